//! Metadata element injection into request templates.

use crate::dom::{Document, Element};
use crate::error::{OpdmError, Result};
use crate::filter::{FilterValue, MetadataFilter};

/// Attribute carrying a condition's operator.
pub const OPERATOR_ATTRIBUTE: &str = "operator";

/// Append one element per filter field under the element at `anchor_path`.
///
/// The template is parsed fresh on every call. All keys are checked against
/// the root's namespace map before anything is appended.
pub fn inject(template: &str, anchor_path: &str, fields: &MetadataFilter) -> Result<String> {
    let mut document = Document::parse(template)?;
    inject_into(&mut document, anchor_path, fields)?;
    Ok(document.to_pretty_string())
}

/// In-place variant of [`inject`] for callers that inject at several anchors.
pub fn inject_into(document: &mut Document, anchor_path: &str, fields: &MetadataFilter) -> Result<()> {
    let elements = fields
        .iter()
        .map(|(key, value)| {
            check_key(document, key)?;
            Ok(filter_element(key, value))
        })
        .collect::<Result<Vec<_>>>()?;

    let anchor = document
        .find_mut(anchor_path)?
        .ok_or_else(|| OpdmError::AnchorNotFound(anchor_path.to_string()))?;

    for element in elements {
        anchor.push_child(element);
    }

    Ok(())
}

fn filter_element(key: &str, value: &FilterValue) -> Element {
    let element = Element::new(key).with_text(value.wire_text());
    match value.operator() {
        Some(operator) => element.with_attribute(OPERATOR_ATTRIBUTE, operator.as_str()),
        None => element,
    }
}

fn check_key(document: &Document, key: &str) -> Result<()> {
    let invalid = |reason: &str| OpdmError::InvalidFieldKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let (prefix, local) = key
        .split_once(':')
        .ok_or_else(|| invalid("expected 'prefix:name'"))?;

    if prefix.is_empty() || !is_xml_name(prefix) {
        return Err(invalid("invalid namespace prefix"));
    }
    if local.is_empty() || local.contains(':') || !is_xml_name(local) {
        return Err(invalid("invalid element name"));
    }
    if document.namespace_uri(prefix).is_none() {
        return Err(invalid("namespace prefix is not declared in the template"));
    }

    Ok(())
}

/// NCName check, ASCII subset plus any non-ASCII letter.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, Operator};
    use crate::templates::{render, Operation, OBJECT_ANCHOR, PMD_NS};

    fn query_object() -> String {
        render(Operation::QueryObject, &[("query_id", "q-1")]).unwrap()
    }

    #[test]
    fn test_literal_and_condition() {
        let filter = MetadataFilter::new()
            .with("pmd:timeHorizon", "1D")
            .with(
                "pmd:scenarioDate",
                Condition::unary(Operator::IsAfter, "2021-12-30T00:00:00").unwrap(),
            );
        let xml = inject(&query_object(), OBJECT_ANCHOR, &filter).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let anchor = doc.find(OBJECT_ANCHOR).unwrap().unwrap();

        let horizon = anchor.child("timeHorizon").unwrap();
        assert_eq!(horizon.name(), "pmd:timeHorizon");
        assert_eq!(horizon.text(), "1D");
        assert_eq!(horizon.attribute(OPERATOR_ATTRIBUTE), None);

        let date = anchor.child("scenarioDate").unwrap();
        assert_eq!(date.text(), "2021-12-30T00:00:00");
        assert_eq!(date.attribute(OPERATOR_ATTRIBUTE), Some("is after"));
    }

    #[test]
    fn test_appends_in_insertion_order() {
        let filter = MetadataFilter::new()
            .with("pmd:b", "2")
            .with("pmd:a", "1")
            .with("pmd:c", "3");
        let xml = inject(&query_object(), ".//OPDMObject", &filter).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let names: Vec<_> = doc
            .find(OBJECT_ANCHOR)
            .unwrap()
            .unwrap()
            .child_elements()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["opde:Components", "opde:Dependencies", "pmd:b", "pmd:a", "pmd:c"]
        );
        assert_eq!(doc.namespace_uri("pmd"), Some(PMD_NS));
    }

    #[test]
    fn test_between_keeps_both_values() {
        let filter = MetadataFilter::new().with(
            "pmd:scenarioDate",
            Condition::between("2021-12-30T00:00:00", "2021-12-31T00:00:00").unwrap(),
        );
        let xml = inject(&query_object(), OBJECT_ANCHOR, &filter).unwrap();
        assert!(xml.contains(
            "<pmd:scenarioDate operator=\"is between\">2021-12-30T00:00:00,2021-12-31T00:00:00</pmd:scenarioDate>"
        ));
    }

    #[test]
    fn test_anchor_not_found() {
        let filter = MetadataFilter::new().with("pmd:timeHorizon", "1D");
        let err = inject(&query_object(), ".//opdm:Profile", &filter).unwrap_err();
        assert!(matches!(err, OpdmError::AnchorNotFound(_)));
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["timeHorizon", "xyz:timeHorizon", "pmd:", ":x", "pmd:a:b", "pmd:1abc"] {
            let filter = MetadataFilter::new().with(key, "1D");
            let err = inject(&query_object(), OBJECT_ANCHOR, &filter).unwrap_err();
            assert!(
                matches!(err, OpdmError::InvalidFieldKey { .. }),
                "{} gave {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_invalid_key_leaves_no_partial_output() {
        let mut doc = Document::parse(&query_object()).unwrap();
        let before = doc.clone();
        let filter = MetadataFilter::new()
            .with("pmd:timeHorizon", "1D")
            .with("bad:key", "x");
        assert!(inject_into(&mut doc, OBJECT_ANCHOR, &filter).is_err());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_repeated_injection_on_fresh_templates() {
        let template = query_object();
        let first = inject(&template, OBJECT_ANCHOR, &MetadataFilter::new().with("pmd:a", "1")).unwrap();
        let second = inject(&template, OBJECT_ANCHOR, &MetadataFilter::new().with("pmd:b", "2")).unwrap();
        assert!(first.contains("pmd:a") && !first.contains("pmd:b"));
        assert!(second.contains("pmd:b") && !second.contains("pmd:a"));
    }

    #[test]
    fn test_escapes_values() {
        let filter = MetadataFilter::new().with("pmd:description", "A<B & C");
        let xml = inject(&query_object(), OBJECT_ANCHOR, &filter).unwrap();
        assert!(xml.contains("A&lt;B &amp; C"));
        let doc = Document::parse(&xml).unwrap();
        assert_eq!(
            doc.find(".//pmd:description").unwrap().unwrap().text(),
            "A<B & C"
        );
    }
}
