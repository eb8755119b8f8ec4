//! Response normalization into nested JSON-like values.
//!
//! Element content becomes a string (or null when empty) if the element has
//! neither attributes nor child elements, otherwise an object keyed by tag
//! name. Repeated siblings become arrays in document order.

use crate::dom::{Element, Node};
use serde_json::{Map, Value};

/// Wrapper tag the service uses for every result part.
pub const PART_TAG: &str = "sm:part";

/// Key for text content of elements that also carry attributes or children.
pub const TEXT_KEY: &str = "#text";

/// Prefix for attribute keys.
pub const ATTRIBUTE_PREFIX: char = '@';

/// How attributes are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeMode {
    /// Attributes become `@name` keys
    Include,
    /// Attributes are dropped
    #[default]
    Drop,
}

/// Normalization settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub attributes: AttributeMode,
    /// Tags that always normalize to arrays, even with one occurrence
    pub always_list: Vec<String>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            attributes: AttributeMode::Drop,
            always_list: vec![PART_TAG.to_string()],
        }
    }
}

impl NormalizeOptions {
    pub fn with_attributes() -> Self {
        Self {
            attributes: AttributeMode::Include,
            ..Default::default()
        }
    }

    /// Add a tag to the always-list set.
    pub fn always_list(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.always_list.contains(&tag) {
            self.always_list.push(tag);
        }
        self
    }

    fn is_always_list(&self, tag: &str) -> bool {
        self.always_list.iter().any(|t| t == tag)
    }
}

/// Normalize `element` into `{ <tag>: <content> }`.
pub fn normalize(element: &Element, options: &NormalizeOptions) -> Value {
    let mut root = Map::new();
    root.insert(element.name().to_string(), element_content(element, options));
    Value::Object(root)
}

fn element_content(element: &Element, options: &NormalizeOptions) -> Value {
    let mut map = Map::new();

    if options.attributes == AttributeMode::Include {
        for (key, value) in element.attributes() {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            map.insert(format!("{}{}", ATTRIBUTE_PREFIX, key), Value::String(value.clone()));
        }
    }

    for child in element.child_elements() {
        let value = element_content(child, options);
        let key = child.name();
        match map.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                let value = if options.is_always_list(key) {
                    Value::Array(vec![value])
                } else {
                    value
                };
                map.insert(key.to_string(), value);
            }
        }
    }

    let text = element
        .children()
        .iter()
        .filter_map(|node| match node {
            Node::Text(t) | Node::CData(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<String>();
    let text = text.trim();

    if map.is_empty() {
        return if text.is_empty() {
            Value::Null
        } else {
            Value::String(text.to_string())
        };
    }

    if !text.is_empty() {
        map.insert(TEXT_KEY.to_string(), Value::String(text.to_string()));
    }

    Value::Object(map)
}

/// The `sm:part` sequence of a normalized result such as `sm:QueryResult`.
///
/// Returns an empty slice when the result or its parts are missing.
pub fn parts<'a>(normalized: &'a Value, result_tag: &str) -> &'a [Value] {
    match normalized.get(result_tag).and_then(|result| result.get(PART_TAG)) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(single) => std::slice::from_ref(single),
        None => &[],
    }
}

/// Elements of a possibly-single value as a slice.
pub fn as_list(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items.as_slice(),
        Value::Null => &[],
        single => std::slice::from_ref(single),
    }
}

/// Text of a normalized value, looking through `#text` objects.
pub fn text_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get(TEXT_KEY).and_then(Value::as_str),
        _ => None,
    }
}
