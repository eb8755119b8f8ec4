//! High-level OPDM operations.

use crate::config::ClientConfig;
use crate::dom::{Document, Element};
use crate::error::{OpdmError, Result};
use crate::filter::{FilterValue, MetadataFilter};
use crate::inject::inject_into;
use crate::normalize::{self, normalize, text_of, NormalizeOptions};
use crate::session::{SoapSession, SoapTransport};
use crate::templates::{
    render, Operation, COMPONENTS_ANCHOR, DEPENDENCIES_ANCHOR, OBJECT_ANCHOR, PROFILE_ANCHOR,
};
use crate::types::{
    version_key, ContentKind, ContentPayload, DownloadedContent, ObjectQuery, ObjectType,
    Publication, QueryResponse, ReportFilter, ReturnMode, RulesetInfo, Subscription,
    SubscriptionRequest, SubscriptionStatus,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Metadata field carrying the object type.
pub const OBJECT_TYPE_FIELD: &str = "pmd:Object-Type";

const GET_CONTENT_RESULT: &str = "sm:GetContentResult";
const PUBLICATION_LIST_RESULT: &str = "sm:PublicationsSubscriptionListResult";

/// Client for the OPDM service.
#[derive(Debug)]
pub struct OpdmClient {
    session: SoapSession,
}

impl OpdmClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            session: SoapSession::new(config)?,
        })
    }

    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn SoapTransport>) -> Self {
        Self {
            session: SoapSession::with_transport(config, transport),
        }
    }

    pub fn session(&self) -> &SoapSession {
        &self.session
    }

    /// Correlation id for a new query.
    pub fn new_query_id() -> String {
        format!("rsquery_{}_{}", env!("CARGO_PKG_VERSION"), Uuid::new_v4())
    }

    /// Query model objects.
    pub async fn query_object(&self, query: &ObjectQuery) -> Result<QueryResponse> {
        let query_id = Self::new_query_id();
        let payload = build_object_query(&query_id, query)?;
        debug!(query_id = %query_id, payload = %payload, "QueryObject request");

        let result = self
            .session
            .execute_normalized(&payload, &NormalizeOptions::default())
            .await?;
        let response = QueryResponse { query_id, result };
        info!(
            query_id = %response.query_id,
            results = response.entries().len(),
            "Object query completed"
        );
        Ok(response)
    }

    /// Query profiles matching `filter`.
    pub async fn query_profile(&self, filter: &MetadataFilter) -> Result<QueryResponse> {
        let query_id = Self::new_query_id();
        let mut document = Document::parse(&render(
            Operation::QueryProfile,
            &[("query_id", query_id.as_str())],
        )?)?;
        inject_into(&mut document, PROFILE_ANCHOR, filter)?;
        let payload = document.to_pretty_string();
        debug!(query_id = %query_id, payload = %payload, "QueryProfile request");

        let result = self
            .session
            .execute_normalized(&payload, &NormalizeOptions::default())
            .await?;
        let response = QueryResponse { query_id, result };
        info!(
            query_id = %response.query_id,
            results = response.entries().len(),
            "Profile query completed"
        );
        Ok(response)
    }

    /// Download content by identifier. One identifier part is sent per id,
    /// in order.
    pub async fn get_content<S: AsRef<str>>(
        &self,
        ids: &[S],
        kind: ContentKind,
        return_mode: ReturnMode,
    ) -> Result<Value> {
        let payload = build_get_content(ids, kind, return_mode)?;
        debug!(return_mode = %return_mode, ids = ids.len(), "GetContent request");

        let result = self
            .session
            .execute_normalized(&payload, &NormalizeOptions::default())
            .await?;

        // The first part echoes the request, content parts follow
        let parts = normalize::parts(&result, GET_CONTENT_RESULT);
        if parts.len() > 1 {
            info!(ids = ids.len(), parts = parts.len() - 1, "Content downloaded");
        } else {
            error!(ids = ids.len(), "Content download failed");
        }
        Ok(result)
    }

    /// Extract the content entries of a GetContent result.
    pub fn downloaded_contents(result: &Value, return_mode: ReturnMode) -> Result<Vec<DownloadedContent>> {
        let mut contents = Vec::new();

        for part in normalize::parts(result, GET_CONTENT_RESULT) {
            let entry = [ContentKind::Profile, ContentKind::Model]
                .iter()
                .find_map(|kind| part.get(kind.element()));
            let Some(entry) = entry else {
                continue;
            };
            let Some(content) = entry.get("opde:Content").and_then(text_of) else {
                continue;
            };

            let id = entry.get("opde:Id").and_then(text_of).map(str::to_string);
            let file_name = entry
                .get("pmd:fileName")
                .and_then(text_of)
                .map(str::to_string);

            let payload = match return_mode {
                ReturnMode::Payload => {
                    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                    let bytes = BASE64.decode(compact.as_bytes()).map_err(|e| {
                        OpdmError::XmlParse(format!(
                            "content of '{}' is not valid base64: {}",
                            id.as_deref().unwrap_or("?"),
                            e
                        ))
                    })?;
                    ContentPayload::Inline(bytes)
                }
                ReturnMode::File => ContentPayload::Reference(content.to_string()),
            };

            contents.push(DownloadedContent {
                id,
                file_name,
                payload,
            });
        }

        Ok(contents)
    }

    /// Upload a named dataset.
    pub async fn publication_request(&self, name: &str, content: &[u8], content_type: &str) -> Result<Value> {
        if name.trim().is_empty() {
            return Err(OpdmError::InvalidArgument("dataset name must not be empty".to_string()));
        }
        if content_type.trim().is_empty() {
            return Err(OpdmError::InvalidArgument("content type must not be empty".to_string()));
        }

        let response = self.session.submit_content(name, content, content_type).await?;
        info!(name = %name, "Publication request accepted");
        Ok(normalize(&response, &NormalizeOptions::default()))
    }

    /// Upload a file, named after its file name.
    pub async fn publication_request_file(&self, path: &Path, content_type: &str) -> Result<Value> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                OpdmError::InvalidArgument(format!("'{}' has no file name", path.display()))
            })?
            .to_string();
        let content = tokio::fs::read(path).await?;
        self.publication_request(&name, &content, content_type).await
    }

    /// Raw publication list, attributes included.
    pub async fn publication_list(&self) -> Result<Value> {
        let payload = render(Operation::PublicationList, &[])?;
        let options = NormalizeOptions::with_attributes().always_list("opdm:Publication");
        self.session.execute_normalized(&payload, &options).await
    }

    /// Publications advertised by the service.
    pub async fn available_publications(&self) -> Result<Vec<Publication>> {
        let list = self.publication_list().await?;
        Ok(publications_from_list(&list))
    }

    /// Create a subscription after checking its object type and publication
    /// against the advertised publications.
    pub async fn publication_subscribe(&self, request: &SubscriptionRequest) -> Result<Subscription> {
        let subscription_id = match &request.subscription_id {
            Some(id) if id.trim().is_empty() => {
                return Err(OpdmError::InvalidArgument(
                    "subscription id must not be empty".to_string(),
                ))
            }
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        // Checked here so that bad filters fail before the publication lookup
        build_subscription(
            &subscription_id,
            request.publication_id.as_deref().unwrap_or_default(),
            request,
        )?;

        let publications = self.available_publications().await?;
        let object_type = request.object_type.as_str();
        let advertised_types = publications
            .iter()
            .map(|p| p.object_type.as_str())
            .collect::<Vec<_>>();

        if !advertised_types.contains(&object_type) {
            warn!(object_type = %object_type, advertised = ?advertised_types, "Object type not advertised");
            return Err(OpdmError::NotAdvertised {
                kind: "object type",
                value: object_type.to_string(),
                advertised: advertised_types.join(", "),
            });
        }

        let publication_id = match &request.publication_id {
            Some(id) => id.clone(),
            None => publications
                .iter()
                .find(|p| p.object_type == object_type)
                .map(|p| p.publication_id.clone())
                .unwrap_or_default(),
        };

        if !publications.iter().any(|p| p.publication_id == publication_id) {
            let advertised = publications
                .iter()
                .map(|p| p.publication_id.as_str())
                .collect::<Vec<_>>();
            warn!(publication_id = %publication_id, advertised = ?advertised, "Publication not advertised");
            return Err(OpdmError::NotAdvertised {
                kind: "publication",
                value: publication_id,
                advertised: advertised.join(", "),
            });
        }

        let payload = build_subscription(&subscription_id, &publication_id, request)?;
        debug!(payload = %payload, "CreateSubscription request");
        let result = self
            .session
            .execute_normalized(&payload, &NormalizeOptions::default())
            .await?;

        info!(
            subscription_id = %subscription_id,
            publication_id = %publication_id,
            mode = %request.mode,
            "Subscription created"
        );

        Ok(Subscription {
            subscription_id,
            publication_id,
            mode: request.mode,
            object_type: request.object_type,
            result,
        })
    }

    pub async fn start_subscription(&self, subscription_id: &str) -> Result<Value> {
        self.subscription_call(Operation::StartSubscription, subscription_id)
            .await
    }

    pub async fn stop_subscription(&self, subscription_id: &str) -> Result<Value> {
        self.subscription_call(Operation::StopSubscription, subscription_id)
            .await
    }

    /// Delete a subscription.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<Value> {
        self.subscription_call(Operation::DeleteSubscription, subscription_id)
            .await
    }

    async fn subscription_call(&self, operation: Operation, subscription_id: &str) -> Result<Value> {
        if subscription_id.trim().is_empty() {
            return Err(OpdmError::InvalidArgument(
                "subscription id must not be empty".to_string(),
            ));
        }
        let payload = render(operation, &[("subscription_id", subscription_id)])?;
        debug!(operation = operation.name(), subscription_id = %subscription_id, "Subscription call");
        self.session
            .execute_normalized(&payload, &NormalizeOptions::default())
            .await
    }

    /// List subscriptions, all of them when `status` is `None`.
    pub async fn list_subscriptions(&self, status: Option<SubscriptionStatus>) -> Result<Value> {
        let payload = render(
            Operation::GetSubscriptions,
            &[("status", SubscriptionStatus::wire_value(status))],
        )?;
        self.session
            .execute_normalized(&payload, &NormalizeOptions::with_attributes())
            .await
    }

    /// Publication report of one profile.
    pub async fn get_profile_publication_report(&self, filter: &ReportFilter) -> Result<Value> {
        let mut document = Document::parse(&render(Operation::GetProfilePublicationReport, &[])?)?;
        inject_into(&mut document, PROFILE_ANCHOR, &filter.as_metadata()?)?;
        debug!(field = filter.field(), value = %filter.value(), "Publication report request");

        self.session
            .execute_normalized(&document.to_pretty_string(), &NormalizeOptions::with_attributes())
            .await
    }

    pub async fn get_installed_ruleset_version(&self) -> Result<String> {
        self.session.get_installed_ruleset_version().await
    }

    /// Rulesets the local service can install, normalized.
    pub async fn list_available_rulesets(&self) -> Result<Vec<Value>> {
        let rulesets = self.session.list_available_rulesets().await?;
        Ok(rulesets
            .iter()
            .map(|element| {
                normalize(element, &NormalizeOptions::default())
                    .get(element.name())
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect())
    }

    /// Versions of the installable rulesets.
    pub async fn available_ruleset_versions(&self) -> Result<Vec<String>> {
        Ok(self
            .list_available_rulesets()
            .await?
            .iter()
            .filter_map(|ruleset| ruleset.get("version").and_then(text_of).map(str::to_string))
            .collect())
    }

    pub async fn install_ruleset(&self, version: &str) -> Result<Value> {
        if version.trim().is_empty() {
            return Err(OpdmError::InvalidArgument("ruleset version must not be empty".to_string()));
        }
        let response = self.session.install_ruleset(version).await?;
        info!(version = %version, "Ruleset installed");
        Ok(normalize(&response, &NormalizeOptions::default()))
    }

    pub async fn reset_ruleset(&self) -> Result<Value> {
        let response = self.session.reset_ruleset().await?;
        info!("Ruleset reset");
        Ok(normalize(&response, &NormalizeOptions::default()))
    }

    /// The published ruleset with the highest version, if any.
    pub async fn latest_ruleset(&self) -> Result<Option<RulesetInfo>> {
        let response = self.query_object(&ObjectQuery::new(ObjectType::Ruleset)).await?;
        Ok(latest_ruleset_of(&response))
    }
}

/// Render and fill a QueryObject request.
pub fn build_object_query(query_id: &str, query: &ObjectQuery) -> Result<String> {
    check_object_type(&query.object_type)?;
    if query.metadata.get(OBJECT_TYPE_FIELD).is_some() {
        return Err(OpdmError::InvalidArgument(format!(
            "{} is set through the object type of the query",
            OBJECT_TYPE_FIELD
        )));
    }

    let mut document = Document::parse(&render(Operation::QueryObject, &[("query_id", query_id)])?)?;
    let object_type = MetadataFilter::new().with(OBJECT_TYPE_FIELD, query.object_type.clone());
    inject_into(&mut document, OBJECT_ANCHOR, &object_type)?;
    inject_into(&mut document, OBJECT_ANCHOR, &query.metadata)?;
    for component in &query.components {
        inject_into(&mut document, COMPONENTS_ANCHOR, component)?;
    }
    for dependency in &query.dependencies {
        inject_into(&mut document, DEPENDENCIES_ANCHOR, dependency)?;
    }

    Ok(document.to_pretty_string())
}

/// Every object type named by the filter must be a known one.
fn check_object_type(object_type: &FilterValue) -> Result<()> {
    for value in object_type.values() {
        value.parse::<ObjectType>()?;
    }
    Ok(())
}

/// Render a GetContent request with one identifier part per id.
pub fn build_get_content<S: AsRef<str>>(ids: &[S], kind: ContentKind, return_mode: ReturnMode) -> Result<String> {
    if ids.is_empty() {
        return Err(OpdmError::InvalidArgument(
            "at least one content identifier is required".to_string(),
        ));
    }
    if ids.iter().any(|id| id.as_ref().trim().is_empty()) {
        return Err(OpdmError::InvalidArgument(
            "content identifiers must not be empty".to_string(),
        ));
    }

    let mut document = Document::parse(&render(
        Operation::GetContent,
        &[("return_mode", return_mode.as_str())],
    )?)?;
    for id in ids {
        let identifier = Element::new("sm:part")
            .with_attribute("name", "identifier")
            .with_attribute("type", "opde:ShortMetaData")
            .with_child(
                Element::new(kind.element())
                    .with_child(Element::new("opde:Id").with_text(id.as_ref())),
            );
        document.root_mut().push_child(identifier);
    }

    Ok(document.to_pretty_string())
}

/// Render a CreateSubscription request.
pub fn build_subscription(subscription_id: &str, publication_id: &str, request: &SubscriptionRequest) -> Result<String> {
    let mut document = Document::parse(&render(
        Operation::CreateSubscription,
        &[
            ("subscription_id", subscription_id),
            ("publication_id", publication_id),
            ("mode", request.mode.as_str()),
            ("object_type", request.object_type.as_str()),
        ],
    )?)?;
    if request.metadata.get(OBJECT_TYPE_FIELD).is_some() {
        return Err(OpdmError::InvalidArgument(format!(
            "{} is set through the object type of the subscription",
            OBJECT_TYPE_FIELD
        )));
    }
    inject_into(&mut document, OBJECT_ANCHOR, &request.metadata)?;
    Ok(document.to_pretty_string())
}

/// Publications of a normalized publication list.
pub fn publications_from_list(list: &Value) -> Vec<Publication> {
    normalize::parts(list, PUBLICATION_LIST_RESULT)
        .iter()
        .filter_map(|part| part.get("opdm:PublicationsList"))
        .flat_map(|publications| {
            publications
                .get("opdm:Publication")
                .map(normalize::as_list)
                .unwrap_or_default()
        })
        .filter_map(Publication::from_normalized)
        .collect()
}

/// Highest-versioned ruleset among RULESET query results.
pub fn latest_ruleset_of(response: &QueryResponse) -> Option<RulesetInfo> {
    response
        .objects("opdm:OPDMObject")
        .filter_map(|object| {
            Some(RulesetInfo {
                id: object.get("opde:Id").and_then(text_of)?.to_string(),
                version: object.get("pmd:version").and_then(text_of)?.to_string(),
            })
        })
        .max_by(|a, b| version_key(&a.version).cmp(&version_key(&b.version)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, Operator};

    #[test]
    fn test_query_id_format() {
        let id = OpdmClient::new_query_id();
        let prefix = format!("rsquery_{}_", env!("CARGO_PKG_VERSION"));
        assert!(id.starts_with(&prefix));
        assert!(Uuid::parse_str(&id[prefix.len()..]).is_ok());
    }

    #[test]
    fn test_object_query_injects_object_type_first() {
        let query = ObjectQuery::new(ObjectType::Bds).filter("pmd:timeHorizon", "1D");
        let xml = build_object_query("q-1", &query).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let object = doc.find(OBJECT_ANCHOR).unwrap().unwrap();
        let names: Vec<_> = object.child_elements().map(|e| e.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["opde:Components", "opde:Dependencies", "pmd:Object-Type", "pmd:timeHorizon"]
        );
        assert_eq!(object.child("Object-Type").unwrap().text(), "BDS");
    }

    #[test]
    fn test_object_query_condition_object_type() {
        let query = ObjectQuery::with_object_type(
            Condition::new(Operator::IsNotOneOf, ["IGM", "BDS", "RULESET"]).unwrap(),
        );
        let xml = build_object_query("q-1", &query).unwrap();
        assert!(xml.contains(
            "<pmd:Object-Type operator=\"is not one of\">IGM,BDS,RULESET</pmd:Object-Type>"
        ));
    }

    #[test]
    fn test_object_query_rejects_unknown_object_type() {
        let err = build_object_query("q-1", &ObjectQuery::with_object_type("XYZ")).unwrap_err();
        assert!(matches!(err, OpdmError::UnsupportedEnumValue { .. }));

        let query = ObjectQuery::new(ObjectType::Igm).filter(OBJECT_TYPE_FIELD, "CGM");
        assert!(matches!(
            build_object_query("q-1", &query).unwrap_err(),
            OpdmError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_object_query_components_and_dependencies() {
        let query = ObjectQuery::new(ObjectType::Cgm)
            .component("opde:Component", "c-1")
            .component("opde:Component", "c-2")
            .dependency("opde:DependsOn", "d-1");
        let xml = build_object_query("q-1", &query).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let components: Vec<_> = doc
            .find(COMPONENTS_ANCHOR)
            .unwrap()
            .unwrap()
            .child_elements()
            .map(|e| e.text())
            .collect();
        assert_eq!(components, vec!["c-1", "c-2"]);
        assert_eq!(doc.find(".//opde:Dependencies/opde:DependsOn").unwrap().unwrap().text(), "d-1");
    }

    #[test]
    fn test_get_content_identifiers_in_order() {
        let xml = build_get_content(&["id-1", "id-2"], ContentKind::Profile, ReturnMode::Payload).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let parts: Vec<_> = doc.root().child_elements().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].attribute("name"), Some("content-return-mode"));
        assert_eq!(parts[0].text(), "PAYLOAD");
        for (part, id) in parts[1..].iter().zip(["id-1", "id-2"]) {
            assert_eq!(part.attribute("name"), Some("identifier"));
            assert_eq!(part.attribute("type"), Some("opde:ShortMetaData"));
            let wrapper = part.first_child_element().unwrap();
            assert_eq!(wrapper.name(), "opdm:Profile");
            assert_eq!(wrapper.child("Id").unwrap().text(), id);
        }
    }

    #[test]
    fn test_get_content_model_wrapper() {
        let xml = build_get_content(&["m-1"], ContentKind::Model, ReturnMode::File).unwrap();
        assert!(xml.contains("<opdm:OPDMObject>"));
        assert!(xml.contains(">FILE<"));
    }

    #[test]
    fn test_get_content_requires_ids() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            build_get_content(&empty, ContentKind::Profile, ReturnMode::Payload).unwrap_err(),
            OpdmError::InvalidArgument(_)
        ));
        assert!(build_get_content(&[""], ContentKind::Profile, ReturnMode::Payload).is_err());
    }

    #[test]
    fn test_downloaded_contents() {
        let result = serde_json::json!({"sm:GetContentResult": {"sm:part": [
            "request",
            {"opdm:Profile": {
                "opde:Id": "id-1",
                "pmd:fileName": "a.xml",
                "opde:Content": BASE64.encode(b"<rdf:RDF/>")
            }}
        ]}});
        let contents = OpdmClient::downloaded_contents(&result, ReturnMode::Payload).unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].id.as_deref(), Some("id-1"));
        assert_eq!(contents[0].file_name.as_deref(), Some("a.xml"));
        assert_eq!(contents[0].payload, ContentPayload::Inline(b"<rdf:RDF/>".to_vec()));

        let files = OpdmClient::downloaded_contents(&result, ReturnMode::File).unwrap();
        assert!(matches!(files[0].payload, ContentPayload::Reference(_)));
    }

    #[test]
    fn test_subscription_request_shape() {
        let request = SubscriptionRequest::new(ObjectType::Igm)
            .mode(crate::types::SubscriptionMode::Meta)
            .filter("pmd:timeHorizon", "1D");
        let xml = build_subscription("s-1", "P-1", &request).unwrap();
        let doc = Document::parse(&xml).unwrap();
        assert_eq!(doc.root().name(), "sm:CreateSubscription");
        let object = doc.find(OBJECT_ANCHOR).unwrap().unwrap();
        assert_eq!(object.child("Object-Type").unwrap().text(), "IGM");
        assert_eq!(object.child("timeHorizon").unwrap().text(), "1D");
        assert!(xml.contains("<sm:part name=\"mode\">META</sm:part>"));
        assert!(xml.contains("<sm:part name=\"publicationID\">P-1</sm:part>"));
    }

    #[test]
    fn test_publications_from_list() {
        let list = serde_json::json!({"sm:PublicationsSubscriptionListResult": {"sm:part": [
            {"opdm:PublicationsList": {"opdm:Publication": [
                {"opde:publicationID": {"@v": "P-BDS"}, "opde:messageType": {"@v": "OPDM-BDS"}},
                {"opde:publicationID": {"@v": "P-IGM"}, "opde:messageType": {"@v": "OPDM-IGM"}}
            ]}}
        ]}});
        let publications = publications_from_list(&list);
        assert_eq!(publications.len(), 2);
        assert_eq!(publications[1].publication_id, "P-IGM");
        assert_eq!(publications[1].object_type, "IGM");
    }

    #[test]
    fn test_latest_ruleset() {
        let response = QueryResponse {
            query_id: "q-1".into(),
            result: serde_json::json!({"sm:QueryResult": {"sm:part": [
                "q-1",
                {"opdm:OPDMObject": {"opde:Id": "r-9", "pmd:version": "1.9"}},
                {"opdm:OPDMObject": {"opde:Id": "r-10", "pmd:version": "1.10"}},
                {"opdm:OPDMObject": {"opde:Id": "r-2", "pmd:version": "1.2"}}
            ]}}),
        };
        let latest = latest_ruleset_of(&response).unwrap();
        assert_eq!(latest.id, "r-10");
        assert_eq!(latest.version, "1.10");
    }
}
