//! Domain types shared by the client and the CLI.

use crate::error::{OpdmError, Result};
use crate::filter::{FilterValue, MetadataFilter};
use crate::normalize::text_of;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Root element of a normalized query result.
const QUERY_RESULT: &str = "sm:QueryResult";

/// Enumerations with a fixed wire spelling.
trait WireEnum: Copy + 'static {
    const KIND: &'static str;
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn parse_wire(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|variant| variant.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| OpdmError::UnsupportedEnumValue {
                kind: Self::KIND,
                value: value.to_string(),
                allowed: Self::ALL
                    .iter()
                    .map(|variant| variant.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

macro_rules! wire_enum_impls {
    ($ty:ty) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                WireEnum::as_str(self)
            }

            pub fn all() -> &'static [Self] {
                <Self as WireEnum>::ALL
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(WireEnum::as_str(self))
            }
        }

        impl FromStr for $ty {
            type Err = OpdmError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse_wire(s)
            }
        }
    };
}

/// Remote object-type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectType {
    /// Individual grid model
    Igm,
    /// Common grid model
    Cgm,
    /// Boundary data set
    Bds,
    /// Validation ruleset library
    Ruleset,
}

impl WireEnum for ObjectType {
    const KIND: &'static str = "object type";
    const ALL: &'static [Self] = &[Self::Igm, Self::Cgm, Self::Bds, Self::Ruleset];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Igm => "IGM",
            Self::Cgm => "CGM",
            Self::Bds => "BDS",
            Self::Ruleset => "RULESET",
        }
    }
}

wire_enum_impls!(ObjectType);

/// What a content identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// A whole model, `opdm:OPDMObject`
    Model,
    /// A single profile file, `opdm:Profile`
    #[default]
    Profile,
}

impl ContentKind {
    /// Element wrapping the identifier in a GetContent request.
    pub fn element(&self) -> &'static str {
        match self {
            Self::Model => "opdm:OPDMObject",
            Self::Profile => "opdm:Profile",
        }
    }
}

impl WireEnum for ContentKind {
    const KIND: &'static str = "content kind";
    const ALL: &'static [Self] = &[Self::Model, Self::Profile];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Profile => "profile",
        }
    }
}

wire_enum_impls!(ContentKind);

/// How GetContent returns the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReturnMode {
    /// Inline base64 payload
    Payload,
    /// Stored by the local service, response points at the file
    #[default]
    File,
}

impl WireEnum for ReturnMode {
    const KIND: &'static str = "return mode";
    const ALL: &'static [Self] = &[Self::Payload, Self::File];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Payload => "PAYLOAD",
            Self::File => "FILE",
        }
    }
}

wire_enum_impls!(ReturnMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionMode {
    /// Metadata only
    Meta,
    /// Metadata and content
    #[default]
    Full,
    /// Metadata and content, including dependencies
    FullDependencies,
}

impl WireEnum for SubscriptionMode {
    const KIND: &'static str = "subscription mode";
    const ALL: &'static [Self] = &[Self::Meta, Self::Full, Self::FullDependencies];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Meta => "META",
            Self::Full => "FULL",
            Self::FullDependencies => "FULL_DEPENDENCIES",
        }
    }
}

wire_enum_impls!(SubscriptionMode);

/// Subscription status filter. Listing without a status returns all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl SubscriptionStatus {
    /// Wire value for an optional status filter.
    pub fn wire_value(status: Option<Self>) -> &'static str {
        status.map(|s| WireEnum::as_str(&s)).unwrap_or("ALL")
    }
}

impl WireEnum for SubscriptionStatus {
    const KIND: &'static str = "subscription status";
    const ALL: &'static [Self] = &[Self::Active, Self::Inactive];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

wire_enum_impls!(SubscriptionStatus);

/// Selects the profile a publication report is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFilter {
    ModelId(String),
    Filename(String),
}

impl ReportFilter {
    pub fn field(&self) -> &'static str {
        match self {
            Self::ModelId(_) => "pmd:modelId",
            Self::Filename(_) => "pmd:filename",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::ModelId(value) | Self::Filename(value) => value,
        }
    }

    /// Build from a selector name, `model-id` or `filename`.
    pub fn from_parts(selector: &str, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        match selector.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "model-id" | "modelid" => Ok(Self::ModelId(value)),
            "filename" | "file-name" => Ok(Self::Filename(value)),
            _ => Err(OpdmError::UnsupportedEnumValue {
                kind: "report filter",
                value: selector.to_string(),
                allowed: "model-id, filename".to_string(),
            }),
        }
    }

    pub(crate) fn as_metadata(&self) -> Result<MetadataFilter> {
        if self.value().trim().is_empty() {
            return Err(OpdmError::InvalidArgument(format!(
                "{} must not be empty",
                self.field()
            )));
        }
        Ok(MetadataFilter::new().with(self.field(), self.value()))
    }
}

/// A publication advertised by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub publication_id: String,
    pub message_type: String,
    /// Last `-` separated segment of the message type
    pub object_type: String,
}

impl Publication {
    pub fn new(publication_id: impl Into<String>, message_type: impl Into<String>) -> Self {
        let message_type = message_type.into();
        let object_type = message_type
            .rsplit('-')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            publication_id: publication_id.into(),
            message_type,
            object_type,
        }
    }

    /// Read a normalized `opdm:Publication` entry (attributes included).
    pub fn from_normalized(value: &Value) -> Option<Self> {
        let attribute = |tag: &str| {
            value
                .get(tag)
                .and_then(|v| v.get("@v").and_then(Value::as_str).or_else(|| text_of(v)))
        };
        Some(Self::new(
            attribute("opde:publicationID")?,
            attribute("opde:messageType")?,
        ))
    }
}

/// Result of a query: the locally generated correlation id and the
/// normalized response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub result: Value,
}

impl QueryResponse {
    /// Result entries, without the leading part echoing the query id.
    pub fn entries(&self) -> &[Value] {
        let parts = crate::normalize::parts(&self.result, QUERY_RESULT);
        match parts.first().and_then(Value::as_str) {
            Some(first) if first == self.query_id => &parts[1..],
            _ => parts,
        }
    }

    /// Entries that carry `tag`, e.g. `opdm:OPDMObject`.
    pub fn objects<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.entries().iter().filter_map(move |entry| entry.get(tag))
    }
}

/// Object query: object type, metadata and component/dependency patterns.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObjectQuery {
    pub object_type: FilterValue,
    pub metadata: MetadataFilter,
    /// Each filter is appended under `opde:Components`
    pub components: Vec<MetadataFilter>,
    /// Each filter is appended under `opde:Dependencies`
    pub dependencies: Vec<MetadataFilter>,
}

impl Default for ObjectQuery {
    fn default() -> Self {
        Self::new(ObjectType::Igm)
    }
}

impl ObjectQuery {
    pub fn new(object_type: ObjectType) -> Self {
        Self::with_object_type(object_type.as_str())
    }

    /// Query with an arbitrary object-type filter, e.g. a condition such as
    /// `is not one of IGM,BDS`.
    pub fn with_object_type(object_type: impl Into<FilterValue>) -> Self {
        Self {
            object_type: object_type.into(),
            metadata: MetadataFilter::new(),
            components: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn metadata(mut self, metadata: MetadataFilter) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn component(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.components.push(MetadataFilter::new().with(key, value));
        self
    }

    pub fn dependency(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.dependencies.push(MetadataFilter::new().with(key, value));
        self
    }
}

/// A subscription to create.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionRequest {
    pub object_type: ObjectType,
    /// Generated (UUID v4) when absent
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// First advertised publication for the object type when absent
    #[serde(default)]
    pub publication_id: Option<String>,
    #[serde(default)]
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub metadata: MetadataFilter,
}

impl SubscriptionRequest {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            subscription_id: None,
            publication_id: None,
            mode: SubscriptionMode::default(),
            metadata: MetadataFilter::new(),
        }
    }

    pub fn subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    pub fn publication_id(mut self, id: impl Into<String>) -> Self {
        self.publication_id = Some(id.into());
        self
    }

    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// A created subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub publication_id: String,
    pub mode: SubscriptionMode,
    pub object_type: ObjectType,
    pub result: Value,
}

/// Content returned by GetContent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedContent {
    pub id: Option<String>,
    pub file_name: Option<String>,
    pub payload: ContentPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPayload {
    /// Decoded inline bytes
    Inline(Vec<u8>),
    /// Location reported by the service
    Reference(String),
}

/// A ruleset library found by querying RULESET objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesetInfo {
    pub id: String,
    pub version: String,
}

impl RulesetInfo {
    /// Numeric segments of a dotted version, for ordering.
    pub fn version_key(&self) -> Vec<u64> {
        version_key(&self.version)
    }
}

pub(crate) fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|segment| {
            segment
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, Operator};

    #[test]
    fn test_enum_wire_values() {
        assert_eq!("igm".parse::<ObjectType>().unwrap(), ObjectType::Igm);
        assert_eq!(ObjectType::Ruleset.to_string(), "RULESET");
        assert_eq!(
            "full_dependencies".parse::<SubscriptionMode>().unwrap(),
            SubscriptionMode::FullDependencies
        );
        assert_eq!(ContentKind::Model.element(), "opdm:OPDMObject");
        assert_eq!(ReturnMode::Payload.as_str(), "PAYLOAD");
        assert_eq!(SubscriptionStatus::wire_value(None), "ALL");
        assert_eq!(
            SubscriptionStatus::wire_value(Some(SubscriptionStatus::Inactive)),
            "INACTIVE"
        );
    }

    #[test]
    fn test_unsupported_enum_lists_allowed() {
        let err = "XYZ".parse::<ObjectType>().unwrap_err();
        match err {
            OpdmError::UnsupportedEnumValue { kind, value, allowed } => {
                assert_eq!(kind, "object type");
                assert_eq!(value, "XYZ");
                assert_eq!(allowed, "IGM, CGM, BDS, RULESET");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!("DIRECT_CONTENT".parse::<SubscriptionMode>().is_err());
    }

    #[test]
    fn test_enum_serde() {
        let mode: SubscriptionMode = serde_json::from_str("\"FULL_DEPENDENCIES\"").unwrap();
        assert_eq!(mode, SubscriptionMode::FullDependencies);
        assert_eq!(serde_json::to_string(&ObjectType::Bds).unwrap(), "\"BDS\"");
    }

    #[test]
    fn test_report_filter() {
        let filter = ReportFilter::from_parts("model-id", "abc").unwrap();
        assert_eq!(filter.field(), "pmd:modelId");
        let filter = ReportFilter::from_parts("filename", "a.zip").unwrap();
        assert_eq!(filter.field(), "pmd:filename");
        assert!(ReportFilter::from_parts("tso", "x").is_err());
        assert!(ReportFilter::ModelId(" ".into()).as_metadata().is_err());
    }

    #[test]
    fn test_publication_object_type() {
        let publication = Publication::new("P-1", "OPDM-Publication-BDS");
        assert_eq!(publication.object_type, "BDS");

        let normalized = serde_json::json!({
            "opde:publicationID": {"@v": "P-2"},
            "opde:messageType": {"@v": "IGM-Publication-IGM"}
        });
        let publication = Publication::from_normalized(&normalized).unwrap();
        assert_eq!(publication.publication_id, "P-2");
        assert_eq!(publication.object_type, "IGM");
    }

    #[test]
    fn test_query_response_entries_skip_query_id() {
        let response = QueryResponse {
            query_id: "q-1".into(),
            result: serde_json::json!({"sm:QueryResult": {"sm:part": [
                "q-1",
                {"opdm:OPDMObject": {"pmd:version": "1.2"}},
                {"opdm:OPDMObject": {"pmd:version": "1.10"}}
            ]}}),
        };
        assert_eq!(response.entries().len(), 2);
        assert_eq!(response.objects("opdm:OPDMObject").count(), 2);
    }

    #[test]
    fn test_object_query_builder() {
        let query = ObjectQuery::with_object_type(
            Condition::one_of(["IGM", "BDS"]).unwrap(),
        )
        .filter("pmd:timeHorizon", "1D")
        .component("opde:Component", "c-1")
        .dependency("opde:DependsOn", "d-1");
        assert_eq!(query.object_type.operator(), Some(Operator::IsOneOf));
        assert_eq!(query.metadata.len(), 1);
        assert_eq!(query.components.len(), 1);
        assert_eq!(query.dependencies.len(), 1);
    }

    #[test]
    fn test_subscription_request_from_yaml() {
        let yaml = r#"
object_type: IGM
mode: META
metadata:
  pmd:timeHorizon: 1D
"#;
        let request: SubscriptionRequest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(request.object_type, ObjectType::Igm);
        assert_eq!(request.mode, SubscriptionMode::Meta);
        assert!(request.subscription_id.is_none());
        assert_eq!(request.metadata.len(), 1);
    }

    #[test]
    fn test_version_key_ordering() {
        assert!(version_key("1.10") > version_key("1.9"));
        assert!(version_key("2.0.1") > version_key("2.0"));
        assert_eq!(version_key("v1.2"), vec![1, 2]);
    }
}
