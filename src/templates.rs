//! Request templates for the `ExecuteOperation` payloads.
//!
//! Templates are immutable strings. [`render`] fills their `{placeholder}`
//! slots (XML-escaped) and the result is parsed fresh by whoever mutates it.

use crate::error::{OpdmError, Result};
use quick_xml::escape::escape;

/// Object model namespace.
pub const OPDE_NS: &str = "http://entsoe.eu/opde/ObjectModel/1/0";
/// Profile metadata namespace.
pub const PMD_NS: &str = "http://entsoe.eu/opdm/ProfileMetaData/1/0";
/// Service model namespace.
pub const SM_NS: &str = "http://entsoe.eu/opde/ServiceModel/1/0";
/// OPDM object model namespace.
pub const OPDM_NS: &str = "http://entsoe.eu/opdm/ObjectModel/1/0";

/// Anchor for object-level metadata.
pub const OBJECT_ANCHOR: &str = ".//opdm:OPDMObject";
/// Anchor for profile-level metadata.
pub const PROFILE_ANCHOR: &str = ".//opdm:Profile";
pub const COMPONENTS_ANCHOR: &str = ".//opde:Components";
pub const DEPENDENCIES_ANCHOR: &str = ".//opde:Dependencies";

const QUERY_OBJECT: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<sm:Query xmlns:opde="http://entsoe.eu/opde/ObjectModel/1/0"
          xmlns:pmd="http://entsoe.eu/opdm/ProfileMetaData/1/0"
          xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0"
          xmlns:opdm="http://entsoe.eu/opdm/ObjectModel/1/0">
  <sm:part name="name">{query_id}</sm:part>
  <sm:part name="query" type="opde:MetaDataPattern">
    <opdm:OPDMObject>
      <opde:Components/>
      <opde:Dependencies/>
    </opdm:OPDMObject>
  </sm:part>
</sm:Query>"#;

const QUERY_PROFILE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<sm:Query xmlns:opde="http://entsoe.eu/opde/ObjectModel/1/0"
          xmlns:pmd="http://entsoe.eu/opdm/ProfileMetaData/1/0"
          xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0"
          xmlns:opdm="http://entsoe.eu/opdm/ObjectModel/1/0">
  <sm:part name="name">{query_id}</sm:part>
  <sm:part name="query" type="opde:MetaDataPattern">
    <opdm:Profile/>
  </sm:part>
</sm:Query>"#;

const GET_CONTENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:GetContent xmlns="http://entsoe.eu/opde/ServiceModel/1/0"
               xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0"
               xmlns:opde="http://entsoe.eu/opde/ObjectModel/1/0"
               xmlns:opdm="http://entsoe.eu/opdm/ObjectModel/1/0">
  <sm:part name="content-return-mode">{return_mode}</sm:part>
</sm:GetContent>"#;

const CREATE_SUBSCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:CreateSubscription xmlns="http://entsoe.eu/opde/ServiceModel/1/0"
                       xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0"
                       xmlns:opde="http://entsoe.eu/opde/ObjectModel/1/0"
                       xmlns:pmd="http://entsoe.eu/opdm/ProfileMetaData/1/0"
                       xmlns:opdm="http://entsoe.eu/opdm/ObjectModel/1/0">
  <sm:part name="subscriptionID">{subscription_id}</sm:part>
  <sm:part name="publicationID">{publication_id}</sm:part>
  <sm:part name="mode">{mode}</sm:part>
  <sm:part name="pattern" type="opde:MetaDataPattern">
    <opdm:OPDMObject>
      <pmd:Object-Type>{object_type}</pmd:Object-Type>
    </opdm:OPDMObject>
  </sm:part>
</sm:CreateSubscription>"#;

const START_SUBSCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:StartSubscription xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0">
  <sm:part name="subscriptionID">{subscription_id}</sm:part>
</sm:StartSubscription>"#;

const STOP_SUBSCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:StopSubscription xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0">
  <sm:part name="subscriptionID">{subscription_id}</sm:part>
</sm:StopSubscription>"#;

const DELETE_SUBSCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:DeleteSubscription xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0">
  <sm:part name="subscriptionID">{subscription_id}</sm:part>
</sm:DeleteSubscription>"#;

const GET_SUBSCRIPTIONS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:GetSubscriptions xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0">
  <sm:part name="status">{status}</sm:part>
</sm:GetSubscriptions>"#;

const PUBLICATION_LIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:PublicationsSubscriptionList xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0">
  <sm:part name="listType">AVAILABLE_PUBLICATIONS</sm:part>
</sm:PublicationsSubscriptionList>"#;

const GET_PROFILE_PUBLICATION_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sm:GetProfilePublicationReport xmlns="http://entsoe.eu/opde/ServiceModel/1/0"
                                xmlns:opde="http://entsoe.eu/opde/ObjectModel/1/0"
                                xmlns:sm="http://entsoe.eu/opde/ServiceModel/1/0"
                                xmlns:pmd="http://entsoe.eu/opdm/ProfileMetaData/1/0"
                                xmlns:opdm="http://entsoe.eu/opdm/ObjectModel/1/0">
  <sm:part type="opde:MetaDataPattern">
    <opdm:Profile/>
  </sm:part>
</sm:GetProfilePublicationReport>"#;

/// Request shapes sent through `ExecuteOperation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    QueryObject,
    QueryProfile,
    GetContent,
    CreateSubscription,
    StartSubscription,
    StopSubscription,
    DeleteSubscription,
    GetSubscriptions,
    PublicationList,
    GetProfilePublicationReport,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Self::QueryObject,
        Self::QueryProfile,
        Self::GetContent,
        Self::CreateSubscription,
        Self::StartSubscription,
        Self::StopSubscription,
        Self::DeleteSubscription,
        Self::GetSubscriptions,
        Self::PublicationList,
        Self::GetProfilePublicationReport,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryObject => "QueryObject",
            Self::QueryProfile => "QueryProfile",
            Self::GetContent => "GetContent",
            Self::CreateSubscription => "CreateSubscription",
            Self::StartSubscription => "StartSubscription",
            Self::StopSubscription => "StopSubscription",
            Self::DeleteSubscription => "DeleteSubscription",
            Self::GetSubscriptions => "GetSubscriptions",
            Self::PublicationList => "PublicationList",
            Self::GetProfilePublicationReport => "GetProfilePublicationReport",
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            Self::QueryObject => QUERY_OBJECT,
            Self::QueryProfile => QUERY_PROFILE,
            Self::GetContent => GET_CONTENT,
            Self::CreateSubscription => CREATE_SUBSCRIPTION,
            Self::StartSubscription => START_SUBSCRIPTION,
            Self::StopSubscription => STOP_SUBSCRIPTION,
            Self::DeleteSubscription => DELETE_SUBSCRIPTION,
            Self::GetSubscriptions => GET_SUBSCRIPTIONS,
            Self::PublicationList => PUBLICATION_LIST,
            Self::GetProfilePublicationReport => GET_PROFILE_PUBLICATION_REPORT,
        }
    }

    /// Where metadata filters are injected, if the operation takes any.
    pub fn anchor(&self) -> Option<&'static str> {
        match self {
            Self::QueryObject | Self::CreateSubscription => Some(OBJECT_ANCHOR),
            Self::QueryProfile | Self::GetProfilePublicationReport => Some(PROFILE_ANCHOR),
            _ => None,
        }
    }

    /// Placeholders the template declares, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for name in scan_placeholders(self.template()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Render `operation`'s template with `params`.
///
/// Every declared placeholder needs a value and every parameter must name a
/// declared placeholder.
pub fn render(operation: Operation, params: &[(&str, &str)]) -> Result<String> {
    let template = operation.template();
    let declared = operation.placeholders();

    if let Some((unknown, _)) = params.iter().find(|(name, _)| !declared.contains(name)) {
        return Err(OpdmError::Template(format!(
            "{} has no placeholder '{{{}}}', declared: {:?}",
            operation.name(),
            unknown,
            declared
        )));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            OpdmError::Template(format!("unterminated placeholder in {}", operation.name()))
        })?;
        let name = &after[..end];
        let value = params
            .iter()
            .find(|(param, _)| *param == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                OpdmError::Template(format!(
                    "missing value for placeholder '{{{}}}' of {}",
                    name,
                    operation.name()
                ))
            })?;
        out.push_str(&escape(value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn scan_placeholders(template: &'static str) -> impl Iterator<Item = &'static str> {
    template.split('{').skip(1).filter_map(|chunk| {
        chunk
            .split_once('}')
            .map(|(name, _)| name)
            .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
    })
}
