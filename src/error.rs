//! Error types for the OPDM client.

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OpdmError>;

/// OPDM client errors.
#[derive(Error, Debug)]
pub enum OpdmError {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Anchor '{0}' not found in template")]
    AnchorNotFound(String),

    #[error("Invalid field key '{key}': {reason}")]
    InvalidFieldKey { key: String, reason: String },

    #[error("Unsupported {kind} '{value}', supported values are: {allowed}")]
    UnsupportedEnumValue {
        kind: &'static str,
        value: String,
        allowed: String,
    },

    #[error("Operator '{operator}' expects {expected}, got {got} value(s)")]
    OperatorArity {
        operator: String,
        expected: &'static str,
        got: usize,
    },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} '{value}' is not advertised by the service, advertised: {advertised}")]
    NotAdvertised {
        kind: &'static str,
        value: String,
        advertised: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("SOAP fault: {0}")]
    SoapFault(SoapFault),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpdmError {
    /// Stable error code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::XmlParse(_) => ErrorKind::InvalidXml,
            Self::AnchorNotFound(_) => ErrorKind::AnchorNotFound,
            Self::InvalidFieldKey { .. } => ErrorKind::InvalidFieldKey,
            Self::UnsupportedEnumValue { .. } => ErrorKind::UnsupportedEnumValue,
            Self::OperatorArity { .. } => ErrorKind::OperatorArity,
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::Template(_) => ErrorKind::Template,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotAdvertised { .. } => ErrorKind::NotAdvertised,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Http { .. } => ErrorKind::Http,
            Self::SoapFault(_) => ErrorKind::SoapFault,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the error was raised locally, before anything was sent.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::AnchorNotFound(_)
                | Self::InvalidFieldKey { .. }
                | Self::UnsupportedEnumValue { .. }
                | Self::OperatorArity { .. }
                | Self::InvalidPattern { .. }
                | Self::Template(_)
                | Self::InvalidArgument(_)
        )
    }
}

impl From<reqwest::Error> for OpdmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quick_xml::Error> for OpdmError {
    fn from(err: quick_xml::Error) -> Self {
        Self::XmlParse(err.to_string())
    }
}

/// Error codes for logs and CLI exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidXml,
    AnchorNotFound,
    InvalidFieldKey,
    UnsupportedEnumValue,
    OperatorArity,
    InvalidPattern,
    Template,
    InvalidArgument,
    /// Value rejected against the service's advertised state
    NotAdvertised,
    Transport,
    Http,
    SoapFault,
    Authentication,
    Config,
    Io,
}

impl ErrorKind {
    /// Get the string code for this error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidXml => "INVALID_XML",
            Self::AnchorNotFound => "ANCHOR_NOT_FOUND",
            Self::InvalidFieldKey => "INVALID_FIELD_KEY",
            Self::UnsupportedEnumValue => "UNSUPPORTED_ENUM_VALUE",
            Self::OperatorArity => "OPERATOR_ARITY",
            Self::InvalidPattern => "INVALID_PATTERN",
            Self::Template => "TEMPLATE",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotAdvertised => "NOT_ADVERTISED",
            Self::Transport => "TRANSPORT",
            Self::Http => "HTTP",
            Self::SoapFault => "SOAP_FAULT",
            Self::Authentication => "AUTHENTICATION",
            Self::Config => "CONFIG",
            Self::Io => "IO",
        }
    }
}

/// A SOAP 1.1 fault returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoapFault {
    /// `faultcode`, e.g. `soap:Client`
    pub code: String,
    /// `faultstring`
    pub message: String,
    /// Text of the `detail` element, if any
    pub detail: Option<String>,
}

impl SoapFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    /// Render as a complete SOAP 1.1 fault envelope.
    pub fn to_envelope(&self) -> String {
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!("\n      <detail>{}</detail>", escape(d.as_str())))
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>{}</faultcode>
      <faultstring>{}</faultstring>{}
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
            escape(self.code.as_str()),
            escape(self.message.as_str()),
            detail
        )
    }
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::InvalidXml.as_str(), "INVALID_XML");
        assert_eq!(ErrorKind::NotAdvertised.as_str(), "NOT_ADVERTISED");
    }

    #[test]
    fn test_local_errors() {
        assert!(OpdmError::AnchorNotFound(".//x".to_string()).is_local());
        assert!(!OpdmError::Transport("reset".to_string()).is_local());
        assert_eq!(
            OpdmError::Authentication("denied".to_string()).kind(),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn test_fault_envelope() {
        let mut fault = SoapFault::new("soap:Client", "Unknown <operation>");
        fault.detail = Some("ExecuteOperation".to_string());
        let xml = fault.to_envelope();
        assert!(xml.contains("http://schemas.xmlsoap.org/soap/envelope/"));
        assert!(xml.contains("<faultstring>Unknown &lt;operation&gt;</faultstring>"));
        assert!(xml.contains("<detail>ExecuteOperation</detail>"));
    }

    #[test]
    fn test_fault_display() {
        let fault = SoapFault::new("soap:Server", "boom");
        assert_eq!(fault.to_string(), "[soap:Server] boom");
    }
}
