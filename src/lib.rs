//! Client for the OPDM model exchange SOAP service
//!
//! Builds XML request documents from fixed templates, injects metadata
//! filter conditions into them, sends them over SOAP 1.1 with WS-Security
//! and flattens the responses into nested JSON values.
//!
//! # Features
//!
//! - Metadata filters with operators (`is after`, `is between`, `matches regex`, ...)
//!   validated on construction
//! - Object and profile queries, content download and upload
//! - Publication subscriptions (create, start, stop, delete, list)
//! - Profile publication reports
//! - Ruleset library management
//! - SAML token handling with automatic renewal
//!
//! # Example
//!
//! ```ignore
//! use opdm_client::{ClientConfig, ObjectQuery, ObjectType, OpdmClient};
//! use opdm_client::filter::{Condition, Operator};
//!
//! let config = ClientConfig::new("https://opdm.example.org:8443")
//!     .with_credentials("user", "password");
//! let client = OpdmClient::new(&config)?;
//!
//! let query = ObjectQuery::new(ObjectType::Igm)
//!     .filter("pmd:timeHorizon", "1D")
//!     .filter("pmd:scenarioDate", Condition::unary(Operator::IsAfter, "2021-12-30T00:00:00")?);
//! let response = client.query_object(&query).await?;
//! for model in response.objects("opdm:OPDMObject") {
//!     println!("{}", model);
//! }
//! ```

pub mod client;
pub mod config;
pub mod dom;
pub mod error;
pub mod filter;
pub mod inject;
pub mod normalize;
pub mod session;
pub mod soap;
pub mod templates;
pub mod types;

pub use client::OpdmClient;
pub use config::ClientConfig;
pub use error::{ErrorKind, OpdmError, Result, SoapFault};
pub use filter::{Condition, FilterValue, MetadataFilter, Operator};
pub use inject::inject;
pub use normalize::{normalize, AttributeMode, NormalizeOptions};
pub use session::{HttpTransport, SoapSession, SoapTransport, TransportResponse};
pub use templates::Operation;
pub use types::{
    ContentKind, ContentPayload, DownloadedContent, ObjectQuery, ObjectType, Publication,
    QueryResponse, ReportFilter, ReturnMode, RulesetInfo, Subscription, SubscriptionMode,
    SubscriptionRequest, SubscriptionStatus,
};
