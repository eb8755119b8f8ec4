//! Configuration types for the OPDM client.

use crate::error::{OpdmError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variables that override file configuration.
pub const ENV_SERVER: &str = "OPDM_SERVER";
pub const ENV_USERNAME: &str = "OPDM_USERNAME";
pub const ENV_PASSWORD: &str = "OPDM_PASSWORD";
pub const ENV_EXPORT_FOLDER: &str = "OPDM_EXPORT_FOLDER";

/// Path of the main SOAP interface below the server base URL.
pub const SERVICE_PATH: &str = "/cxf/OPDMSoapInterface";
/// Path of the token service.
pub const AUTH_PATH: &str = "/cxf/OPDMSoapInterface/SoapAuthentication";
/// Path of the ruleset management service.
pub const RULESET_PATH: &str = "/cxf/OPDMSoapInterface/RuleSetManagementService";

/// Main configuration for the OPDM client.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL, e.g. `https://opdm.example.org:8443`
    pub server: String,

    /// Username; empty disables authentication
    pub username: String,

    #[serde(skip_serializing)]
    pub password: String,

    /// Verify the server's TLS certificate
    pub verify_tls: bool,

    /// Log full SOAP envelopes at debug level
    pub debug: bool,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Renew the security token this many seconds before it expires
    pub token_refresh_margin_secs: u64,

    /// Where the CLI writes downloaded content and reports
    pub export_folder: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: String::new(),
            verify_tls: true,
            debug: false,
            timeout_secs: 120,
            token_refresh_margin_secs: 5,
            export_folder: PathBuf::from("."),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .field("verify_tls", &self.verify_tls)
            .field("debug", &self.debug)
            .field("timeout_secs", &self.timeout_secs)
            .field("token_refresh_margin_secs", &self.token_refresh_margin_secs)
            .field("export_folder", &self.export_folder)
            .finish()
    }
}

impl ClientConfig {
    /// Config for `server` with everything else defaulted.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| OpdmError::Config(e.to_string()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`; unset or empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        if let Some(server) = get(ENV_SERVER) {
            self.server = server;
        }
        if let Some(username) = get(ENV_USERNAME) {
            self.username = username;
        }
        if let Some(password) = get(ENV_PASSWORD) {
            self.password = password;
        }
        if let Some(folder) = get(ENV_EXPORT_FOLDER) {
            self.export_folder = PathBuf::from(folder);
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(OpdmError::Config("server address is required".to_string()));
        }
        if !self.server.starts_with("http://") && !self.server.starts_with("https://") {
            return Err(OpdmError::Config(format!(
                "server '{}' must start with http:// or https://",
                self.server
            )));
        }
        if !self.username.is_empty() && self.password.is_empty() {
            return Err(OpdmError::Config(format!(
                "password is required for user '{}'",
                self.username
            )));
        }
        if self.timeout_secs == 0 {
            return Err(OpdmError::Config("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Whether calls are authenticated.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::from_server(&self.server)
    }
}

/// Service endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub service: String,
    pub auth: String,
    pub ruleset: String,
}

impl Endpoints {
    pub fn from_server(server: &str) -> Self {
        let base = server.trim().trim_end_matches('/');
        Self {
            service: format!("{}{}", base, SERVICE_PATH),
            auth: format!("{}{}", base, AUTH_PATH),
            ruleset: format!("{}{}", base, RULESET_PATH),
        }
    }
}
