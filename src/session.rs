//! SOAP session: transport, WS-Security and the remote operations.

use crate::config::{ClientConfig, Endpoints};
use crate::dom::{Document, Element};
use crate::error::{OpdmError, Result};
use crate::normalize::{normalize, NormalizeOptions};
use crate::soap;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Longest response body quoted in an HTTP error.
const MAX_ERROR_BODY: usize = 2048;

const MAX_REFRESH_MARGIN_SECS: u64 = 86_400;

/// Raw HTTP response of a SOAP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Posts serialized SOAP envelopes.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    async fn post(&self, url: &str, envelope: String) -> Result<TransportResponse>;
}

/// HTTP(S) transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        if !config.verify_tls {
            warn!("TLS certificate verification is disabled");
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SoapTransport for HttpTransport {
    async fn post(&self, url: &str, envelope: String) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "\"\"")
            .body(envelope)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

/// A security token and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    assertion_xml: String,
    expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Keep the token XML exactly as received, reading the expiry from the
    /// `NotOnOrAfter` attribute of its `Conditions` element.
    pub fn from_xml(xml: impl Into<String>) -> Result<Self> {
        let assertion_xml = xml.into();
        let document = Document::parse(&assertion_xml)
            .map_err(|e| OpdmError::Authentication(format!("invalid token: {}", e)))?;
        let expires_at = token_expiry(document.root())?;
        Ok(Self {
            assertion_xml,
            expires_at,
        })
    }

    pub fn assertion_xml(&self) -> &str {
        &self.assertion_xml
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once `now` is past the expiry less `margin`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now > self.expires_at - margin
    }
}

fn token_expiry(token: &Element) -> Result<DateTime<Utc>> {
    let conditions = if token.local_name() == "Conditions" {
        Some(token)
    } else {
        token.descendant("Conditions")
    };
    let not_on_or_after = conditions
        .and_then(|c| c.attribute("NotOnOrAfter"))
        .ok_or_else(|| {
            OpdmError::Authentication("token has no Conditions/@NotOnOrAfter".to_string())
        })?;
    parse_timestamp(not_on_or_after)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    // No offset: the service means UTC
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| OpdmError::Authentication(format!("invalid token expiry '{}': {}", value, e)))
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// Long-lived session bound to the service endpoints.
pub struct SoapSession {
    endpoints: Endpoints,
    credentials: Option<Credentials>,
    transport: Arc<dyn SoapTransport>,
    token: Mutex<Option<AuthToken>>,
    refresh_margin: chrono::Duration,
    debug: bool,
}

impl std::fmt::Debug for SoapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapSession")
            .field("endpoints", &self.endpoints)
            .field("authenticated", &self.credentials.is_some())
            .field("debug", &self.debug)
            .finish()
    }
}

impl SoapSession {
    /// Session over HTTPS.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Session over a caller-provided transport.
    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn SoapTransport>) -> Self {
        let credentials = config.has_credentials().then(|| Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        });

        info!(
            server = %config.server,
            authenticated = credentials.is_some(),
            "OPDM session created"
        );

        Self {
            endpoints: config.endpoints(),
            credentials,
            transport,
            token: Mutex::new(None),
            refresh_margin: chrono::Duration::seconds(
                config.token_refresh_margin_secs.min(MAX_REFRESH_MARGIN_SECS) as i64,
            ),
            debug: config.debug,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Expiry of the cached token, if one has been obtained.
    pub async fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token.lock().await.as_ref().map(AuthToken::expires_at)
    }

    /// Request a fresh token from the token service.
    pub async fn request_security_token(&self) -> Result<AuthToken> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| OpdmError::Authentication("no credentials configured".to_string()))?;

        let header = soap::username_token_header(&credentials.username, &credentials.password);
        let body = soap::operation("RequestSecurityToken").to_compact_string();
        let envelope = soap::envelope(Some(&header), &body);

        debug!(url = %self.endpoints.auth, user = %credentials.username, "Requesting security token");

        let (_, body) = self
            .exchange(&self.endpoints.auth, envelope, false)
            .await
            .map_err(|e| match e {
                OpdmError::SoapFault(fault) => OpdmError::Authentication(fault.to_string()),
                OpdmError::Http { status, body } if status == 401 || status == 403 => {
                    OpdmError::Authentication(format!("HTTP {}: {}", status, body))
                }
                other => other,
            })?;

        // Forwarded verbatim, signed assertions included
        let token_xml = soap::raw_return_payload(&body)
            .map_err(|e| OpdmError::Authentication(format!("invalid token response: {}", e)))?;
        let token = AuthToken::from_xml(token_xml)?;

        debug!(expires_at = %token.expires_at, "Security token received");
        Ok(token)
    }

    /// Assertion XML of a valid token, refreshing it when due.
    async fn security_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let now = Utc::now();

        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh(now, self.refresh_margin) {
                if self.debug {
                    debug!(valid_for = %(token.expires_at - now), "Security token still valid");
                }
                return Ok(token.assertion_xml.clone());
            }
        }

        debug!("Requesting new security token");
        let token = self.request_security_token().await?;
        let assertion = token.assertion_xml.clone();
        *guard = Some(token);
        Ok(assertion)
    }

    /// Send `body` to `url`, attaching the security header when authenticated.
    async fn call(&self, url: &str, body: &str) -> Result<Element> {
        let header = match self.credentials {
            Some(_) => Some(soap::token_header(&self.security_token().await?)),
            None => None,
        };
        let envelope = soap::envelope(header.as_deref(), body);
        self.send(url, envelope, self.debug).await
    }

    async fn send(&self, url: &str, envelope: String, log_envelopes: bool) -> Result<Element> {
        let (element, _) = self.exchange(url, envelope, log_envelopes).await?;
        Ok(element)
    }

    /// Post `envelope` and return the parsed Body element with the raw response.
    async fn exchange(
        &self,
        url: &str,
        envelope: String,
        log_envelopes: bool,
    ) -> Result<(Element, Vec<u8>)> {
        if log_envelopes {
            debug!(url = %url, envelope = %envelope, "SOAP request");
        }

        let response = self.transport.post(url, envelope).await?;

        if log_envelopes {
            debug!(
                status = response.status,
                envelope = %String::from_utf8_lossy(&response.body),
                "SOAP response"
            );
        }

        match soap::parse_response(&response.body) {
            Ok(element) if response.is_success() => Ok((element, response.body)),
            Err(OpdmError::SoapFault(fault)) => {
                warn!(code = %fault.code, message = %fault.message, "SOAP fault received");
                Err(OpdmError::SoapFault(fault))
            }
            Err(e) if response.is_success() => Err(e),
            _ => Err(http_error(&response)),
        }
    }

    /// `ExecuteOperation`: submit an operation document, return the document
    /// carried in the response's `return` element.
    pub async fn execute(&self, payload: &str) -> Result<Element> {
        let body = soap::operation("ExecuteOperation")
            .with_child(Element::new("payload").with_text(BASE64.encode(payload.as_bytes())))
            .to_compact_string();

        let response = self.call(&self.endpoints.service, &body).await?;
        soap::return_payload(&response)
    }

    /// [`SoapSession::execute`] followed by normalization.
    pub async fn execute_normalized(&self, payload: &str, options: &NormalizeOptions) -> Result<Value> {
        let element = self.execute(payload).await?;
        Ok(normalize(&element, options))
    }

    /// `PublicationRequest`: upload a named binary dataset.
    pub async fn submit_content(&self, name: &str, content: &[u8], content_type: &str) -> Result<Element> {
        let dataset = Element::new("dataset")
            .with_child(Element::new("id").with_text(name))
            .with_child(Element::new("type").with_text(content_type))
            .with_child(Element::new("content").with_text(BASE64.encode(content)));
        let body = soap::operation("PublicationRequest")
            .with_child(dataset)
            .to_compact_string();

        info!(name = %name, content_type = %content_type, size = content.len(), "Submitting content");
        self.call(&self.endpoints.service, &body).await
    }

    pub async fn get_installed_ruleset_version(&self) -> Result<String> {
        let response = self.ruleset_call("GetInstalledRuleSetVersion", None).await?;
        soap::return_text(&response)
    }

    /// `ListAvailableRuleSets`: one element per available ruleset.
    pub async fn list_available_rulesets(&self) -> Result<Vec<Element>> {
        let response = self.ruleset_call("ListAvailableRuleSets", None).await?;
        Ok(soap::return_elements(&response).cloned().collect())
    }

    pub async fn install_ruleset(&self, version: &str) -> Result<Element> {
        let version = Element::new("Version").with_text(version);
        self.ruleset_call("Install", Some(version)).await
    }

    pub async fn reset_ruleset(&self) -> Result<Element> {
        self.ruleset_call("Reset", None).await
    }

    async fn ruleset_call(&self, operation: &str, argument: Option<Element>) -> Result<Element> {
        let mut request = soap::operation(operation);
        if let Some(argument) = argument {
            request.push_child(argument);
        }
        debug!(operation = %operation, "Ruleset management call");
        self.call(&self.endpoints.ruleset, &request.to_compact_string()).await
    }
}

fn http_error(response: &TransportResponse) -> OpdmError {
    let mut body = String::from_utf8_lossy(&response.body).into_owned();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    OpdmError::Http {
        status: response.status,
        body,
    }
}

/// Parse an XML token document as returned by the token service.
pub fn parse_token(xml: &str) -> Result<AuthToken> {
    AuthToken::from_xml(xml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SoapFault;
    use std::sync::Mutex as StdMutex;

    const TOKEN: &str = r#"<saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="t-1"><saml2:Conditions NotBefore="2030-01-01T00:00:00Z" NotOnOrAfter="2030-01-01T01:00:00Z"/></saml2:Assertion>"#;

    /// Transport replying from a queue and recording what it was sent.
    struct ScriptedTransport {
        replies: StdMutex<Vec<TransportResponse>>,
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<TransportResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into_iter().rev().collect()),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SoapTransport for ScriptedTransport {
        async fn post(&self, url: &str, envelope: String) -> Result<TransportResponse> {
            self.sent.lock().unwrap().push((url.to_string(), envelope));
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| OpdmError::Transport("no scripted reply".to_string()))
        }
    }

    fn ok(body: String) -> TransportResponse {
        TransportResponse {
            status: 200,
            body: body.into_bytes(),
        }
    }

    fn response(operation: &str, inner: &str) -> String {
        format!(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:{op}Response xmlns:ns2="{ns}"><return>{inner}</return></ns2:{op}Response></soap:Body></soap:Envelope>"#,
            op = operation,
            ns = soap::SERVICE_NS,
            inner = inner
        )
    }

    fn config() -> ClientConfig {
        ClientConfig::new("https://opdm.test")
    }

    #[test]
    fn test_parse_token_expiry() {
        let token = parse_token(TOKEN).unwrap();
        assert_eq!(token.expires_at().to_rfc3339(), "2030-01-01T01:00:00+00:00");

        let naive = TOKEN.replace("2030-01-01T01:00:00Z", "2030-01-01T01:00:00.000");
        assert_eq!(parse_token(&naive).unwrap().expires_at(), token.expires_at());

        assert!(parse_token("<saml2:Assertion xmlns:saml2=\"urn:x\"/>").is_err());
    }

    #[test]
    fn test_needs_refresh_margin() {
        let token = parse_token(TOKEN).unwrap();
        let margin = chrono::Duration::seconds(5);
        let expiry = token.expires_at();
        assert!(!token.needs_refresh(expiry - chrono::Duration::seconds(6), margin));
        assert!(!token.needs_refresh(expiry - chrono::Duration::seconds(5), margin));
        assert!(token.needs_refresh(expiry - chrono::Duration::seconds(4), margin));
    }

    #[tokio::test]
    async fn test_execute_encodes_payload() {
        let transport = ScriptedTransport::new(vec![ok(response(
            "ExecuteOperation",
            "<sm:QueryResult xmlns:sm=\"urn:sm\"><sm:part>q-1</sm:part></sm:QueryResult>",
        ))]);
        let session = SoapSession::with_transport(&config(), transport.clone());

        let result = session.execute("<sm:Query/>").await.unwrap();
        assert_eq!(result.name(), "sm:QueryResult");

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://opdm.test/cxf/OPDMSoapInterface");
        assert!(!sent[0].1.contains("Security"));
        let envelope = Document::parse(&sent[0].1).unwrap();
        let payload = envelope.find(".//ns0:ExecuteOperation/payload").unwrap().unwrap();
        assert_eq!(BASE64.decode(payload.text()).unwrap(), b"<sm:Query/>");
    }

    #[tokio::test]
    async fn test_token_requested_once() {
        let transport = ScriptedTransport::new(vec![
            ok(response("RequestSecurityToken", TOKEN)),
            ok(response("GetInstalledRuleSetVersion", "1.2.3")),
            ok(response("GetInstalledRuleSetVersion", "1.2.3")),
        ]);
        let config = config().with_credentials("user", "pass");
        let session = SoapSession::with_transport(&config, transport.clone());

        assert_eq!(session.get_installed_ruleset_version().await.unwrap(), "1.2.3");
        assert_eq!(session.get_installed_ruleset_version().await.unwrap(), "1.2.3");

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].0.ends_with("/SoapAuthentication"));
        assert!(sent[0].1.contains("UsernameToken"));
        assert!(sent[0].1.contains("<wsse:Password"));
        for (url, envelope) in &sent[1..] {
            assert!(url.ends_with("/RuleSetManagementService"));
            assert!(envelope.contains("saml2:Assertion"));
            assert!(!envelope.contains("UsernameToken"));
        }
        assert!(session.token_expiry().await.is_some());
    }

    #[tokio::test]
    async fn test_expired_token_refreshed() {
        let expired = TOKEN.replace("2030-01-01T01:00:00Z", "2000-01-01T00:00:00Z");
        let transport = ScriptedTransport::new(vec![
            ok(response("RequestSecurityToken", &expired)),
            ok(response("Reset", "")),
            ok(response("RequestSecurityToken", TOKEN)),
            ok(response("Reset", "")),
        ]);
        let config = config().with_credentials("user", "pass");
        let session = SoapSession::with_transport(&config, transport.clone());

        session.reset_ruleset().await.unwrap();
        session.reset_ruleset().await.unwrap();
        let auth_calls = transport
            .sent()
            .iter()
            .filter(|(url, _)| url.ends_with("/SoapAuthentication"))
            .count();
        assert_eq!(auth_calls, 2);
    }

    #[tokio::test]
    async fn test_token_forwarded_with_inherited_namespace() {
        let token_response = format!(
            r#"<soap:Envelope xmlns:soap="{soap}"><soap:Body><ns2:RequestSecurityTokenResponse xmlns:ns2="{svc}" xmlns:saml2="{saml}"><return><saml2:Assertion ID="t">
  <saml2:Conditions NotOnOrAfter="2099-01-01T00:00:00Z"/>
</saml2:Assertion></return></ns2:RequestSecurityTokenResponse></soap:Body></soap:Envelope>"#,
            soap = soap::SOAP_11_NS,
            svc = soap::SERVICE_NS,
            saml = soap::SAML_NS
        );
        let transport = ScriptedTransport::new(vec![ok(token_response), ok(response("Reset", ""))]);
        let config = config().with_credentials("user", "pass");
        let session = SoapSession::with_transport(&config, transport.clone());

        session.reset_ruleset().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("ID=\"t\">\n  <saml2:Conditions NotOnOrAfter=\"2099-01-01T00:00:00Z\"/>\n</saml2:Assertion>"));

        let envelope = Document::parse(&sent[1].1).unwrap();
        let assertion = envelope
            .find(".//soapenv:Header/Security/Assertion")
            .unwrap()
            .unwrap();
        assert_eq!(assertion.attribute("xmlns:saml2"), Some(soap::SAML_NS));
    }

    /// Answers token requests only after yielding, so concurrent callers
    /// overlap while the first refresh is in flight.
    struct SlowTokenTransport {
        auth_posts: StdMutex<usize>,
        other_posts: StdMutex<usize>,
    }

    #[async_trait]
    impl SoapTransport for SlowTokenTransport {
        async fn post(&self, url: &str, _envelope: String) -> Result<TransportResponse> {
            if url.ends_with("/SoapAuthentication") {
                *self.auth_posts.lock().unwrap() += 1;
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                return Ok(ok(response("RequestSecurityToken", TOKEN)));
            }
            *self.other_posts.lock().unwrap() += 1;
            Ok(ok(response("Reset", "")))
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_refresh_token_once() {
        let transport = Arc::new(SlowTokenTransport {
            auth_posts: StdMutex::new(0),
            other_posts: StdMutex::new(0),
        });
        let config = config().with_credentials("user", "pass");
        let session = Arc::new(SoapSession::with_transport(&config, transport.clone()));

        let (a, b, c) = tokio::join!(
            session.reset_ruleset(),
            session.reset_ruleset(),
            session.reset_ruleset()
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(*transport.auth_posts.lock().unwrap(), 1);
        assert_eq!(*transport.other_posts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_soap_fault_propagates() {
        let fault = SoapFault::new("soap:Server", "Unknown operation");
        let transport = ScriptedTransport::new(vec![TransportResponse {
            status: 500,
            body: fault.to_envelope().into_bytes(),
        }]);
        let session = SoapSession::with_transport(&config(), transport);

        match session.execute("<x/>").await.unwrap_err() {
            OpdmError::SoapFault(received) => assert_eq!(received.message, "Unknown operation"),
            other => panic!("expected SOAP fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let transport = ScriptedTransport::new(vec![TransportResponse {
            status: 503,
            body: b"Service Unavailable".to_vec(),
        }]);
        let session = SoapSession::with_transport(&config(), transport);

        match session.execute("<x/>").await.unwrap_err() {
            OpdmError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "Service Unavailable");
            }
            other => panic!("expected HTTP error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let fault = SoapFault::new("wsse:FailedAuthentication", "Invalid username or password");
        let transport = ScriptedTransport::new(vec![TransportResponse {
            status: 500,
            body: fault.to_envelope().into_bytes(),
        }]);
        let config = config().with_credentials("user", "wrong");
        let session = SoapSession::with_transport(&config, transport);

        let err = session.reset_ruleset().await.unwrap_err();
        assert!(matches!(err, OpdmError::Authentication(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_submit_content() {
        let transport = ScriptedTransport::new(vec![ok(response("PublicationRequest", "<status>OK</status>"))]);
        let session = SoapSession::with_transport(&config(), transport.clone());

        let result = session.submit_content("model.zip", b"PK\x03\x04", "CGMES").await.unwrap();
        assert_eq!(result.local_name(), "PublicationRequestResponse");

        let sent = transport.sent();
        let envelope = Document::parse(&sent[0].1).unwrap();
        let dataset = envelope.find(".//ns0:PublicationRequest/dataset").unwrap().unwrap();
        assert_eq!(dataset.child("id").unwrap().text(), "model.zip");
        assert_eq!(dataset.child("type").unwrap().text(), "CGMES");
        assert_eq!(BASE64.decode(dataset.child("content").unwrap().text()).unwrap(), b"PK\x03\x04");
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let transport = ScriptedTransport::new(vec![]);
        let session = SoapSession::with_transport(&config(), transport);
        let err = session.submit_content("a", b"b", "CGMES").await.unwrap_err();
        assert!(matches!(err, OpdmError::Transport(_)));
    }
}
