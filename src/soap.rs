//! SOAP 1.1 envelope construction and response parsing.

use crate::dom::{Document, Element};
use crate::error::{OpdmError, Result, SoapFault};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const WSSE_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const PASSWORD_TEXT_TYPE: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";

/// Namespace of the service's SOAP operations.
pub const SERVICE_NS: &str = "http://soap.interfaces.application.components.opdm.entsoe.eu/";

/// Wrap `body` (one or more serialized elements) in a SOAP 1.1 envelope.
pub fn envelope(security_header: Option<&str>, body: &str) -> String {
    let header = security_header
        .map(|h| format!("\n  <soapenv:Header>{}</soapenv:Header>", h))
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="{}" xmlns:ns0="{}">{}
  <soapenv:Body>{}</soapenv:Body>
</soapenv:Envelope>"#,
        SOAP_11_NS, SERVICE_NS, header, body
    )
}

/// Body element for an operation in the service namespace, `ns0:<operation>`.
pub fn operation(name: &str) -> Element {
    Element::new(format!("ns0:{}", name))
}

/// WS-Security header with a UsernameToken (PasswordText).
pub fn username_token_header(username: &str, password: &str) -> String {
    format!(
        r#"<wsse:Security xmlns:wsse="{}"><wsse:UsernameToken><wsse:Username>{}</wsse:Username><wsse:Password Type="{}">{}</wsse:Password></wsse:UsernameToken></wsse:Security>"#,
        WSSE_NS,
        escape(username),
        PASSWORD_TEXT_TYPE,
        escape(password)
    )
}

/// WS-Security header carrying a SAML assertion.
pub fn token_header(assertion_xml: &str) -> String {
    format!(
        r#"<wsse:Security xmlns:wsse="{}">{}</wsse:Security>"#,
        WSSE_NS, assertion_xml
    )
}

/// Parse a SOAP response and return the first element of its Body.
///
/// A `Fault` in the Body is turned into [`OpdmError::SoapFault`].
pub fn parse_response(data: &[u8]) -> Result<Element> {
    let document = Document::parse_bytes(data)?;
    let envelope = document.root();

    if envelope.local_name() != "Envelope" {
        return Err(OpdmError::XmlParse(format!(
            "Expected SOAP Envelope, got '{}'",
            envelope.name()
        )));
    }
    let envelope_ns = match envelope.prefix() {
        Some(prefix) => document.namespace_uri(prefix),
        None => envelope
            .namespace_declarations()
            .find(|(p, _)| p.is_none())
            .map(|(_, uri)| uri),
    };
    if envelope_ns != Some(SOAP_11_NS) {
        return Err(OpdmError::XmlParse(format!(
            "Unsupported SOAP envelope namespace {:?}",
            envelope_ns
        )));
    }

    let body = envelope
        .child("Body")
        .ok_or_else(|| OpdmError::XmlParse("SOAP Envelope has no Body".to_string()))?;
    let first = body
        .first_child_element()
        .ok_or_else(|| OpdmError::XmlParse("SOAP Body is empty".to_string()))?;

    if first.local_name() == "Fault" {
        return Err(OpdmError::SoapFault(parse_fault(first)));
    }

    Ok(first.clone())
}

fn parse_fault(fault: &Element) -> SoapFault {
    let code = fault
        .child("faultcode")
        .map(Element::text)
        .unwrap_or_default();
    let message = fault
        .child("faultstring")
        .map(Element::text)
        .unwrap_or_default();
    let detail = fault.child("detail").map(|detail| {
        let text = detail.text();
        if text.is_empty() {
            detail
                .child_elements()
                .map(Element::to_compact_string)
                .collect::<Vec<_>>()
                .join("")
        } else {
            text
        }
    });

    SoapFault {
        code,
        message,
        detail: detail.filter(|d| !d.is_empty()),
    }
}

/// All `return` elements of an operation response.
pub fn return_elements(response: &Element) -> impl Iterator<Item = &Element> {
    response
        .child_elements()
        .filter(|element| element.local_name() == "return")
}

/// The XML document an `ExecuteOperation` response carries: the first element
/// inside `return`.
pub fn return_payload(response: &Element) -> Result<Element> {
    let ret = return_elements(response).next().ok_or_else(|| {
        OpdmError::XmlParse(format!("'{}' has no return element", response.name()))
    })?;

    if let Some(element) = ret.first_child_element() {
        return Ok(element.clone());
    }

    // Some deployments return the document as escaped text
    let text = ret.text();
    if text.is_empty() {
        return Err(OpdmError::XmlParse("Empty return element".to_string()));
    }
    Ok(Document::parse(&text)?.into_root())
}

/// The first element inside the first `return` element, cut verbatim from
/// the raw response.
///
/// Namespace declarations in scope from its ancestors are copied onto its
/// start tag so the fragment stands alone. Nothing else is touched, which
/// keeps signed content byte-identical. A `return` holding escaped text
/// yields that text unescaped.
pub fn raw_return_payload(data: &[u8]) -> Result<String> {
    let xml = std::str::from_utf8(data)
        .map_err(|e| OpdmError::XmlParse(format!("Invalid UTF-8: {}", e)))?;
    let mut reader = Reader::from_str(xml);

    // Namespace declarations of each open element
    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
    let mut return_depth: Option<usize> = None;
    let mut text = String::new();

    loop {
        let offset = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                if return_depth == Some(scopes.len()) {
                    if !empty {
                        reader.read_to_end(e.name())?;
                    }
                    let end = reader.buffer_position() as usize;
                    return with_inherited_namespaces(&xml[offset..end], e, &scopes);
                }
                let is_return = return_depth.is_none() && e.local_name().as_ref() == b"return";
                if empty {
                    if is_return {
                        return Err(OpdmError::XmlParse("Empty return element".to_string()));
                    }
                    continue;
                }
                scopes.push(namespace_declarations(e)?);
                if is_return {
                    return_depth = Some(scopes.len());
                }
            }
            Event::End(_) => {
                if return_depth == Some(scopes.len()) {
                    let text = text.trim();
                    if text.is_empty() {
                        return Err(OpdmError::XmlParse("Empty return element".to_string()));
                    }
                    return Ok(text.to_string());
                }
                scopes.pop();
            }
            Event::Text(ref e) if return_depth == Some(scopes.len()) => {
                text.push_str(&e.unescape()?);
            }
            Event::CData(ref e) if return_depth == Some(scopes.len()) => {
                text.push_str(&String::from_utf8_lossy(e));
            }
            Event::DocType(_) => {
                return Err(OpdmError::XmlParse(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Event::Eof => {
                return Err(OpdmError::XmlParse("Response has no return element".to_string()));
            }
            _ => {}
        }
    }
}

fn namespace_declarations(start: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut declarations = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| OpdmError::XmlParse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref());
        if key == "xmlns" || key.starts_with("xmlns:") {
            // Raw value, already escaped; only the quote style may change
            let value = String::from_utf8_lossy(&attr.value).replace('"', "&quot;");
            declarations.push((key.into_owned(), value));
        }
    }
    Ok(declarations)
}

/// Insert the declarations of `scopes` not shadowed by `start` itself (or a
/// nearer ancestor) right after the element name of `raw`.
fn with_inherited_namespaces(
    raw: &str,
    start: &BytesStart,
    scopes: &[Vec<(String, String)>],
) -> Result<String> {
    let mut seen: Vec<String> = namespace_declarations(start)?
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let mut inherited = Vec::new();
    for (key, value) in scopes.iter().rev().flatten() {
        if !seen.contains(key) {
            seen.push(key.clone());
            inherited.push(format!(" {}=\"{}\"", key, value));
        }
    }
    inherited.reverse();

    let name_end = 1 + start.name().as_ref().len();
    Ok(format!(
        "{}{}{}",
        &raw[..name_end],
        inherited.concat(),
        &raw[name_end..]
    ))
}

/// Text of the first `return` element.
pub fn return_text(response: &Element) -> Result<String> {
    return_elements(response)
        .next()
        .map(Element::text)
        .ok_or_else(|| OpdmError::XmlParse(format!("'{}' has no return element", response.name())))
}
