//! PlayReady support.
//!
//! PlayReady wraps its challenges in a UTF-16 XML envelope that also carries
//! the HTTP headers the license server expects, and its PSSH payload is a
//! PlayReady Object (PRO) whose WRM header may name the license URL.
use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keysystem::{KeySystem, KeySystemHandler};
use crate::protection::ProtectionData;
use crate::utils::{b64_decode, utf16le_decode, utf16le_encode};

const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// PlayReady key system handler.
#[derive(Debug, Clone)]
pub struct PlayReady {
    key_system: KeySystem,
}

impl Default for PlayReady {
    fn default() -> Self {
        Self {
            key_system: KeySystem::PLAYREADY,
        }
    }
}

impl KeySystemHandler for PlayReady {
    fn key_system(&self) -> &KeySystem {
        &self.key_system
    }

    fn display_name(&self) -> &str {
        "PlayReady"
    }

    /// Headers from the key message envelope. Older modules name the content
    /// type header `Content`; a missing content type defaults to XML.
    fn request_headers(&self, message: &[u8]) -> BTreeMap<String, String> {
        let mut headers = parse_key_message(message)
            .map(|m| m.headers)
            .unwrap_or_default();

        if let Some(content) = headers.remove("Content") {
            headers.insert("Content-Type".to_string(), content);
        }
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        headers
    }

    /// The decoded challenge for wrapped messages, the message itself
    /// otherwise.
    fn license_request_body(&self, message: &[u8]) -> Option<Vec<u8>> {
        match parse_key_message(message) {
            Some(envelope) => envelope.challenge,
            None => Some(message.to_vec()),
        }
    }

    fn license_url_from_init_data(&self, pssh_data: &[u8]) -> Option<String> {
        let xml = wrm_header(pssh_data).ok()?;
        let doc = roxmltree::Document::parse(&xml).ok()?;
        ["LA_URL", "LUI_URL"].iter().find_map(|tag| {
            doc.descendants()
                .find(|n| n.tag_name().name() == *tag)
                .and_then(|n| n.text())
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
        })
    }

    /// Custom data is handed to the module as UTF-16LE.
    fn cdm_data(&self, protection: Option<&ProtectionData>) -> Option<Vec<u8>> {
        protection
            .and_then(|p| p.cdm_data.as_deref())
            .filter(|data| !data.is_empty())
            .map(utf16le_encode)
    }
}

/// Contents of a `PlayReadyKeyMessage` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMessageEnvelope {
    /// Base64-decoded challenge; `None` when the envelope has no usable one.
    pub challenge: Option<Vec<u8>>,
    pub headers: BTreeMap<String, String>,
}

/// Parse a key message envelope, UTF-16LE or UTF-8.
///
/// Returns `None` when the message is not a wrapped PlayReady key message.
pub fn parse_key_message(message: &[u8]) -> Option<KeyMessageEnvelope> {
    let text = utf16le_decode(message)
        .filter(|t| t.contains("PlayReadyKeyMessage"))
        .or_else(|| {
            std::str::from_utf8(message)
                .ok()
                .filter(|t| t.contains("PlayReadyKeyMessage"))
                .map(str::to_string)
        })?;
    let doc = roxmltree::Document::parse(&text).ok()?;

    let challenge = doc
        .descendants()
        .find(|n| n.tag_name().name() == "Challenge")
        .and_then(|n| n.text())
        .and_then(|t| b64_decode(t).ok())
        .filter(|c| !c.is_empty());

    let mut headers = BTreeMap::new();
    for header in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "HttpHeader")
    {
        let child_text = |tag: &str| {
            header
                .children()
                .find(|c| c.tag_name().name() == tag)
                .and_then(|c| c.text())
                .map(|t| t.trim().to_string())
        };
        if let (Some(name), Some(value)) = (child_text("name"), child_text("value")) {
            headers.insert(name, value);
        }
    }

    Some(KeyMessageEnvelope { challenge, headers })
}

/// Extract the WRM header XML from a PlayReady Object.
pub fn wrm_header(pro: &[u8]) -> Result<String> {
    if pro.len() < 6 {
        return Err(Error::InvalidInitData("PlayReady data too short".to_string()));
    }

    let total_length = LittleEndian::read_u32(&pro[0..4]) as usize;
    if total_length != pro.len() {
        return Err(Error::InvalidInitData(
            "PlayReady object length mismatch".to_string(),
        ));
    }

    let record_count = LittleEndian::read_u16(&pro[4..6]) as usize;
    let mut offset = 6;

    for _ in 0..record_count {
        if pro.len() < offset + 4 {
            return Err(Error::InvalidInitData("PlayReady record truncated".to_string()));
        }
        let record_type = LittleEndian::read_u16(&pro[offset..offset + 2]);
        let record_length = LittleEndian::read_u16(&pro[offset + 2..offset + 4]) as usize;
        offset += 4;

        if pro.len() < offset + record_length {
            return Err(Error::InvalidInitData("PlayReady record truncated".to_string()));
        }
        let record_data = &pro[offset..offset + record_length];
        offset += record_length;

        if record_type != 0x01 {
            continue;
        }

        return utf16le_decode(record_data)
            .ok_or_else(|| Error::InvalidInitData("Invalid PlayReady XML".to_string()));
    }

    Err(Error::InvalidInitData(
        "No WRM header record in PlayReady object".to_string(),
    ))
}

/// Key ids listed in a WRM header (versions 4.0.0.0 to 4.3.0.0).
pub fn key_ids(pro: &[u8]) -> Result<Vec<Uuid>> {
    let xml = wrm_header(pro)?;
    let doc = roxmltree::Document::parse(&xml)
        .map_err(|e| Error::InvalidInitData(format!("PlayReady XML parse error: {}", e)))?;

    let root = doc.root_element();
    let version = root
        .attribute("version")
        .ok_or_else(|| Error::InvalidInitData("Missing PlayReady version".to_string()))?;

    let mut key_ids = Vec::new();
    for node in root.descendants().filter(|n| n.tag_name().name() == "KID") {
        let value = match version {
            "4.0.0.0" => node.text(),
            "4.1.0.0" | "4.2.0.0" | "4.3.0.0" => node.attribute("VALUE"),
            _ => {
                return Err(Error::InvalidInitData(format!(
                    "Unsupported PlayReady version {}",
                    version
                )))
            }
        };
        let Some(value) = value else {
            continue;
        };
        let bytes = b64_decode(value)?;
        // PlayReady stores GUIDs with the first three fields little-endian.
        let guid = Uuid::from_slice_le(&bytes)
            .map_err(|_| Error::InvalidInitData("Invalid PlayReady KID".to_string()))?;
        key_ids.push(guid);
    }

    if key_ids.is_empty() {
        return Err(Error::InvalidInitData(
            "No PlayReady KIDs found".to_string(),
        ));
    }
    Ok(key_ids)
}

/// Build a PlayReady Object holding a single WRM header record.
pub fn build_pro(wrm_header_xml: &str) -> Vec<u8> {
    let record = utf16le_encode(wrm_header_xml);
    let mut pro = Vec::with_capacity(record.len() + 10);
    pro.extend_from_slice(&((record.len() + 10) as u32).to_le_bytes());
    pro.extend_from_slice(&1u16.to_le_bytes());
    pro.extend_from_slice(&1u16.to_le_bytes());
    pro.extend_from_slice(&(record.len() as u16).to_le_bytes());
    pro.extend_from_slice(&record);
    pro
}

/// Summarise a SOAP fault returned by a PlayReady license server.
///
/// Falls back to the raw body when it is not a SOAP fault.
pub fn soap_fault_summary(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body).into_owned();
    let Ok(doc) = roxmltree::Document::parse(&text) else {
        return text;
    };
    let find = |tag: &str| {
        doc.descendants()
            .find(|n| n.tag_name().name() == tag)
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
    };

    let Some(fault) = find("faultstring") else {
        return text;
    };
    let mut summary = match find("StatusCode") {
        Some(code) => format!("code: {}, message: {}", code, fault),
        None => format!("message: {}", fault),
    };
    if let Some(custom) = find("CustomData") {
        summary.push_str(&format!(", custom data: {}", custom));
    }
    if let Some(redirect) = find("RedirectUrl") {
        summary.push_str(&format!(", redirect: {}", redirect));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    const WRM_HEADER: &str = r#"<WRMHEADER xmlns="http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader" version="4.3.0.0"><DATA><PROTECTINFO><KIDS><KID ALGID="AESCTR" VALUE="AAECAwQFBgcICQoLDA0ODw=="></KID></KIDS></PROTECTINFO><LA_URL>https://pr.example/rightsmanager.asmx</LA_URL></DATA></WRMHEADER>"#;

    fn wrapped_message(challenge: &[u8]) -> Vec<u8> {
        let xml = format!(
            concat!(
                r#"<PlayReadyKeyMessage type="LicenseAcquisition"><LicenseAcquisition Version="1">"#,
                r#"<Challenge encoding="base64encoded">{}</Challenge>"#,
                r#"<HttpHeaders><HttpHeader><name>Content</name><value>text/xml; charset=utf-8</value></HttpHeader>"#,
                r#"<HttpHeader><name>SOAPAction</name><value>"http://schemas.microsoft.com/DRM/2007/03/protocols/AcquireLicense"</value></HttpHeader>"#,
                r#"</HttpHeaders></LicenseAcquisition></PlayReadyKeyMessage>"#
            ),
            base64::engine::general_purpose::STANDARD.encode(challenge)
        );
        utf16le_encode(&xml)
    }

    #[test]
    fn wrapped_message_yields_challenge_and_headers() {
        let message = wrapped_message(b"<soap>challenge</soap>");
        let handler = PlayReady::default();

        assert_eq!(
            handler.license_request_body(&message),
            Some(b"<soap>challenge</soap>".to_vec())
        );
        let headers = handler.request_headers(&message);
        assert_eq!(headers.get("Content-Type").map(String::as_str), Some(DEFAULT_CONTENT_TYPE));
        assert!(!headers.contains_key("Content"));
        assert!(headers.get("SOAPAction").expect("soap action").contains("AcquireLicense"));
    }

    #[test]
    fn unwrapped_message_is_sent_verbatim_with_default_content_type() {
        let handler = PlayReady::default();
        assert_eq!(handler.license_request_body(b"raw"), Some(b"raw".to_vec()));
        let headers = handler.request_headers(b"raw");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Content-Type"], DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn la_url_is_read_from_pro() {
        let pro = build_pro(WRM_HEADER);
        assert_eq!(
            PlayReady::default().license_url_from_init_data(&pro).as_deref(),
            Some("https://pr.example/rightsmanager.asmx")
        );
        assert!(PlayReady::default().license_url_from_init_data(b"junk").is_none());
    }

    #[test]
    fn key_ids_are_read_as_little_endian_guids() {
        let pro = build_pro(WRM_HEADER);
        let ids = key_ids(&pro).expect("key ids");
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], Uuid::from_slice_le(&(0u8..16).collect::<Vec<_>>()).expect("uuid"));
    }

    #[test]
    fn soap_fault_is_summarised() {
        let body = br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>Access denied</faultstring><detail><Exception><StatusCode>0x8004C600</StatusCode></Exception></detail></soap:Fault></soap:Body></soap:Envelope>"#;
        assert_eq!(soap_fault_summary(body), "code: 0x8004C600, message: Access denied");
        assert_eq!(soap_fault_summary(b"plain failure"), "plain failure");
    }

    #[test]
    fn cdm_data_is_utf16() {
        let protection = ProtectionData {
            cdm_data: Some("ab".to_string()),
            ..Default::default()
        };
        assert_eq!(
            PlayReady::default().cdm_data(Some(&protection)),
            Some(vec![b'a', 0, b'b', 0])
        );
        assert_eq!(PlayReady::default().cdm_data(None), None);
    }
}
