//! Host-supplied protection configuration and manifest protection metadata.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::session::{MessageType, SessionType};

/// Protection data keyed by key system name (e.g. `com.widevine.alpha`).
pub type ProtectionDataSet = BTreeMap<String, ProtectionData>;

/// License server location: one URL, or one URL per message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerUrl {
    Single(String),
    PerMessageType(BTreeMap<String, String>),
}

/// A requirement level used in key system configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    Required,
    Optional,
    NotAllowed,
}

/// Per-system configuration supplied by the host application.
///
/// Field names accept both snake_case and the camelCase spelling used by web
/// players, so existing JSON configurations load unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionData {
    /// License server URL, optionally per message type.
    #[serde(alias = "serverURL")]
    pub server_url: Option<ServerUrl>,
    /// Deprecated single license URL, used when `server_url` is unset.
    #[serde(alias = "laURL")]
    pub la_url: Option<String>,
    /// Extra headers sent with every license request.
    #[serde(alias = "httpRequestHeaders")]
    pub http_request_headers: BTreeMap<String, String>,
    /// Send credentials. An `Authorization` header forces them regardless.
    #[serde(alias = "withCredentials")]
    pub with_credentials: Option<bool>,
    /// ClearKey keys, base64url key id to base64url key.
    pub clearkeys: BTreeMap<String, String>,
    /// Base64 server certificate pushed once the system is selected.
    #[serde(alias = "serverCertificate")]
    pub server_certificate: Option<String>,
    /// Persisted session to load instead of creating a new one.
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "sessionType")]
    pub session_type: Option<SessionType>,
    #[serde(alias = "audioRobustness")]
    pub audio_robustness: Option<String>,
    #[serde(alias = "videoRobustness")]
    pub video_robustness: Option<String>,
    #[serde(alias = "distinctiveIdentifier")]
    pub distinctive_identifier: Option<Requirement>,
    #[serde(alias = "persistentState")]
    pub persistent_state: Option<Requirement>,
    /// Custom data forwarded to the secure module at session creation.
    #[serde(alias = "cdmData")]
    pub cdm_data: Option<String>,
    /// Route license requests through the DRMtoday service format.
    pub drmtoday: bool,
}

impl ProtectionData {
    /// License URL configured for `message_type`.
    ///
    /// A single `server_url` wins; a per-message-type map is consulted next and
    /// falls through to the legacy `la_url` when it has no entry. Empty strings
    /// count as unset.
    pub fn configured_url(&self, message_type: MessageType) -> Option<&str> {
        let from_server_url = match &self.server_url {
            Some(ServerUrl::Single(url)) => Some(url.as_str()),
            Some(ServerUrl::PerMessageType(urls)) => {
                urls.get(message_type.as_str()).map(String::as_str)
            }
            None => None,
        };

        from_server_url
            .filter(|url| !url.is_empty())
            .or_else(|| self.la_url.as_deref().filter(|url| !url.is_empty()))
    }
}

/// Content protection metadata read from a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentProtectionDescriptor {
    /// Scheme identifier, e.g. `urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed`.
    #[serde(alias = "schemeIdUri")]
    pub scheme_id_uri: String,
    pub value: Option<String>,
    /// Base64 PSSH box carried in the manifest.
    pub pssh: Option<String>,
    /// Default key id, hex with or without dashes.
    #[serde(alias = "cencDefaultKid", alias = "default_KID")]
    pub default_kid: Option<String>,
}

impl ContentProtectionDescriptor {
    /// Descriptor for a scheme with a base64 PSSH box.
    pub fn with_pssh(scheme_id_uri: impl Into<String>, pssh_b64: impl Into<String>) -> Self {
        Self {
            scheme_id_uri: scheme_id_uri.into(),
            pssh: Some(pssh_b64.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_message_type_url_is_selected() {
        let data: ProtectionData = serde_json::from_str(
            r#"{"serverURL": {"license-request": "https://ls/a", "license-renewal": "https://ls/b"}}"#,
        )
        .expect("parse");
        assert_eq!(data.configured_url(MessageType::LicenseRequest), Some("https://ls/a"));
        assert_eq!(data.configured_url(MessageType::LicenseRenewal), Some("https://ls/b"));
        assert_eq!(data.configured_url(MessageType::LicenseRelease), None);
    }

    #[test]
    fn single_url_beats_legacy_url() {
        let data = ProtectionData {
            server_url: Some(ServerUrl::Single("https://new".to_string())),
            la_url: Some("https://old".to_string()),
            ..Default::default()
        };
        assert_eq!(data.configured_url(MessageType::LicenseRequest), Some("https://new"));
    }

    #[test]
    fn empty_and_missing_entries_fall_through_to_legacy_url() {
        let data = ProtectionData {
            server_url: Some(ServerUrl::Single(String::new())),
            la_url: Some("https://old".to_string()),
            ..Default::default()
        };
        assert_eq!(data.configured_url(MessageType::LicenseRequest), Some("https://old"));

        let data = ProtectionData {
            server_url: Some(ServerUrl::PerMessageType(BTreeMap::new())),
            la_url: Some("https://old".to_string()),
            ..Default::default()
        };
        assert_eq!(data.configured_url(MessageType::LicenseRenewal), Some("https://old"));
    }

    #[test]
    fn camel_case_fields_are_accepted() {
        let data: ProtectionData = serde_json::from_str(
            r#"{"laURL": "https://la", "httpRequestHeaders": {"X-Token": "t"}, "withCredentials": true, "sessionType": "persistent-license"}"#,
        )
        .expect("parse");
        assert_eq!(data.la_url.as_deref(), Some("https://la"));
        assert_eq!(data.http_request_headers.get("X-Token").map(String::as_str), Some("t"));
        assert_eq!(data.with_credentials, Some(true));
        assert_eq!(data.session_type, Some(SessionType::PersistentLicense));
    }
}
