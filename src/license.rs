//! License services and the HTTP request/response values exchanged with them.
//!
//! A [`LicenseService`] describes how one license server speaks: which method
//! and response format it uses, how its responses turn into [`KeyMaterial`]
//! and how its error bodies read. The controller builds a [`LicenseRequest`]
//! from it and hands it to a transport.
use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::key::{ClearKeySet, KeyMaterial};
use crate::keysystem::KeySystem;
use crate::playready::soap_fault_summary;
use crate::session::MessageType;
use crate::utils::b64_decode;

/// HTTP method of a license request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected format of a license response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResponseType {
    #[default]
    Binary,
    Json,
}

/// One HTTP request to a license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub url: String,
    pub method: HttpMethod,
    pub response_type: ResponseType,
    pub headers: BTreeMap<String, String>,
    /// Send cookies and other credentials with the request.
    pub with_credentials: bool,
    pub body: Vec<u8>,
}

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl LicenseResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Status in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

/// Why an exchange did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request aborted")]
    Aborted,
    #[error("request timed out")]
    TimedOut,
    #[error("network error: {0}")]
    Network(String),
}

/// Outcome of one license exchange as reported by a transport.
pub type ExchangeResult = std::result::Result<LicenseResponse, TransportError>;

/// Protocol description of a license server.
pub trait LicenseService: fmt::Debug + Send + Sync {
    /// Final request URL given the configured one.
    fn server_url_from_message(
        &self,
        url: Option<String>,
        _message: &[u8],
        _message_type: MessageType,
    ) -> Option<String> {
        url
    }

    fn http_method(&self, _message_type: MessageType) -> HttpMethod {
        HttpMethod::Post
    }

    fn response_type(&self, _key_system: &KeySystem, _message_type: MessageType) -> ResponseType {
        ResponseType::Binary
    }

    /// Key material carried by a successful response; `None` when the body
    /// holds no usable license.
    fn license_message(
        &self,
        body: &[u8],
        key_system: &KeySystem,
        message_type: MessageType,
    ) -> Option<KeyMaterial>;

    /// Human readable description of an error body.
    fn error_response(&self, body: &[u8], _key_system: &KeySystem, _message_type: MessageType) -> String {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Widevine license proxies answer with the raw license.
#[derive(Debug, Clone, Copy, Default)]
pub struct WidevineLicenseService;

impl LicenseService for WidevineLicenseService {
    fn license_message(&self, body: &[u8], _: &KeySystem, _: MessageType) -> Option<KeyMaterial> {
        if body.is_empty() {
            return None;
        }
        Some(KeyMaterial::License(body.to_vec()))
    }
}

/// PlayReady servers answer with a SOAP envelope the module consumes as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayReadyLicenseService;

impl LicenseService for PlayReadyLicenseService {
    fn license_message(&self, body: &[u8], _: &KeySystem, _: MessageType) -> Option<KeyMaterial> {
        if body.is_empty() {
            return None;
        }
        Some(KeyMaterial::License(body.to_vec()))
    }

    fn error_response(&self, body: &[u8], _: &KeySystem, _: MessageType) -> String {
        soap_fault_summary(body)
    }
}

/// ClearKey servers answer with a JSON Web Key set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearKeyLicenseService;

impl LicenseService for ClearKeyLicenseService {
    fn response_type(&self, _: &KeySystem, _: MessageType) -> ResponseType {
        ResponseType::Json
    }

    fn license_message(&self, body: &[u8], _: &KeySystem, _: MessageType) -> Option<KeyMaterial> {
        match ClearKeySet::from_jwk_set(body) {
            Ok(set) => Some(KeyMaterial::ClearKey(set)),
            Err(e) => {
                debug!("ClearKey response is not a key set: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DrmTodayWidevineResponse {
    license: String,
}

/// castLabs DRMtoday. Widevine licenses come back base64 inside JSON,
/// PlayReady licenses as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmTodayLicenseService;

impl LicenseService for DrmTodayLicenseService {
    fn response_type(&self, key_system: &KeySystem, _: MessageType) -> ResponseType {
        if *key_system == KeySystem::WIDEVINE {
            ResponseType::Json
        } else {
            ResponseType::Binary
        }
    }

    fn license_message(
        &self,
        body: &[u8],
        key_system: &KeySystem,
        _: MessageType,
    ) -> Option<KeyMaterial> {
        if body.is_empty() {
            return None;
        }
        if *key_system == KeySystem::WIDEVINE {
            let response: DrmTodayWidevineResponse = serde_json::from_slice(body).ok()?;
            let license = b64_decode(&response.license).ok()?;
            return Some(KeyMaterial::License(license));
        }
        Some(KeyMaterial::License(body.to_vec()))
    }

    fn error_response(&self, body: &[u8], key_system: &KeySystem, _: MessageType) -> String {
        if *key_system == KeySystem::PLAYREADY {
            return soap_fault_summary(body);
        }
        String::from_utf8_lossy(body).into_owned()
    }
}
