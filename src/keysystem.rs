//! Protection systems and their per-system behaviour.
//!
//! A [`KeySystemHandler`] knows how one DRM scheme finds its initialization
//! data, which headers and body its challenges need, and where its init data
//! hides a license URL. Widevine and ClearKey live here; PlayReady has its own
//! module because its messages are XML.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::{ClearKeySet, Key};
use crate::protection::{ContentProtectionDescriptor, ProtectionData};
use crate::session::SessionType;
use crate::utils::{b64_decode, b64url_encode};

/// A DRM scheme a secure module can implement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySystem {
    name: Cow<'static, str>,
    system_id: Uuid,
}

impl KeySystem {
    pub const WIDEVINE: KeySystem = KeySystem {
        name: Cow::Borrowed("com.widevine.alpha"),
        system_id: Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
    };
    pub const PLAYREADY: KeySystem = KeySystem {
        name: Cow::Borrowed("com.microsoft.playready"),
        system_id: Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
    };
    /// ClearKey as signalled by the W3C common PSSH system id.
    pub const CLEARKEY: KeySystem = KeySystem {
        name: Cow::Borrowed("org.w3.clearkey"),
        system_id: Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b),
    };
    /// ClearKey under its legacy prefixed name and system id.
    pub const WEBKIT_CLEARKEY: KeySystem = KeySystem {
        name: Cow::Borrowed("webkit-org.w3.clearkey"),
        system_id: Uuid::from_u128(0xe2719d58a985b3c9781ab030af78d30e),
    };

    /// Create a key system.
    pub fn new(name: impl Into<String>, system_id: Uuid) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            system_id,
        }
    }

    /// Reverse-domain name, the key used for protection data.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PSSH system id.
    pub fn system_id(&self) -> Uuid {
        self.system_id
    }

    /// `urn:uuid:` scheme identifier used in manifests.
    pub fn scheme_id_uri(&self) -> String {
        format!("urn:uuid:{}", self.system_id)
    }

    /// Whether this is one of the ClearKey variants.
    pub fn is_clear_key(&self) -> bool {
        self.name == KeySystem::CLEARKEY.name || self.name == KeySystem::WEBKIT_CLEARKEY.name
    }
}

impl fmt::Display for KeySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A protection system offered for selection, with the data needed to open
/// a session once it wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKeySystem {
    pub key_system: KeySystem,
    pub scheme_id_uri: String,
    /// Human readable name, for logs and UIs.
    pub name: String,
    pub session_type: SessionType,
    pub init_data: Option<Vec<u8>>,
    /// Custom data forwarded to the secure module.
    pub cdm_data: Option<Vec<u8>>,
    /// Persisted session to load instead of creating one.
    pub session_id: Option<String>,
}

/// Per-system behaviour plugged into the extension resolver.
pub trait KeySystemHandler: fmt::Debug + Send + Sync {
    fn key_system(&self) -> &KeySystem;

    fn display_name(&self) -> &str;

    /// Initialization data carried by a manifest descriptor.
    fn init_data_from_manifest(&self, descriptor: &ContentProtectionDescriptor) -> Option<Vec<u8>> {
        descriptor.pssh.as_deref().and_then(|p| b64_decode(p).ok())
    }

    /// Headers the license request needs, derived from the challenge.
    fn request_headers(&self, _message: &[u8]) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Body of the license request; `None` when the challenge is unusable.
    fn license_request_body(&self, message: &[u8]) -> Option<Vec<u8>> {
        Some(message.to_vec())
    }

    /// License URL embedded in the system's PSSH payload.
    fn license_url_from_init_data(&self, _pssh_data: &[u8]) -> Option<String> {
        None
    }

    /// Custom data for session creation.
    fn cdm_data(&self, _protection: Option<&ProtectionData>) -> Option<Vec<u8>> {
        None
    }

    /// Keys the application supplied directly, for systems with no network
    /// exchange.
    fn clear_keys(
        &self,
        _protection: Option<&ProtectionData>,
        _message: &[u8],
    ) -> Result<Option<ClearKeySet>> {
        Ok(None)
    }
}

/// Widevine passes challenges and licenses through untouched.
#[derive(Debug, Clone)]
pub struct Widevine {
    key_system: KeySystem,
}

impl Default for Widevine {
    fn default() -> Self {
        Self {
            key_system: KeySystem::WIDEVINE,
        }
    }
}

impl KeySystemHandler for Widevine {
    fn key_system(&self) -> &KeySystem {
        &self.key_system
    }

    fn display_name(&self) -> &str {
        "Widevine"
    }
}

#[derive(Debug, Deserialize)]
struct ClearKeyMessage {
    kids: Vec<String>,
    #[serde(rename = "type", default)]
    session_type: Option<SessionType>,
}

#[derive(Debug, Serialize)]
struct KeyIdsInitData {
    kids: Vec<String>,
}

/// ClearKey, in either its W3C or legacy prefixed form.
#[derive(Debug, Clone)]
pub struct ClearKey {
    key_system: KeySystem,
}

impl ClearKey {
    pub fn new() -> Self {
        Self {
            key_system: KeySystem::CLEARKEY,
        }
    }

    pub fn webkit() -> Self {
        Self {
            key_system: KeySystem::WEBKIT_CLEARKEY,
        }
    }
}

impl Default for ClearKey {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySystemHandler for ClearKey {
    fn key_system(&self) -> &KeySystem {
        &self.key_system
    }

    fn display_name(&self) -> &str {
        "ClearKey"
    }

    /// Falls back to `keyids` init data built from the default key id.
    fn init_data_from_manifest(&self, descriptor: &ContentProtectionDescriptor) -> Option<Vec<u8>> {
        if let Some(pssh) = descriptor.pssh.as_deref() {
            return b64_decode(pssh).ok();
        }
        let kid = descriptor.default_kid.as_deref()?;
        let kid = hex::decode(kid.replace('-', "")).ok()?;
        let init_data = KeyIdsInitData {
            kids: vec![b64url_encode(&kid)],
        };
        serde_json::to_vec(&init_data).ok()
    }

    /// ClearKey challenges are JSON and are forwarded verbatim.
    fn license_request_body(&self, message: &[u8]) -> Option<Vec<u8>> {
        serde_json::from_slice::<serde_json::Value>(message)
            .ok()
            .map(|_| message.to_vec())
    }

    fn clear_keys(
        &self,
        protection: Option<&ProtectionData>,
        message: &[u8],
    ) -> Result<Option<ClearKeySet>> {
        let Some(protection) = protection else {
            return Ok(None);
        };
        if protection.clearkeys.is_empty() {
            return Ok(None);
        }

        let request: ClearKeyMessage = serde_json::from_slice(message)?;
        let mut keys = Vec::with_capacity(request.kids.len());
        for kid in &request.kids {
            let lookup = kid.trim_end_matches('=');
            let key = protection
                .clearkeys
                .iter()
                .find(|(k, _)| k.trim_end_matches('=') == lookup)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    Error::InvalidProtectionData(format!("ClearKey key id {} is not known", kid))
                })?;
            keys.push(Key::from_b64url(kid, key)?);
        }

        Ok(Some(ClearKeySet::new(
            keys,
            request.session_type.unwrap_or_default(),
        )))
    }
}
