//! Key material applied to sessions.
//!
//! License services hand back either an opaque license blob for the secure
//! module or, for ClearKey, a set of key pairs serialised as a JSON Web Key
//! set.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::SessionType;
use crate::utils::{b64url_decode, b64url_encode};

/// A ClearKey content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /// Raw key id bytes.
    pub kid: Vec<u8>,
    /// Raw key bytes.
    pub key: Vec<u8>,
}

impl Key {
    /// Create a new Key.
    pub fn new(kid: Vec<u8>, key: Vec<u8>) -> Self {
        Self { kid, key }
    }

    /// Create a key from base64url encoded key id and key.
    pub fn from_b64url(kid: &str, key: &str) -> Result<Self> {
        Ok(Self::new(b64url_decode(kid)?, b64url_decode(key)?))
    }

    /// Key id as UUID, see [`Key::kid_to_uuid`].
    pub fn kid_uuid(&self) -> Uuid {
        Self::kid_to_uuid(&self.kid)
    }

    /// Convert a Key ID to a UUID.
    ///
    /// Handles various formats:
    /// - 16 bytes: direct UUID bytes
    /// - 32 bytes: hex-encoded UUID string
    /// - Other lengths: padded or truncated to 16 bytes
    pub fn kid_to_uuid(kid: &[u8]) -> Uuid {
        if kid.is_empty() {
            return Uuid::nil();
        }

        if kid.len() == 16 {
            return Uuid::from_slice(kid).unwrap_or_else(|_| Uuid::nil());
        }

        if kid.len() == 32 {
            if let Ok(s) = std::str::from_utf8(kid) {
                if let Ok(uuid) = Uuid::parse_str(s) {
                    return uuid;
                }
            }
        }

        let mut buf = [0u8; 16];
        let len = kid.len().min(16);
        buf[..len].copy_from_slice(&kid[..len]);
        Uuid::from_bytes(buf)
    }
}

/// A set of ClearKey keys for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearKeySet {
    pub keys: Vec<Key>,
    pub session_type: SessionType,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    session_type: Option<SessionType>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Jwk {
    #[serde(default = "default_kty")]
    kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    kid: String,
    k: String,
}

fn default_kty() -> String {
    "oct".to_string()
}

impl ClearKeySet {
    /// Create a key set.
    pub fn new(keys: Vec<Key>, session_type: SessionType) -> Self {
        Self { keys, session_type }
    }

    /// Serialise as the W3C ClearKey license format (a JWK set).
    pub fn to_jwk_set(&self) -> Vec<u8> {
        let set = JwkSet {
            keys: self
                .keys
                .iter()
                .map(|k| Jwk {
                    kty: default_kty(),
                    alg: Some("A128KW".to_string()),
                    kid: b64url_encode(&k.kid),
                    k: b64url_encode(&k.key),
                })
                .collect(),
            session_type: Some(self.session_type),
        };
        // A struct of strings always serialises.
        serde_json::to_vec(&set).unwrap_or_default()
    }

    /// Parse a JWK set as returned by a ClearKey license server.
    pub fn from_jwk_set(data: &[u8]) -> Result<Self> {
        let set: JwkSet = serde_json::from_slice(data)?;
        if set.keys.is_empty() {
            return Err(Error::DecodeError("JWK set contains no keys".to_string()));
        }
        let keys = set
            .keys
            .iter()
            .map(|jwk| Key::from_b64url(&jwk.kid, &jwk.k))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(keys, set.session_type.unwrap_or_default()))
    }
}

/// Material applied to a session through the gateway's update primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Opaque license response for the secure module.
    License(Vec<u8>),
    /// ClearKey keys.
    ClearKey(ClearKeySet),
}

impl KeyMaterial {
    /// Bytes handed to the session update primitive.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KeyMaterial::License(bytes) => bytes.clone(),
            KeyMaterial::ClearKey(set) => set.to_jwk_set(),
        }
    }
}
