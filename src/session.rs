//! Key session handles and the per-session vocabulary.
//!
//! Sessions themselves live inside the platform gateway. The controller only
//! holds [`SessionToken`]s that reference them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Gateway-assigned identity of one key session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle to a platform key session.
///
/// Carries the initialization data the session was created from and, once the
/// secure module has assigned one, its session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Gateway handle.
    pub handle: SessionHandle,
    /// Session id assigned by the secure module.
    pub session_id: Option<String>,
    /// Initialization data the session was created from.
    pub init_data: Option<Vec<u8>>,
    /// Session type requested at creation.
    pub session_type: SessionType,
}

impl SessionToken {
    /// Create a token for a freshly created session.
    pub fn new(handle: SessionHandle, init_data: Option<Vec<u8>>, session_type: SessionType) -> Self {
        Self {
            handle,
            session_id: None,
            init_data,
            session_type,
        }
    }

    /// Attach the session id reported by the secure module.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(id) => write!(f, "{} ({})", self.handle, id),
            None => write!(f, "{}", self.handle),
        }
    }
}

/// Lifetime of the keys held by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    /// Keys are discarded when the session closes.
    #[default]
    Temporary,
    /// The license is persisted by the secure module and can be reloaded.
    PersistentLicense,
}

impl SessionType {
    /// Wire name used by the platform.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Temporary => "temporary",
            SessionType::PersistentLicense => "persistent-license",
        }
    }
}

/// Classification of a key-session challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

impl MessageType {
    /// Wire name used by the platform and as protection-data URL key.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::LicenseRequest => "license-request",
            MessageType::LicenseRenewal => "license-renewal",
            MessageType::LicenseRelease => "license-release",
            MessageType::IndividualizationRequest => "individualization-request",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one key inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

impl KeyStatus {
    /// Statuses that leave the key permanently unusable.
    pub fn is_error(self) -> bool {
        matches!(self, KeyStatus::Expired | KeyStatus::InternalError)
    }
}
