//! Faults reported to the host.
//!
//! Asynchronous failures never surface as `Err` from the controller API.
//! They are turned into a [`Fault`] and handed to the host's fault handler,
//! which decides whether playback can continue.
use std::fmt;

use crate::keysystem::KeySystem;
use crate::session::{MessageType, SessionToken};

/// Numeric fault category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Key error without a more specific code.
    KeyError,
    KeyErrorUnknown,
    KeyErrorClient,
    KeyErrorService,
    KeyErrorOutput,
    KeyErrorHardwareChange,
    KeyErrorDomain,
    /// The key message carried no usable challenge.
    NoChallenge,
    ServerCertificateError,
    KeyStatusError,
    NoLicenseUrl,
    AccessDenied,
    SessionCreationFailed,
    LicenseServerError,
    SelectionFailed,
    /// Init data arrived after selection but names no system matching the
    /// selected one.
    NoEligibleCandidate,
}

impl FaultCode {
    pub fn code(self) -> u16 {
        match self {
            FaultCode::KeyError => 100,
            FaultCode::KeyErrorUnknown => 101,
            FaultCode::KeyErrorClient => 102,
            FaultCode::KeyErrorService => 103,
            FaultCode::KeyErrorOutput => 104,
            FaultCode::KeyErrorHardwareChange => 105,
            FaultCode::KeyErrorDomain => 106,
            FaultCode::NoChallenge => 108,
            FaultCode::ServerCertificateError => 109,
            FaultCode::KeyStatusError => 110,
            FaultCode::NoLicenseUrl => 111,
            FaultCode::AccessDenied => 112,
            FaultCode::SessionCreationFailed => 113,
            FaultCode::LicenseServerError => 114,
            FaultCode::SelectionFailed => 115,
            FaultCode::NoEligibleCandidate => 116,
        }
    }

    /// Map a platform key error code (1 to 6) onto a fault code.
    pub fn from_key_error(code: Option<u16>) -> Self {
        match code {
            Some(1) => FaultCode::KeyErrorUnknown,
            Some(2) => FaultCode::KeyErrorClient,
            Some(3) => FaultCode::KeyErrorService,
            Some(4) => FaultCode::KeyErrorOutput,
            Some(5) => FaultCode::KeyErrorHardwareChange,
            Some(6) => FaultCode::KeyErrorDomain,
            _ => FaultCode::KeyError,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Structured details attached to a fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultContext {
    /// Key systems considered during a failed negotiation.
    pub key_systems: Vec<KeySystem>,
    pub session: Option<SessionToken>,
    pub message_type: Option<MessageType>,
    /// License server URL.
    pub url: Option<String>,
    /// HTTP status, when the server answered.
    pub status: Option<u16>,
    /// Server error body, decoded by the license service.
    pub response: Option<String>,
}

/// A failure reported through the fault channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
    pub context: FaultContext,
}

impl Fault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: FaultContext::default(),
        }
    }

    #[must_use]
    pub fn with_key_systems(mut self, key_systems: Vec<KeySystem>) -> Self {
        self.context.key_systems = key_systems;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionToken) -> Self {
        self.context.session = Some(session);
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.context.message_type = Some(message_type);
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.context.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.context.status = status;
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.context.response = Some(response.into());
        self
    }
}

/// Host callback receiving every fault.
pub type FaultHandler = Box<dyn FnMut(&Fault)>;
