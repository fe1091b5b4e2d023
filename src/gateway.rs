//! The platform side of key system negotiation.
//!
//! A [`ProtectionGateway`] wraps whatever actually talks to the secure
//! decryption module. Its methods only start operations; outcomes come back
//! later as [`GatewayEvent`]s the host feeds into the controller.
use std::fmt;

use crate::error::Result;
use crate::key::KeyMaterial;
use crate::keysystem::KeySystem;
use crate::protection::Requirement;
use crate::session::{KeyStatus, MessageType, SessionToken, SessionType};

/// Correlates an access request with its completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessRequestId(pub u64);

impl fmt::Display for AccessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "access#{}", self.0)
    }
}

/// Host handle of the media element keys are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaSinkHandle(pub u64);

/// A content type the secure module must decrypt, with its robustness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCapability {
    /// MIME type with codecs, e.g. `video/mp4;codecs="avc1.4d401f"`.
    pub content_type: String,
    pub robustness: String,
}

/// Configuration requested from the platform for one key system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySystemConfiguration {
    pub audio_capabilities: Vec<MediaCapability>,
    pub video_capabilities: Vec<MediaCapability>,
    pub distinctive_identifier: Requirement,
    pub persistent_state: Requirement,
    pub session_types: Vec<SessionType>,
}

impl Default for KeySystemConfiguration {
    fn default() -> Self {
        Self {
            audio_capabilities: Vec::new(),
            video_capabilities: Vec::new(),
            distinctive_identifier: Requirement::Optional,
            persistent_state: Requirement::Optional,
            session_types: vec![SessionType::Temporary],
        }
    }
}

/// One system offered to the platform, with acceptable configurations in
/// order of preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub key_system: KeySystem,
    pub configs: Vec<KeySystemConfiguration>,
}

/// Access granted by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySystemAccess {
    pub key_system: KeySystem,
    /// The configuration the platform accepted.
    pub configuration: KeySystemConfiguration,
}

/// Session lifecycle primitives of the platform.
///
/// Every method that returns `Ok` has started an operation whose outcome is
/// reported through the matching [`GatewayEvent`]. An `Err` means nothing was
/// started.
pub trait ProtectionGateway {
    /// Prepare the platform. Called once by `initialize`.
    fn init(&mut self) -> Result<()>;

    /// Ask for access to the first supported system of `requests`.
    /// Answered by [`GatewayEvent::AccessComplete`].
    fn request_access(&mut self, id: AccessRequestId, requests: &[AccessRequest]) -> Result<()>;

    /// Instantiate the secure module for `access`.
    /// Answered by [`GatewayEvent::SystemSelected`].
    fn select_system(&mut self, access: &KeySystemAccess) -> Result<()>;

    /// Currently selected key system.
    fn key_system(&self) -> Option<KeySystem>;

    /// Answered by [`GatewayEvent::SessionCreated`].
    fn create_session(
        &mut self,
        init_data: &[u8],
        session_type: SessionType,
        cdm_data: Option<&[u8]>,
    ) -> Result<()>;

    /// Answered by [`GatewayEvent::SessionCreated`].
    fn load_session(&mut self, session_id: &str, cdm_data: Option<&[u8]>) -> Result<()>;

    /// Apply a license or key set. Answered by [`GatewayEvent::KeyAdded`] or
    /// [`GatewayEvent::KeyError`].
    fn update_session(&mut self, token: &SessionToken, material: &KeyMaterial) -> Result<()>;

    /// Answered by [`GatewayEvent::SessionClosed`].
    fn close_session(&mut self, token: &SessionToken) -> Result<()>;

    /// Answered by [`GatewayEvent::SessionRemoved`].
    fn remove_session(&mut self, token: &SessionToken) -> Result<()>;

    /// Answered by [`GatewayEvent::ServerCertificateUpdated`].
    fn set_server_certificate(&mut self, certificate: &[u8]) -> Result<()>;

    fn set_media_sink(&mut self, sink: Option<MediaSinkHandle>) -> Result<()>;

    /// Initialization data of every open session, including sessions whose
    /// creation is still pending.
    fn list_init_data(&self) -> Vec<Vec<u8>>;

    /// Close every session and release the secure module.
    fn reset(&mut self);
}

/// Something that happened on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Encrypted media needs keys.
    NeedKey {
        init_data_type: String,
        init_data: Vec<u8>,
    },
    /// A session produced a message for the license server.
    KeyMessage {
        token: SessionToken,
        message: Vec<u8>,
        message_type: MessageType,
        /// URL suggested by the secure module.
        default_url: Option<String>,
    },
    KeyAdded {
        token: SessionToken,
    },
    KeyError {
        token: Option<SessionToken>,
        /// Platform key error code, 1 to 6.
        code: Option<u16>,
        message: String,
    },
    SessionCreated(std::result::Result<SessionToken, String>),
    SessionClosed(std::result::Result<SessionToken, String>),
    SessionRemoved(std::result::Result<SessionToken, String>),
    KeyStatusesChanged {
        token: SessionToken,
        statuses: Vec<(Vec<u8>, KeyStatus)>,
    },
    AccessComplete {
        request: AccessRequestId,
        result: std::result::Result<KeySystemAccess, String>,
    },
    SystemSelected(std::result::Result<KeySystem, String>),
    ServerCertificateUpdated(std::result::Result<(), String>),
}
