//! Error types for rseme.
//!
//! These cover synchronous, caller-fixable problems. Failures that happen while
//! negotiating or acquiring licenses are reported as [`crate::fault::Fault`]s.

use thiserror::Error;

/// Main error type for rseme operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `initialize` was called without any audio or video codec.
    #[error("Missing media info: an audio or video codec is required")]
    MissingMediaInfo,

    /// The initialization data is malformed.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// Per-system protection data could not be used.
    #[error("Invalid protection data: {0}")]
    InvalidProtectionData(String),

    /// The controller configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The platform gateway rejected a call.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// The license transport could not issue a request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for rseme operations.
pub type Result<T> = std::result::Result<T, Error>;
