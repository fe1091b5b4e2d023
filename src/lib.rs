//! rseme - key system negotiation and license acquisition for encrypted media.
//!
//! This crate provides:
//! - Key system selection over candidates found in manifests and init data.
//! - Key session lifecycle driven through a platform gateway trait.
//! - License challenge/response handling for Widevine, PlayReady, ClearKey
//!   and DRMtoday servers.
//! - PSSH and PlayReady Object parsing.
//!
//! The [`controller::ProtectionController`] is sans-IO: the host feeds it
//! gateway events, license responses and clock ticks.
//!
//! Feature flags:
//! - `http`: reqwest/tokio based license transport.
//! - `tracing`: log through `tracing` (on by default).
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Controller configuration loading.
pub mod config;
/// The protection controller.
pub mod controller;
/// Common error types and Result alias.
pub mod error;
/// Public events and listener dispatch.
pub mod events;
/// License exchange bookkeeping.
pub mod exchange;
/// Faults reported to the host.
pub mod fault;
/// Platform gateway trait and events.
pub mod gateway;
/// Key material and ClearKey key sets.
pub mod key;
/// Key systems and per-system handlers.
pub mod keysystem;
/// License services and HTTP request values.
pub mod license;
/// PlayReady handler and PlayReady Object parsing.
pub mod playready;
/// Host protection data and manifest descriptors.
pub mod protection;
/// PSSH parsing utilities.
pub mod pssh;
/// Candidate discovery and per-system transforms.
pub mod resolver;
/// Session tokens and session vocabulary.
pub mod session;
/// License transports.
pub mod transport;
/// Shared helper utilities.
pub mod utils;

pub use controller::{ProtectionController, Selection};
pub use error::{Error, Result};
pub use fault::{Fault, FaultCode};
pub use keysystem::KeySystem;
