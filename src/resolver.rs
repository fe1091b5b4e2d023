//! Protection extension resolver.
//!
//! Maps initialization data and manifest metadata to candidate key systems and
//! supplies the per-system pieces of the license pipeline. [`Extensions`] is
//! the built-in resolver covering PlayReady, Widevine and ClearKey; hosts can
//! register further [`KeySystemHandler`]s or implement [`ExtensionResolver`]
//! themselves.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::key::KeyMaterial;
use crate::keysystem::{CandidateKeySystem, ClearKey, KeySystem, KeySystemHandler, Widevine};
use crate::license::{
    ClearKeyLicenseService, DrmTodayLicenseService, LicenseService, PlayReadyLicenseService,
    WidevineLicenseService,
};
use crate::playready::PlayReady;
use crate::protection::{ContentProtectionDescriptor, ProtectionData, ProtectionDataSet};
use crate::pssh;
use crate::session::{MessageType, SessionType};

pub trait ExtensionResolver {
    /// Supported key systems, in order of preference.
    fn list_key_systems(&self) -> Vec<KeySystem>;

    /// Candidates for init data found in the media.
    fn candidates_for(&self, init_data: &[u8], session_type: SessionType)
        -> Vec<CandidateKeySystem>;

    /// Candidates for the protection descriptors of a manifest.
    fn candidates_from_manifest(
        &self,
        descriptors: &[ContentProtectionDescriptor],
        session_type: SessionType,
    ) -> Vec<CandidateKeySystem>;

    /// Service for a message; `None` when the message needs no network step.
    fn license_service_for(
        &self,
        key_system: &KeySystem,
        protection: Option<&ProtectionData>,
        message_type: MessageType,
    ) -> Option<Arc<dyn LicenseService>>;

    fn is_clear_key_variant(&self, key_system: &KeySystem) -> bool {
        key_system.is_clear_key()
    }

    /// Keys supplied directly by the host for a ClearKey message.
    fn synthesize_clear_key_material(
        &self,
        key_system: &KeySystem,
        protection: Option<&ProtectionData>,
        message: &[u8],
    ) -> Option<KeyMaterial>;

    fn init_data_equals(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    /// Accept new protection data.
    fn configure(&mut self, protection: &ProtectionDataSet);

    /// The part of `init_data` that belongs to `key_system`. Data that is not
    /// a PSSH box sequence is used verbatim.
    fn init_data_for(&self, key_system: &KeySystem, init_data: &[u8]) -> Option<Vec<u8>> {
        if pssh::is_box_sequence(init_data) {
            pssh::pssh_for_system(init_data, key_system.system_id())
        } else if init_data.is_empty() {
            None
        } else {
            Some(init_data.to_vec())
        }
    }

    /// Headers derived from the challenge by the key system.
    fn request_headers(&self, key_system: &KeySystem, message: &[u8]) -> BTreeMap<String, String>;

    /// Request body for the challenge; `None` when unusable.
    fn license_request_body(&self, key_system: &KeySystem, message: &[u8]) -> Option<Vec<u8>>;

    /// License URL embedded in a session's init data.
    fn license_url_from_init_data(&self, key_system: &KeySystem, init_data: &[u8])
        -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct KeyIdsInitData {
    kids: Vec<String>,
}

/// Built-in resolver.
#[derive(Debug)]
pub struct Extensions {
    handlers: Vec<Arc<dyn KeySystemHandler>>,
    protection: ProtectionDataSet,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            handlers: vec![
                Arc::new(PlayReady::default()),
                Arc::new(Widevine::default()),
                Arc::new(ClearKey::webkit()),
                Arc::new(ClearKey::new()),
            ],
            protection: ProtectionDataSet::new(),
        }
    }
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with no built-in systems.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            protection: ProtectionDataSet::new(),
        }
    }

    /// Add a handler. A handler for an already known key system replaces it.
    pub fn register(&mut self, handler: Arc<dyn KeySystemHandler>) {
        if let Some(existing) = self
            .handlers
            .iter_mut()
            .find(|h| h.key_system() == handler.key_system())
        {
            *existing = handler;
        } else {
            self.handlers.push(handler);
        }
    }

    fn handler(&self, key_system: &KeySystem) -> Option<&Arc<dyn KeySystemHandler>> {
        self.handlers
            .iter()
            .find(|h| h.key_system() == key_system)
            .or_else(|| self.handlers.iter().find(|h| h.key_system().name() == key_system.name()))
    }

    /// Systems the host allowed; every system when no protection data is set.
    fn allowed(&self, key_system: &KeySystem) -> bool {
        self.protection.is_empty() || self.protection.contains_key(key_system.name())
    }

    fn candidate(
        &self,
        handler: &dyn KeySystemHandler,
        init_data: Option<Vec<u8>>,
        session_type: SessionType,
    ) -> CandidateKeySystem {
        let key_system = handler.key_system().clone();
        let protection = self.protection.get(key_system.name());
        CandidateKeySystem {
            scheme_id_uri: key_system.scheme_id_uri(),
            name: handler.display_name().to_string(),
            session_type: protection
                .and_then(|p| p.session_type)
                .unwrap_or(session_type),
            init_data,
            cdm_data: handler.cdm_data(protection),
            session_id: protection.and_then(|p| p.session_id.clone()),
            key_system,
        }
    }
}

impl ExtensionResolver for Extensions {
    fn list_key_systems(&self) -> Vec<KeySystem> {
        self.handlers.iter().map(|h| h.key_system().clone()).collect()
    }

    fn candidates_for(
        &self,
        init_data: &[u8],
        session_type: SessionType,
    ) -> Vec<CandidateKeySystem> {
        let allowed = self
            .handlers
            .iter()
            .filter(|h| self.allowed(h.key_system()));

        if pssh::is_box_sequence(init_data) {
            let boxes = pssh::parse_pssh_list(init_data);
            return allowed
                .filter(|h| {
                    boxes
                        .iter()
                        .any(|b| b.pssh.system_id == h.key_system().system_id())
                })
                .map(|h| self.candidate(&**h, Some(init_data.to_vec()), session_type))
                .collect();
        }

        // `keyids` init data names ClearKey keys directly.
        if serde_json::from_slice::<KeyIdsInitData>(init_data).is_ok_and(|k| !k.kids.is_empty()) {
            return allowed
                .filter(|h| h.key_system().is_clear_key())
                .map(|h| self.candidate(&**h, Some(init_data.to_vec()), session_type))
                .collect();
        }

        trace!("init data of {} bytes names no known system", init_data.len());
        Vec::new()
    }

    fn candidates_from_manifest(
        &self,
        descriptors: &[ContentProtectionDescriptor],
        session_type: SessionType,
    ) -> Vec<CandidateKeySystem> {
        self.handlers
            .iter()
            .filter(|h| self.allowed(h.key_system()))
            .filter_map(|h| {
                let scheme = h.key_system().scheme_id_uri();
                let descriptor = descriptors
                    .iter()
                    .find(|d| d.scheme_id_uri.eq_ignore_ascii_case(&scheme))?;
                let init_data = h.init_data_from_manifest(descriptor);
                Some(self.candidate(&**h, init_data, session_type))
            })
            .collect()
    }

    fn license_service_for(
        &self,
        key_system: &KeySystem,
        protection: Option<&ProtectionData>,
        message_type: MessageType,
    ) -> Option<Arc<dyn LicenseService>> {
        if matches!(
            message_type,
            MessageType::LicenseRelease | MessageType::IndividualizationRequest
        ) {
            return None;
        }

        if protection.is_some_and(|p| p.drmtoday) {
            return Some(Arc::new(DrmTodayLicenseService));
        }

        if *key_system == KeySystem::PLAYREADY {
            Some(Arc::new(PlayReadyLicenseService))
        } else if key_system.is_clear_key() {
            Some(Arc::new(ClearKeyLicenseService))
        } else {
            Some(Arc::new(WidevineLicenseService))
        }
    }

    fn synthesize_clear_key_material(
        &self,
        key_system: &KeySystem,
        protection: Option<&ProtectionData>,
        message: &[u8],
    ) -> Option<KeyMaterial> {
        let handler = self.handler(key_system)?;
        match handler.clear_keys(protection, message) {
            Ok(keys) => keys.map(KeyMaterial::ClearKey),
            Err(e) => {
                warn!("cannot use configured ClearKey keys: {}", e);
                None
            }
        }
    }

    fn configure(&mut self, protection: &ProtectionDataSet) {
        self.protection = protection.clone();
    }

    fn request_headers(&self, key_system: &KeySystem, message: &[u8]) -> BTreeMap<String, String> {
        self.handler(key_system)
            .map(|h| h.request_headers(message))
            .unwrap_or_default()
    }

    fn license_request_body(&self, key_system: &KeySystem, message: &[u8]) -> Option<Vec<u8>> {
        match self.handler(key_system) {
            Some(handler) => handler.license_request_body(message),
            None => Some(message.to_vec()),
        }
    }

    fn license_url_from_init_data(
        &self,
        key_system: &KeySystem,
        init_data: &[u8],
    ) -> Option<String> {
        let handler = self.handler(key_system)?;
        handler.license_url_from_init_data(&pssh::pssh_data(init_data))
    }
}
