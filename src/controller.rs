//! Key system selection, session lifecycle and license acquisition.
//!
//! [`ProtectionController`] owns all negotiation state for one playback
//! session. It performs no I/O: gateway operations are started through a
//! [`ProtectionGateway`], HTTP exchanges through a [`LicenseTransport`], and
//! their outcomes are fed back by the host through
//! [`handle_gateway_event`](ProtectionController::handle_gateway_event),
//! [`handle_license_response`](ProtectionController::handle_license_response)
//! and [`poll_timeouts`](ProtectionController::poll_timeouts). Every handler
//! runs to completion on the caller's thread.
//!
//! Selection moves `Unset -> Selecting -> Selected`. Candidate batches that
//! arrive while a negotiation is running are queued and replayed once against
//! the winning system. A failed negotiation returns to `Unset` and keeps the
//! queue for the next attempt.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::events::{
    EventBus, EventKind, KeyMessage, KeyStatuses, LicenseRequestComplete, ListenerId, ProtectionEvent,
};
use crate::exchange::{ExchangeId, ExchangeTracker, LicenseExchange};
use crate::fault::{Fault, FaultCode, FaultHandler};
use crate::gateway::{
    AccessRequest, AccessRequestId, GatewayEvent, KeySystemAccess, KeySystemConfiguration,
    MediaCapability, MediaSinkHandle, ProtectionGateway,
};
use crate::key::KeyMaterial;
use crate::keysystem::{CandidateKeySystem, KeySystem};
use crate::license::{ExchangeResult, LicenseRequest, TransportError};
use crate::protection::{ContentProtectionDescriptor, ProtectionData, ProtectionDataSet, Requirement};
use crate::resolver::ExtensionResolver;
use crate::session::{KeyStatus, MessageType, SessionToken, SessionType};
use crate::transport::LicenseTransport;
use crate::utils::b64_decode;

/// Key system selection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    Unset,
    /// A negotiation is running; new candidates are queued.
    Selecting,
    Selected(KeySystem),
}

/// Candidates waiting for a negotiation to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    pub candidates: Vec<CandidateKeySystem>,
    /// Came from the manifest rather than from media init data.
    pub from_manifest: bool,
}

#[derive(Debug, Clone)]
enum AccessPurpose {
    /// First negotiation, over every candidate.
    Negotiate,
    /// Re-confirm access to the selected system for a new candidate.
    Revalidate(CandidateKeySystem),
}

/// Waits for one access request to complete.
#[derive(Debug, Clone)]
struct AccessListener {
    purpose: AccessPurpose,
    considered: Vec<KeySystem>,
    from_manifest: bool,
    deadline: Option<Instant>,
}

/// Waits for the platform to instantiate the granted system.
#[derive(Debug, Clone)]
struct SelectionListener {
    access: KeySystemAccess,
    considered: Vec<KeySystem>,
    from_manifest: bool,
    deadline: Option<Instant>,
}

pub struct ProtectionController<G, R, T> {
    gateway: G,
    resolver: R,
    transport: T,
    config: ControllerConfig,
    audio_codec: Option<String>,
    video_codec: Option<String>,
    initialized: bool,
    media_sink: Option<MediaSinkHandle>,
    selection: Selection,
    pending: VecDeque<PendingBatch>,
    next_access_id: u64,
    access_listeners: HashMap<AccessRequestId, AccessListener>,
    selection_listener: Option<SelectionListener>,
    exchanges: ExchangeTracker,
    events: EventBus,
    fault_handler: Option<FaultHandler>,
}

impl<G, R, T> ProtectionController<G, R, T>
where
    G: ProtectionGateway,
    R: ExtensionResolver,
    T: LicenseTransport,
{
    pub fn new(gateway: G, mut resolver: R, transport: T, config: ControllerConfig) -> Self {
        resolver.configure(&config.protection_data);
        Self {
            gateway,
            resolver,
            transport,
            config,
            audio_codec: None,
            video_codec: None,
            initialized: false,
            media_sink: None,
            selection: Selection::Unset,
            pending: VecDeque::new(),
            next_access_id: 0,
            access_listeners: HashMap::new(),
            selection_listener: None,
            exchanges: ExchangeTracker::new(),
            events: EventBus::new(),
            fault_handler: None,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Candidate batches waiting for a negotiation.
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// License exchanges running or queued.
    pub fn exchanges_in_flight(&self) -> usize {
        self.exchanges.len()
    }

    /// Prepare the gateway and start negotiating the systems named by the
    /// manifest. Only the first call has an effect.
    ///
    /// At least one of the audio and video content types must be known, since
    /// access requests are built from them.
    pub fn initialize(
        &mut self,
        descriptors: &[ContentProtectionDescriptor],
        audio_content_type: Option<&str>,
        video_content_type: Option<&str>,
    ) -> Result<()> {
        if self.initialized {
            debug!("protection controller already initialized");
            return Ok(());
        }
        if audio_content_type.is_none() && video_content_type.is_none() {
            return Err(Error::MissingMediaInfo);
        }

        self.gateway.init()?;
        self.audio_codec = audio_content_type.map(str::to_string);
        self.video_codec = video_content_type.map(str::to_string);
        self.initialized = true;

        let candidates = self
            .resolver
            .candidates_from_manifest(descriptors, self.config.session_type);
        if candidates.is_empty() {
            debug!("manifest names no supported key system, waiting for init data");
            return Ok(());
        }
        self.select_key_system(PendingBatch {
            candidates,
            from_manifest: true,
        });
        Ok(())
    }

    pub fn add_event_listener(
        &mut self,
        kind: EventKind,
        listener: impl FnMut(&ProtectionEvent) + 'static,
    ) -> ListenerId {
        self.events.on(kind, Box::new(listener))
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn set_fault_handler(&mut self, handler: impl FnMut(&Fault) + 'static) {
        self.fault_handler = Some(Box::new(handler));
    }

    pub fn set_session_type(&mut self, session_type: SessionType) {
        self.config.session_type = session_type;
    }

    pub fn set_robustness_level(&mut self, level: impl Into<String>) {
        self.config.robustness_level = level.into();
    }

    pub fn set_protection_data(&mut self, protection_data: ProtectionDataSet) {
        self.resolver.configure(&protection_data);
        self.config.protection_data = protection_data;
    }

    /// Attach or detach the media sink. Need-key events are only acted on
    /// while a sink is attached.
    pub fn attach_media_sink(&mut self, sink: Option<MediaSinkHandle>) -> Result<()> {
        self.gateway.set_media_sink(sink)?;
        self.media_sink = sink;
        Ok(())
    }

    /// Create a session for `init_data` with the selected system.
    ///
    /// Init data equal to that of an existing session is ignored.
    pub fn create_key_session(&mut self, init_data: &[u8], cdm_data: Option<&[u8]>) {
        let session_type = self
            .selected_protection()
            .and_then(|p| p.session_type)
            .unwrap_or(self.config.session_type);
        self.create_session(init_data, cdm_data, session_type);
    }

    /// Load a persisted session.
    pub fn load_key_session(&mut self, session_id: &str, cdm_data: Option<&[u8]>) {
        debug!("loading session {}", session_id);
        if let Err(e) = self.gateway.load_session(session_id, cdm_data) {
            self.session_creation_failed(format!("failed to load session {}: {}", session_id, e));
        }
    }

    pub fn remove_key_session(&mut self, token: &SessionToken) {
        self.cancel_exchanges(token);
        if let Err(e) = self.gateway.remove_session(token) {
            let fault = Fault::new(
                FaultCode::KeyError,
                format!("failed to remove session {}: {}", token, e),
            )
            .with_session(token.clone());
            warn!("{}", fault);
            self.emit(ProtectionEvent::KeySessionRemoved(Err(fault)));
        }
    }

    pub fn close_key_session(&mut self, token: &SessionToken) {
        self.cancel_exchanges(token);
        if let Err(e) = self.gateway.close_session(token) {
            let fault = Fault::new(
                FaultCode::KeyError,
                format!("failed to close session {}: {}", token, e),
            )
            .with_session(token.clone());
            warn!("{}", fault);
            self.emit(ProtectionEvent::KeySessionClosed(Err(fault)));
        }
    }

    pub fn set_server_certificate(&mut self, certificate: &[u8]) {
        if let Err(e) = self.gateway.set_server_certificate(certificate) {
            self.server_certificate_failed(format!("failed to set server certificate: {}", e));
        }
    }

    /// Abort all license exchanges, drop every pending negotiation and reset
    /// the gateway. Late responses for aborted work are ignored.
    pub fn teardown(&mut self) {
        info!("tearing down protection controller");
        for id in self.exchanges.drain() {
            debug!("aborting {}", id);
            self.transport.abort(id);
        }
        self.access_listeners.clear();
        self.selection_listener = None;
        self.pending.clear();
        self.selection = Selection::Unset;
        self.initialized = false;
        if self.media_sink.take().is_some() {
            if let Err(e) = self.gateway.set_media_sink(None) {
                warn!("failed to detach media sink: {}", e);
            }
        }
        self.gateway.reset();
        self.emit(ProtectionEvent::TeardownComplete);
    }

    pub fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::NeedKey {
                init_data_type,
                init_data,
            } => self.on_need_key(&init_data_type, &init_data),
            GatewayEvent::KeyMessage {
                token,
                message,
                message_type,
                default_url,
            } => self.on_key_message(token, message, message_type, default_url),
            GatewayEvent::KeyAdded { token } => {
                info!("keys added to session {}", token);
                self.emit(ProtectionEvent::KeyAdded(token));
            }
            GatewayEvent::KeyError {
                token,
                code,
                message,
            } => {
                let mut fault = Fault::new(FaultCode::from_key_error(code), message);
                if let Some(token) = token {
                    fault = fault.with_session(token);
                }
                self.emit(ProtectionEvent::KeyError(fault.clone()));
                self.raise(fault);
            }
            GatewayEvent::SessionCreated(Ok(token)) => {
                info!("session {} created", token);
                self.emit(ProtectionEvent::KeySessionCreated(Ok(token)));
            }
            GatewayEvent::SessionCreated(Err(message)) => self.session_creation_failed(message),
            GatewayEvent::SessionClosed(result) => {
                let result = result.map_err(|m| Fault::new(FaultCode::KeyError, m));
                self.emit(ProtectionEvent::KeySessionClosed(result));
            }
            GatewayEvent::SessionRemoved(result) => {
                let result = result.map_err(|m| Fault::new(FaultCode::KeyError, m));
                self.emit(ProtectionEvent::KeySessionRemoved(result));
            }
            GatewayEvent::KeyStatusesChanged { token, statuses } => {
                self.on_key_statuses(token, statuses)
            }
            GatewayEvent::AccessComplete { request, result } => {
                self.on_access_complete(request, result)
            }
            GatewayEvent::SystemSelected(result) => self.on_system_selected(result),
            GatewayEvent::ServerCertificateUpdated(Ok(())) => {
                debug!("server certificate updated");
                self.emit(ProtectionEvent::ServerCertificateUpdated(Ok(())));
            }
            GatewayEvent::ServerCertificateUpdated(Err(message)) => {
                self.server_certificate_failed(message)
            }
        }
    }

    /// Feed the outcome of a license exchange back in. Outcomes of exchanges
    /// that were cancelled, timed out or torn down are ignored.
    pub fn handle_license_response(&mut self, id: ExchangeId, result: ExchangeResult) {
        let Some((exchange, next)) = self.exchanges.finish(id) else {
            trace!("ignoring response for untracked {}", id);
            return;
        };
        self.complete_exchange(exchange, result);
        if let Some(next) = next {
            self.start_exchange(next);
        }
    }

    /// Expire negotiations and license exchanges whose deadline is at or
    /// before `now`.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<AccessRequestId> = self
            .access_listeners
            .iter()
            .filter(|(_, l)| l.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(listener) = self.access_listeners.remove(&id) {
                warn!("{} timed out", id);
                self.access_denied(listener, "key system access request timed out".to_string());
            }
        }

        if self
            .selection_listener
            .as_ref()
            .is_some_and(|l| l.deadline.is_some_and(|d| d <= now))
        {
            if let Some(listener) = self.selection_listener.take() {
                warn!("selection of {} timed out", listener.access.key_system);
                self.fail_negotiation(
                    FaultCode::AccessDenied,
                    format!("selection of {} timed out", listener.access.key_system),
                    listener.considered,
                    listener.from_manifest,
                );
            }
        }

        for id in self.exchanges.expired(now) {
            self.transport.abort(id);
            if let Some((exchange, next)) = self.exchanges.finish(id) {
                warn!("{} timed out", id);
                self.complete_exchange(exchange, Err(TransportError::TimedOut));
                if let Some(next) = next {
                    self.start_exchange(next);
                }
            }
        }
    }

    fn on_need_key(&mut self, init_data_type: &str, init_data: &[u8]) {
        if self.media_sink.is_none() {
            debug!("ignoring need-key event without a media sink");
            return;
        }
        if init_data_type != "cenc" {
            warn!("only cenc init data is supported, ignoring {}", init_data_type);
            return;
        }
        if init_data.is_empty() {
            debug!("ignoring need-key event without init data");
            return;
        }

        let candidates = self
            .resolver
            .candidates_for(init_data, self.config.session_type);
        if candidates.is_empty() {
            debug!("init data names no supported key system");
            return;
        }
        self.select_key_system(PendingBatch {
            candidates,
            from_manifest: false,
        });
    }

    fn select_key_system(&mut self, batch: PendingBatch) {
        match self.selection.clone() {
            Selection::Unset => self.negotiate(batch),
            Selection::Selecting => {
                debug!("negotiation running, queueing {} candidates", batch.candidates.len());
                self.pending.push_back(batch);
            }
            Selection::Selected(key_system) => self.revalidate(key_system, batch),
        }
    }

    fn negotiate(&mut self, batch: PendingBatch) {
        let considered: Vec<KeySystem> = batch
            .candidates
            .iter()
            .map(|c| c.key_system.clone())
            .collect();
        let requests: Vec<AccessRequest> = batch
            .candidates
            .iter()
            .map(|c| AccessRequest {
                key_system: c.key_system.clone(),
                configs: vec![self.configuration_for(c)],
            })
            .collect();
        let from_manifest = batch.from_manifest;

        self.selection = Selection::Selecting;
        self.pending.push_back(batch);

        let id = self.next_access_id();
        info!(
            "requesting access to {} ({})",
            considered
                .iter()
                .map(KeySystem::name)
                .collect::<Vec<_>>()
                .join(", "),
            id
        );
        self.access_listeners.insert(
            id,
            AccessListener {
                purpose: AccessPurpose::Negotiate,
                considered,
                from_manifest,
                deadline: self.negotiation_deadline(),
            },
        );

        if let Err(e) = self.gateway.request_access(id, &requests) {
            if let Some(listener) = self.access_listeners.remove(&id) {
                self.access_denied(listener, e.to_string());
            }
        }
    }

    fn revalidate(&mut self, key_system: KeySystem, batch: PendingBatch) {
        let Some(candidate) = batch
            .candidates
            .iter()
            .find(|c| c.key_system == key_system)
            .cloned()
        else {
            let considered = batch.candidates.iter().map(|c| c.key_system.clone()).collect();
            self.raise(
                Fault::new(
                    FaultCode::NoEligibleCandidate,
                    format!("init data offers no candidate for selected key system {}", key_system),
                )
                .with_key_systems(considered),
            );
            return;
        };

        let id = self.next_access_id();
        debug!("re-confirming access to {} ({})", key_system, id);
        let request = AccessRequest {
            key_system: key_system.clone(),
            configs: vec![self.configuration_for(&candidate)],
        };
        self.access_listeners.insert(
            id,
            AccessListener {
                purpose: AccessPurpose::Revalidate(candidate),
                considered: vec![key_system],
                from_manifest: batch.from_manifest,
                deadline: self.negotiation_deadline(),
            },
        );

        if let Err(e) = self.gateway.request_access(id, &[request]) {
            if let Some(listener) = self.access_listeners.remove(&id) {
                self.access_denied(listener, e.to_string());
            }
        }
    }

    fn on_access_complete(
        &mut self,
        id: AccessRequestId,
        result: std::result::Result<KeySystemAccess, String>,
    ) {
        let Some(listener) = self.access_listeners.remove(&id) else {
            debug!("ignoring completion of abandoned {}", id);
            return;
        };

        let access = match result {
            Ok(access) => access,
            Err(message) => {
                self.access_denied(listener, message);
                return;
            }
        };

        match listener.purpose {
            AccessPurpose::Negotiate => {
                info!("access granted to {}", access.key_system);
                if let Err(e) = self.gateway.select_system(&access) {
                    self.fail_negotiation(
                        FaultCode::SelectionFailed,
                        format!("failed to select {}: {}", access.key_system, e),
                        listener.considered,
                        listener.from_manifest,
                    );
                    return;
                }
                self.selection_listener = Some(SelectionListener {
                    access,
                    considered: listener.considered,
                    from_manifest: listener.from_manifest,
                    deadline: self.negotiation_deadline(),
                });
            }
            AccessPurpose::Revalidate(candidate) => {
                debug!("access to {} re-confirmed", access.key_system);
                self.open_session(&candidate);
            }
        }
    }

    fn on_system_selected(&mut self, result: std::result::Result<KeySystem, String>) {
        let Some(listener) = self.selection_listener.take() else {
            debug!("ignoring unexpected key system selection");
            return;
        };

        if let Err(message) = result {
            self.fail_negotiation(
                FaultCode::SelectionFailed,
                format!("failed to select {}: {}", listener.access.key_system, message),
                listener.considered,
                listener.from_manifest,
            );
            return;
        }

        let key_system = listener.access.key_system.clone();
        info!("key system {} selected", key_system);
        self.selection = Selection::Selected(key_system.clone());
        self.emit(ProtectionEvent::KeySystemSelected(Ok(listener.access)));

        let certificate = self
            .selected_protection()
            .and_then(|p| p.server_certificate.clone())
            .filter(|c| !c.is_empty());
        if let Some(certificate) = certificate {
            match b64_decode(&certificate) {
                Ok(certificate) => self.set_server_certificate(&certificate),
                Err(e) => self.server_certificate_failed(format!(
                    "configured server certificate is not valid base64: {}",
                    e
                )),
            }
        }

        while let Some(batch) = self.pending.pop_front() {
            match batch.candidates.iter().find(|c| c.key_system == key_system) {
                Some(candidate) => {
                    let candidate = candidate.clone();
                    self.open_session(&candidate);
                }
                None => debug!("queued candidates do not include {}, skipping", key_system),
            }
        }
    }

    /// Access to a system was refused, or the request could not be made.
    fn access_denied(&mut self, listener: AccessListener, message: String) {
        match listener.purpose {
            AccessPurpose::Negotiate => self.fail_negotiation(
                FaultCode::AccessDenied,
                message,
                listener.considered,
                listener.from_manifest,
            ),
            AccessPurpose::Revalidate(candidate) => {
                let fault = Fault::new(
                    FaultCode::AccessDenied,
                    format!("access to {} refused: {}", candidate.key_system, message),
                )
                .with_key_systems(listener.considered);
                if !listener.from_manifest {
                    self.emit(ProtectionEvent::KeySystemSelected(Err(fault.clone())));
                }
                self.raise(fault);
            }
        }
    }

    fn fail_negotiation(
        &mut self,
        code: FaultCode,
        message: String,
        considered: Vec<KeySystem>,
        from_manifest: bool,
    ) {
        self.selection = Selection::Unset;
        self.selection_listener = None;
        let fault = Fault::new(code, message).with_key_systems(considered);
        if !from_manifest {
            self.emit(ProtectionEvent::KeySystemSelected(Err(fault.clone())));
        }
        self.raise(fault);
    }

    fn open_session(&mut self, candidate: &CandidateKeySystem) {
        if let Some(session_id) = candidate.session_id.as_deref() {
            self.load_key_session(session_id, candidate.cdm_data.as_deref());
        } else if let Some(init_data) = candidate.init_data.as_deref() {
            self.create_session(init_data, candidate.cdm_data.as_deref(), candidate.session_type);
        } else {
            debug!("{} has no init data yet", candidate.key_system);
        }
    }

    fn create_session(
        &mut self,
        init_data: &[u8],
        cdm_data: Option<&[u8]>,
        session_type: SessionType,
    ) {
        let Selection::Selected(key_system) = self.selection.clone() else {
            self.session_creation_failed("no key system selected".to_string());
            return;
        };

        let derived = self
            .resolver
            .init_data_for(&key_system, init_data)
            .filter(|d| !d.is_empty());
        let Some(derived) = derived else {
            self.session_creation_failed(format!(
                "no initialization data for selected system {}",
                key_system
            ));
            return;
        };

        let duplicate = self
            .gateway
            .list_init_data()
            .iter()
            .any(|existing| self.resolver.init_data_equals(existing, &derived));
        if duplicate {
            debug!("a session for this init data already exists");
            return;
        }

        debug!("creating {} session", session_type.as_str());
        if let Err(e) = self.gateway.create_session(&derived, session_type, cdm_data) {
            self.session_creation_failed(format!("failed to create session: {}", e));
        }
    }

    fn on_key_statuses(&mut self, token: SessionToken, statuses: Vec<(Vec<u8>, KeyStatus)>) {
        let failed: Vec<String> = statuses
            .iter()
            .filter(|(_, status)| status.is_error())
            .map(|(kid, status)| format!("{}: {:?}", hex::encode(kid), status))
            .collect();

        if failed.is_empty() {
            self.emit(ProtectionEvent::KeyStatusesChanged(Ok(KeyStatuses {
                token,
                statuses,
            })));
            return;
        }

        let fault = Fault::new(
            FaultCode::KeyStatusError,
            format!("key status error ({})", failed.join(", ")),
        )
        .with_session(token);
        self.emit(ProtectionEvent::KeyStatusesChanged(Err(fault.clone())));
        self.raise(fault);
    }

    fn on_key_message(
        &mut self,
        token: SessionToken,
        message: Vec<u8>,
        message_type: MessageType,
        default_url: Option<String>,
    ) {
        self.emit(ProtectionEvent::KeyMessage(KeyMessage {
            token: token.clone(),
            message: message.clone(),
            message_type,
        }));

        if message.is_empty() {
            self.license_request_failed(
                &token,
                message_type,
                Fault::new(FaultCode::NoChallenge, "key message carries no challenge"),
            );
            return;
        }

        let key_system = match &self.selection {
            Selection::Selected(key_system) => Some(key_system.clone()),
            _ => self.gateway.key_system(),
        };
        let Some(key_system) = key_system else {
            self.license_request_failed(
                &token,
                message_type,
                Fault::new(
                    FaultCode::KeyError,
                    format!("key message for {} arrived without a selected key system", token),
                ),
            );
            return;
        };
        let protection = self.config.protection_data.get(key_system.name()).cloned();

        let Some(service) =
            self.resolver
                .license_service_for(&key_system, protection.as_ref(), message_type)
        else {
            debug!("{} message needs no license server", message_type);
            self.emit(ProtectionEvent::LicenseRequestComplete(LicenseRequestComplete {
                token,
                message_type,
                result: Ok(()),
            }));
            return;
        };

        if self.resolver.is_clear_key_variant(&key_system) {
            if let Some(material) = self.resolver.synthesize_clear_key_material(
                &key_system,
                protection.as_ref(),
                &message,
            ) {
                debug!("using configured ClearKey keys for {}", token);
                self.apply_material(token, message_type, &material);
                return;
            }
        }

        let url = protection
            .as_ref()
            .and_then(|p| p.configured_url(message_type))
            .map(str::to_string)
            .or_else(|| {
                token
                    .init_data
                    .as_deref()
                    .and_then(|d| self.resolver.license_url_from_init_data(&key_system, d))
            })
            .or(default_url.filter(|u| !u.is_empty()));
        let Some(url) = service.server_url_from_message(url, &message, message_type) else {
            self.license_request_failed(
                &token,
                message_type,
                Fault::new(
                    FaultCode::NoLicenseUrl,
                    format!("no license server URL for {}", key_system),
                ),
            );
            return;
        };

        let mut headers: BTreeMap<String, String> = protection
            .as_ref()
            .map(|p| p.http_request_headers.clone())
            .unwrap_or_default();
        for (name, value) in self.resolver.request_headers(&key_system, &message) {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(&name));
            headers.insert(name, value);
        }
        // Either an explicit flag or an authorization header forces credentials.
        let with_credentials = protection.as_ref().and_then(|p| p.with_credentials) == Some(true)
            || headers.keys().any(|k| k.eq_ignore_ascii_case("authorization"));

        let Some(body) = self.resolver.license_request_body(&key_system, &message) else {
            self.license_request_failed(
                &token,
                message_type,
                Fault::new(
                    FaultCode::NoChallenge,
                    format!("{} key message holds no usable challenge", key_system),
                ),
            );
            return;
        };

        let request = LicenseRequest {
            url,
            method: service.http_method(message_type),
            response_type: service.response_type(&key_system, message_type),
            headers,
            with_credentials,
            body,
        };
        let exchange = LicenseExchange {
            id: self.exchanges.next_id(),
            token,
            message_type,
            key_system,
            service,
            request,
            deadline: None,
        };
        let id = exchange.id;
        if self.exchanges.admit(exchange) {
            self.start_exchange(id);
        } else {
            debug!("{} queued behind the running exchange of its session", id);
        }
    }

    fn start_exchange(&mut self, id: ExchangeId) {
        let deadline = self.config.license_timeout.map(|t| Instant::now() + t);
        let Some(exchange) = self.exchanges.get_mut(id) else {
            return;
        };
        exchange.deadline = deadline;
        let request = exchange.request.clone();

        info!("{} {} for {}", request.method, request.url, id);
        if let Err(e) = self.transport.send(id, &request) {
            if let Some((exchange, next)) = self.exchanges.finish(id) {
                self.complete_exchange(exchange, Err(TransportError::Network(e.to_string())));
                if let Some(next) = next {
                    self.start_exchange(next);
                }
            }
        }
    }

    fn complete_exchange(&mut self, exchange: LicenseExchange, result: ExchangeResult) {
        let LicenseExchange {
            id,
            token,
            message_type,
            key_system,
            service,
            request,
            ..
        } = exchange;

        let response = match result {
            Ok(response) => response,
            Err(TransportError::Aborted) => {
                debug!("{} aborted", id);
                return;
            }
            Err(e) => {
                let fault = Fault::new(
                    FaultCode::LicenseServerError,
                    format!("{} license request to {} failed: {}", key_system, request.url, e),
                )
                .with_url(request.url)
                .with_status(None);
                self.license_request_failed(&token, message_type, fault);
                return;
            }
        };

        debug!("{} finished with status {}", id, response.status);
        if response.is_success() {
            if let Some(material) =
                service.license_message(&response.body, &key_system, message_type)
            {
                self.apply_material(token, message_type, &material);
                return;
            }
        }

        let detail = service.error_response(&response.body, &key_system, message_type);
        let fault = Fault::new(
            FaultCode::LicenseServerError,
            format!(
                "{} license request to {} failed with status {}: {}",
                key_system, request.url, response.status, detail
            ),
        )
        .with_url(request.url)
        .with_status(Some(response.status))
        .with_response(detail);
        self.license_request_failed(&token, message_type, fault);
    }

    fn apply_material(&mut self, token: SessionToken, message_type: MessageType, material: &KeyMaterial) {
        if let Err(e) = self.gateway.update_session(&token, material) {
            let fault = Fault::new(
                FaultCode::KeyError,
                format!("failed to update session {}: {}", token, e),
            );
            self.license_request_failed(&token, message_type, fault);
            return;
        }
        self.emit(ProtectionEvent::LicenseRequestComplete(LicenseRequestComplete {
            token,
            message_type,
            result: Ok(()),
        }));
    }

    fn license_request_failed(&mut self, token: &SessionToken, message_type: MessageType, fault: Fault) {
        let fault = fault
            .with_session(token.clone())
            .with_message_type(message_type);
        self.emit(ProtectionEvent::LicenseRequestComplete(LicenseRequestComplete {
            token: token.clone(),
            message_type,
            result: Err(fault.clone()),
        }));
        self.raise(fault);
    }

    fn cancel_exchanges(&mut self, token: &SessionToken) {
        if let Some(id) = self.exchanges.cancel_session(token.handle) {
            debug!("aborting {} of closing session {}", id, token);
            self.transport.abort(id);
        }
    }

    fn session_creation_failed(&mut self, message: String) {
        let fault = Fault::new(FaultCode::SessionCreationFailed, message);
        self.emit(ProtectionEvent::KeySessionCreated(Err(fault.clone())));
        self.raise(fault);
    }

    fn server_certificate_failed(&mut self, message: String) {
        let fault = Fault::new(FaultCode::ServerCertificateError, message);
        self.emit(ProtectionEvent::ServerCertificateUpdated(Err(fault.clone())));
        self.raise(fault);
    }

    fn configuration_for(&self, candidate: &CandidateKeySystem) -> KeySystemConfiguration {
        let protection = self.config.protection_data.get(candidate.key_system.name());
        let robustness = |specific: Option<&String>| {
            specific
                .cloned()
                .unwrap_or_else(|| self.config.robustness_level.clone())
        };
        let audio_robustness = robustness(protection.and_then(|p| p.audio_robustness.as_ref()));
        let video_robustness = robustness(protection.and_then(|p| p.video_robustness.as_ref()));

        let persistent_default = if candidate.session_type == SessionType::PersistentLicense {
            Requirement::Required
        } else {
            Requirement::Optional
        };

        KeySystemConfiguration {
            audio_capabilities: self
                .audio_codec
                .iter()
                .map(|content_type| MediaCapability {
                    content_type: content_type.clone(),
                    robustness: audio_robustness.clone(),
                })
                .collect(),
            video_capabilities: self
                .video_codec
                .iter()
                .map(|content_type| MediaCapability {
                    content_type: content_type.clone(),
                    robustness: video_robustness.clone(),
                })
                .collect(),
            distinctive_identifier: protection
                .and_then(|p| p.distinctive_identifier)
                .unwrap_or(Requirement::Optional),
            persistent_state: protection
                .and_then(|p| p.persistent_state)
                .unwrap_or(persistent_default),
            session_types: vec![candidate.session_type],
        }
    }

    fn selected_protection(&self) -> Option<&ProtectionData> {
        match &self.selection {
            Selection::Selected(key_system) => self.config.protection_data.get(key_system.name()),
            _ => None,
        }
    }

    fn negotiation_deadline(&self) -> Option<Instant> {
        self.config.negotiation_timeout.map(|t| Instant::now() + t)
    }

    fn next_access_id(&mut self) -> AccessRequestId {
        self.next_access_id += 1;
        AccessRequestId(self.next_access_id)
    }

    fn emit(&mut self, event: ProtectionEvent) {
        trace!("emitting {:?}", event.kind());
        self.events.emit(&event);
    }

    fn raise(&mut self, fault: Fault) {
        error!("{}", fault);
        match self.fault_handler.as_mut() {
            Some(handler) => handler(&fault),
            None => warn!("no fault handler installed"),
        }
    }
}
