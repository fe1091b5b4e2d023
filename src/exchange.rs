//! Bookkeeping for license exchanges.
//!
//! At most one exchange runs per session; later ones wait in FIFO order and
//! start when the running one settles. Every exchange that has been handed to
//! the transport stays tracked until its response arrives, it times out, or
//! it is cancelled.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::keysystem::KeySystem;
use crate::license::{LicenseRequest, LicenseService};
use crate::session::{MessageType, SessionHandle, SessionToken};

/// Correlates a transport completion with its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange#{}", self.0)
    }
}

/// One challenge/response round trip with a license server.
#[derive(Debug, Clone)]
pub struct LicenseExchange {
    pub id: ExchangeId,
    pub token: SessionToken,
    pub message_type: MessageType,
    pub key_system: KeySystem,
    pub service: Arc<dyn LicenseService>,
    pub request: LicenseRequest,
    /// Set when the exchange is handed to the transport.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ExchangeTracker {
    next_id: u64,
    exchanges: HashMap<ExchangeId, LicenseExchange>,
    /// Running exchange per session.
    active: HashMap<SessionHandle, ExchangeId>,
    /// Exchanges waiting for the running one, per session.
    waiting: HashMap<SessionHandle, VecDeque<ExchangeId>>,
}

impl ExchangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> ExchangeId {
        self.next_id += 1;
        ExchangeId(self.next_id)
    }

    /// Track `exchange`. Returns `true` when it may start now, `false` when
    /// it was queued behind a running exchange of the same session.
    pub fn admit(&mut self, exchange: LicenseExchange) -> bool {
        let id = exchange.id;
        let handle = exchange.token.handle;
        self.exchanges.insert(id, exchange);

        if self.active.contains_key(&handle) {
            self.waiting.entry(handle).or_default().push_back(id);
            false
        } else {
            self.active.insert(handle, id);
            true
        }
    }

    pub fn get(&self, id: ExchangeId) -> Option<&LicenseExchange> {
        self.exchanges.get(&id)
    }

    pub fn get_mut(&mut self, id: ExchangeId) -> Option<&mut LicenseExchange> {
        self.exchanges.get_mut(&id)
    }

    /// Whether `id` is the running exchange of its session.
    pub fn is_active(&self, id: ExchangeId) -> bool {
        self.exchanges
            .get(&id)
            .is_some_and(|e| self.active.get(&e.token.handle) == Some(&id))
    }

    /// Stop tracking a running exchange. Returns it together with the next
    /// exchange of the same session, which is now the running one.
    pub fn finish(&mut self, id: ExchangeId) -> Option<(LicenseExchange, Option<ExchangeId>)> {
        if !self.is_active(id) {
            return None;
        }
        let exchange = self.exchanges.remove(&id)?;
        let handle = exchange.token.handle;
        self.active.remove(&handle);

        let next = self.waiting.get_mut(&handle).and_then(VecDeque::pop_front);
        if self.waiting.get(&handle).is_some_and(VecDeque::is_empty) {
            self.waiting.remove(&handle);
        }
        if let Some(next) = next {
            self.active.insert(handle, next);
        }
        Some((exchange, next))
    }

    /// Drop every exchange of a session. Returns the running one, which the
    /// caller must abort.
    pub fn cancel_session(&mut self, handle: SessionHandle) -> Option<ExchangeId> {
        for id in self.waiting.remove(&handle).unwrap_or_default() {
            self.exchanges.remove(&id);
        }
        let active = self.active.remove(&handle)?;
        self.exchanges.remove(&active);
        Some(active)
    }

    /// Drop everything. Returns the running exchanges.
    pub fn drain(&mut self) -> Vec<ExchangeId> {
        let mut running: Vec<ExchangeId> = self.active.drain().map(|(_, id)| id).collect();
        running.sort();
        self.waiting.clear();
        self.exchanges.clear();
        running
    }

    /// Running exchanges whose deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<ExchangeId> {
        let mut expired: Vec<ExchangeId> = self
            .active
            .values()
            .filter(|id| {
                self.exchanges
                    .get(id)
                    .and_then(|e| e.deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .copied()
            .collect();
        expired.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::license::{HttpMethod, ResponseType, WidevineLicenseService};
    use crate::session::SessionType;

    fn exchange(tracker: &mut ExchangeTracker, handle: u64) -> LicenseExchange {
        LicenseExchange {
            id: tracker.next_id(),
            token: SessionToken::new(SessionHandle(handle), None, SessionType::Temporary),
            message_type: MessageType::LicenseRequest,
            key_system: KeySystem::WIDEVINE,
            service: Arc::new(WidevineLicenseService),
            request: LicenseRequest {
                url: "https://ls".to_string(),
                method: HttpMethod::Post,
                response_type: ResponseType::Binary,
                headers: BTreeMap::new(),
                with_credentials: false,
                body: vec![1],
            },
            deadline: None,
        }
    }

    #[test]
    fn same_session_is_serialized() {
        let mut tracker = ExchangeTracker::new();
        let a = exchange(&mut tracker, 1);
        let b = exchange(&mut tracker, 1);
        let c = exchange(&mut tracker, 2);
        let (a_id, b_id) = (a.id, b.id);

        assert!(tracker.admit(a));
        assert!(!tracker.admit(b));
        assert!(tracker.admit(c));
        assert!(!tracker.is_active(b_id));

        let (done, next) = tracker.finish(a_id).expect("running");
        assert_eq!(done.id, a_id);
        assert_eq!(next, Some(b_id));
        assert!(tracker.is_active(b_id));
        assert!(tracker.finish(a_id).is_none());
    }

    #[test]
    fn cancel_session_drops_queued_and_running() {
        let mut tracker = ExchangeTracker::new();
        let a = exchange(&mut tracker, 1);
        let b = exchange(&mut tracker, 1);
        let a_id = a.id;
        tracker.admit(a);
        tracker.admit(b);

        assert_eq!(tracker.cancel_session(SessionHandle(1)), Some(a_id));
        assert!(tracker.is_empty());
        assert_eq!(tracker.cancel_session(SessionHandle(1)), None);
    }

    #[test]
    fn expired_reports_running_exchanges_past_deadline() {
        let mut tracker = ExchangeTracker::new();
        let now = Instant::now();
        let mut a = exchange(&mut tracker, 1);
        a.deadline = Some(now + Duration::from_secs(1));
        let a_id = a.id;
        tracker.admit(a);

        assert!(tracker.expired(now).is_empty());
        assert_eq!(tracker.expired(now + Duration::from_secs(1)), vec![a_id]);
        assert_eq!(tracker.drain(), vec![a_id]);
        assert!(tracker.is_empty());
    }
}
