//! Public events and their dispatch table.
use std::collections::HashMap;
use std::fmt;

use crate::fault::Fault;
use crate::gateway::KeySystemAccess;
use crate::session::{KeyStatus, MessageType, SessionToken};

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    KeySystemSelected,
    KeyMessage,
    KeySessionCreated,
    KeySessionRemoved,
    KeySessionClosed,
    KeyAdded,
    KeyError,
    KeyStatusesChanged,
    ServerCertificateUpdated,
    LicenseRequestComplete,
    TeardownComplete,
}

/// A message a session wants delivered to its license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMessage {
    pub token: SessionToken,
    pub message: Vec<u8>,
    pub message_type: MessageType,
}

/// Key statuses reported for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatuses {
    pub token: SessionToken,
    pub statuses: Vec<(Vec<u8>, KeyStatus)>,
}

/// Outcome of handling one key message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequestComplete {
    pub token: SessionToken,
    pub message_type: MessageType,
    pub result: Result<(), Fault>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectionEvent {
    KeySystemSelected(Result<KeySystemAccess, Fault>),
    KeyMessage(KeyMessage),
    KeySessionCreated(Result<SessionToken, Fault>),
    KeySessionRemoved(Result<SessionToken, Fault>),
    KeySessionClosed(Result<SessionToken, Fault>),
    KeyAdded(SessionToken),
    KeyError(Fault),
    KeyStatusesChanged(Result<KeyStatuses, Fault>),
    ServerCertificateUpdated(Result<(), Fault>),
    LicenseRequestComplete(LicenseRequestComplete),
    TeardownComplete,
}

impl ProtectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProtectionEvent::KeySystemSelected(_) => EventKind::KeySystemSelected,
            ProtectionEvent::KeyMessage(_) => EventKind::KeyMessage,
            ProtectionEvent::KeySessionCreated(_) => EventKind::KeySessionCreated,
            ProtectionEvent::KeySessionRemoved(_) => EventKind::KeySessionRemoved,
            ProtectionEvent::KeySessionClosed(_) => EventKind::KeySessionClosed,
            ProtectionEvent::KeyAdded(_) => EventKind::KeyAdded,
            ProtectionEvent::KeyError(_) => EventKind::KeyError,
            ProtectionEvent::KeyStatusesChanged(_) => EventKind::KeyStatusesChanged,
            ProtectionEvent::ServerCertificateUpdated(_) => EventKind::ServerCertificateUpdated,
            ProtectionEvent::LicenseRequestComplete(_) => EventKind::LicenseRequestComplete,
            ProtectionEvent::TeardownComplete => EventKind::TeardownComplete,
        }
    }
}

pub type Listener = Box<dyn FnMut(&ProtectionEvent)>;

/// Listeners grouped by the event kind they subscribed to.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        for listeners in self.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|(l, _)| *l == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    pub fn emit(&mut self, event: &ProtectionEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            for (_, listener) in listeners.iter_mut() {
                listener(event);
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self
            .listeners
            .iter()
            .map(|(kind, listeners)| (*kind, listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn listeners_receive_only_their_kind() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();

        let sink = seen.clone();
        bus.on(
            EventKind::TeardownComplete,
            Box::new(move |e| sink.borrow_mut().push(e.kind())),
        );

        bus.emit(&ProtectionEvent::KeyError(crate::fault::Fault::new(
            crate::fault::FaultCode::KeyError,
            "boom",
        )));
        bus.emit(&ProtectionEvent::TeardownComplete);

        assert_eq!(*seen.borrow(), vec![EventKind::TeardownComplete]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let count = Rc::new(RefCell::new(0));
        let mut bus = EventBus::new();

        let c = count.clone();
        let id = bus.on(
            EventKind::TeardownComplete,
            Box::new(move |_| *c.borrow_mut() += 1),
        );
        bus.emit(&ProtectionEvent::TeardownComplete);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&ProtectionEvent::TeardownComplete);

        assert_eq!(*count.borrow(), 1);
        assert_eq!(bus.listener_count(EventKind::TeardownComplete), 0);
    }
}
