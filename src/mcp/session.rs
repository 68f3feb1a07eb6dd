//! Session ids and the per-session routing table used by the bridge.
//!
//! Every bridged connection owns one id. Inbound traffic from the host side
//! names that id, and the registry hands it to whichever handlers the owning
//! transport registered. The table is instance-owned so independent bridges
//! never see each other's sessions.

use crate::mcp::error::TransportError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type SessionId = String;

pub type StartOutcome = Result<(), TransportError>;

/// Callbacks one transport registers for its session.
pub struct SessionHandlers {
    pub on_message: Box<dyn FnMut(Vec<u8>) + Send>,
    /// Consumed by the first start-success or start-error signal.
    pub on_start: Option<oneshot::Sender<StartOutcome>>,
    pub on_runtime_error: Box<dyn FnMut(TransportError) + Send>,
    pub on_closed: Box<dyn FnMut() + Send>,
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<SessionId, SessionHandlers>,
    reserved: HashSet<SessionId>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a fresh id not held by any live or reserved session.
    pub fn allocate(&self) -> SessionId {
        let mut state = self.lock();
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !state.handlers.contains_key(&id) && state.reserved.insert(id.clone()) {
                return id;
            }
        }
    }

    pub fn register(&self, id: &str, handlers: SessionHandlers) {
        let mut state = self.lock();
        state.reserved.insert(id.to_string());
        if state.handlers.insert(id.to_string(), handlers).is_some() {
            debug!(session_id = %id, "Replaced handlers for session");
        }
    }

    /// Drops the handlers and releases the id.
    pub fn deregister(&self, id: &str) {
        let mut state = self.lock();
        state.handlers.remove(id);
        state.reserved.remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn route_message(&self, id: &str, payload: Vec<u8>) {
        let mut state = self.lock();
        match state.handlers.get_mut(id) {
            Some(handlers) => (handlers.on_message)(payload),
            None => warn!(
                session_id = %id,
                bytes = payload.len(),
                "Dropping message for unknown session"
            ),
        }
    }

    pub fn route_start_success(&self, id: &str) {
        self.complete_start(id, Ok(()));
    }

    pub fn route_start_error(&self, id: &str, error: TransportError) {
        self.complete_start(id, Err(error));
    }

    fn complete_start(&self, id: &str, outcome: StartOutcome) {
        let waiter = {
            let mut state = self.lock();
            state
                .handlers
                .get_mut(id)
                .and_then(|handlers| handlers.on_start.take())
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!(session_id = %id, ?outcome, "No start waiter for session"),
        }
    }

    pub fn route_runtime_error(&self, id: &str, error: TransportError) {
        let mut state = self.lock();
        match state.handlers.get_mut(id) {
            Some(handlers) => (handlers.on_runtime_error)(error),
            None => warn!(session_id = %id, error = %error, "Runtime error for unknown session"),
        }
    }

    pub fn route_closed(&self, id: &str) {
        let mut state = self.lock();
        match state.handlers.get_mut(id) {
            Some(handlers) => (handlers.on_closed)(),
            None => debug!(session_id = %id, "Close signal for unknown session"),
        }
    }

    /// Fails every pending start and signals close to every session, used
    /// when the link to the host side goes away.
    pub fn fail_all(&self, error: TransportError) {
        let mut state = self.lock();
        for handlers in state.handlers.values_mut() {
            if let Some(tx) = handlers.on_start.take() {
                let _ = tx.send(Err(error.clone()));
            } else {
                (handlers.on_runtime_error)(error.clone());
            }
            (handlers.on_closed)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_handlers(
        messages: Arc<Mutex<Vec<Vec<u8>>>>,
        errors: Arc<AtomicUsize>,
        start: Option<oneshot::Sender<StartOutcome>>,
    ) -> SessionHandlers {
        SessionHandlers {
            on_message: Box::new(move |payload| {
                messages.lock().expect("lock").push(payload);
            }),
            on_start: start,
            on_runtime_error: Box::new(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
            on_closed: Box::new(|| {}),
        }
    }

    #[test]
    fn allocate_never_hands_out_a_live_id() {
        let registry = SessionRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(registry.allocate()));
        }
    }

    #[test]
    fn routes_messages_only_to_the_named_session() {
        let registry = SessionRegistry::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let a = registry.allocate();
        let b = registry.allocate();
        registry.register(&a, recording_handlers(first.clone(), Arc::default(), None));
        registry.register(&b, recording_handlers(second.clone(), Arc::default(), None));

        registry.route_message(&a, b"one".to_vec());
        registry.route_message(&a, b"two".to_vec());
        registry.route_message(&b, b"three".to_vec());

        assert_eq!(
            *first.lock().expect("lock"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(*second.lock().expect("lock"), vec![b"three".to_vec()]);
    }

    #[test]
    fn late_messages_after_deregister_are_dropped() {
        let registry = SessionRegistry::new();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let id = registry.allocate();
        registry.register(&id, recording_handlers(messages.clone(), Arc::default(), None));
        registry.deregister(&id);

        registry.route_message(&id, b"late".to_vec());
        registry.route_runtime_error(&id, TransportError::Closed);

        assert!(messages.lock().expect("lock").is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn start_outcome_is_delivered_once() {
        let registry = SessionRegistry::new();
        let (tx, rx) = oneshot::channel();
        let errors = Arc::new(AtomicUsize::new(0));
        let id = registry.allocate();
        registry.register(
            &id,
            recording_handlers(Arc::default(), errors.clone(), Some(tx)),
        );

        registry.route_start_success(&id);
        registry.route_start_error(&id, TransportError::Closed);

        assert_eq!(rx.await.expect("outcome"), Ok(()));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_pending_starts() {
        let registry = SessionRegistry::new();
        let (tx, rx) = oneshot::channel();
        let id = registry.allocate();
        registry.register(&id, recording_handlers(Arc::default(), Arc::default(), Some(tx)));

        registry.fail_all(TransportError::Channel("host exited".into()));

        assert!(matches!(
            rx.await.expect("outcome"),
            Err(TransportError::Channel(_))
        ));
    }
}
