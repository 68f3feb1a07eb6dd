//! Cross-process bridge between the hub and a privileged host process that
//! owns the tool-provider children.
//!
//! The hub side keeps a [`SessionRegistry`]; every bridged transport
//! registers its handlers there under its own session id, and a single
//! dispatcher routes host events to them. The host side is [`BridgeHost`].
//! The two halves talk either over in-process channels or over the host's
//! stdio as newline-delimited JSON envelopes.

use crate::mcp::error::TransportError;
use crate::mcp::session::SessionRegistry;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod codec;
pub mod host;

pub use codec::{BridgeEvent, BridgeRequest, RuntimeErrorKind};
pub use host::BridgeHost;

/// Hub-side handle on a bridge host. Cheap to clone; all clones share one
/// link and one session table.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<BridgeClientInner>,
}

struct BridgeClientInner {
    requests: mpsc::UnboundedSender<BridgeRequest>,
    registry: SessionRegistry,
    // Held so the host process lives as long as the client.
    _host: Mutex<Option<Child>>,
}

impl BridgeClient {
    /// Wraps an established link and starts routing its events.
    pub fn new(
        requests: mpsc::UnboundedSender<BridgeRequest>,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
    ) -> Self {
        Self::with_host(requests, events, None)
    }

    fn with_host(
        requests: mpsc::UnboundedSender<BridgeRequest>,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
        host: Option<Child>,
    ) -> Self {
        let registry = SessionRegistry::new();
        tokio::spawn(dispatch_events(events, registry.clone()));
        Self {
            inner: Arc::new(BridgeClientInner {
                requests,
                registry,
                _host: Mutex::new(host),
            }),
        }
    }

    /// Runs a [`BridgeHost`] as a task in this process.
    pub fn in_process() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(BridgeHost::new(events_tx).run(requests_rx));
        Self::new(requests_tx, events_rx)
    }

    /// Launches `command` as the host process and links to it over its
    /// stdio. The host is killed when the last clone is dropped.
    pub fn spawn_host(command: &[String]) -> Result<Self, TransportError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TransportError::Channel("bridge host command is empty".to_string()))?;
        debug!(command = %program, args = ?args, "Starting bridge host");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Spawn {
                command: program.clone(),
                reason: err.to_string(),
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Channel("bridge host stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Channel("bridge host stdout was not captured".into()))?;
        info!(pid = ?child.id(), "Bridge host started");

        let (requests, events) =
            codec::link_over_io::<_, _, BridgeEvent, BridgeRequest>(stdout, stdin, "bridge-client");
        Ok(Self::with_host(requests, events, Some(child)))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn send(&self, request: BridgeRequest) -> Result<(), TransportError> {
        self.inner
            .requests
            .send(request)
            .map_err(|_| TransportError::Channel("bridge host is unavailable".to_string()))
    }
}

async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    registry: SessionRegistry,
) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Message {
                session_id,
                payload,
            } => registry.route_message(&session_id, payload),
            BridgeEvent::StartSuccess { session_id } => registry.route_start_success(&session_id),
            BridgeEvent::StartError {
                session_id,
                message,
                config,
            } => registry.route_start_error(
                &session_id,
                TransportError::Spawn {
                    command: config.describe(),
                    reason: message,
                },
            ),
            BridgeEvent::RuntimeError {
                session_id,
                message,
                stack,
                kind,
            } => {
                if let Some(stack) = stack {
                    debug!(session_id = %session_id, stack = %stack, "Bridge runtime error detail");
                }
                registry.route_runtime_error(&session_id, kind.into_error(message));
            }
            BridgeEvent::Closed { session_id, code } => {
                debug!(session_id = %session_id, exit_code = ?code, "Bridge session closed");
                registry.route_closed(&session_id);
            }
        }
    }
    warn!("Bridge host link closed");
    registry.fail_all(TransportError::Channel(
        "bridge host disconnected".to_string(),
    ));
}
