//! Shared transport abstractions.
//!
//! Every channel the hub speaks over (a local child process, a session on the
//! bridge host, or the relay socket) implements [`Transport`], so the
//! provider client and the hub never care which one they hold.

use crate::core::config::data::ConnectionConfig;
use crate::mcp::bridge::BridgeClient;
use crate::mcp::error::TransportError;
use crate::mcp::protocol::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub mod bridge;
pub mod relay;
pub mod stdio;

pub use bridge::BridgeTransport;
pub use relay::{RelaySettings, RelayTransport};
pub use stdio::ChildProcessTransport;

/// Physical channel behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ChildProcess,
    Bridge,
    Relay,
    /// In-memory doubles.
    Memory,
}

/// Asynchronous notifications from a running transport, delivered in the
/// order the underlying channel produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(JsonRpcMessage),
    Error(TransportError),
    Closed,
}

#[async_trait]
/// Capability set shared by every message channel.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens the channel. Repeated calls while started do not open a second
    /// one.
    async fn start(&self) -> Result<(), TransportError>;

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Tears the channel down. Safe to call more than once.
    async fn close(&self);

    /// Hands out the event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Correlation id bound to this transport, when the channel has one.
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Event sender plus the not-yet-claimed receiver, shared by every
/// implementation.
pub(crate) struct EventChannel {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.tx.clone()
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Builds transports for the hub. Swappable so tests can run the hub against
/// in-memory providers.
pub trait TransportFactory: Send + Sync {
    /// Transport for one tool provider. Not started yet.
    fn provider_transport(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError>;

    /// Fresh outward transport, or `None` when no outward endpoint is
    /// configured.
    fn outward_transport(&self) -> Option<Arc<dyn Transport>>;
}

/// Production factory: providers run as local children or behind the bridge
/// host, and the outward side is the relay.
#[derive(Clone, Default)]
pub struct DefaultTransportFactory {
    bridge: Option<BridgeClient>,
    relay: Option<RelaySettings>,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bridge(mut self, bridge: BridgeClient) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_relay(mut self, relay: RelaySettings) -> Self {
        self.relay = Some(relay);
        self
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn provider_transport(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match (&self.bridge, config) {
            (Some(bridge), config) => Ok(Arc::new(BridgeTransport::new(
                bridge.clone(),
                config.clone(),
            ))),
            (None, ConnectionConfig::Process(process)) => {
                Ok(Arc::new(ChildProcessTransport::new(name, process.clone())))
            }
        }
    }

    fn outward_transport(&self) -> Option<Arc<dyn Transport>> {
        self.relay
            .clone()
            .map(|settings| Arc::new(RelayTransport::new(settings)) as Arc<dyn Transport>)
    }
}
