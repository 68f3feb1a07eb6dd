//! Transport whose provider process lives on the bridge host.

use super::{EventChannel, Transport, TransportEvent, TransportKind};
use crate::core::config::data::ConnectionConfig;
use crate::mcp::bridge::{BridgeClient, BridgeRequest};
use crate::mcp::error::TransportError;
use crate::mcp::framing::{decode_lines, encode_line, LineDecoder};
use crate::mcp::protocol::JsonRpcMessage;
use crate::mcp::session::{SessionHandlers, SessionId};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type StartFuture = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Default)]
struct Attempt {
    session_id: Option<SessionId>,
    start: Option<StartFuture>,
}

pub struct BridgeTransport {
    client: BridgeClient,
    config: ConnectionConfig,
    attempt: Mutex<Attempt>,
    events: EventChannel,
}

impl BridgeTransport {
    pub fn new(client: BridgeClient, config: ConnectionConfig) -> Self {
        Self {
            client,
            config,
            attempt: Mutex::new(Attempt::default()),
            events: EventChannel::new(),
        }
    }

    fn attempt(&self) -> MutexGuard<'_, Attempt> {
        self.attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers(&self, start_tx: oneshot::Sender<Result<(), TransportError>>) -> SessionHandlers {
        let messages = self.events.sender();
        let errors = self.events.sender();
        let closed = self.events.sender();
        let mut decoder = LineDecoder::default();
        SessionHandlers {
            on_message: Box::new(move |payload| {
                for decoded in decode_lines(decoder.push(&payload)) {
                    let event = match decoded {
                        Ok(message) => TransportEvent::Message(message),
                        Err(err) => {
                            warn!(error = %err, "Dropping malformed line from bridged provider");
                            TransportEvent::Error(err)
                        }
                    };
                    let _ = messages.send(event);
                }
            }),
            on_start: Some(start_tx),
            on_runtime_error: Box::new(move |err| {
                let _ = errors.send(TransportEvent::Error(err));
            }),
            on_closed: Box::new(move || {
                let _ = closed.send(TransportEvent::Closed);
            }),
        }
    }

    /// Registers a fresh session and sends the connect request. The returned
    /// future settles only when the host reports the outcome.
    fn begin(&self) -> (SessionId, StartFuture) {
        let registry = self.client.registry();
        let session_id = registry.allocate();
        let (start_tx, start_rx) = oneshot::channel();
        registry.register(&session_id, self.handlers(start_tx));

        let sent = self.client.send(BridgeRequest::Start {
            config: self.config.clone(),
            session_id: session_id.clone(),
        });
        debug!(session_id = %session_id, config = %self.config.describe(), "Bridge start requested");
        let start = async move {
            sent?;
            start_rx.await.unwrap_or(Err(TransportError::Closed))
        }
        .boxed()
        .shared();
        (session_id, start)
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    async fn start(&self) -> Result<(), TransportError> {
        let start = {
            let mut attempt = self.attempt();
            match &attempt.start {
                Some(existing) => existing.clone(),
                None => {
                    let (session_id, start) = self.begin();
                    attempt.session_id = Some(session_id);
                    attempt.start = Some(start.clone());
                    start
                }
            }
        };
        start.await
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let session_id = self.attempt().session_id.clone().ok_or_else(|| {
            TransportError::ProcessUnavailable("bridge session is not started".to_string())
        })?;
        let buffer = encode_line(&message)?;
        self.client.send(BridgeRequest::Message { buffer, session_id })
    }

    async fn close(&self) {
        let session_id = {
            let mut attempt = self.attempt();
            attempt.start = None;
            attempt.session_id.take()
        };
        let Some(session_id) = session_id else {
            return;
        };
        if let Err(err) = self.client.send(BridgeRequest::Stop {
            session_id: session_id.clone(),
        }) {
            debug!(session_id = %session_id, error = %err, "Bridge stop request failed");
        }
        self.client.registry().deregister(&session_id);
        self.events.emit(TransportEvent::Closed);
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn session_id(&self) -> Option<String> {
        self.attempt().session_id.clone()
    }
}
