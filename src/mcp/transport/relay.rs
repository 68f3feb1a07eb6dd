//! Outward transport over a persistent WebSocket to the remote relay.
//!
//! Binary frames carry JSON-RPC messages. Text frames are small control
//! envelopes: `{"Token": ..}` goes out on open and on every keep-alive, and
//! `{"CorrelationId": ..}` comes in once to bind this transport to an
//! upstream session. One supervisor task per `start()` owns the read half
//! and reconnects with bounded exponential backoff when the socket drops
//! without `close()` having been called.

use super::{EventChannel, Transport, TransportEvent, TransportKind};
use crate::core::config::data::RelayConfig;
use crate::core::credentials::CredentialSource;
use crate::mcp::error::TransportError;
use crate::mcp::framing::{decode_lines, encode_line, LineDecoder};
use crate::mcp::protocol::JsonRpcMessage;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RelaySink = SplitSink<RelaySocket, Message>;
type RelayStream = SplitStream<RelaySocket>;
type StartFuture = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Clone)]
pub struct RelaySettings {
    pub url: String,
    pub credentials: Arc<dyn CredentialSource>,
    pub keep_alive: Duration,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl RelaySettings {
    pub fn from_config(
        config: &RelayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, TransportError> {
        let raw = config
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| TransportError::Connection("relay url is not configured".into()))?;
        let url = url::Url::parse(raw)
            .map_err(|err| TransportError::Connection(format!("invalid relay url {raw}: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Connection(format!(
                "relay url must use ws:// or wss://, got {raw}"
            )));
        }
        Ok(Self {
            url: url.to_string(),
            credentials,
            keep_alive: config.keep_alive(),
            max_reconnect_attempts: config.max_reconnect_attempts(),
            reconnect_base_delay: config.reconnect_base_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
        })
    }
}

/// Delay before reconnect attempt `attempt` (0-based): base doubled per
/// attempt, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Deserialize)]
struct ControlFrame {
    #[serde(rename = "CorrelationId")]
    correlation_id: String,
}

fn token_frame(token: &str) -> Message {
    Message::Text(serde_json::json!({ "Token": token }).to_string())
}

struct RelayShared {
    sink: Mutex<Option<RelaySink>>,
    session_id: std::sync::Mutex<Option<String>>,
    cancel: std::sync::Mutex<CancellationToken>,
    open: AtomicBool,
}

impl RelayShared {
    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }

    fn bind_session(&self, id: String) {
        let mut slot = self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            None => {
                info!(session_id = %id, "Relay session bound");
                *slot = Some(id);
            }
            Some(existing) if *existing != id => {
                debug!(session_id = %existing, ignored = %id, "Ignoring later correlation id");
            }
            Some(_) => {}
        }
    }

    async fn send_frame(&self, frame: Message) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection("relay socket is not open".to_string()))?;
        sink.send(frame)
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))
    }
}

pub struct RelayTransport {
    settings: RelaySettings,
    shared: Arc<RelayShared>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// First-connect outcome of the live supervisor, shared by every
    /// concurrent `start()`.
    attempt: std::sync::Mutex<Option<StartFuture>>,
    events: EventChannel,
}

impl RelayTransport {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            shared: Arc::new(RelayShared {
                sink: Mutex::new(None),
                session_id: std::sync::Mutex::new(None),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                open: AtomicBool::new(false),
            }),
            supervisor: std::sync::Mutex::new(None),
            attempt: std::sync::Mutex::new(None),
            events: EventChannel::new(),
        }
    }

    fn attempt(&self) -> std::sync::MutexGuard<'_, Option<StartFuture>> {
        self.attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn supervising(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns a supervisor and returns its shared first-connect outcome.
    fn launch(&self) -> StartFuture {
        let cancel = self.shared.replace_cancel_token();
        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(
            self.settings.clone(),
            self.shared.clone(),
            self.events.sender(),
            cancel,
            first_tx,
        ));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        async move { first_rx.await.unwrap_or(Err(TransportError::Closed)) }
            .boxed()
            .shared()
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    /// Connects, or joins the attempt already under way. A supervisor that
    /// has since stopped (first connect failed, gave up, or closed) is
    /// replaced by a fresh one.
    async fn start(&self) -> Result<(), TransportError> {
        let start = {
            let mut attempt = self.attempt();
            match attempt.as_ref() {
                Some(existing) if self.supervising() => existing.clone(),
                _ => {
                    let start = self.launch();
                    *attempt = Some(start.clone());
                    start
                }
            }
        };
        let outcome = start.await;
        if outcome.is_ok() {
            self.shared.open.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let bytes = encode_line(&message)?;
        self.shared.send_frame(Message::Binary(bytes)).await
    }

    async fn close(&self) {
        self.attempt().take();
        self.shared.cancel_token().cancel();
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!(error = %err, "Relay socket close failed");
            }
        }
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        if self.shared.open.swap(false, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Closed);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn session_id(&self) -> Option<String> {
        self.shared
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Owns the connection for one `start()`: reports the first connect outcome,
/// pumps inbound frames, and reconnects until cancelled or out of attempts.
async fn supervise(
    settings: RelaySettings,
    shared: Arc<RelayShared>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut first = Some(first);
    let mut failures: u32 = 0;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = connect_once(&settings, &shared) => connected,
        };
        match connected {
            Ok(stream) => {
                failures = 0;
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }
                run_session(&settings, &shared, &events, &cancel, stream).await;
                shared.sink.lock().await.take();
                if cancel.is_cancelled() {
                    break;
                }
                warn!(url = %settings.url, "Relay socket closed unexpectedly; reconnecting");
            }
            Err(err) => {
                if let Some(first) = first.take() {
                    let _ = first.send(Err(err));
                    break;
                }
                failures += 1;
                if failures > settings.max_reconnect_attempts {
                    warn!(
                        url = %settings.url,
                        attempts = failures - 1,
                        error = %err,
                        "Giving up on relay reconnection"
                    );
                    shared.open.store(false, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Error(err));
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
                warn!(url = %settings.url, attempt = failures, error = %err, "Relay reconnect failed");
            }
        }

        let delay = backoff_delay(
            settings.reconnect_base_delay,
            settings.reconnect_max_delay,
            failures,
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(url = %settings.url, "Relay supervisor stopped");
}

async fn connect_once(
    settings: &RelaySettings,
    shared: &RelayShared,
) -> Result<RelayStream, TransportError> {
    let token = settings
        .credentials
        .token()
        .await
        .map_err(|err| TransportError::Connection(format!("relay credential: {err}")))?;
    let (socket, _response) = connect_async(settings.url.as_str())
        .await
        .map_err(|err| TransportError::Connection(err.to_string()))?;
    let (mut sink, stream) = socket.split();
    sink.send(token_frame(&token))
        .await
        .map_err(|err| TransportError::Connection(err.to_string()))?;
    *shared.sink.lock().await = Some(sink);
    info!(url = %settings.url, "Relay connected");
    Ok(stream)
}

/// Returns when the socket ends or `cancel` fires.
async fn run_session(
    settings: &RelaySettings,
    shared: &RelayShared,
    events: &mpsc::UnboundedSender<TransportEvent>,
    cancel: &CancellationToken,
    mut stream: RelayStream,
) {
    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.keep_alive,
        settings.keep_alive,
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = keep_alive.tick() => send_keep_alive(settings, shared).await,
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(bytes))) => forward_binary(&bytes, events),
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ControlFrame>(&text) {
                    Ok(control) => shared.bind_session(control.correlation_id),
                    Err(_) => debug!(bytes = text.len(), "Ignoring unrecognized relay text frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Relay sent close");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "Relay read failed");
                    return;
                }
                None => return,
            },
        }
    }
}

async fn send_keep_alive(settings: &RelaySettings, shared: &RelayShared) {
    let token = match settings.credentials.token().await {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %err, "Skipping relay keep-alive; credential unavailable");
            return;
        }
    };
    if let Err(err) = shared.send_frame(token_frame(&token)).await {
        debug!(error = %err, "Relay keep-alive failed");
    }
}

fn forward_binary(bytes: &[u8], events: &mpsc::UnboundedSender<TransportEvent>) {
    let mut decoder = LineDecoder::default();
    let mut lines = decoder.push(bytes);
    lines.extend(decoder.finish());
    for decoded in decode_lines(lines) {
        let event = match decoded {
            Ok(message) => TransportEvent::Message(message),
            Err(err) => {
                warn!(error = %err, "Dropping malformed relay frame");
                TransportEvent::Error(err)
            }
        };
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests;
