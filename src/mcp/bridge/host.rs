//! Privileged side of the bridge: owns the tool-provider processes and
//! shuttles bytes between them and the hub, keyed by session id.
//!
//! Each session has its own writer task, so a child that stops reading its
//! stdin stalls only its own queue, never the request loop.

use super::codec::{link_over_io, BridgeEvent, BridgeRequest};
use crate::core::config::data::ConnectionConfig;
use crate::mcp::error::TransportError;
use crate::mcp::framing::{encode_line, LineDecoder};
use crate::mcp::process::{ChildProcess, ProcessEvent};
use crate::mcp::protocol::JsonRpcMessage;
use crate::mcp::session::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct HostSession {
    process: Arc<ChildProcess>,
    decoder: LineDecoder,
    writes: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct BridgeHost {
    sessions: HashMap<SessionId, HostSession>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    exits_tx: mpsc::UnboundedSender<SessionId>,
    exits: Option<mpsc::UnboundedReceiver<SessionId>>,
}

impl BridgeHost {
    pub fn new(events: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        Self {
            sessions: HashMap::new(),
            events,
            exits_tx,
            exits: Some(exits),
        }
    }

    /// Serves requests until the hub side hangs up, then closes every
    /// session it still owns. Sessions whose child exits are dropped as soon
    /// as the exit is seen.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<BridgeRequest>) {
        let mut exits = self.exits.take();
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request).await;
                }
                Some(session_id) = async {
                    match exits.as_mut() {
                        Some(exits) => exits.recv().await,
                        None => None,
                    }
                } => {
                    self.reap(&session_id);
                }
            }
        }
        debug!(sessions = self.sessions.len(), "Bridge hub disconnected; closing sessions");
        for (_, session) in self.sessions.drain() {
            session.process.close().await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn handle(&mut self, request: BridgeRequest) {
        match request {
            BridgeRequest::Start { config, session_id } => self.start(config, session_id),
            BridgeRequest::Message { buffer, session_id } => self.forward(&session_id, &buffer),
            BridgeRequest::Stop { session_id } => self.stop(&session_id).await,
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    /// Forgets `session_id` if its child has exited. A live session that
    /// reused the id is left alone.
    fn reap(&mut self, session_id: &str) -> bool {
        let exited = self
            .sessions
            .get(session_id)
            .is_some_and(|session| session.process.has_exited());
        if exited {
            debug!(session_id = %session_id, "Dropping exited bridge session");
            self.sessions.remove(session_id);
        }
        exited
    }

    fn start(&mut self, config: ConnectionConfig, session_id: SessionId) {
        self.reap(&session_id);
        if self.sessions.contains_key(&session_id) {
            debug!(session_id = %session_id, "Session already running");
            self.emit(BridgeEvent::StartSuccess { session_id });
            return;
        }
        let ConnectionConfig::Process(process_config) = &config;
        match ChildProcess::spawn(process_config, &session_id) {
            Ok((process, process_events)) => {
                info!(
                    session_id = %session_id,
                    command = %config.describe(),
                    "Bridge session started"
                );
                let process = Arc::new(process);
                let (writes, queued) = mpsc::unbounded_channel();
                spawn_forwarder(
                    session_id.clone(),
                    process_events,
                    self.events.clone(),
                    self.exits_tx.clone(),
                );
                spawn_writer(session_id.clone(), process.clone(), queued, self.events.clone());
                self.sessions.insert(
                    session_id.clone(),
                    HostSession {
                        process,
                        decoder: LineDecoder::default(),
                        writes,
                    },
                );
                self.emit(BridgeEvent::StartSuccess { session_id });
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Bridge session failed to start");
                self.emit(BridgeEvent::StartError {
                    session_id,
                    message: err.to_string(),
                    config,
                });
            }
        }
    }

    /// Splits the inbound buffer into lines, validates each as JSON-RPC, and
    /// queues the valid ones for the child. A bad line is reported and skipped.
    fn forward(&mut self, session_id: &str, buffer: &[u8]) {
        let reason = if self.reap(session_id) {
            format!("session {session_id} has exited")
        } else {
            format!("no session {session_id}")
        };
        let Some(session) = self.sessions.get_mut(session_id) else {
            self.emit(BridgeEvent::runtime_error(
                session_id,
                &TransportError::ProcessUnavailable(reason),
            ));
            return;
        };
        let lines = session.decoder.push(buffer);
        let writes = session.writes.clone();
        for line in lines {
            let encoded = line
                .and_then(|line| JsonRpcMessage::parse(&line))
                .and_then(|message| encode_line(&message));
            match encoded {
                Ok(bytes) => {
                    if writes.send(bytes).is_err() {
                        self.emit(BridgeEvent::runtime_error(
                            session_id,
                            &TransportError::ProcessUnavailable(format!(
                                "session {session_id} is no longer writable"
                            )),
                        ));
                    }
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "Rejecting malformed message");
                    self.emit(BridgeEvent::runtime_error(session_id, &err));
                }
            }
        }
    }

    async fn stop(&mut self, session_id: &str) {
        match self.sessions.remove(session_id) {
            Some(session) => {
                debug!(session_id = %session_id, "Stopping bridge session");
                session.process.close().await;
            }
            None => debug!(session_id = %session_id, "Stop for unknown session"),
        }
    }
}

/// Relays one child's stdout chunks and lifecycle to the hub side, then
/// tells the host loop the session is gone.
fn spawn_forwarder(
    session_id: SessionId,
    mut process_events: mpsc::UnboundedReceiver<ProcessEvent>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    exits: mpsc::UnboundedSender<SessionId>,
) {
    tokio::spawn(async move {
        while let Some(event) = process_events.recv().await {
            let bridged = match event {
                ProcessEvent::Stdout(payload) => BridgeEvent::Message {
                    session_id: session_id.clone(),
                    payload,
                },
                ProcessEvent::Error(err) => BridgeEvent::runtime_error(&session_id, &err),
                ProcessEvent::Exited(code) => {
                    let _ = events.send(BridgeEvent::Closed {
                        session_id: session_id.clone(),
                        code,
                    });
                    let _ = exits.send(session_id);
                    break;
                }
            };
            if events.send(bridged).is_err() {
                break;
            }
        }
    });
}

/// Drains one session's outbound queue into the child's stdin.
fn spawn_writer(
    session_id: SessionId,
    process: Arc<ChildProcess>,
    mut queued: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
) {
    tokio::spawn(async move {
        while let Some(bytes) = queued.recv().await {
            if let Err(err) = process.write(&bytes).await {
                debug!(session_id = %session_id, error = %err, "Write to bridged provider failed");
                if events.send(BridgeEvent::runtime_error(&session_id, &err)).is_err() {
                    break;
                }
            }
        }
    });
}

/// Runs a host over this process's stdin and stdout. Returns when stdin
/// closes.
pub async fn serve_stdio() {
    let (events, requests) = link_over_io::<_, _, BridgeRequest, BridgeEvent>(
        tokio::io::stdin(),
        tokio::io::stdout(),
        "bridge-host",
    );
    info!("Bridge host ready");
    BridgeHost::new(events).run(requests).await;
}
