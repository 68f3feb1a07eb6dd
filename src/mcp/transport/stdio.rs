//! Tool provider running as a local child process, framed as
//! newline-delimited JSON-RPC.

use super::{EventChannel, Transport, TransportEvent, TransportKind};
use crate::core::config::data::ProcessConfig;
use crate::mcp::error::TransportError;
use crate::mcp::framing::{decode_lines, encode_line, LineDecoder};
use crate::mcp::process::{ChildProcess, ProcessEvent};
use crate::mcp::protocol::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub struct ChildProcessTransport {
    label: String,
    config: ProcessConfig,
    process: Mutex<Option<Arc<ChildProcess>>>,
    events: EventChannel,
}

impl ChildProcessTransport {
    pub fn new(label: &str, config: ProcessConfig) -> Self {
        Self {
            label: label.to_string(),
            config,
            process: Mutex::new(None),
            events: EventChannel::new(),
        }
    }

    /// The live child. An exited one is dropped from the slot so the next
    /// `start` spawns afresh.
    async fn current(&self) -> Result<Arc<ChildProcess>, TransportError> {
        let mut slot = self.process.lock().await;
        if slot.as_ref().is_some_and(|process| process.has_exited()) {
            slot.take();
        }
        slot.clone()
            .ok_or_else(|| TransportError::ProcessUnavailable(format!("{} is not running", self.label)))
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ChildProcess
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.process.lock().await;
        if slot.as_ref().is_some_and(|process| !process.has_exited()) {
            return Ok(());
        }
        let (process, process_events) = ChildProcess::spawn(&self.config, &self.label)?;
        debug!(server_id = %self.label, pid = ?process.pid(), "Tool provider process started");
        spawn_pump(self.label.clone(), process_events, self.events.sender());
        *slot = Some(Arc::new(process));
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let bytes = encode_line(&message)?;
        let written = match self.current().await {
            Ok(process) => process.write(&bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &written {
            debug!(server_id = %self.label, error = %err, "Write to tool provider failed");
            self.events.emit(TransportEvent::Error(err.clone()));
        }
        written
    }

    async fn close(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.close().await;
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }
}

/// Reassembles stdout chunks into messages until the child exits.
fn spawn_pump(
    label: String,
    mut process_events: mpsc::UnboundedReceiver<ProcessEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let mut decoder = LineDecoder::default();
        while let Some(event) = process_events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => {
                    forward_lines(&label, decode_lines(decoder.push(&chunk)), &events);
                }
                ProcessEvent::Error(err) => {
                    let _ = events.send(TransportEvent::Error(err));
                }
                ProcessEvent::Exited(code) => {
                    forward_lines(&label, decode_lines(decoder.finish()), &events);
                    debug!(server_id = %label, exit_code = ?code, "Tool provider transport closed");
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
            }
        }
    });
}

fn forward_lines(
    label: &str,
    decoded: Vec<Result<JsonRpcMessage, TransportError>>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    for result in decoded {
        let event = match result {
            Ok(message) => TransportEvent::Message(message),
            Err(err) => {
                warn!(server_id = %label, error = %err, "Dropping malformed line from tool provider");
                TransportEvent::Error(err)
            }
        };
        let _ = events.send(event);
    }
}
