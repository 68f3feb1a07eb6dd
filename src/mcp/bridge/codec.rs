//! Envelopes exchanged between the hub and the bridge host, and the
//! newline-delimited JSON encoding used when they cross a process boundary.

use crate::core::config::data::ConnectionConfig;
use crate::mcp::error::TransportError;
use crate::mcp::framing::LineDecoder;
use crate::mcp::session::SessionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Hub → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BridgeRequest {
    Start {
        config: ConnectionConfig,
        session_id: SessionId,
    },
    Message {
        #[serde(with = "base64_bytes")]
        buffer: Vec<u8>,
        session_id: SessionId,
    },
    Stop {
        session_id: SessionId,
    },
}

/// Host → hub. Every event names the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    Message {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    StartSuccess {
        session_id: SessionId,
    },
    StartError {
        session_id: SessionId,
        message: String,
        config: ConnectionConfig,
    },
    RuntimeError {
        session_id: SessionId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default)]
        kind: RuntimeErrorKind,
    },
    /// The session's process exited.
    Closed {
        session_id: SessionId,
        #[serde(default)]
        code: Option<i32>,
    },
}

impl BridgeEvent {
    pub fn session_id(&self) -> &str {
        match self {
            BridgeEvent::Message { session_id, .. }
            | BridgeEvent::StartSuccess { session_id }
            | BridgeEvent::StartError { session_id, .. }
            | BridgeEvent::RuntimeError { session_id, .. }
            | BridgeEvent::Closed { session_id, .. } => session_id,
        }
    }

    pub fn runtime_error(session_id: &str, err: &TransportError) -> Self {
        let (kind, message) = RuntimeErrorKind::split(err);
        BridgeEvent::RuntimeError {
            session_id: session_id.to_string(),
            message,
            stack: Some(format!("{err:?}")),
            kind,
        }
    }
}

/// Which [`TransportError`] a runtime error stands for on the hub side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeErrorKind {
    #[default]
    Channel,
    ProcessUnavailable,
    Parse,
}

impl RuntimeErrorKind {
    fn split(err: &TransportError) -> (Self, String) {
        match err {
            TransportError::ProcessUnavailable(detail) => {
                (RuntimeErrorKind::ProcessUnavailable, detail.clone())
            }
            TransportError::Parse(detail) => (RuntimeErrorKind::Parse, detail.clone()),
            TransportError::Channel(detail) | TransportError::Connection(detail) => {
                (RuntimeErrorKind::Channel, detail.clone())
            }
            other => (RuntimeErrorKind::Channel, other.to_string()),
        }
    }

    pub fn into_error(self, message: String) -> TransportError {
        match self {
            RuntimeErrorKind::Channel => TransportError::Channel(message),
            RuntimeErrorKind::ProcessUnavailable => TransportError::ProcessUnavailable(message),
            RuntimeErrorKind::Parse => TransportError::Parse(message),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// One envelope as a JSON line.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, TransportError> {
    let mut bytes =
        serde_json::to_vec(frame).map_err(|err| TransportError::Parse(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, TransportError> {
    serde_json::from_str(line).map_err(|err| TransportError::Parse(err.to_string()))
}

/// Runs envelopes over a byte-stream pair: frames written to the returned
/// sender go out on `writer`, and frames read from `reader` arrive on the
/// returned receiver. The receiver ends when `reader` reaches EOF.
pub fn link_over_io<R, W, In, Out>(
    reader: R,
    writer: W,
    label: &'static str,
) -> (mpsc::UnboundedSender<Out>, mpsc::UnboundedReceiver<In>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Out>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();
    tokio::spawn(write_frames(writer, out_rx, label));
    tokio::spawn(read_frames(reader, in_tx, label));
    (out_tx, in_rx)
}

async fn write_frames<W, Out>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Out>,
    label: &'static str,
) where
    W: AsyncWrite + Unpin,
    Out: Serialize,
{
    while let Some(frame) = frames.recv().await {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(link = label, error = %err, "Skipping unencodable bridge frame");
                continue;
            }
        };
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(link = label, error = %err, "Bridge link write failed");
            break;
        }
        if let Err(err) = writer.flush().await {
            warn!(link = label, error = %err, "Bridge link flush failed");
            break;
        }
    }
    debug!(link = label, "Bridge link writer stopped");
}

async fn read_frames<R, In>(
    mut reader: R,
    frames: mpsc::UnboundedSender<In>,
    label: &'static str,
) where
    R: AsyncRead + Unpin,
    In: DeserializeOwned,
{
    let mut decoder = LineDecoder::default();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let (lines, eof) = match reader.read(&mut buf).await {
            Ok(0) => (decoder.finish(), true),
            Ok(n) => (decoder.push(&buf[..n]), false),
            Err(err) => {
                warn!(link = label, error = %err, "Bridge link read failed");
                (decoder.finish(), true)
            }
        };
        for line in lines {
            match line.and_then(|line| decode_frame::<In>(&line)) {
                Ok(frame) => {
                    if frames.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(link = label, error = %err, "Dropping malformed bridge frame"),
            }
        }
        if eof {
            break;
        }
    }
    debug!(link = label, "Bridge link reader stopped");
}
