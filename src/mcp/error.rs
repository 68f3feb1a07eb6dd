//! Error taxonomy for transports, provider clients, and the hub.

use thiserror::Error;

/// Failures raised by a [`crate::mcp::transport::Transport`] or the raw child
/// process it wraps.
///
/// Cloneable because a memoized `start()` hands the same outcome to every
/// waiter, and runtime errors fan out to pending requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The OS refused to create the provider process.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// An expected stdio pipe, socket, or bridge link is missing or unusable.
    #[error("channel error: {0}")]
    Channel(String),

    /// A write was attempted after the process exited or was killed.
    #[error("process unavailable: {0}")]
    ProcessUnavailable(String),

    /// An inbound frame could not be decoded as a JSON-RPC message.
    #[error("malformed frame: {0}")]
    Parse(String),

    /// Connecting to the remote endpoint failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport was closed before the operation could complete.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether in-flight requests on this transport can still expect a reply.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Parse(_))
    }
}

/// Failures of a single tool-provider client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Start, handshake, or liveness probe failed.
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The provider answered with a JSON-RPC error.
    #[error("MCP error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The provider answered with something other than the expected shape.
    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("request '{method}' timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },
}

/// Failures surfaced by [`crate::mcp::hub::McpHub`] operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("an MCP client named '{0}' already exists")]
    DuplicateClientName(String),

    #[error("no MCP client named '{0}'")]
    UnknownClient(String),

    #[error("client '{name}': {source}")]
    Client {
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("hub stopped while '{0}' was connecting")]
    StoppedDuringAdd(String),

    /// The hub lacks configuration needed for the requested operation.
    #[error("hub not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_not_fatal() {
        assert!(!TransportError::Parse("bad".into()).is_fatal());
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::ProcessUnavailable("gone".into()).is_fatal());
    }

    #[test]
    fn duplicate_name_message_is_verbatim_friendly() {
        let err = HubError::DuplicateClientName("fs".into());
        assert_eq!(err.to_string(), "an MCP client named 'fs' already exists");
    }

    #[test]
    fn connection_error_keeps_transport_source() {
        let err = ClientError::Connection(TransportError::Spawn {
            command: "missing".into(),
            reason: "not found".into(),
        });
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("failed to spawn 'missing': not found")
        );
    }
}
