//! Client side of one upstream tool provider.
//!
//! A [`ToolProviderClient`] owns exactly one [`Transport`], performs the MCP
//! handshake over it, and then serves catalog refreshes and tool calls. A
//! reader task drains the transport's events, resolving pending requests by
//! id and keeping the liveness status current.

use crate::mcp::error::{ClientError, TransportError};
use crate::mcp::protocol::{
    client_details, into_result, parse_initialize_result, CallToolParams, JsonRpcMessage,
    ListToolsPage, RequestId, ToolDescriptor, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_NOT_FOUND, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::mcp::transport::{Transport, TransportEvent};
use chrono::{DateTime, Utc};
use rust_mcp_schema::InitializeResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on `tools/list` pages followed for one refresh.
const MAX_TOOL_LIST_PAGES: usize = 100;

type Reply = Result<JsonRpcMessage, TransportError>;
type PendingMap = Arc<Mutex<PendingTable>>;

/// In-flight requests by id. Once `closed` is set no new entry is accepted,
/// so a request issued after the transport closed fails instead of waiting
/// for a reply nobody will deliver.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<RequestId, oneshot::Sender<Reply>>,
    closed: bool,
}

impl PendingTable {
    fn close(&mut self) -> Vec<oneshot::Sender<Reply>> {
        self.closed = true;
        self.waiters.drain().map(|(_, tx)| tx).collect()
    }
}

/// Liveness snapshot for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    /// When the provider last sent anything.
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct ToolProviderClient {
    name: String,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    request_timeout: Option<Duration>,
    tools: RwLock<Vec<ToolDescriptor>>,
    server_details: RwLock<Option<InitializeResult>>,
    status: Arc<StdMutex<ClientStatus>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ToolProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolProviderClient")
            .field("name", &self.name)
            .field("transport", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

impl ToolProviderClient {
    /// Starts `transport`, then runs `initialize`, the `initialized`
    /// notification, and a `ping` probe. A transport error raised before the
    /// probe answers fails the connect. Nothing here is timed.
    pub async fn connect(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let name = name.into();
        let events = transport.take_events().ok_or_else(|| {
            ClientError::Connection(TransportError::Channel(
                "transport events were already claimed".to_string(),
            ))
        })?;

        let (early_tx, mut early_rx) = oneshot::channel();
        let client = Self {
            name,
            transport,
            pending: PendingMap::default(),
            next_request_id: AtomicI64::new(0),
            request_timeout,
            tools: RwLock::new(Vec::new()),
            server_details: RwLock::new(None),
            status: Arc::new(StdMutex::new(ClientStatus::default())),
            reader: StdMutex::new(None),
        };
        let reader = tokio::spawn(read_events(
            client.name.clone(),
            client.transport.clone(),
            events,
            client.pending.clone(),
            client.status.clone(),
            early_tx,
        ));
        *lock(&client.reader) = Some(reader);

        debug!(server_id = %client.name, transport = ?client.transport.kind(), "Connecting MCP provider");
        let outcome = tokio::select! {
            outcome = client.handshake() => outcome,
            Ok(err) = &mut early_rx => Err(ClientError::Connection(err)),
        };

        match outcome {
            Ok(details) => {
                info!(
                    server_id = %client.name,
                    server = %details.server_info.name,
                    protocol_version = %details.protocol_version,
                    "MCP provider connected"
                );
                *write(&client.server_details) = Some(details);
                client.update_status(|status| {
                    status.connected = true;
                    status.last_error = None;
                });
                Ok(client)
            }
            Err(err) => {
                let err = into_connection_error(err);
                warn!(server_id = %client.name, error = %err, "MCP provider failed to connect");
                client.shutdown().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, ClientError> {
        self.transport.start().await.map_err(ClientError::Connection)?;
        let params = serde_json::to_value(client_details())
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        let result = self
            .request_with_timeout(METHOD_INITIALIZE, Some(params), None)
            .await?;
        let details = parse_initialize_result(result)?;
        self.transport
            .send(JsonRpcMessage::notification(METHOD_INITIALIZED, None))
            .await?;
        self.request_with_timeout(METHOD_PING, None, None).await?;
        Ok(details)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        read(&self.server_details).clone()
    }

    pub fn status(&self) -> ClientStatus {
        lock(&self.status).clone()
    }

    /// Last successfully fetched catalog.
    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        read(&self.tools).clone()
    }

    /// Fetches the full catalog, following `nextCursor`. On failure the
    /// cached catalog is left untouched.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        match self.fetch_tools().await {
            Ok(tools) => {
                debug!(server_id = %self.name, count = tools.len(), "Refreshed MCP tool catalog");
                *write(&self.tools) = tools.clone();
                Ok(tools)
            }
            Err(err) => {
                warn!(
                    server_id = %self.name,
                    error = %err,
                    cached = read(&self.tools).len(),
                    "Tool listing failed; keeping cached catalog"
                );
                self.update_status(|status| status.last_error = Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|cursor| serde_json::json!({ "cursor": cursor }));
            let result = self.request(METHOD_TOOLS_LIST, params).await?;
            let page: ListToolsPage = serde_json::from_value(result)
                .map_err(|err| ClientError::Protocol(format!("tools/list: {err}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(tools),
            }
        }
        warn!(server_id = %self.name, "Stopped following tools/list pagination");
        Ok(tools)
    }

    /// Invokes a tool by the provider's own (unprefixed) name and returns the
    /// raw result object.
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ClientError> {
        let params = CallToolParams {
            name: original_name.to_string(),
            arguments,
        };
        let params =
            serde_json::to_value(params).map_err(|err| ClientError::Protocol(err.to_string()))?;
        self.request(METHOD_TOOLS_CALL, Some(params)).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(METHOD_PING, None).await.map(|_| ())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let request_id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(TransportError::Closed.into());
            }
            pending.waiters.insert(request_id.clone(), tx);
        }

        debug!(server_id = %self.name, request_id = ?request_id, method, "Sending MCP request");
        let message = JsonRpcMessage::request(request_id.clone(), method, params);
        if let Err(err) = self.transport.send(message).await {
            self.pending.lock().await.waiters.remove(&request_id);
            return Err(err.into());
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.waiters.remove(&request_id);
                    debug!(server_id = %self.name, request_id = ?request_id, "MCP request timed out");
                    return Err(ClientError::Timeout {
                        method: method.to_string(),
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(message)) => into_result(message),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(TransportError::Closed.into()),
        }
    }

    /// Closes the transport. Never fails; problems are logged.
    pub async fn close(&self) {
        debug!(server_id = %self.name, "Closing MCP provider");
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.transport.close().await;
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        let waiting = self.pending.lock().await.close();
        if !waiting.is_empty() {
            debug!(server_id = %self.name, count = waiting.len(), "Failing requests pending at close");
        }
        for tx in waiting {
            let _ = tx.send(Err(TransportError::Closed));
        }
        self.update_status(|status| status.connected = false);
    }

    fn update_status(&self, apply: impl FnOnce(&mut ClientStatus)) {
        apply(&mut lock(&self.status));
    }
}

fn into_connection_error(err: ClientError) -> ClientError {
    match err {
        ClientError::Connection(err) | ClientError::Transport(err) => ClientError::Connection(err),
        other => ClientError::Connection(TransportError::Connection(other.to_string())),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn fail_pending(pending: &PendingMap, err: &TransportError) {
    let waiting = pending.lock().await.waiters.drain().map(|(_, tx)| tx).collect::<Vec<_>>();
    for tx in waiting {
        let _ = tx.send(Err(err.clone()));
    }
}

async fn close_pending(pending: &PendingMap) {
    let waiting = pending.lock().await.close();
    for tx in waiting {
        let _ = tx.send(Err(TransportError::Closed));
    }
}

async fn read_events(
    server_id: String,
    transport: Arc<dyn Transport>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    pending: PendingMap,
    status: Arc<StdMutex<ClientStatus>>,
    early_error: oneshot::Sender<TransportError>,
) {
    let mut early_error = Some(early_error);
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => {
                lock(&status).last_seen = Some(Utc::now());
                dispatch_message(&server_id, transport.as_ref(), &pending, message).await;
            }
            TransportEvent::Error(err) => {
                warn!(server_id = %server_id, error = %err, "MCP provider transport error");
                lock(&status).last_error = Some(err.to_string());
                if err.is_fatal() {
                    if let Some(tx) = early_error.take() {
                        let _ = tx.send(err.clone());
                    }
                    fail_pending(&pending, &err).await;
                }
            }
            TransportEvent::Closed => {
                info!(server_id = %server_id, "MCP provider transport closed");
                lock(&status).connected = false;
                if let Some(tx) = early_error.take() {
                    let _ = tx.send(TransportError::Closed);
                }
                break;
            }
        }
    }
    lock(&status).connected = false;
    close_pending(&pending).await;
}

async fn dispatch_message(
    server_id: &str,
    transport: &dyn Transport,
    pending: &PendingMap,
    message: JsonRpcMessage,
) {
    if let Some(id) = message.response_id() {
        let waiter = pending.lock().await.waiters.remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(message));
            }
            None => debug!(server_id = %server_id, response_id = ?id, "Dropping unmatched MCP response"),
        }
        return;
    }

    match message {
        JsonRpcMessage::Request(request) => {
            debug!(
                server_id = %server_id,
                method = %request.method,
                request_id = ?request.id,
                "Received MCP provider request"
            );
            let reply = if request.method == METHOD_PING {
                JsonRpcMessage::response(request.id, serde_json::json!({}))
            } else {
                JsonRpcMessage::error(
                    Some(request.id),
                    METHOD_NOT_FOUND,
                    format!("method not supported by mcp-hub: {}", request.method),
                )
            };
            if let Err(err) = transport.send(reply).await {
                debug!(server_id = %server_id, error = %err, "Failed to answer provider request");
            }
        }
        JsonRpcMessage::Notification(notification) => {
            debug!(server_id = %server_id, method = %notification.method, "Received MCP notification");
        }
        JsonRpcMessage::Error(error) => {
            warn!(
                server_id = %server_id,
                code = error.error.code,
                message = %error.error.message,
                "MCP provider reported an uncorrelated error"
            );
        }
        JsonRpcMessage::Response(_) => {}
    }
}
