//! In-memory doubles for provider and outward transports.

use crate::core::config::data::ConnectionConfig;
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{
    server_details, CallToolParams, JsonRpcMessage, JsonRpcRequest, RequestId, ToolDescriptor,
    INTERNAL_ERROR, METHOD_INITIALIZE, METHOD_NOT_FOUND, METHOD_PING, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST,
};
use crate::mcp::transport::{EventChannel, Transport, TransportEvent, TransportFactory, TransportKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub(crate) fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        title: None,
        description: Some(format!("{name} tool")),
        input_schema: json!({ "type": "object", "properties": {} }),
        output_schema: None,
    }
}

/// Scripted tool provider: answers `initialize`, `ping`, `tools/list` and
/// `tools/call` from whatever catalog it holds.
pub(crate) struct StubProvider {
    pub(crate) label: String,
    tools: Mutex<Vec<ToolDescriptor>>,
    page_size: Mutex<Option<usize>>,
    fail_list: AtomicBool,
    silent_calls: AtomicBool,
    start_error: Mutex<Option<TransportError>>,
    ping_error: Mutex<Option<TransportError>>,
    calls: Mutex<Vec<CallToolParams>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    starts: AtomicUsize,
    start_gate: Mutex<Option<Arc<Notify>>>,
    closed: AtomicBool,
    events: EventChannel,
}

impl StubProvider {
    pub(crate) fn new(label: &str, tools: Vec<ToolDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            tools: Mutex::new(tools),
            page_size: Mutex::new(None),
            fail_list: AtomicBool::new(false),
            silent_calls: AtomicBool::new(false),
            start_error: Mutex::new(None),
            ping_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            start_gate: Mutex::new(None),
            closed: AtomicBool::new(false),
            events: EventChannel::new(),
        })
    }

    pub(crate) fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub(crate) fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = Some(size);
    }

    pub(crate) fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Record `tools/call` requests without ever answering them.
    pub(crate) fn set_silent_calls(&self, silent: bool) {
        self.silent_calls.store(silent, Ordering::SeqCst);
    }

    pub(crate) fn set_start_error(&self, err: TransportError) {
        *self.start_error.lock().unwrap() = Some(err);
    }

    /// Instead of answering the liveness probe, raise `err` as an event.
    pub(crate) fn set_ping_error(&self, err: TransportError) {
        *self.ping_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn calls(&self) -> Vec<CallToolParams> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pushes an event as if the underlying channel produced it.
    pub(crate) fn inject(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    fn answer(&self, request: JsonRpcRequest) -> Option<JsonRpcMessage> {
        let id = request.id;
        let reply = match request.method.as_str() {
            METHOD_INITIALIZE => {
                JsonRpcMessage::response(id, serde_json::to_value(server_details()).ok()?)
            }
            METHOD_PING => {
                if let Some(err) = self.ping_error.lock().unwrap().clone() {
                    self.events.emit(TransportEvent::Error(err));
                    return None;
                }
                JsonRpcMessage::response(id, json!({}))
            }
            METHOD_TOOLS_LIST => {
                if self.fail_list.load(Ordering::SeqCst) {
                    JsonRpcMessage::error(Some(id), INTERNAL_ERROR, "catalog unavailable")
                } else {
                    JsonRpcMessage::response(id, self.list_page(request.params.as_ref()))
                }
            }
            METHOD_TOOLS_CALL => {
                let params: CallToolParams =
                    serde_json::from_value(request.params.unwrap_or(Value::Null)).ok()?;
                let result = json!({
                    "content": [{ "type": "text", "text": format!("{} ran {}", self.label, params.name) }],
                    "structuredContent": { "arguments": params.arguments.clone() },
                });
                self.calls.lock().unwrap().push(params);
                if self.silent_calls.load(Ordering::SeqCst) {
                    return None;
                }
                JsonRpcMessage::response(id, result)
            }
            other => JsonRpcMessage::error(Some(id), METHOD_NOT_FOUND, format!("no {other}")),
        };
        Some(reply)
    }

    fn list_page(&self, params: Option<&Value>) -> Value {
        let tools = self.tools.lock().unwrap().clone();
        let Some(size) = *self.page_size.lock().unwrap() else {
            return json!({ "tools": tools });
        };
        let start = params
            .and_then(|params| params.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (start + size).min(tools.len());
        let slice = tools[start.min(end)..end].to_vec();
        let mut page = json!({ "tools": slice });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

#[async_trait]
impl Transport for StubProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let gate = self.start_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.start_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ProcessUnavailable(self.label.clone()));
        }
        self.sent.lock().unwrap().push(message.clone());
        if let JsonRpcMessage::Request(request) = message {
            if let Some(reply) = self.answer(request) {
                self.events.emit(TransportEvent::Message(reply));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Closed);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }
}

/// Hub-side half of an in-memory outward channel.
pub(crate) struct LoopbackTransport {
    to_peer: mpsc::UnboundedSender<JsonRpcMessage>,
    started: AtomicBool,
    closed: AtomicBool,
    fail_start: AtomicBool,
    events: EventChannel,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("loopback refused".into()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.to_peer
            .send(message)
            .map_err(|_| TransportError::Channel("loopback peer dropped".into()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Closed);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn session_id(&self) -> Option<String> {
        self.started
            .load(Ordering::SeqCst)
            .then(|| "loopback-session".to_string())
    }
}

/// Plays the upstream consumer on the far side of a [`LoopbackTransport`].
pub(crate) struct LoopbackPeer {
    pub(crate) transport: Arc<LoopbackTransport>,
    from_hub: tokio::sync::Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    next_id: AtomicI64,
}

impl LoopbackPeer {
    pub(crate) fn pair() -> Arc<Self> {
        let (to_peer, from_hub) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport: Arc::new(LoopbackTransport {
                to_peer,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                events: EventChannel::new(),
            }),
            from_hub: tokio::sync::Mutex::new(from_hub),
            next_id: AtomicI64::new(1),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.transport.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.transport.closed.load(Ordering::SeqCst)
    }

    /// Sends a request to the hub and waits for its reply.
    pub(crate) async fn request(&self, method: &str, params: Option<Value>) -> JsonRpcMessage {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.transport
            .events
            .emit(TransportEvent::Message(JsonRpcMessage::request(
                id.clone(),
                method,
                params,
            )));
        let mut from_hub = self.from_hub.lock().await;
        loop {
            let reply = tokio::time::timeout(Duration::from_secs(5), from_hub.recv())
                .await
                .expect("timed out waiting for hub reply")
                .expect("hub dropped the loopback");
            if reply.response_id() == Some(&id) {
                return reply;
            }
        }
    }

    /// Result payload of a successful reply.
    pub(crate) async fn call(&self, method: &str, params: Option<Value>) -> Value {
        match self.request(method, params).await {
            JsonRpcMessage::Response(response) => response.result,
            other => panic!("expected a result for {method}, got {other:?}"),
        }
    }
}

/// Factory handing out [`StubProvider`]s per client name and loopback
/// outward transports.
pub(crate) struct StubFactory {
    catalogs: Mutex<HashMap<String, Vec<ToolDescriptor>>>,
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    providers: Mutex<Vec<Arc<StubProvider>>>,
    outward: Mutex<Vec<Arc<LoopbackPeer>>>,
    outward_enabled: bool,
    refuse_outward: AtomicBool,
}

impl StubFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    pub(crate) fn without_outward() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(outward_enabled: bool) -> Self {
        Self {
            catalogs: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
            outward: Mutex::new(Vec::new()),
            outward_enabled,
            refuse_outward: AtomicBool::new(false),
        }
    }

    pub(crate) fn catalog(&self, client: &str, tools: &[&str]) {
        self.catalogs.lock().unwrap().insert(
            client.to_string(),
            tools.iter().map(|name| tool(name)).collect(),
        );
    }

    pub(crate) fn fail_start(&self, client: &str) {
        self.failing.lock().unwrap().insert(client.to_string());
    }

    /// Providers for `client` block in `start()` until the returned gate is
    /// notified.
    pub(crate) fn hold_start(&self, client: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(client.to_string(), gate.clone());
        gate
    }

    pub(crate) fn refuse_outward(&self) {
        self.refuse_outward.store(true, Ordering::SeqCst);
    }

    /// Most recent provider built for `client`.
    pub(crate) fn provider(&self, client: &str) -> Arc<StubProvider> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|provider| provider.label == client)
            .cloned()
            .expect("no provider built for client")
    }

    pub(crate) fn provider_count(&self) -> usize {
        self.providers.lock().unwrap().len()
    }

    pub(crate) fn outward(&self, index: usize) -> Arc<LoopbackPeer> {
        self.outward.lock().unwrap()[index].clone()
    }

    pub(crate) fn outward_count(&self) -> usize {
        self.outward.lock().unwrap().len()
    }
}

impl TransportFactory for StubFactory {
    fn provider_transport(
        &self,
        name: &str,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let tools = self
            .catalogs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        let provider = StubProvider::new(name, tools);
        if self.failing.lock().unwrap().contains(name) {
            provider.set_start_error(TransportError::Spawn {
                command: name.to_string(),
                reason: "No such file or directory".to_string(),
            });
        }
        if let Some(gate) = self.gates.lock().unwrap().get(name) {
            *provider.start_gate.lock().unwrap() = Some(gate.clone());
        }
        self.providers.lock().unwrap().push(provider.clone());
        Ok(provider)
    }

    fn outward_transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.outward_enabled {
            return None;
        }
        let peer = LoopbackPeer::pair();
        if self.refuse_outward.load(Ordering::SeqCst) {
            peer.transport.fail_start.store(true, Ordering::SeqCst);
        }
        self.outward.lock().unwrap().push(peer.clone());
        Some(peer.transport.clone())
    }
}
