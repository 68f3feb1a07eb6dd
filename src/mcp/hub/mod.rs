//! The hub: many tool providers behind one namespaced outward endpoint.
//!
//! Clients are added and removed by name. While running, the hub owns one
//! outward transport and one [`endpoint::ToolEndpoint`]; both are built
//! fresh by every `start()` and dropped together by `stop()`.

mod endpoint;

pub use endpoint::ToolRoute;

use crate::core::config::data::ConnectionConfig;
use crate::mcp::client::{ClientStatus, ToolProviderClient};
use crate::mcp::error::{ClientError, HubError, TransportError};
use crate::mcp::protocol::ToolDescriptor;
use crate::mcp::transport::{Transport, TransportFactory};
use endpoint::ToolEndpoint;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct ClientEntry {
    pub(crate) client: Arc<ToolProviderClient>,
    pub(crate) config: ConnectionConfig,
}

/// Connected clients plus names whose `add_client` is still connecting.
/// `generation` moves on every `stop()`, so a connect that began before it
/// cannot land in the cleared table.
#[derive(Default)]
pub(crate) struct ClientTable {
    pub(crate) entries: BTreeMap<String, ClientEntry>,
    reserved: HashSet<String>,
    generation: u64,
}

pub(crate) type ClientDirectory = Arc<Mutex<ClientTable>>;

struct Running {
    endpoint: Arc<ToolEndpoint>,
    outward: Arc<dyn Transport>,
    server: JoinHandle<()>,
}

impl Running {
    async fn shutdown(self) {
        self.outward.close().await;
        self.server.abort();
    }
}

/// Holds a client name while its connection is in flight.
struct Reservation<'a> {
    clients: &'a ClientDirectory,
    name: String,
    generation: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.clients).reserved.remove(&self.name);
    }
}

pub struct McpHub {
    factory: Arc<dyn TransportFactory>,
    request_timeout: Option<Duration>,
    clients: ClientDirectory,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl McpHub {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            request_timeout: None,
            clients: Arc::new(Mutex::new(ClientTable::default())),
            running: Mutex::new(None),
        }
    }

    /// Timeout for `tools/list` and `tools/call` round-trips. Connecting is
    /// never timed.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self) -> Option<Arc<ToolEndpoint>> {
        lock(&self.running)
            .as_ref()
            .map(|running| running.endpoint.clone())
    }

    fn clients_snapshot(&self) -> Vec<(String, Arc<ToolProviderClient>)> {
        lock(&self.clients)
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.client.clone()))
            .collect()
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, HubError> {
        let mut table = lock(&self.clients);
        if table.entries.contains_key(name) || !table.reserved.insert(name.to_string()) {
            return Err(HubError::DuplicateClientName(name.to_string()));
        }
        Ok(Reservation {
            clients: &self.clients,
            name: name.to_string(),
            generation: table.generation,
        })
    }

    /// Builds a fresh endpoint and outward transport, registers every
    /// client's tools (best-effort), then connects outward.
    ///
    /// Calling this while running replaces the running endpoint and closes
    /// the previous outward transport.
    pub async fn start(&self) -> Result<(), HubError> {
        let outward = self.factory.outward_transport().ok_or_else(|| {
            HubError::NotConfigured("no outward relay transport is configured".to_string())
        })?;
        let endpoint = Arc::new(ToolEndpoint::new(self.clients.clone()));
        for (name, client) in self.clients_snapshot() {
            register_client_tools(&endpoint, &name, &client).await;
        }

        let events = outward.take_events().ok_or_else(|| {
            TransportError::Channel("outward transport events were already claimed".to_string())
        })?;
        if let Err(err) = outward.start().await {
            warn!(error = %err, "Outward transport failed to start");
            outward.close().await;
            return Err(err.into());
        }
        let server = tokio::spawn(endpoint.clone().serve(outward.clone(), events));

        let previous = lock(&self.running).replace(Running {
            endpoint: endpoint.clone(),
            outward,
            server,
        });
        if let Some(previous) = previous {
            warn!("Hub started while already running; replacing the outward endpoint");
            previous.shutdown().await;
        }
        info!(
            clients = self.clients_snapshot().len(),
            tools = endpoint.registered_names().len(),
            "MCP hub started"
        );
        Ok(())
    }

    /// Closes every client, then the outward transport. Safe when stopped.
    pub async fn stop(&self) {
        let entries = {
            let mut table = lock(&self.clients);
            table.generation += 1;
            std::mem::take(&mut table.entries)
        };
        for (name, entry) in entries {
            debug!(server_id = %name, "Closing MCP client");
            entry.client.close().await;
        }
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.shutdown().await;
            info!("MCP hub stopped");
        }
    }

    pub async fn restart(&self) -> Result<(), HubError> {
        self.stop().await;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Connects a new client. Nothing is recorded unless the connection
    /// succeeds. When running, its tools are published right away.
    pub async fn add_client(&self, name: &str, config: ConnectionConfig) -> Result<(), HubError> {
        let reservation = self.reserve(name)?;
        debug!(server_id = %name, config = %config.describe(), "Adding MCP client");

        let client_error = |source: ClientError| HubError::Client {
            name: name.to_string(),
            source,
        };
        let transport = self
            .factory
            .provider_transport(name, &config)
            .map_err(|err| client_error(ClientError::Connection(err)))?;
        let client = ToolProviderClient::connect(name, transport, self.request_timeout)
            .await
            .map_err(client_error)?;
        let client = Arc::new(client);

        let inserted = {
            let mut table = lock(&self.clients);
            let current = table.generation == reservation.generation;
            if current {
                table.entries.insert(
                    name.to_string(),
                    ClientEntry {
                        client: client.clone(),
                        config,
                    },
                );
            }
            current
        };
        drop(reservation);
        if !inserted {
            debug!(server_id = %name, "Hub stopped during connect; closing new client");
            client.close().await;
            return Err(HubError::StoppedDuringAdd(name.to_string()));
        }
        info!(server_id = %name, "MCP client added");

        if let Some(endpoint) = self.endpoint() {
            register_client_tools(&endpoint, name, &client).await;
        }
        Ok(())
    }

    /// Removes and closes a client. Its tools leave the registered set, but
    /// a running endpoint keeps advertising them until the next restart.
    pub async fn remove_client(&self, name: &str) -> Result<(), HubError> {
        let entry = lock(&self.clients)
            .entries
            .remove(name)
            .ok_or_else(|| HubError::UnknownClient(name.to_string()))?;
        if let Some(endpoint) = self.endpoint() {
            let forgotten = endpoint.forget_client(name);
            debug!(server_id = %name, count = forgotten, "Unregistered tool names");
        }
        entry.client.close().await;
        info!(server_id = %name, "MCP client removed");
        Ok(())
    }

    pub fn has_client(&self, name: &str) -> bool {
        lock(&self.clients).entries.contains_key(name)
    }

    pub fn client_names(&self) -> Vec<String> {
        lock(&self.clients).entries.keys().cloned().collect()
    }

    pub fn client_config(&self, name: &str) -> Option<ConnectionConfig> {
        lock(&self.clients)
            .entries
            .get(name)
            .map(|entry| entry.config.clone())
    }

    pub fn client_statuses(&self) -> BTreeMap<String, ClientStatus> {
        lock(&self.clients)
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.client.status()))
            .collect()
    }

    /// Refreshes every catalog (stale caches are kept for providers that
    /// fail) and returns them keyed by client name.
    pub async fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        let mut all = BTreeMap::new();
        for (name, client) in self.clients_snapshot() {
            if let Err(err) = client.list_tools().await {
                debug!(server_id = %name, error = %err, "Using cached catalog");
            }
            all.insert(name, client.cached_tools());
        }
        all
    }

    /// Prefixed names currently tracked as registered; empty when stopped.
    pub fn registered_tool_names(&self) -> Vec<String> {
        self.endpoint()
            .map(|endpoint| endpoint.registered_names())
            .unwrap_or_default()
    }

    pub fn resolve_tool(&self, prefixed: &str) -> Option<ToolRoute> {
        self.endpoint()?.route(prefixed)
    }

    /// Invokes an aggregated tool the same way an upstream consumer would.
    pub async fn call_tool(
        &self,
        prefixed: &str,
        arguments: Option<Value>,
    ) -> Result<Value, HubError> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| HubError::UnknownTool(prefixed.to_string()))?;
        endpoint.call_tool(prefixed, arguments).await
    }

    /// Correlation id of the outward transport, once bound.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.running)
            .as_ref()
            .and_then(|running| running.outward.session_id())
    }
}

async fn register_client_tools(endpoint: &ToolEndpoint, name: &str, client: &ToolProviderClient) {
    match client.list_tools().await {
        Ok(tools) => {
            endpoint.register(name, &tools);
        }
        Err(err) => {
            warn!(server_id = %name, error = %err, "Skipping tool registration for client");
        }
    }
}
