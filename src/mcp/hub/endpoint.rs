//! The aggregated tool surface served on the outward transport.
//!
//! Publication is write-once for the lifetime of an endpoint: removing a
//! client only drops its names from the tracking set, so an upstream
//! consumer may still see them in `tools/list` until the hub restarts.
//! Calls to such stale names fail with a JSON-RPC error.

use super::ClientDirectory;
use crate::mcp::client::ToolProviderClient;
use crate::mcp::error::{ClientError, HubError};
use crate::mcp::naming::prefixed_tool_name;
use crate::mcp::protocol::{
    server_details, CallToolParams, JsonRpcMessage, JsonRpcRequest, ToolDescriptor,
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_INITIALIZE, METHOD_NOT_FOUND, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::mcp::transport::{Transport, TransportEvent};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a published tool name leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub client: String,
    pub original: String,
}

struct PublishedTool {
    descriptor: ToolDescriptor,
    route: ToolRoute,
}

#[derive(Default)]
struct Catalog {
    published: BTreeMap<String, PublishedTool>,
    registered: BTreeSet<String>,
}

pub(crate) struct ToolEndpoint {
    catalog: Mutex<Catalog>,
    clients: ClientDirectory,
}

struct RpcFailure {
    code: i64,
    message: String,
}

impl RpcFailure {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl ToolEndpoint {
    pub(crate) fn new(clients: ClientDirectory) -> Self {
        Self {
            catalog: Mutex::new(Catalog::default()),
            clients,
        }
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `tools` under prefixed names. A name already registered is
    /// skipped, so the first client to claim it keeps it. Returns the names
    /// newly registered.
    pub(crate) fn register(&self, client: &str, tools: &[ToolDescriptor]) -> Vec<String> {
        let mut catalog = self.catalog();
        let mut added = Vec::new();
        for tool in tools {
            let prefixed = prefixed_tool_name(client, &tool.name);
            if catalog.registered.contains(&prefixed) {
                let owner = catalog
                    .published
                    .get(&prefixed)
                    .map(|published| published.route.client.clone())
                    .unwrap_or_default();
                warn!(
                    server_id = %client,
                    tool = %tool.name,
                    prefixed = %prefixed,
                    owner = %owner,
                    "Skipping tool whose prefixed name is already registered"
                );
                continue;
            }
            catalog.registered.insert(prefixed.clone());
            catalog.published.insert(
                prefixed.clone(),
                PublishedTool {
                    descriptor: tool.renamed(&prefixed),
                    route: ToolRoute {
                        client: client.to_string(),
                        original: tool.name.clone(),
                    },
                },
            );
            added.push(prefixed);
        }
        if !added.is_empty() {
            debug!(server_id = %client, count = added.len(), "Registered tools");
        }
        added
    }

    /// Drops `client`'s names from the tracking set. Published entries stay.
    pub(crate) fn forget_client(&self, client: &str) -> usize {
        let mut catalog = self.catalog();
        let Catalog {
            published,
            registered,
        } = &mut *catalog;
        let before = registered.len();
        registered.retain(|name| {
            published
                .get(name)
                .is_none_or(|published| published.route.client != client)
        });
        before - registered.len()
    }

    pub(crate) fn registered_names(&self) -> Vec<String> {
        self.catalog().registered.iter().cloned().collect()
    }

    pub(crate) fn published_tools(&self) -> Vec<ToolDescriptor> {
        self.catalog()
            .published
            .values()
            .map(|published| published.descriptor.clone())
            .collect()
    }

    pub(crate) fn route(&self, prefixed: &str) -> Option<ToolRoute> {
        self.catalog()
            .published
            .get(prefixed)
            .map(|published| published.route.clone())
    }

    fn client(&self, name: &str) -> Option<Arc<ToolProviderClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .get(name)
            .map(|entry| entry.client.clone())
    }

    /// Resolves a prefixed name and forwards the call using the provider's
    /// own tool name.
    pub(crate) async fn call_tool(
        &self,
        prefixed: &str,
        arguments: Option<Value>,
    ) -> Result<Value, HubError> {
        let route = self
            .route(prefixed)
            .ok_or_else(|| HubError::UnknownTool(prefixed.to_string()))?;
        let client = self
            .client(&route.client)
            .ok_or_else(|| HubError::UnknownClient(route.client.clone()))?;
        debug!(tool = %prefixed, server_id = %route.client, original = %route.original, "Forwarding tool call");
        client
            .call_tool(&route.original, arguments)
            .await
            .map_err(|source| HubError::Client {
                name: route.client.clone(),
                source,
            })
    }

    async fn handle(&self, request: &JsonRpcRequest) -> Result<Value, RpcFailure> {
        match request.method.as_str() {
            METHOD_INITIALIZE => serde_json::to_value(server_details())
                .map_err(|err| RpcFailure::new(INTERNAL_ERROR, err.to_string())),
            METHOD_PING => Ok(serde_json::json!({})),
            METHOD_TOOLS_LIST => Ok(serde_json::json!({ "tools": self.published_tools() })),
            METHOD_TOOLS_CALL => {
                let params: CallToolParams =
                    serde_json::from_value(request.params.clone().unwrap_or(Value::Null))
                        .map_err(|err| RpcFailure::new(INVALID_PARAMS, err.to_string()))?;
                self.call_tool(&params.name, params.arguments)
                    .await
                    .map_err(rpc_failure)
            }
            other => Err(RpcFailure::new(
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    /// Answers requests arriving on `outward` until it closes.
    pub(crate) async fn serve(
        self: Arc<Self>,
        outward: Arc<dyn Transport>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                    let endpoint = self.clone();
                    let outward = outward.clone();
                    tokio::spawn(async move {
                        let reply = match endpoint.handle(&request).await {
                            Ok(result) => JsonRpcMessage::response(request.id, result),
                            Err(failure) => {
                                debug!(
                                    method = %request.method,
                                    code = failure.code,
                                    message = %failure.message,
                                    "Outward request failed"
                                );
                                JsonRpcMessage::error(Some(request.id), failure.code, failure.message)
                            }
                        };
                        if let Err(err) = outward.send(reply).await {
                            warn!(error = %err, "Failed to answer outward request");
                        }
                    });
                }
                TransportEvent::Message(other) => {
                    debug!(method = ?other.method(), "Ignoring outward message");
                }
                TransportEvent::Error(err) => {
                    warn!(error = %err, "Outward transport error");
                }
                TransportEvent::Closed => {
                    info!("Outward transport closed");
                    break;
                }
            }
        }
    }
}

fn rpc_failure(err: HubError) -> RpcFailure {
    match err {
        HubError::UnknownTool(name) => RpcFailure::new(INVALID_PARAMS, format!("unknown tool: {name}")),
        HubError::UnknownClient(name) => RpcFailure::new(
            INVALID_PARAMS,
            format!("tool provider '{name}' is no longer connected"),
        ),
        HubError::Client {
            source: ClientError::Rpc { code, message, .. },
            ..
        } => RpcFailure::new(code, message),
        other => RpcFailure::new(INTERNAL_ERROR, other.to_string()),
    }
}
