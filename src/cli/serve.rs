use std::error::Error;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::config::data::Config;
use crate::core::credentials::{credential_source, KeyringCredentials};
use crate::mcp::bridge::BridgeClient;
use crate::mcp::hub::McpHub;
use crate::mcp::naming::prefixed_tool_name;
use crate::mcp::transport::{DefaultTransportFactory, RelaySettings};

/// Host command used when `[bridge] host_command` is not set: this
/// executable's `bridge-host` subcommand.
fn default_host_command() -> Result<Vec<String>, Box<dyn Error>> {
    let exe = std::env::current_exe()?;
    Ok(vec![
        exe.to_string_lossy().into_owned(),
        "bridge-host".to_string(),
    ])
}

pub(crate) fn bridge_command(config: &Config) -> Result<Vec<String>, Box<dyn Error>> {
    match &config.bridge.host_command {
        Some(command) if !command.is_empty() => Ok(command.clone()),
        _ => default_host_command(),
    }
}

/// Provider side of the factory: local children, or the bridge host when
/// `[bridge] enabled` is set.
fn provider_factory(config: &Config) -> Result<DefaultTransportFactory, Box<dyn Error>> {
    let factory = DefaultTransportFactory::new();
    if !config.bridge.enabled {
        return Ok(factory);
    }
    let command = bridge_command(config)?;
    info!(command = ?command, "Routing tool providers through the bridge host");
    Ok(factory.with_bridge(BridgeClient::spawn_host(&command)?))
}

fn build_hub(config: &Config, factory: DefaultTransportFactory) -> McpHub {
    McpHub::new(Arc::new(factory)).with_request_timeout(config.request_timeout())
}

/// Adds every enabled server. Failures are logged and skipped.
async fn connect_servers(hub: &McpHub, config: &Config) {
    for entry in config.enabled_servers() {
        if let Err(err) = hub.add_client(&entry.name, entry.connection()).await {
            warn!(server_id = %entry.name, error = %err, "Failed to connect MCP server");
            eprintln!("⚠️  {}: {err}", entry.name);
        }
    }
}

pub async fn serve(config: &Config, token: Option<String>) -> Result<(), Box<dyn Error>> {
    let relay = config
        .relay
        .as_ref()
        .ok_or("No [relay] section is configured; nothing to serve to.")?;
    let credentials = credential_source(relay, token)?;
    let settings = RelaySettings::from_config(relay, credentials)?;
    let hub = build_hub(config, provider_factory(config)?.with_relay(settings));

    connect_servers(&hub, config).await;
    hub.start().await?;
    eprintln!(
        "✅ Serving {} tools from {} servers. Press Ctrl+C to stop.",
        hub.registered_tool_names().len(),
        hub.client_names().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    hub.stop().await;
    Ok(())
}

pub async fn print_tools(config: &Config) -> Result<(), Box<dyn Error>> {
    let hub = build_hub(config, provider_factory(config)?);
    connect_servers(&hub, config).await;

    let catalogs = hub.list_all_tools().await;
    if catalogs.is_empty() {
        println!("No servers connected.");
    }
    for (server, tools) in catalogs {
        println!("{server} ({} tools)", tools.len());
        for tool in tools {
            let name = prefixed_tool_name(&server, &tool.name);
            match tool.description.as_deref() {
                Some(description) if !description.is_empty() => {
                    println!("  {name}  {}", first_line(description));
                }
                _ => println!("  {name}"),
            }
        }
    }

    hub.stop().await;
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

/// Saves `token` under the keyring account named after the relay URL, which
/// is where [`credential_source`] looks when no other token is configured.
pub fn store_relay_token(config: &Config, token: &str) -> Result<(), Box<dyn Error>> {
    let account = config
        .relay
        .as_ref()
        .and_then(|relay| relay.url.clone())
        .unwrap_or_else(|| "default".to_string());
    KeyringCredentials::new(account.clone()).store(token.trim())?;
    println!("✅ Stored relay token for {account}");
    Ok(())
}
