use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_KEEP_ALIVE_SECONDS: u64 = 20;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 8;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// How to spawn one tool-provider process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything needed to reach one tool provider. Consumed once at connect
/// time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectionConfig {
    Process(ProcessConfig),
}

impl ConnectionConfig {
    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Process(process) if process.args.is_empty() => {
                process.command.clone()
            }
            ConnectionConfig::Process(process) => {
                format!("{} {}", process.command, process.args.join(" "))
            }
        }
    }
}

impl From<ProcessConfig> for ConnectionConfig {
    fn from(value: ProcessConfig) -> Self {
        ConnectionConfig::Process(value)
    }
}

fn default_true() -> bool {
    true
}

/// One `[[servers]]` entry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerEntry {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::Process(ProcessConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// WebSocket endpoint of the remote relay.
    pub url: Option<String>,
    /// Static bearer token. Overridden by `MCP_HUB_RELAY_TOKEN`.
    pub token: Option<String>,
    /// HTTP endpoint that returns a fresh bearer token.
    pub token_url: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
}

impl RelayConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(
            self.keep_alive_seconds
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECONDS),
        )
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(
            self.reconnect_base_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
        )
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(
            self.reconnect_max_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Run provider processes inside a separate bridge host process.
    #[serde(default)]
    pub enabled: bool,
    /// Command line for the host. Defaults to this executable's
    /// `bridge-host` subcommand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_command: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Seconds to wait for `tools/list` and `tools/call`; 0 disables.
    pub request_timeout_seconds: Option<u64>,
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Config {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self
            .request_timeout_seconds
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(|entry| entry.enabled)
    }

    pub fn find_server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|entry| entry.name == name)
    }

    /// Appends a server, refusing a name that is already configured.
    pub fn add_server(&mut self, entry: ServerEntry) -> Result<(), String> {
        if entry.name.trim().is_empty() {
            return Err("Server name cannot be empty.".to_string());
        }
        if self.find_server(&entry.name).is_some() {
            return Err(format!("Server '{}' is already configured.", entry.name));
        }
        self.servers.push(entry);
        Ok(())
    }

    pub fn remove_server(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|entry| entry.name != name);
        self.servers.len() != before
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
