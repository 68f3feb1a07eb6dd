use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::core::config::data::{path_display, Config, ServerEntry};

/// Parses `KEY=VALUE` for `--env`.
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("environment variable name is empty in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn entry_from_args(
    name: String,
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    disabled: bool,
) -> ServerEntry {
    ServerEntry {
        name,
        command,
        args,
        cwd,
        enabled: !disabled,
        env: env.into_iter().collect::<HashMap<_, _>>(),
    }
}

pub fn list_servers(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = Config::load_from_path(config_path)?;
    println!("Config: {}", path_display(config_path));
    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    for entry in &config.servers {
        let state = if entry.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} [{}]  {}",
            entry.name,
            state,
            entry.connection().describe()
        );
    }
    Ok(())
}

pub fn add_server(config_path: &Path, entry: ServerEntry) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load_from_path(config_path)?;
    let name = entry.name.clone();
    config.add_server(entry)?;
    config.save_to_path(config_path)?;
    println!("✅ Added server '{name}'");
    Ok(())
}

pub fn remove_server(config_path: &Path, name: &str) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load_from_path(config_path)?;
    if !config.remove_server(name) {
        return Err(format!("No server named '{name}' is configured.").into());
    }
    config.save_to_path(config_path)?;
    println!("✅ Removed server '{name}'");
    Ok(())
}
