//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod serve;
pub mod servers;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::config::data::Config;
use crate::core::credentials::TOKEN_ENV_VAR;

#[derive(Parser)]
#[command(name = "mcp-hub", version)]
#[command(about = "Aggregate MCP tool providers behind one relayed endpoint")]
#[command(
    long_about = "mcp-hub connects to any number of Model Context Protocol tool providers, \
merges their tools into one namespace ({server}-{tool}), and serves that namespace \
to a remote relay over a persistent WebSocket.\n\n\
Configuration lives in config.toml under the platform config directory \
(see 'mcp-hub server list').\n\n\
Environment Variables:\n\
  MCP_HUB_RELAY_TOKEN   Bearer token presented to the relay\n\
  RUST_LOG              Log filter (defaults to info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file to use instead of the default location
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect every enabled server and serve the aggregated tools until Ctrl-C
    Serve {
        /// Relay bearer token (overrides the config file and keyring)
        #[arg(long, env = TOKEN_ENV_VAR, hide_env_values = true)]
        token: Option<String>,
    },
    /// Connect every enabled server and print its tools under their hub names
    Tools,
    /// Manage configured tool-provider servers
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// Store the relay bearer token in the system keyring
    RelayToken {
        /// Token to store
        token: String,
    },
    /// Run the privileged bridge host on stdin/stdout
    BridgeHost,
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// List configured servers
    List,
    /// Add a server that is launched as a child process
    Add {
        /// Unique server name; becomes the tool-name prefix
        name: String,
        /// Environment variable for the server process (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = servers::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Working directory for the server process
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Add the server without enabling it
        #[arg(long)]
        disabled: bool,
        /// Executable to launch
        command: String,
        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Remove a configured server
    Remove {
        /// Server name
        name: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    crate::logging::init(args.log.as_deref())?;
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let config_path = Config::resolve_path(args.config.as_deref())?;

    match args.command {
        Commands::Serve { token } => {
            let config = Config::load_from_path(&config_path)?;
            serve::serve(&config, token).await
        }
        Commands::Tools => {
            let config = Config::load_from_path(&config_path)?;
            serve::print_tools(&config).await
        }
        Commands::Server { command } => match command {
            ServerCommands::List => servers::list_servers(&config_path),
            ServerCommands::Add {
                name,
                env,
                cwd,
                disabled,
                command,
                args,
            } => servers::add_server(
                &config_path,
                servers::entry_from_args(name, command, args, env, cwd, disabled),
            ),
            ServerCommands::Remove { name } => servers::remove_server(&config_path, &name),
        },
        Commands::RelayToken { token } => {
            let config = Config::load_from_path(&config_path)?;
            serve::store_relay_token(&config, &token)
        }
        Commands::BridgeHost => {
            crate::mcp::bridge::host::serve_stdio().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests;
