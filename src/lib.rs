//! MCP Hub aggregates many Model Context Protocol tool providers behind one
//! namespaced endpoint and republishes it to a remote relay.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns configuration loading/saving and relay credentials.
//! - [`mcp`] holds the protocol types, the transports (child process,
//!   cross-process bridge, relay socket), the tool-provider client, and the
//!   [`mcp::hub::McpHub`] itself.
//! - [`logging`] installs the process-wide `tracing` subscriber.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
