//! Model Context Protocol plumbing: the wire protocol, the transports that
//! carry it, the per-provider client, and the hub that aggregates providers.

pub mod bridge;
pub mod client;
pub mod error;
pub mod framing;
pub mod hub;
pub mod naming;
pub mod process;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
