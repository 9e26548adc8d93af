//! An RDMA verbs transport engine.
//!
//! `ibfabric` lets processes on different hosts allocate registered memory
//! regions ([`mem`]), exchange queue-pair addressing out of band through a
//! TCP control plane ([`proto`], [`sequencer`]), and drive one-sided and
//! two-sided transfers over reliable connected or unreliable datagram
//! transports ([`engine`]), including UD multicast. The [`client`] and
//! [`server`] facets bootstrap QP peering; [`barrier`] aligns benchmark
//! runs on the data plane.
//!
//! A typical server:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibfabric::{Config, MemoryKind, MemoryRegion, ReliableEngine, Server};
//!
//! # fn main() -> ibfabric::Result<()> {
//! let config = Config::load(None)?;
//! let memory = Arc::new(MemoryRegion::new(MemoryKind::Host, 1 << 30, &config)?);
//! let engine = Arc::new(ReliableEngine::new(memory, &config)?);
//! let server = Server::new(engine, config, "storage-node")?;
//! server.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! And the matching client:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibfabric::{Client, Config, MemoryKind, MemoryRegion, ReliableEngine};
//!
//! # fn main() -> ibfabric::Result<()> {
//! let config = Config::load(None)?;
//! let memory = Arc::new(MemoryRegion::new(MemoryKind::Host, 1 << 20, &config)?);
//! let engine = Arc::new(ReliableEngine::new(memory, &config)?);
//! let client = Client::new(engine.clone(), config, "bench-client")?;
//! let server_id = client.connect("10.0.0.1:5200")?;
//! let offset = client.remote_alloc(server_id, 4096)?;
//! engine.write(server_id as usize, offset, 0, 4096, true)?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("`ibfabric` currently only supports Linux");

/// Bindings of C interfaces.
pub(crate) mod bindings;

/// Shared utility functions.
#[macro_use]
mod utils;

/// Type aliases shared across the crate.
pub mod types;

/// Crate-level error type.
mod error;

/// Runtime configuration.
pub mod config;

/// Mostly-safe wrappers of verbs resources.
pub mod verbs;

/// Registered memory regions and the free-list allocator.
pub mod mem;

/// Control-plane messaging over TCP.
pub mod proto;

/// The NodeID sequencer service.
pub mod sequencer;

/// RC and UD transport engines.
pub mod engine;

/// Client facet: peer lookup, QP exchange, remote allocation.
pub mod client;

/// Server facet: accept loop, remote allocation service, SRQ routing.
pub mod server;

/// Data-plane barriers and the IMMEDIATE-mode receive budget.
pub mod barrier;

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::engine::{
    ConnState, McastId, ReliableEngine, SrqId, Transport, UnreliableEngine,
};
pub use crate::error::{Error, Result};
pub use crate::mem::{MemoryKind, MemoryRegion};
pub use crate::sequencer::NodeIdSequencer;
pub use crate::server::Server;
pub use crate::types::{ConnId, NodeId};
