//! Server facet.
//!
//! A server owns an engine and its memory region, registers at the NodeID
//! sequencer, and runs a control-plane accept loop serving connection
//! requests, remote allocation, and disconnects. New QPs are routed onto
//! the engine's active SRQ when one is designated.

use std::sync::{Arc, Mutex};

use crate::client::Client;
use crate::config::Config;
use crate::engine::Transport;
use crate::error::Result;
use crate::proto::{CtrlMessage, CtrlServer, Handler, MemoryOp, MessageStatus, NodeRole, QpAddress};
use crate::types::{ConnId, NodeId};

/// A server endpoint over an engine.
pub struct Server<T: Transport + 'static> {
    engine: Arc<T>,
    config: Config,
    name: String,
    bind_addr: String,
    client: Mutex<Option<Arc<Client<T>>>>,
    ctrl: Mutex<Option<CtrlServer>>,
}

impl<T: Transport + 'static> Server<T> {
    /// Create a server listening on the configured interface and port.
    pub fn new(engine: Arc<T>, config: Config, name: &str) -> Result<Self> {
        let ip = Config::interface_ip(&config.interface)?;
        let bind_addr = format!("{}:{}", ip, config.port);
        Ok(Self::with_bind_addr(engine, config, name, bind_addr))
    }

    /// Create a server listening on an explicit `ip:port`.
    pub fn with_bind_addr(
        engine: Arc<T>,
        config: Config,
        name: &str,
        bind_addr: String,
    ) -> Self {
        Self {
            engine,
            config,
            name: name.to_owned(),
            bind_addr,
            client: Mutex::new(None),
            ctrl: Mutex::new(None),
        }
    }

    /// The engine this server drives.
    pub fn engine(&self) -> &Arc<T> {
        &self.engine
    }

    /// Register at the sequencer and spawn the control-plane accept loop.
    /// Idempotent while running.
    pub fn start(&self) -> Result<()> {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.is_some() {
            return Ok(());
        }

        // Bind first: with a `:0` bind the registered address must carry
        // the actual port.
        let bound = CtrlServer::bind(&self.bind_addr)?;
        let addr = bound.local_addr().to_owned();

        let client = Arc::new(Client::with_identity(
            self.engine.clone(),
            self.config.clone(),
            &self.name,
            addr.clone(),
            NodeRole::Server,
        ));
        client.register()?;

        let handler = ServerHandler {
            engine: self.engine.clone(),
            client: client.clone(),
        };
        *self.client.lock().unwrap() = Some(client);
        *ctrl = Some(bound.serve(handler));
        log::info!("server '{}' accepting connections on {}", self.name, addr);
        Ok(())
    }

    /// Stop the accept loop and close every connection, draining each QP's
    /// completion queues on the way down.
    pub fn stop(&self) {
        if let Some(mut ctrl) = self.ctrl.lock().unwrap().take() {
            ctrl.stop();
        }
        for conn in self.engine.ready_ids() {
            if let Err(e) = self.engine.shutdown(conn) {
                log::warn!("closing connection {} failed: {}", conn, e);
            }
        }
    }

    /// The address the control plane is bound to, once started.
    pub fn local_addr(&self) -> Option<String> {
        self.ctrl
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.local_addr().to_owned())
    }

    /// This server's node id, once registered.
    pub fn own_node_id(&self) -> Option<NodeId> {
        self.client
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.own_node_id())
    }

    /// The client facet this server uses for outbound peering (server-to-
    /// server connections ride the same machinery).
    pub fn client(&self) -> Option<Arc<Client<T>>> {
        self.client.lock().unwrap().clone()
    }

    /// Ids of all connections currently usable for data transfers.
    pub fn connected_ids(&self) -> Vec<ConnId> {
        self.engine.ready_ids()
    }
}

impl<T: Transport + 'static> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The control-plane request handler of a running server.
struct ServerHandler<T: Transport + 'static> {
    engine: Arc<T>,
    client: Arc<Client<T>>,
}

impl<T: Transport + 'static> ServerHandler<T> {
    fn handle_conn_request(&self, address: QpAddress, node_id: NodeId) -> CtrlMessage {
        let own_id = match self.client.own_node_id() {
            Some(id) => id,
            None => {
                log::error!("connection request before registration completed");
                return CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                };
            }
        };

        // First contact claims the peering outright. A duplicate claim
        // means both sides started building QPs towards each other; the
        // side with the greater node id wins and the other backs off.
        if !self.client.claim_peering(node_id) {
            if node_id == own_id {
                log::warn!("connection request from own node id {}", node_id);
            }
            if node_id <= own_id {
                log::debug!(
                    "rejecting duplicate peering from node {} (own id {})",
                    node_id,
                    own_id
                );
                return CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                };
            }
            // The requester outranks us; replace whatever we started.
            if let Err(e) = self.engine.discard_endpoint(node_id as usize) {
                log::debug!("discarding superseded endpoint {}: {}", node_id, e);
            }
        }

        match self.client.accept_peering(node_id, address) {
            Ok(local) => {
                log::info!("accepted connection from node {}", node_id);
                CtrlMessage::ConnResponse { address: local }
            }
            Err(e) => {
                log::error!("building QP for node {} failed: {}", node_id, e);
                CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                }
            }
        }
    }

    fn handle_memory_request(&self, op: MemoryOp, size: usize, offset: usize) -> CtrlMessage {
        // The region's free list carries its own lock.
        match op {
            MemoryOp::Alloc => match self.engine.memory().alloc(size) {
                Ok(offset) => CtrlMessage::MemoryResponse {
                    offset,
                    status: MessageStatus::NoError,
                },
                Err(e) => {
                    log::debug!("remote allocation of {} bytes failed: {}", size, e);
                    CtrlMessage::MemoryResponse {
                        offset: 0,
                        status: MessageStatus::MemoryNotAvailable,
                    }
                }
            },
            MemoryOp::Release => match self.engine.memory().free(offset) {
                Ok(()) => CtrlMessage::MemoryResponse {
                    offset,
                    status: MessageStatus::NoError,
                },
                Err(e) => {
                    log::debug!("remote release at offset {} failed: {}", offset, e);
                    CtrlMessage::MemoryResponse {
                        offset,
                        status: MessageStatus::MemoryReleaseFailed,
                    }
                }
            },
        }
    }
}

impl<T: Transport + 'static> Handler for ServerHandler<T> {
    fn handle(&mut self, msg: CtrlMessage) -> CtrlMessage {
        match msg {
            CtrlMessage::ConnRequest { address, node_id } => {
                self.handle_conn_request(address, node_id)
            }
            CtrlMessage::MemoryRequest { op, size, offset } => {
                self.handle_memory_request(op, size, offset)
            }
            CtrlMessage::ConnDisconnect { node_id } => {
                match self.engine.shutdown(node_id as usize) {
                    Ok(()) => CtrlMessage::Error {
                        status: MessageStatus::NoError,
                    },
                    Err(e) => {
                        log::debug!("disconnect of node {} failed: {}", node_id, e);
                        CtrlMessage::Error {
                            status: MessageStatus::InvalidMessage,
                        }
                    }
                }
            }
            other => {
                log::warn!("server received unhandled message {}", other.kind());
                CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                }
            }
        }
    }
}
