//! Client facet.
//!
//! On top of an engine, the client resolves peers through the NodeID
//! sequencer, drives the QP address exchange, and offers the remote
//! allocation RPC. Data transfers then go through the engine directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::engine::Transport;
use crate::error::{Error, Result};
use crate::proto::{CtrlMessage, CtrlSocket, MemoryOp, MessageStatus, NodeRole, QpAddress};
use crate::sequencer::lookup_node_id;
use crate::types::NodeId;

/// A client endpoint: an engine plus the control-plane bookkeeping needed
/// to peer with servers.
pub struct Client<T: Transport> {
    engine: Arc<T>,
    config: Config,
    name: String,
    own_addr: String,
    role: NodeRole,
    own_node_id: Mutex<Option<NodeId>>,
    /// Persistent control-plane connections, keyed by `ip:port`.
    sockets: Mutex<HashMap<String, CtrlSocket>>,
    /// Peer address book, node id -> `ip:port`.
    addr_by_node: Mutex<HashMap<NodeId, String>>,
    /// Node ids whose QP build has been claimed, by either side.
    peering: Mutex<HashSet<NodeId>>,
}

impl<T: Transport> Client<T> {
    /// Create a client registering as `name` at the configured sequencer.
    /// The client's own address is the configured interface's IP.
    pub fn new(engine: Arc<T>, config: Config, name: &str) -> Result<Self> {
        let own_addr = Config::interface_ip(&config.interface)?.to_string();
        Ok(Self::with_identity(
            engine,
            config,
            name,
            own_addr,
            NodeRole::Client,
        ))
    }

    /// Create a facet with an explicit identity. The server facet uses this
    /// to register its `ip:port` under the SERVER role.
    pub(crate) fn with_identity(
        engine: Arc<T>,
        config: Config,
        name: &str,
        own_addr: String,
        role: NodeRole,
    ) -> Self {
        Self {
            engine,
            config,
            name: name.to_owned(),
            own_addr,
            role,
            own_node_id: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
            addr_by_node: Mutex::new(HashMap::new()),
            peering: Mutex::new(HashSet::new()),
        }
    }

    /// The engine this client drives.
    pub fn engine(&self) -> &Arc<T> {
        &self.engine
    }

    /// This node's id, once assigned by the sequencer.
    pub fn own_node_id(&self) -> Option<NodeId> {
        *self.own_node_id.lock().unwrap()
    }

    /// Exchange one request/reply with `addr`, connecting first if no
    /// persistent control-plane connection exists yet.
    fn exchange(&self, addr: &str, msg: &CtrlMessage) -> Result<CtrlMessage> {
        let mut sockets = self.sockets.lock().unwrap();
        if !sockets.contains_key(addr) {
            let socket = CtrlSocket::connect(addr, self.config.proto_timeout)?;
            sockets.insert(addr.to_owned(), socket);
        }
        sockets
            .get_mut(addr)
            .expect("socket inserted above")
            .request(msg)
    }

    /// Register at the sequencer, once, and learn this node's id.
    pub fn register(&self) -> Result<NodeId> {
        if let Some(id) = *self.own_node_id.lock().unwrap() {
            return Ok(id);
        }

        let sequencer = self.config.sequencer_addr();
        log::info!("requesting node id from sequencer at {}", sequencer);
        let reply = self.exchange(
            &sequencer,
            &CtrlMessage::NodeIdRequest {
                addr: self.own_addr.clone(),
                name: self.name.clone(),
                role: self.role,
            },
        )?;
        match reply {
            CtrlMessage::NodeIdResponse {
                id,
                status: MessageStatus::NoError,
            } => {
                *self.own_node_id.lock().unwrap() = Some(id);
                log::info!("assigned node id {}", id);
                Ok(id)
            }
            CtrlMessage::NodeIdResponse { status, .. } => Err(Error::RemoteRejected(status)),
            other => Err(Error::ctrl(format!(
                "unexpected reply {} to node id request",
                other.kind()
            ))),
        }
    }

    /// Connect to the server at `ip:port` and return its node id.
    ///
    /// Registers at the sequencer if necessary, translates the address to
    /// the server's node id (with bounded retries while the server has not
    /// registered yet), and exchanges QP addresses unless a peering with
    /// that node already exists or is being built in the other direction.
    pub fn connect(&self, addr: &str) -> Result<NodeId> {
        let own_id = self.register()?;

        if let Some((&id, _)) = self
            .addr_by_node
            .lock()
            .unwrap()
            .iter()
            .find(|(_, a)| a.as_str() == addr)
        {
            return Ok(id);
        }

        // Translate the target address to its node id.
        let server_id = {
            let sequencer = self.config.sequencer_addr();
            let mut sockets = self.sockets.lock().unwrap();
            if !sockets.contains_key(&sequencer) {
                let socket = CtrlSocket::connect(&sequencer, self.config.proto_timeout)?;
                sockets.insert(sequencer.clone(), socket);
            }
            let socket = sockets.get_mut(&sequencer).expect("socket inserted above");
            lookup_node_id(socket, addr, self.config.get_node_id_retries)?
        };
        self.addr_by_node
            .lock()
            .unwrap()
            .insert(server_id, addr.to_owned());

        // Claim the peering; if the peer (a server connecting to a server)
        // got here first, the QP already exists or is being built.
        {
            let mut peering = self.peering.lock().unwrap();
            if !peering.insert(server_id) {
                log::debug!("peering with node {} already in place", server_id);
                return Ok(server_id);
            }
        }

        let local = match self.engine.create_endpoint(server_id as usize) {
            Ok(local) => local,
            Err(e) => {
                self.peering.lock().unwrap().remove(&server_id);
                return Err(e);
            }
        };

        let reply = match self.exchange(
            addr,
            &CtrlMessage::ConnRequest {
                address: local,
                node_id: own_id,
            },
        ) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = self.engine.discard_endpoint(server_id as usize);
                self.peering.lock().unwrap().remove(&server_id);
                return Err(e);
            }
        };
        match reply {
            CtrlMessage::ConnResponse { address } => {
                self.engine.install_remote(server_id as usize, address)?;
                self.engine.establish(server_id as usize)?;
                log::info!("connected to node {} at {}", server_id, addr);
                Ok(server_id)
            }
            CtrlMessage::Error { status } => {
                // The peer refused; the QP for this peering is built in the
                // other direction. Drop ours.
                log::debug!(
                    "peer {} rejected the connection request ({:?}), discarding local QP",
                    addr,
                    status
                );
                self.engine.discard_endpoint(server_id as usize)?;
                Ok(server_id)
            }
            other => Err(Error::ctrl(format!(
                "unexpected reply {} to connection request",
                other.kind()
            ))),
        }
    }

    fn node_addr(&self, node: NodeId) -> Result<String> {
        self.addr_by_node
            .lock()
            .unwrap()
            .get(&node)
            .cloned()
            .ok_or_else(|| Error::InvalidArg(format!("node {} is not connected", node)))
    }

    /// Allocate `size` bytes in the remote server's memory region. Returns
    /// the offset of the extent inside the server's region.
    pub fn remote_alloc(&self, node: NodeId, size: usize) -> Result<usize> {
        let addr = self.node_addr(node)?;
        let reply = self.exchange(
            &addr,
            &CtrlMessage::MemoryRequest {
                op: MemoryOp::Alloc,
                size,
                offset: 0,
            },
        )?;
        match reply {
            CtrlMessage::MemoryResponse {
                offset,
                status: MessageStatus::NoError,
            } => Ok(offset),
            CtrlMessage::MemoryResponse { status, .. } => Err(Error::RemoteRejected(status)),
            other => Err(Error::ctrl(format!(
                "unexpected reply {} to remote allocation",
                other.kind()
            ))),
        }
    }

    /// Release an extent previously obtained with [`Self::remote_alloc`].
    pub fn remote_free(&self, node: NodeId, offset: usize) -> Result<()> {
        let addr = self.node_addr(node)?;
        let reply = self.exchange(
            &addr,
            &CtrlMessage::MemoryRequest {
                op: MemoryOp::Release,
                size: 0,
                offset,
            },
        )?;
        match reply {
            CtrlMessage::MemoryResponse {
                status: MessageStatus::NoError,
                ..
            } => Ok(()),
            CtrlMessage::MemoryResponse { status, .. } => Err(Error::RemoteRejected(status)),
            other => Err(Error::ctrl(format!(
                "unexpected reply {} to remote release",
                other.kind()
            ))),
        }
    }

    /// Tear down the peering with `node`: notify the peer and transition
    /// the local QP to DISCONNECTED.
    pub fn disconnect(&self, node: NodeId) -> Result<()> {
        if let Some(own_id) = self.own_node_id() {
            if let Ok(addr) = self.node_addr(node) {
                // Best effort; the peer may already be gone.
                if let Err(e) =
                    self.exchange(&addr, &CtrlMessage::ConnDisconnect { node_id: own_id })
                {
                    log::debug!("disconnect notification to node {} failed: {}", node, e);
                }
            }
        }
        self.peering.lock().unwrap().remove(&node);
        self.engine.shutdown(node as usize)
    }

    /// Install a QP address arriving from a peer that initiated the
    /// exchange towards us (server-to-server peering). Used by the server
    /// facet's request handler.
    pub(crate) fn accept_peering(&self, node: NodeId, remote: QpAddress) -> Result<QpAddress> {
        let conn = node as usize;
        let local = self.engine.create_endpoint(conn)?;
        self.engine.install_remote(conn, remote)?;
        self.engine.establish(conn)?;
        Ok(local)
    }

    /// Whether a peering with `node` has been claimed (by either side).
    pub(crate) fn claim_peering(&self, node: NodeId) -> bool {
        self.peering.lock().unwrap().insert(node)
    }
}
