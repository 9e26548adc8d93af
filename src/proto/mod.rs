//! Control-plane messaging.
//!
//! The control plane carries NodeID assignment, QP address exchange, and
//! remote-allocation RPC over TCP. Messages are typed envelopes encoded as
//! length-prefixed JSON; see [`socket`] for the framing.

mod server;
mod socket;

use serde::{Deserialize, Serialize};

pub use self::server::{BoundCtrl, CtrlServer, Handler};
pub use self::socket::CtrlSocket;
use crate::types::NodeId;
use crate::verbs::Gid;

/// Status codes carried in control-plane replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    NoError,
    InvalidMessage,
    MemoryNotAvailable,
    MemoryReleaseFailed,
    NodeIdNotFound,
}

/// What a node registers as at the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Client,
    Server,
}

/// The QP addressing record exchanged during connection setup.
///
/// `buffer` is the remote MR base for computing absolute addresses from
/// offsets; `rkey` authorizes one-sided access to it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QpAddress {
    pub buffer: u64,
    pub rkey: u32,
    pub qp_num: u32,
    pub lid: u16,
    pub gid: Gid,
    pub psn: u32,
}

/// One row of the sequencer's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub addr: String,
    pub name: String,
    pub id: NodeId,
    pub role: NodeRole,
}

/// Whether a memory resource request allocates or releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOp {
    Alloc,
    Release,
}

/// The control-plane message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlMessage {
    /// Register at the sequencer and obtain a fresh node id.
    NodeIdRequest {
        addr: String,
        name: String,
        role: NodeRole,
    },
    NodeIdResponse {
        id: NodeId,
        status: MessageStatus,
    },

    /// Translate a server's ip:port to its node id.
    NodeIdForAddrRequest {
        addr: String,
    },
    NodeIdForAddrResponse {
        id: NodeId,
        addr: String,
        name: String,
        role: NodeRole,
        status: MessageStatus,
    },

    /// Dump the whole directory.
    AllNodeIdsRequest,
    AllNodeIdsResponse {
        entries: Vec<NodeEntry>,
        status: MessageStatus,
    },

    /// Peer-to-peer QP address exchange.
    ConnRequest {
        address: QpAddress,
        node_id: NodeId,
    },
    ConnResponse {
        address: QpAddress,
    },
    ConnDisconnect {
        node_id: NodeId,
    },

    /// Remote allocation RPC against a server's memory region.
    MemoryRequest {
        op: MemoryOp,
        size: usize,
        offset: usize,
    },
    MemoryResponse {
        offset: usize,
        status: MessageStatus,
    },

    /// Failure reply to any request.
    Error {
        status: MessageStatus,
    },
}

impl CtrlMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CtrlMessage::NodeIdRequest { .. } => "NodeIdRequest",
            CtrlMessage::NodeIdResponse { .. } => "NodeIdResponse",
            CtrlMessage::NodeIdForAddrRequest { .. } => "NodeIdForAddrRequest",
            CtrlMessage::NodeIdForAddrResponse { .. } => "NodeIdForAddrResponse",
            CtrlMessage::AllNodeIdsRequest => "AllNodeIdsRequest",
            CtrlMessage::AllNodeIdsResponse { .. } => "AllNodeIdsResponse",
            CtrlMessage::ConnRequest { .. } => "ConnRequest",
            CtrlMessage::ConnResponse { .. } => "ConnResponse",
            CtrlMessage::ConnDisconnect { .. } => "ConnDisconnect",
            CtrlMessage::MemoryRequest { .. } => "MemoryRequest",
            CtrlMessage::MemoryResponse { .. } => "MemoryResponse",
            CtrlMessage::Error { .. } => "Error",
        }
    }
}
