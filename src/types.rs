//! Type aliases shared across the crate.

/// [`u64`]: **Node identifier**, a dense process-wide id assigned by the
/// [`NodeIdSequencer`](crate::sequencer::NodeIdSequencer).
pub type NodeId = u64;

/// [`usize`]: **Connection identifier**, a dense index into an engine's
/// connection table. The facets use the peer's [`NodeId`] as the index.
pub type ConnId = usize;

/// [`u16`]: **Local identifier (LID)**, identifies a port on a switch or an
/// HCA in the subnet.
pub type Lid = u16;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, initializes a QP's sequence
/// space.
pub type Psn = u32;

/// [`u32`]: **Queue key**, authorizes sends to an unreliable datagram QP.
pub type QKey = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the poster to identify
/// a work request in its completion.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, carried by WRITE_WITH_IMM and SEND_WITH_IMM
/// work requests in network byte order.
pub type ImmData = u32;
