//! RDMA transport engines.
//!
//! An engine owns the queue pairs, completion queues, and (for RC) shared
//! receive queues of one endpoint, and drives the verbs posting/polling
//! state machine on top of a shared [`MemoryRegion`](crate::mem::MemoryRegion).

pub mod reliable;
pub mod unreliable;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub use self::reliable::{ReliableEngine, SrqId};
pub use self::unreliable::{McastId, UnreliableEngine};
use crate::config::Config;
use crate::error::Result;
use crate::mem::MemoryRegion;
use crate::proto::QpAddress;
use crate::types::ConnId;

/// Lifecycle state of one connection endpoint.
///
/// States advance monotonically; `Disconnected` is terminal and means the
/// verbs resources have been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// No queue pair exists yet.
    Fresh,
    /// The queue pair exists and is in INIT; the remote address may still be
    /// missing.
    Init,
    /// The queue pair reached RTS and serves data transfers.
    Ready,
    /// Torn down. Terminal.
    Disconnected,
}

impl ConnState {
    /// Whether moving to `next` keeps the state sequence monotone.
    #[inline]
    pub fn may_advance_to(self, next: ConnState) -> bool {
        self < next
    }
}

/// Per-connection signaled-work-request counter.
///
/// The send queue has a bounded depth, and a completion must be reaped every
/// so often or unsignaled posts overrun it. Callers' `signaled` flags are
/// advisory: after `limit` consecutive unsignaled posts the next post is
/// forced to signal.
pub(crate) struct SignalBudget {
    count: AtomicU32,
    limit: u32,
}

impl SignalBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    /// Account one post. Returns whether it must be posted signaled.
    pub fn apply(&self, signaled: bool) -> bool {
        if signaled {
            self.count.store(0, Ordering::Relaxed);
            return true;
        }
        let seen = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.limit {
            self.count.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Engine-side connection management used by the client and server facets.
///
/// The facets use the peer's node id as the connection id. Data-plane
/// operations live on the concrete engines.
pub trait Transport: Send + Sync {
    /// The memory region this engine transfers from and into.
    fn memory(&self) -> &Arc<MemoryRegion>;

    /// Create a fresh endpoint for `conn` and bring it to INIT. Returns the
    /// local QP address to offer the peer.
    fn create_endpoint(&self, conn: ConnId) -> Result<QpAddress>;

    /// Drop an endpoint whose peering was rejected before it ever reached
    /// READY.
    fn discard_endpoint(&self, conn: ConnId) -> Result<()>;

    /// Install the peer's QP address for `conn`.
    fn install_remote(&self, conn: ConnId, remote: QpAddress) -> Result<()>;

    /// Drive the endpoint to READY (RC: RTR then RTS; UD: build the peer's
    /// address handle). Idempotent once READY.
    fn establish(&self, conn: ConnId) -> Result<()>;

    /// Transition `conn` to DISCONNECTED, releasing its verbs resources.
    fn shutdown(&self, conn: ConnId) -> Result<()>;

    /// The local QP address of `conn`.
    fn local_address(&self, conn: ConnId) -> Result<QpAddress>;

    /// Lifecycle state of `conn`.
    fn state(&self, conn: ConnId) -> ConnState;

    /// Ids of all connections currently in READY.
    fn ready_ids(&self) -> Vec<ConnId>;
}

/// Creation-time parameters shared by both engines, distilled from the
/// runtime [`Config`].
#[derive(Debug, Clone)]
pub(crate) struct EngineParams {
    pub max_wr: u32,
    pub port_num: u8,
    pub gid_index: Option<u8>,
    pub ud_mtu: u32,
}

impl EngineParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_wr: config.max_wr,
            port_num: config.ib_port,
            gid_index: config.gid_index,
            ud_mtu: config.ud_mtu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_monotone() {
        use ConnState::*;
        let order = [Fresh, Init, Ready, Disconnected];
        for (i, &a) in order.iter().enumerate() {
            for (j, &b) in order.iter().enumerate() {
                assert_eq!(a.may_advance_to(b), i < j);
            }
        }
    }

    #[test]
    fn budget_forces_signal_at_limit() {
        let budget = SignalBudget::new(4);
        // Three unsignaled posts pass through, the fourth is forced.
        assert!(!budget.apply(false));
        assert!(!budget.apply(false));
        assert!(!budget.apply(false));
        assert!(budget.apply(false));
        // The counter restarted.
        assert!(!budget.apply(false));
    }

    #[test]
    fn explicit_signal_resets_the_counter() {
        let budget = SignalBudget::new(3);
        assert!(!budget.apply(false));
        assert!(!budget.apply(false));
        assert!(budget.apply(true));
        // A full window is available again.
        assert!(!budget.apply(false));
        assert!(!budget.apply(false));
        assert!(budget.apply(false));
    }
}
