//! Benchmark coordination helpers on the data plane.
//!
//! Barriers ride the RC queue pairs rather than the control-plane sockets,
//! so that synchronization exercises the same fabric path the benchmark is
//! about to measure.

use std::thread;
use std::time::Duration;

use crate::engine::ReliableEngine;
use crate::error::{Error, Result};
use crate::types::{ConnId, ImmData};

/// Client side of the global barrier.
///
/// Posts a zero-length receive towards every peer, then sends a zero-length
/// signaled message to each (retrying transient post failures), and finally
/// waits for every peer's acknowledgement.
pub fn global_barrier_client(engine: &ReliableEngine, conns: &[ConnId]) -> Result<()> {
    for &conn in conns {
        engine.receive(conn, 0, 0)?;
    }

    let mut left: Vec<ConnId> = conns.to_vec();
    while !left.is_empty() {
        let mut still = Vec::new();
        for conn in left {
            match engine.send(conn, 0, 0, true) {
                Ok(()) => {}
                Err(Error::PostFailed(e)) => {
                    log::debug!("barrier send to {} not yet possible: {}", conn, e);
                    thread::sleep(Duration::from_millis(1));
                    still.push(conn);
                }
                Err(e) => return Err(e),
            }
        }
        left = still;
    }

    for &conn in conns {
        engine.poll_receive(conn, true)?;
    }
    Ok(())
}

/// Server side of the global barrier.
///
/// Posts a receive per connected client, waits for all of them to ping,
/// then acknowledges each with a zero-length signaled send.
pub fn global_barrier_server(engine: &ReliableEngine, conns: &[ConnId]) -> Result<()> {
    for &conn in conns {
        engine.receive(conn, 0, 0)?;
    }
    for &conn in conns {
        engine.poll_receive(conn, true)?;
    }
    for &conn in conns {
        engine.send(conn, 0, 0, true)?;
    }
    Ok(())
}

/// Sender-side receive budget for IMMEDIATE-mode flows.
///
/// Both sides keep `pending` within `[0, max_wr]`. The sender reserves
/// window space before each burst of WRITE_WITH_IMM or SEND messages; the
/// receiver acknowledges every half-window block with one WRITE_WITH_IMM
/// carrying the block size as immediate data, which the sender feeds back
/// through [`ReceiveBudget::on_ack`]. This keeps the wire busy without ever
/// overrunning the receiver's posted-WR window.
#[derive(Debug)]
pub struct ReceiveBudget {
    max_wr: u32,
    pending: u32,
}

impl ReceiveBudget {
    /// Create a budget for a connection with the given WR window.
    pub fn new(max_wr: u32) -> Self {
        Self { max_wr, pending: 0 }
    }

    /// The block size the receiver acknowledges: half the window, rounded
    /// up.
    pub fn ack_block(max_wr: u32) -> u32 {
        max_wr.div_ceil(2)
    }

    /// Outstanding unacknowledged messages.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// How many more messages fit in the window right now.
    pub fn available(&self) -> u32 {
        self.max_wr - self.pending
    }

    /// Reserve window space for a burst of `count` messages. Fails when the
    /// burst would overrun the window; nothing is reserved in that case.
    pub fn reserve(&mut self, count: u32) -> Result<()> {
        if self.pending + count > self.max_wr {
            return Err(Error::InvalidArg(format!(
                "burst of {} overruns the receive window ({} of {} pending)",
                count, self.pending, self.max_wr
            )));
        }
        self.pending += count;
        Ok(())
    }

    /// Feed back an acknowledgement immediate: the receiver confirms
    /// consumption of `imm` messages.
    pub fn on_ack(&mut self, imm: ImmData) {
        self.pending = self.pending.saturating_sub(imm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_never_exceeds_window() {
        let mut budget = ReceiveBudget::new(8);
        budget.reserve(5).unwrap();
        budget.reserve(3).unwrap();
        assert_eq!(budget.pending(), 8);
        assert!(budget.reserve(1).is_err());
        // The failed reservation changed nothing.
        assert_eq!(budget.pending(), 8);
    }

    #[test]
    fn acks_reopen_the_window() {
        let mut budget = ReceiveBudget::new(8);
        budget.reserve(8).unwrap();
        budget.on_ack(ReceiveBudget::ack_block(8));
        assert_eq!(budget.pending(), 4);
        budget.reserve(4).unwrap();
        assert_eq!(budget.available(), 0);
    }

    #[test]
    fn ack_block_rounds_up() {
        assert_eq!(ReceiveBudget::ack_block(8), 4);
        assert_eq!(ReceiveBudget::ack_block(9), 5);
        assert_eq!(ReceiveBudget::ack_block(1), 1);
    }

    #[test]
    fn stray_ack_saturates_at_zero() {
        let mut budget = ReceiveBudget::new(4);
        budget.reserve(2).unwrap();
        budget.on_ack(10);
        assert_eq!(budget.pending(), 0);
        budget.reserve(4).unwrap();
    }
}
