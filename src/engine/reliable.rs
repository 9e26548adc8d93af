//! Reliable connected (RC) engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{ConnState, EngineParams, SignalBudget, Transport};
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::mem::MemoryRegion;
use crate::proto::QpAddress;
use crate::types::{ConnId, ImmData};
use crate::verbs::{Cq, LocalBuf, Qp, QpInitOptions, QpType, RemoteBuf, Srq, Wc};

/// Identifier of a shared receive queue inside one engine.
pub type SrqId = usize;

/// How many completions one SRQ batch poll reaps at most.
const SRQ_POLL_BATCH: usize = 64;

/// Verbs resources of one RC connection.
struct ConnRes {
    qp: Qp,
    send_cq: Cq,
    recv_cq: Cq,
    /// The recv CQ is the SRQ's shared CQ, not this connection's own.
    on_srq: bool,
    budget: SignalBudget,
}

/// One slot of the connection table.
struct ConnSlot {
    state: ConnState,
    local: QpAddress,
    remote: Option<QpAddress>,
    res: Option<Arc<ConnRes>>,
}

impl Default for ConnSlot {
    fn default() -> Self {
        Self {
            state: ConnState::Fresh,
            local: QpAddress::default(),
            remote: None,
            res: None,
        }
    }
}

struct SrqEntry {
    srq: Srq,
    recv_cq: Cq,
}

/// The RC engine: a table of reliable-connected queue pairs over one
/// registered memory region, with optional server-side SRQ sharing.
///
/// Post and poll paths on a READY connection only take the table's read
/// lock; creation, state transitions, and teardown serialize on its write
/// lock.
pub struct ReliableEngine {
    memory: Arc<MemoryRegion>,
    params: EngineParams,
    conns: RwLock<Vec<ConnSlot>>,
    qpn_to_conn: RwLock<HashMap<u32, ConnId>>,
    srqs: RwLock<Vec<SrqEntry>>,
    active_srq: Mutex<Option<SrqId>>,
}

impl ReliableEngine {
    /// Create an RC engine over a registered memory region.
    pub fn new(memory: Arc<MemoryRegion>, config: &Config) -> Result<Self> {
        // Fail early if the region cannot back verbs traffic.
        memory.pd()?;
        Ok(Self {
            memory,
            params: EngineParams::from_config(config),
            conns: RwLock::new(Vec::new()),
            qpn_to_conn: RwLock::new(HashMap::new()),
            srqs: RwLock::new(Vec::new()),
            active_srq: Mutex::new(None),
        })
    }

    /// Create an endpoint under the lowest unused connection id.
    pub fn next_endpoint(&self) -> Result<(ConnId, QpAddress)> {
        let conn = {
            let conns = self.conns.read().unwrap();
            conns
                .iter()
                .position(|slot| slot.state == ConnState::Fresh)
                .unwrap_or(conns.len())
        };
        let local = self.create_endpoint(conn)?;
        Ok((conn, local))
    }

    fn local_buf(&self, offset: usize, len: usize) -> Result<LocalBuf> {
        if offset.checked_add(len).map_or(true, |end| end > self.memory.size()) {
            return Err(Error::InvalidArg(format!(
                "local range [{}, {}+{}) exceeds the memory region",
                offset, offset, len
            )));
        }
        Ok(LocalBuf {
            addr: self.memory.addr() + offset as u64,
            len: len as u32,
            lkey: self.memory.lkey()?,
        })
    }

    /// Fetch the resources and remote address of a READY connection.
    fn conn_res(&self, conn: ConnId) -> Result<(Arc<ConnRes>, QpAddress)> {
        let conns = self.conns.read().unwrap();
        let slot = conns.get(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state != ConnState::Ready {
            return Err(Error::NotConnected(conn));
        }
        let res = slot.res.as_ref().expect("READY connection without QP");
        let remote = slot.remote.expect("READY connection without remote");
        Ok((res.clone(), remote))
    }

    /// Mark a connection failed after a completion error, releasing its
    /// resources.
    fn fail_connection(&self, conn: ConnId) {
        let mut conns = self.conns.write().unwrap();
        if let Some(slot) = conns.get_mut(conn) {
            log::error!("connection {} failed, tearing down its QP", conn);
            if let Some(res) = slot.res.take() {
                self.qpn_to_conn.write().unwrap().remove(&res.qp.qp_num());
            }
            slot.state = ConnState::Disconnected;
        }
    }

    /// Reap exactly one completion from the connection's send CQ, spinning
    /// until it arrives.
    fn drain_one_send(&self, conn: ConnId, res: &ConnRes) -> Result<()> {
        let mut wc = Wc::zeroed();
        loop {
            let n = res.send_cq.poll_one_into(&mut wc)?;
            if n == 0 {
                std::hint::spin_loop();
                continue;
            }
            if !wc.is_success() {
                let status = wc.status();
                self.fail_connection(conn);
                return Err(Error::CompletionError(status));
            }
            return Ok(());
        }
    }

    fn post_one_sided(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        size: usize,
        imm: Option<ImmData>,
        signaled: bool,
        is_write: bool,
    ) -> Result<()> {
        let (res, remote) = self.conn_res(conn)?;
        let local = self.local_buf(local_offset, size)?;
        let target = RemoteBuf {
            addr: remote.buffer + remote_offset as u64,
            rkey: remote.rkey,
        };

        let signaled = res.budget.apply(signaled);
        let posted = if is_write {
            res.qp.post_write(local, target, imm, signaled)
        } else {
            res.qp.post_read(local, target, signaled)
        };
        posted.map_err(Error::PostFailed)?;

        if signaled {
            self.drain_one_send(conn, &res)?;
        }
        Ok(())
    }

    /// RDMA-write `size` bytes from the local region at `local_offset` into
    /// the peer's region at `remote_offset`.
    ///
    /// With `signaled`, the call blocks until the write's completion is
    /// reaped. Unsignaled writes may still be forced to signal every
    /// `max_wr`-th post to keep the send queue from overrunning.
    pub fn write(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        self.post_one_sided(conn, remote_offset, local_offset, size, None, signaled, true)
    }

    /// RDMA-write with immediate data. The peer must have posted a receive
    /// ([`Self::receive_write_imm`]) to consume the notification.
    pub fn write_imm(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        size: usize,
        imm: ImmData,
        signaled: bool,
    ) -> Result<()> {
        self.post_one_sided(
            conn,
            remote_offset,
            local_offset,
            size,
            Some(imm),
            signaled,
            true,
        )
    }

    /// RDMA-read `size` bytes from the peer's region at `remote_offset`
    /// into the local region at `local_offset`.
    pub fn read(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        self.post_one_sided(conn, remote_offset, local_offset, size, None, signaled, false)
    }

    fn send_impl(
        &self,
        conn: ConnId,
        local_offset: usize,
        size: usize,
        imm: Option<ImmData>,
        signaled: bool,
    ) -> Result<()> {
        let (res, _) = self.conn_res(conn)?;
        let local = self.local_buf(local_offset, size)?;

        let signaled = res.budget.apply(signaled);
        res.qp
            .post_send(local, None, imm, signaled, false)
            .map_err(Error::PostFailed)?;

        if signaled {
            self.drain_one_send(conn, &res)?;
        }
        Ok(())
    }

    /// Two-sided send. The peer must post a matching receive first.
    pub fn send(
        &self,
        conn: ConnId,
        local_offset: usize,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        self.send_impl(conn, local_offset, size, None, signaled)
    }

    /// Two-sided send with immediate data.
    pub fn send_imm(
        &self,
        conn: ConnId,
        local_offset: usize,
        size: usize,
        imm: ImmData,
        signaled: bool,
    ) -> Result<()> {
        self.send_impl(conn, local_offset, size, Some(imm), signaled)
    }

    /// Post a receive of up to `size` bytes into the local region. Call
    /// before the peer sends; complete with [`Self::poll_receive`].
    pub fn receive(&self, conn: ConnId, local_offset: usize, size: usize) -> Result<()> {
        let (res, _) = self.conn_res(conn)?;
        let local = self.local_buf(local_offset, size)?;
        res.qp.post_recv(local, 0).map_err(Error::PostFailed)
    }

    /// Post a zero-length receive that consumes one incoming
    /// WRITE_WITH_IMM notification.
    pub fn receive_write_imm(&self, conn: ConnId) -> Result<()> {
        self.receive(conn, 0, 0)
    }

    /// Atomic fetch-and-add on an 8-byte operand in the peer's region. The
    /// fetched pre-add value lands at `local_offset`.
    ///
    /// Operands travel in the byte order the HCA produces; interpreting
    /// them as host integers is only portable between same-endian hosts.
    pub fn fetch_and_add(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        add: u64,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        if size != config::ATOMICS_SIZE {
            return Err(Error::InvalidArg(format!(
                "atomic operands are {} bytes, got {}",
                config::ATOMICS_SIZE,
                size
            )));
        }
        let (res, remote) = self.conn_res(conn)?;
        let local = self.local_buf(local_offset, size)?;
        let target = RemoteBuf {
            addr: remote.buffer + remote_offset as u64,
            rkey: remote.rkey,
        };

        let signaled = res.budget.apply(signaled);
        res.qp
            .post_fetch_add(local, target, add, signaled)
            .map_err(Error::PostFailed)?;

        if signaled {
            self.drain_one_send(conn, &res)?;
        }
        Ok(())
    }

    /// Atomic compare-and-swap on an 8-byte operand in the peer's region.
    /// The pre-swap value lands at `local_offset`; the swap took effect iff
    /// that value equals `compare`.
    pub fn compare_and_swap(
        &self,
        conn: ConnId,
        remote_offset: usize,
        local_offset: usize,
        compare: u64,
        swap: u64,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        if size != config::ATOMICS_SIZE {
            return Err(Error::InvalidArg(format!(
                "atomic operands are {} bytes, got {}",
                config::ATOMICS_SIZE,
                size
            )));
        }
        let (res, remote) = self.conn_res(conn)?;
        let local = self.local_buf(local_offset, size)?;
        let target = RemoteBuf {
            addr: remote.buffer + remote_offset as u64,
            rkey: remote.rkey,
        };

        let signaled = res.budget.apply(signaled);
        res.qp
            .post_compare_swap(local, target, compare, swap, signaled)
            .map_err(Error::PostFailed)?;

        if signaled {
            self.drain_one_send(conn, &res)?;
        }
        Ok(())
    }

    /// Poll the connection's send CQ. With `block`, spin until one
    /// completion arrives; otherwise return how many (0 or 1) were present.
    pub fn poll_send(&self, conn: ConnId, block: bool) -> Result<u32> {
        let (res, _) = self.conn_res(conn)?;
        let mut wc = Wc::zeroed();
        loop {
            let n = res.send_cq.poll_one_into(&mut wc)?;
            if n > 0 {
                if !wc.is_success() {
                    let status = wc.status();
                    self.fail_connection(conn);
                    return Err(Error::CompletionError(status));
                }
                return Ok(n);
            }
            if !block {
                return Ok(0);
            }
            std::hint::spin_loop();
        }
    }

    /// Poll the connection's receive CQ. Returns the number of completions
    /// reaped (0 or 1) and the immediate data if the sender attached any.
    pub fn poll_receive(&self, conn: ConnId, block: bool) -> Result<(u32, Option<ImmData>)> {
        let (res, _) = self.conn_res(conn)?;
        let mut wc = Wc::zeroed();
        loop {
            let n = res.recv_cq.poll_one_into(&mut wc)?;
            if n > 0 {
                if !wc.is_success() {
                    let status = wc.status();
                    self.fail_connection(conn);
                    return Err(Error::CompletionError(status));
                }
                return Ok((n, wc.imm()));
            }
            if !block {
                return Ok((0, None));
            }
            std::hint::spin_loop();
        }
    }

    // ---- shared receive queues ----

    /// Create a shared receive queue with its shared recv CQ.
    pub fn create_srq(&self) -> Result<SrqId> {
        let pd = self.memory.pd()?;
        let srq = Srq::new(pd, self.params.max_wr, config::MAX_SGE).map_err(Error::DeviceUnavailable)?;
        let recv_cq = Cq::new(self.memory.context()?, self.params.max_wr + 1)
            .map_err(Error::DeviceUnavailable)?;

        let mut srqs = self.srqs.write().unwrap();
        srqs.push(SrqEntry { srq, recv_cq });
        log::debug!("created shared receive queue {}", srqs.len() - 1);
        Ok(srqs.len() - 1)
    }

    /// Designate `srq` as the active SRQ: endpoints created from now on are
    /// attached to it and poll receives from its shared CQ.
    pub fn activate_srq(&self, srq: SrqId) -> Result<()> {
        if srq >= self.srqs.read().unwrap().len() {
            return Err(Error::InvalidArg(format!("unknown SRQ id {}", srq)));
        }
        *self.active_srq.lock().unwrap() = Some(srq);
        Ok(())
    }

    /// Detach endpoint creation from any SRQ.
    pub fn deactivate_srq(&self) {
        *self.active_srq.lock().unwrap() = None;
    }

    /// The currently active SRQ, if any.
    pub fn active_srq(&self) -> Option<SrqId> {
        *self.active_srq.lock().unwrap()
    }

    /// Post a receive to the SRQ. Whichever attached QP a message arrives
    /// on will consume it.
    pub fn receive_srq(&self, srq: SrqId, local_offset: usize, size: usize) -> Result<()> {
        let local = self.local_buf(local_offset, size)?;
        let srqs = self.srqs.read().unwrap();
        let entry = srqs
            .get(srq)
            .ok_or_else(|| Error::InvalidArg(format!("unknown SRQ id {}", srq)))?;
        entry.srq.post_recv(local, 0).map_err(Error::PostFailed)
    }

    /// Poll the SRQ's shared recv CQ and map the completion back to the
    /// originating connection id. Returns `None` if nonblocking and empty.
    pub fn poll_receive_srq(
        &self,
        srq: SrqId,
        block: bool,
    ) -> Result<Option<(ConnId, Option<ImmData>)>> {
        let recv_cq = {
            let srqs = self.srqs.read().unwrap();
            srqs.get(srq)
                .ok_or_else(|| Error::InvalidArg(format!("unknown SRQ id {}", srq)))?
                .recv_cq
                .clone()
        };

        let mut wc = Wc::zeroed();
        loop {
            let n = recv_cq.poll_one_into(&mut wc)?;
            if n > 0 {
                if !wc.is_success() {
                    return Err(Error::CompletionError(wc.status()));
                }
                let conn = self
                    .qpn_to_conn
                    .read()
                    .unwrap()
                    .get(&wc.qp_num())
                    .copied()
                    .ok_or_else(|| {
                        Error::InvalidArg(format!("no connection for QP number {}", wc.qp_num()))
                    })?;
                return Ok(Some((conn, wc.imm())));
            }
            if !block {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    /// Reap up to a batch of completions from the SRQ's shared recv CQ.
    /// Returns how many were reaped.
    pub fn poll_receive_batch_srq(&self, srq: SrqId, block: bool) -> Result<usize> {
        let recv_cq = {
            let srqs = self.srqs.read().unwrap();
            srqs.get(srq)
                .ok_or_else(|| Error::InvalidArg(format!("unknown SRQ id {}", srq)))?
                .recv_cq
                .clone()
        };

        let mut wcs = [Wc::zeroed(); SRQ_POLL_BATCH];
        loop {
            let n = recv_cq.poll_into(&mut wcs)? as usize;
            if n > 0 {
                for wc in &wcs[..n] {
                    if !wc.is_success() {
                        return Err(Error::CompletionError(wc.status()));
                    }
                }
                return Ok(n);
            }
            if !block {
                return Ok(0);
            }
            std::hint::spin_loop();
        }
    }

    /// Engine parameters (shared with the barrier helpers).
    pub(crate) fn max_wr(&self) -> u32 {
        self.params.max_wr
    }
}

impl Transport for ReliableEngine {
    fn memory(&self) -> &Arc<MemoryRegion> {
        &self.memory
    }

    fn create_endpoint(&self, conn: ConnId) -> Result<QpAddress> {
        let mut conns = self.conns.write().unwrap();
        if conns.len() <= conn {
            conns.resize_with(conn + 1, ConnSlot::default);
        }
        let slot = &mut conns[conn];
        if slot.state == ConnState::Init || slot.state == ConnState::Ready {
            return Err(Error::InvalidArg(format!(
                "connection id {} already has a QP",
                conn
            )));
        }

        let context = self.memory.context()?;
        let pd = self.memory.pd()?;
        let send_cq =
            Cq::new(context, self.params.max_wr + 1).map_err(Error::DeviceUnavailable)?;

        // New QPs land on the active SRQ, if one is designated.
        let active = *self.active_srq.lock().unwrap();
        let srqs = self.srqs.read().unwrap();
        let (recv_cq, attached) = match active {
            Some(id) => {
                let entry = srqs
                    .get(id)
                    .ok_or_else(|| Error::InvalidArg(format!("unknown SRQ id {}", id)))?;
                (entry.recv_cq.clone(), Some(&entry.srq))
            }
            None => (
                Cq::new(context, self.params.max_wr + 1).map_err(Error::DeviceUnavailable)?,
                None,
            ),
        };

        let qp = Qp::create(
            pd,
            QpInitOptions {
                qp_type: QpType::Rc,
                send_cq: &send_cq,
                recv_cq: &recv_cq,
                srq: attached,
                max_wr: self.params.max_wr,
                max_sge: config::MAX_SGE,
                max_inline_data: config::MAX_RC_INLINE_SEND,
            },
        )
        .map_err(Error::DeviceUnavailable)?;
        qp.modify_to_init(self.params.port_num, 0)
            .map_err(Error::DeviceUnavailable)?;

        let local = QpAddress {
            buffer: self.memory.addr(),
            rkey: self.memory.rkey()?,
            qp_num: qp.qp_num(),
            lid: self.memory.lid()?,
            gid: self.memory.gid()?,
            psn: 0,
        };

        self.qpn_to_conn.write().unwrap().insert(qp.qp_num(), conn);
        slot.state = ConnState::Init;
        slot.local = local;
        slot.remote = None;
        slot.res = Some(Arc::new(ConnRes {
            qp,
            send_cq,
            recv_cq,
            on_srq: attached.is_some(),
            budget: SignalBudget::new(self.params.max_wr),
        }));

        log::debug!("created RC queue pair for connection {}", conn);
        Ok(local)
    }

    fn discard_endpoint(&self, conn: ConnId) -> Result<()> {
        let mut conns = self.conns.write().unwrap();
        let slot = conns
            .get_mut(conn)
            .ok_or(Error::NotConnected(conn))?;
        if let Some(res) = slot.res.take() {
            self.qpn_to_conn.write().unwrap().remove(&res.qp.qp_num());
        }
        *slot = ConnSlot::default();
        Ok(())
    }

    fn install_remote(&self, conn: ConnId, remote: QpAddress) -> Result<()> {
        let mut conns = self.conns.write().unwrap();
        let slot = conns.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state != ConnState::Init {
            return Err(Error::InvalidArg(format!(
                "connection {} is not awaiting a remote address",
                conn
            )));
        }
        slot.remote = Some(remote);
        Ok(())
    }

    fn establish(&self, conn: ConnId) -> Result<()> {
        let mut conns = self.conns.write().unwrap();
        let slot = conns.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state == ConnState::Ready {
            return Ok(());
        }
        if slot.state != ConnState::Init {
            return Err(Error::NotConnected(conn));
        }
        let remote = slot.remote.ok_or_else(|| {
            Error::InvalidArg(format!("connection {} has no remote address", conn))
        })?;
        let res = slot.res.as_ref().expect("INIT connection without QP");

        res.qp
            .modify_rc_to_rtr(
                self.params.port_num,
                remote.qp_num,
                remote.lid,
                remote.gid,
                self.params.gid_index,
                remote.psn,
            )
            .map_err(Error::DeviceUnavailable)?;
        res.qp
            .modify_rc_to_rts(slot.local.psn)
            .map_err(Error::DeviceUnavailable)?;

        slot.state = ConnState::Ready;
        log::debug!("connection {} is ready", conn);
        Ok(())
    }

    fn shutdown(&self, conn: ConnId) -> Result<()> {
        let mut conns = self.conns.write().unwrap();
        let slot = conns.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state == ConnState::Disconnected {
            return Ok(());
        }

        if let Some(res) = slot.res.take() {
            // Drain stale completions before the CQs go away. The shared
            // SRQ CQ stays alive for its other consumers.
            let mut wcs = [Wc::zeroed(); SRQ_POLL_BATCH];
            while res.send_cq.poll_into(&mut wcs)? > 0 {}
            if !res.on_srq {
                while res.recv_cq.poll_into(&mut wcs)? > 0 {}
            }
            self.qpn_to_conn.write().unwrap().remove(&res.qp.qp_num());
        }
        slot.state = ConnState::Disconnected;
        log::debug!("connection {} disconnected", conn);
        Ok(())
    }

    fn local_address(&self, conn: ConnId) -> Result<QpAddress> {
        let conns = self.conns.read().unwrap();
        let slot = conns.get(conn).ok_or(Error::NotConnected(conn))?;
        if slot.res.is_none() {
            return Err(Error::NotConnected(conn));
        }
        Ok(slot.local)
    }

    fn state(&self, conn: ConnId) -> ConnState {
        self.conns
            .read()
            .unwrap()
            .get(conn)
            .map_or(ConnState::Fresh, |slot| slot.state)
    }

    fn ready_ids(&self) -> Vec<ConnId> {
        self.conns
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == ConnState::Ready)
            .map(|(id, _)| id)
            .collect()
    }
}
