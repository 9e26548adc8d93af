//! Unreliable datagram (UD) engine.
//!
//! One UD queue pair serves every datagram peer of this endpoint; peers only
//! differ in the address handle sends are steered by. Multicast groups are
//! joined through the connection manager and carry their own CM-owned QP.

use std::ffi::CString;
use std::mem;
use std::ptr;
use std::sync::{Arc, Mutex, RwLock};

use super::{ConnState, EngineParams, SignalBudget, Transport};
use crate::bindings::*;
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::mem::MemoryRegion;
use crate::proto::QpAddress;
use crate::types::{ConnId, ImmData};
use crate::verbs::{AddressHandle, Cq, LocalBuf, Qp, QpInitOptions, QpType, Wc};

/// Identifier of a joined multicast group inside one engine.
pub type McastId = usize;

/// The queue key every UD endpoint of this system uses.
pub const UD_QKEY: u32 = 0x1111_1111;

/// The engine's single UD queue pair.
struct UdEndpoint {
    qp: Qp,
    send_cq: Cq,
    recv_cq: Cq,
    local: QpAddress,
    budget: SignalBudget,
}

/// Per-peer state: the exchanged remote address and the address handle
/// built from it.
struct PeerSlot {
    state: ConnState,
    remote: Option<QpAddress>,
    ah: Option<Arc<AddressHandle>>,
}

impl Default for PeerSlot {
    fn default() -> Self {
        Self {
            state: ConnState::Fresh,
            remote: None,
            ah: None,
        }
    }
}

/// The UD engine.
///
/// Receive buffers are prefixed by the 40-byte GRH; [`Self::ud_alloc`]
/// reserves that headroom so callers keep working with payload offsets.
pub struct UnreliableEngine {
    memory: Arc<MemoryRegion>,
    params: EngineParams,
    ud: UdEndpoint,
    peers: RwLock<Vec<PeerSlot>>,
    mcast: Mutex<Vec<Option<McastGroup>>>,
}

impl UnreliableEngine {
    /// Create a UD engine over a registered memory region. The single UD QP
    /// is created eagerly and brought to RTS; no remote address is needed.
    pub fn new(memory: Arc<MemoryRegion>, config: &Config) -> Result<Self> {
        let params = EngineParams::from_config(config);
        let context = memory.context()?;
        let pd = memory.pd()?;

        let send_cq = Cq::new(context, params.max_wr + 1).map_err(Error::DeviceUnavailable)?;
        let recv_cq = Cq::new(context, params.max_wr + 1).map_err(Error::DeviceUnavailable)?;
        let qp = Qp::create(
            pd,
            QpInitOptions {
                qp_type: QpType::Ud,
                send_cq: &send_cq,
                recv_cq: &recv_cq,
                srq: None,
                max_wr: params.max_wr,
                max_sge: config::MAX_SGE,
                max_inline_data: config::MAX_UD_INLINE_SEND,
            },
        )
        .map_err(Error::DeviceUnavailable)?;

        // SAFETY: FFI; lrand48 has no preconditions.
        let psn = (unsafe { libc::lrand48() } as u32) & 0xFF_FFFF;
        qp.modify_to_init(params.port_num, UD_QKEY)
            .map_err(Error::DeviceUnavailable)?;
        qp.modify_ud_to_rtr().map_err(Error::DeviceUnavailable)?;
        qp.modify_ud_to_rts(psn).map_err(Error::DeviceUnavailable)?;

        let local = QpAddress {
            buffer: memory.addr(),
            rkey: memory.rkey()?,
            qp_num: qp.qp_num(),
            lid: memory.lid()?,
            gid: memory.gid()?,
            psn,
        };
        log::debug!("created UD queue pair {}", local.qp_num);

        Ok(Self {
            ud: UdEndpoint {
                qp,
                send_cq,
                recv_cq,
                local,
                budget: SignalBudget::new(params.max_wr),
            },
            memory,
            params,
            peers: RwLock::new(Vec::new()),
            mcast: Mutex::new(Vec::new()),
        })
    }

    /// Allocate a datagram buffer of `size` payload bytes, reserving the
    /// 40-byte GRH headroom in front of the returned offset.
    pub fn ud_alloc(&self, size: usize) -> Result<usize> {
        Ok(self.memory.alloc(size + config::UD_GRH_SIZE)? + config::UD_GRH_SIZE)
    }

    /// Free a buffer obtained from [`Self::ud_alloc`].
    pub fn ud_free(&self, offset: usize) -> Result<()> {
        if offset < config::UD_GRH_SIZE {
            return Err(Error::InvalidArg(format!(
                "offset {} has no GRH headroom",
                offset
            )));
        }
        self.memory.free(offset - config::UD_GRH_SIZE)
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

    fn peer_ah(&self, conn: ConnId) -> Result<Arc<AddressHandle>> {
        let peers = self.peers.read().unwrap();
        let slot = peers.get(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state != ConnState::Ready {
            return Err(Error::NotConnected(conn));
        }
        Ok(slot.ah.as_ref().expect("READY peer without AH").clone())
    }

    fn drain_one_send(&self) -> Result<()> {
        let mut wc = Wc::zeroed();
        loop {
            let n = self.ud.send_cq.poll_one_into(&mut wc)?;
            if n == 0 {
                std::hint::spin_loop();
                continue;
            }
            if !wc.is_success() {
                return Err(Error::CompletionError(wc.status()));
            }
            return Ok(());
        }
    }

    /// Send a datagram of `size` bytes to the peer. `size` is bounded by
    /// the UD MTU.
    pub fn send(
        &self,
        conn: ConnId,
        local_offset: usize,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        if size > self.params.ud_mtu as usize {
            return Err(Error::InvalidArg(format!(
                "datagram of {} bytes exceeds the UD MTU of {}",
                size, self.params.ud_mtu
            )));
        }
        let ah = self.peer_ah(conn)?;
        let local = self.local_buf(local_offset, size)?;

        let signaled = self.ud.budget.apply(signaled);
        self.ud
            .qp
            .post_send(local, Some(&*ah), None, signaled, false)
            .map_err(Error::PostFailed)?;

        if signaled {
            self.drain_one_send()?;
        }
        Ok(())
    }

    /// Post a receive for a datagram of up to `size` payload bytes at
    /// `local_offset`. The offset must come from [`Self::ud_alloc`] (or
    /// otherwise leave 40 bytes of headroom for the GRH).
    pub fn receive(&self, _conn: ConnId, local_offset: usize, size: usize) -> Result<()> {
        if local_offset < config::UD_GRH_SIZE {
            return Err(Error::InvalidArg(format!(
                "receive offset {} has no GRH headroom",
                local_offset
            )));
        }
        let local = self.local_buf(
            local_offset - config::UD_GRH_SIZE,
            size + config::UD_GRH_SIZE,
        )?;
        self.ud.qp.post_recv(local, 0).map_err(Error::PostFailed)
    }

    /// Poll the send CQ of the shared UD QP.
    pub fn poll_send(&self, _conn: ConnId, block: bool) -> Result<u32> {
        let mut wc = Wc::zeroed();
        loop {
            let n = self.ud.send_cq.poll_one_into(&mut wc)?;
            if n > 0 {
                if !wc.is_success() {
                    return Err(Error::CompletionError(wc.status()));
                }
                return Ok(n);
            }
            if !block {
                return Ok(0);
            }
            std::hint::spin_loop();
        }
    }

    /// Poll the receive CQ of the shared UD QP. Returns the completion
    /// count (0 or 1) and any immediate data.
    pub fn poll_receive(&self, _conn: ConnId, block: bool) -> Result<(u32, Option<ImmData>)> {
        let mut wc = Wc::zeroed();
        loop {
            let n = self.ud.recv_cq.poll_one_into(&mut wc)?;
            if n > 0 {
                if !wc.is_success() {
                    return Err(Error::CompletionError(wc.status()));
                }
                return Ok((n, wc.imm()));
            }
            if !block {
                return Ok((0, None));
            }
            std::hint::spin_loop();
        }
    }

    // ---- multicast ----

    /// Join an IP multicast group and return its id.
    pub fn join_multicast(&self, mcast_addr: &str) -> Result<McastId> {
        let group = McastGroup::join(
            mcast_addr,
            &self.memory,
            self.params.max_wr,
        )?;
        let mut groups = self.mcast.lock().unwrap();
        let id = groups
            .iter()
            .position(|g| g.is_none())
            .unwrap_or(groups.len());
        if id == groups.len() {
            groups.push(Some(group));
        } else {
            groups[id] = Some(group);
        }
        log::debug!("joined multicast group {} as id {}", mcast_addr, id);
        Ok(id)
    }

    fn mcast_refs(&self, id: McastId) -> Result<McastRefs> {
        let groups = self.mcast.lock().unwrap();
        groups
            .get(id)
            .and_then(|g| g.as_ref())
            .map(|g| g.refs())
            .ok_or_else(|| Error::InvalidArg(format!("unknown multicast id {}", id)))
    }

    /// Send a datagram to the multicast group. The immediate data carries
    /// the sender's QP number (network byte order) so receivers can filter
    /// their own traffic.
    pub fn send_multicast(
        &self,
        id: McastId,
        local_offset: usize,
        size: usize,
        signaled: bool,
    ) -> Result<()> {
        let (refs, signaled) = {
            let groups = self.mcast.lock().unwrap();
            let group = groups
                .get(id)
                .and_then(|g| g.as_ref())
                .ok_or_else(|| Error::InvalidArg(format!("unknown multicast id {}", id)))?;
            (group.refs(), group.budget.apply(signaled))
        };

        let mut sge = ibv_sge {
            addr: self.memory.addr() + local_offset as u64,
            length: size as u32,
            lkey: refs.lkey,
        };
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
        wr.send_flags = {
            let mut flags = 0;
            if signaled {
                flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
            if size < config::MAX_UD_INLINE_SEND as usize {
                flags |= ibv_send_flags::IBV_SEND_INLINE.0;
            }
            flags
        };
        wr.set_imm(refs.local_qpn.to_be());
        wr.wr.ud = ud_t {
            ah: refs.ah,
            remote_qpn: refs.remote_qpn,
            remote_qkey: refs.remote_qkey,
        };

        // SAFETY: FFI; every pointer in the WR is valid for this call.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(refs.qp, &mut wr, &mut bad_wr)
        };
        if ret != 0 {
            return Err(Error::PostFailed(std::io::Error::from_raw_os_error(ret)));
        }

        if signaled {
            let mut wc = Wc::zeroed();
            loop {
                // SAFETY: FFI; `Wc` is transparent over `ibv_wc`.
                let n = unsafe { ibv_poll_cq(refs.send_cq, 1, (&mut wc as *mut Wc).cast()) };
                if n < 0 {
                    return Err(Error::Io(std::io::Error::from_raw_os_error(-n)));
                }
                if n > 0 {
                    if !wc.is_success() {
                        return Err(Error::CompletionError(wc.status()));
                    }
                    break;
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Post a multicast receive at `local_offset` (GRH headroom applies as
    /// for unicast receives).
    pub fn receive_multicast(&self, id: McastId, local_offset: usize, size: usize) -> Result<()> {
        if local_offset < config::UD_GRH_SIZE {
            return Err(Error::InvalidArg(format!(
                "receive offset {} has no GRH headroom",
                local_offset
            )));
        }
        let refs = self.mcast_refs(id)?;

        let mut sge = ibv_sge {
            addr: self.memory.addr() + (local_offset - config::UD_GRH_SIZE) as u64,
            length: (size + config::UD_GRH_SIZE) as u32,
            lkey: refs.lkey,
        };
        let mut wr = ibv_recv_wr {
            wr_id: 0,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_recv(refs.qp, &mut wr, &mut bad_wr)
        };
        if ret != 0 {
            return Err(Error::PostFailed(std::io::Error::from_raw_os_error(ret)));
        }
        Ok(())
    }

    /// Poll the multicast receive CQ. Returns the completion count and the
    /// sender's QP number from the immediate data, if present.
    pub fn poll_receive_multicast(
        &self,
        id: McastId,
        block: bool,
    ) -> Result<(u32, Option<ImmData>)> {
        let refs = self.mcast_refs(id)?;
        let mut wc = Wc::zeroed();
        loop {
            // SAFETY: FFI; `Wc` is transparent over `ibv_wc`.
            let n = unsafe { ibv_poll_cq(refs.recv_cq, 1, (&mut wc as *mut Wc).cast()) };
            if n < 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(-n)));
            }
            if n > 0 {
                if !wc.is_success() {
                    return Err(Error::CompletionError(wc.status()));
                }
                return Ok((n as u32, wc.imm()));
            }
            if !block {
                return Ok((0, None));
            }
            std::hint::spin_loop();
        }
    }

    /// Leave a multicast group and release its resources.
    pub fn leave_multicast(&self, id: McastId) -> Result<()> {
        let mut groups = self.mcast.lock().unwrap();
        match groups.get_mut(id).and_then(|g| g.take()) {
            Some(group) => {
                group.leave()?;
                Ok(())
            }
            None => Err(Error::InvalidArg(format!("unknown multicast id {}", id))),
        }
    }
}

impl Drop for UnreliableEngine {
    fn drop(&mut self) {
        let mut groups = self.mcast.lock().unwrap();
        for group in groups.iter_mut() {
            if let Some(group) = group.take() {
                if let Err(e) = group.leave() {
                    log::warn!("leaving multicast group on drop failed: {}", e);
                }
            }
        }
    }
}

impl Transport for UnreliableEngine {
    fn memory(&self) -> &Arc<MemoryRegion> {
        &self.memory
    }

    fn create_endpoint(&self, conn: ConnId) -> Result<QpAddress> {
        let mut peers = self.peers.write().unwrap();
        if peers.len() <= conn {
            peers.resize_with(conn + 1, PeerSlot::default);
        }
        let slot = &mut peers[conn];
        if slot.state == ConnState::Init || slot.state == ConnState::Ready {
            return Err(Error::InvalidArg(format!(
                "connection id {} is already peered",
                conn
            )));
        }
        // All peers share the engine's single UD QP.
        slot.state = ConnState::Init;
        slot.remote = None;
        slot.ah = None;
        Ok(self.ud.local)
    }

    fn discard_endpoint(&self, conn: ConnId) -> Result<()> {
        let mut peers = self.peers.write().unwrap();
        let slot = peers.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        *slot = PeerSlot::default();
        Ok(())
    }

    fn install_remote(&self, conn: ConnId, remote: QpAddress) -> Result<()> {
        let mut peers = self.peers.write().unwrap();
        let slot = peers.get_mut(conn).ok_or(Error::NotConnected(conn))?;
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
        let mut peers = self.peers.write().unwrap();
        let slot = peers.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state == ConnState::Ready {
            return Ok(());
        }
        if slot.state != ConnState::Init {
            return Err(Error::NotConnected(conn));
        }
        let remote = slot.remote.ok_or_else(|| {
            Error::InvalidArg(format!("connection {} has no remote address", conn))
        })?;

        let ah = AddressHandle::new(
            self.memory.pd()?,
            self.params.port_num,
            remote.lid,
            remote.gid,
            self.params.gid_index,
            remote.qp_num,
            UD_QKEY,
        )
        .map_err(Error::DeviceUnavailable)?;
        slot.ah = Some(Arc::new(ah));
        slot.state = ConnState::Ready;
        log::debug!("UD peer {} is ready", conn);
        Ok(())
    }

    fn shutdown(&self, conn: ConnId) -> Result<()> {
        let mut peers = self.peers.write().unwrap();
        let slot = peers.get_mut(conn).ok_or(Error::NotConnected(conn))?;
        if slot.state == ConnState::Disconnected {
            return Ok(());
        }
        slot.ah = None;
        slot.state = ConnState::Disconnected;
        Ok(())
    }

    fn local_address(&self, conn: ConnId) -> Result<QpAddress> {
        let peers = self.peers.read().unwrap();
        peers
            .get(conn)
            .filter(|slot| slot.state != ConnState::Fresh)
            .map(|_| self.ud.local)
            .ok_or(Error::NotConnected(conn))
    }

    fn state(&self, conn: ConnId) -> ConnState {
        self.peers
            .read()
            .unwrap()
            .get(conn)
            .map_or(ConnState::Fresh, |slot| slot.state)
    }

    fn ready_ids(&self) -> Vec<ConnId> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == ConnState::Ready)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Raw pointers needed to post to a multicast group, copyable out of the
/// group lock.
#[derive(Clone, Copy)]
struct McastRefs {
    qp: *mut ibv_qp,
    ah: *mut ibv_ah,
    send_cq: *mut ibv_cq,
    recv_cq: *mut ibv_cq,
    lkey: u32,
    local_qpn: u32,
    remote_qpn: u32,
    remote_qkey: u32,
}

/// A joined multicast group: connection-manager id, its own protection
/// domain and MR, send/recv CQs, and the group address handle.
struct McastGroup {
    addr: String,
    channel: *mut rdma_event_channel,
    cm_id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    mr: *mut ibv_mr,
    send_cq: *mut ibv_cq,
    recv_cq: *mut ibv_cq,
    ah: *mut ibv_ah,
    remote_qpn: u32,
    remote_qkey: u32,
    sockaddr: libc::sockaddr_storage,
    budget: SignalBudget,
}

// The raw pointers are only dereferenced through FFI calls that verbs and
// the CM serialize internally.
unsafe impl Send for McastGroup {}

impl McastGroup {
    /// Resolve the group address, create the CM-owned QP, and join.
    fn join(mcast_addr: &str, memory: &MemoryRegion, max_wr: u32) -> Result<Self> {
        let addr_c = CString::new(mcast_addr)
            .map_err(|_| Error::InvalidArg(format!("bad multicast address '{}'", mcast_addr)))?;

        // SAFETY: FFI throughout; every resource created here is released
        // by `leave` (or immediately below on the error paths).
        unsafe {
            let channel = rdma_create_event_channel();
            if channel.is_null() {
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            let mut cm_id: *mut rdma_cm_id = ptr::null_mut();
            if rdma_create_id(
                channel,
                &mut cm_id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_UDP,
            ) != 0
            {
                rdma_destroy_event_channel(channel);
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            // Resolve the multicast address.
            let mut hints = mem::zeroed::<rdma_addrinfo>();
            hints.ai_port_space = rdma_port_space::RDMA_PS_UDP as i32;
            hints.ai_flags = 0;
            let mut rai: *mut rdma_addrinfo = ptr::null_mut();
            if rdma_getaddrinfo(addr_c.as_ptr(), ptr::null(), &hints, &mut rai) != 0 {
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::ctrl(format!(
                    "cannot resolve multicast address '{}'",
                    mcast_addr
                )));
            }
            if rdma_resolve_addr(cm_id, ptr::null_mut(), (*rai).ai_dst_addr, 2000) != 0 {
                rdma_freeaddrinfo(rai);
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::ctrl(format!(
                    "cannot resolve route to multicast address '{}'",
                    mcast_addr
                )));
            }
            expect_cm_event(
                channel,
                rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED,
                None,
            )?;

            let mut sockaddr = mem::zeroed::<libc::sockaddr_storage>();
            ptr::copy_nonoverlapping(
                (*rai).ai_dst_addr as *const u8,
                &mut sockaddr as *mut _ as *mut u8,
                ((*rai).ai_dst_len as usize).min(mem::size_of::<libc::sockaddr_storage>()),
            );
            rdma_freeaddrinfo(rai);

            // The group gets its own protection domain on the CM's device,
            // and the shared buffer is registered against it for local use.
            let pd = ibv_alloc_pd((*cm_id).verbs);
            if pd.is_null() {
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }
            let mr = ibv_reg_mr(
                pd,
                memory.ptr_at(0) as *mut libc::c_void,
                memory.size(),
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32,
            );
            if mr.is_null() {
                ibv_dealloc_pd(pd);
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            let send_cq = ibv_create_cq(
                (*cm_id).verbs,
                (max_wr + 1) as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            let recv_cq = ibv_create_cq(
                (*cm_id).verbs,
                (max_wr + 1) as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if send_cq.is_null() || recv_cq.is_null() {
                if !send_cq.is_null() {
                    ibv_destroy_cq(send_cq);
                }
                if !recv_cq.is_null() {
                    ibv_destroy_cq(recv_cq);
                }
                ibv_dereg_mr(mr);
                ibv_dealloc_pd(pd);
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            let mut attr = mem::zeroed::<ibv_qp_init_attr>();
            attr.qp_type = ibv_qp_type::IBV_QPT_UD;
            attr.send_cq = send_cq;
            attr.recv_cq = recv_cq;
            attr.cap.max_send_wr = max_wr;
            attr.cap.max_recv_wr = max_wr;
            attr.cap.max_send_sge = config::MAX_SGE;
            attr.cap.max_recv_sge = config::MAX_SGE;
            attr.cap.max_inline_data = config::MAX_UD_INLINE_SEND;
            if rdma_create_qp(cm_id, pd, &mut attr) != 0 {
                ibv_destroy_cq(send_cq);
                ibv_destroy_cq(recv_cq);
                ibv_dereg_mr(mr);
                ibv_dealloc_pd(pd);
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            if rdma_join_multicast(
                cm_id,
                &mut sockaddr as *mut _ as *mut libc::sockaddr,
                ptr::null_mut(),
            ) != 0
            {
                rdma_destroy_qp(cm_id);
                ibv_destroy_cq(send_cq);
                ibv_destroy_cq(recv_cq);
                ibv_dereg_mr(mr);
                ibv_dealloc_pd(pd);
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                return Err(Error::ctrl(format!(
                    "cannot join multicast group '{}'",
                    mcast_addr
                )));
            }

            // The join event carries the group's QP number, queue key, and
            // route.
            let mut event: *mut rdma_cm_event = ptr::null_mut();
            expect_cm_event(
                channel,
                rdma_cm_event_type::RDMA_CM_EVENT_MULTICAST_JOIN,
                Some(&mut event),
            )?;
            let remote_qpn = (*event).param.ud.qp_num;
            let remote_qkey = (*event).param.ud.qkey;
            let mut ah_attr = (*event).param.ud.ah_attr;
            let ah = ibv_create_ah(pd, &mut ah_attr);
            rdma_ack_cm_event(event);
            if ah.is_null() {
                let group = McastGroup {
                    addr: mcast_addr.to_owned(),
                    channel,
                    cm_id,
                    pd,
                    mr,
                    send_cq,
                    recv_cq,
                    ah: ptr::null_mut(),
                    remote_qpn,
                    remote_qkey,
                    sockaddr,
                    budget: SignalBudget::new(max_wr),
                };
                let _ = group.leave();
                return Err(Error::DeviceUnavailable(std::io::Error::last_os_error()));
            }

            Ok(McastGroup {
                addr: mcast_addr.to_owned(),
                channel,
                cm_id,
                pd,
                mr,
                send_cq,
                recv_cq,
                ah,
                remote_qpn,
                remote_qkey,
                sockaddr,
                budget: SignalBudget::new(max_wr),
            })
        }
    }

    fn refs(&self) -> McastRefs {
        // SAFETY: the CM id owns a QP once joined.
        let qp = unsafe { (*self.cm_id).qp };
        McastRefs {
            qp,
            ah: self.ah,
            send_cq: self.send_cq,
            recv_cq: self.recv_cq,
            // SAFETY: the MR is valid until `leave`.
            lkey: unsafe { (*self.mr).lkey },
            local_qpn: unsafe { (*qp).qp_num },
            remote_qpn: self.remote_qpn,
            remote_qkey: self.remote_qkey,
        }
    }

    /// Leave the group and tear down in reverse creation order.
    fn leave(mut self) -> Result<()> {
        // SAFETY: FFI; each resource is released exactly once.
        unsafe {
            let mut sockaddr = self.sockaddr;
            if rdma_leave_multicast(self.cm_id, &mut sockaddr as *mut _ as *mut libc::sockaddr)
                != 0
            {
                return Err(Error::ctrl(format!(
                    "cannot leave multicast group '{}'",
                    self.addr
                )));
            }
            if !self.ah.is_null() {
                ibv_destroy_ah(self.ah);
                self.ah = ptr::null_mut();
            }
            if !(*self.cm_id).qp.is_null() {
                rdma_destroy_qp(self.cm_id);
            }
            ibv_destroy_cq(self.send_cq);
            ibv_destroy_cq(self.recv_cq);
            ibv_dereg_mr(self.mr);
            ibv_dealloc_pd(self.pd);
            rdma_destroy_id(self.cm_id);
            rdma_destroy_event_channel(self.channel);
        }
        Ok(())
    }
}

/// Block for the next CM event and verify it is of the expected type.
/// Unless the caller takes the event, it is acknowledged here.
unsafe fn expect_cm_event(
    channel: *mut rdma_event_channel,
    expected: rdma_cm_event_type::Type,
    out: Option<&mut *mut rdma_cm_event>,
) -> Result<()> {
    let mut event: *mut rdma_cm_event = ptr::null_mut();
    if rdma_get_cm_event(channel, &mut event) != 0 {
        return Err(Error::ctrl("rdma_get_cm_event failed".to_owned()));
    }
    if (*event).event != expected {
        let got = (*event).event;
        rdma_ack_cm_event(event);
        return Err(Error::ctrl(format!(
            "unexpected CM event {} (expected {})",
            got, expected
        )));
    }
    match out {
        Some(slot) => *slot = event,
        None => {
            rdma_ack_cm_event(event);
        }
    }
    Ok(())
}
