//! Queue pairs and address handles.

use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::ptr::NonNull;
use std::{mem, ptr};

use super::cq::Cq;
use super::gid::Gid;
use super::pd::Pd;
use super::srq::Srq;
use crate::bindings::*;
use crate::utils::interop::{from_c_ret, from_c_ret_explained};

/// Wrapper for `*mut ibv_qp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvQp(NonNull<ibv_qp>);

impl IbvQp {
    /// Get the QP number.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        // SAFETY: `self` points to a valid `ibv_qp` instance.
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// Destroy the QP.
    ///
    /// # Safety
    ///
    /// - A QP must not be destroyed more than once.
    /// - Destroyed QPs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_qp(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_qp, IbvQp);

/// Queue pair transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connection.
    Rc,
    /// Unreliable datagram.
    Ud,
}

impl From<QpType> for u32 {
    fn from(ty: QpType) -> u32 {
        match ty {
            QpType::Rc => ibv_qp_type::IBV_QPT_RC,
            QpType::Ud => ibv_qp_type::IBV_QPT_UD,
        }
    }
}

/// Creation-time attributes of a queue pair.
pub struct QpInitOptions<'a> {
    pub qp_type: QpType,
    pub send_cq: &'a Cq,
    pub recv_cq: &'a Cq,
    /// Attach the QP to this SRQ; its receive path then belongs to the SRQ.
    pub srq: Option<&'a Srq>,
    pub max_wr: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
}

/// A local scatter/gather buffer for one work request.
#[derive(Debug, Clone, Copy)]
pub struct LocalBuf {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

impl From<LocalBuf> for ibv_sge {
    fn from(buf: LocalBuf) -> Self {
        ibv_sge {
            addr: buf.addr,
            length: buf.len,
            lkey: buf.lkey,
        }
    }
}

/// A remote buffer addressed by one-sided work requests.
#[derive(Debug, Clone, Copy)]
pub struct RemoteBuf {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteBuf {
    #[inline]
    fn as_rdma_t(&self) -> rdma_t {
        rdma_t {
            remote_addr: self.addr,
            rkey: self.rkey,
        }
    }
}

/// Queue pair. Owns its verbs QP; the associated CQs are owned by the
/// engine's connection record.
pub struct Qp {
    qp: IbvQp,
    /// Keeps the device context alive for as long as the QP exists.
    _pd: Pd,
    qp_type: QpType,
}

impl Qp {
    /// Create a queue pair. Every work request decides for itself whether to
    /// generate a completion (`sq_sig_all` is off).
    pub fn create(pd: &Pd, options: QpInitOptions<'_>) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = options.send_cq.as_raw();
        init_attr.recv_cq = options.recv_cq.as_raw();
        init_attr.srq = options.srq.map_or(ptr::null_mut(), |srq| srq.as_raw());
        init_attr.qp_type = u32::from(options.qp_type);
        init_attr.sq_sig_all = 0;
        init_attr.cap.max_send_wr = options.max_wr;
        init_attr.cap.max_recv_wr = options.max_wr;
        init_attr.cap.max_send_sge = options.max_sge;
        init_attr.cap.max_recv_sge = options.max_sge;
        init_attr.cap.max_inline_data = options.max_inline_data;

        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(pd.as_raw(), &mut init_attr) };
        let qp = NonNull::new(qp).ok_or_else(IoError::last_os_error)?;

        Ok(Self {
            qp: IbvQp(qp),
            _pd: pd.clone(),
            qp_type: options.qp_type,
        })
    }

    /// Get the underlying `ibv_qp` pointer.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ibv_qp {
        self.qp.as_ptr()
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    /// Get the transport type of this QP.
    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    /// Modify the queue pair from RESET to INIT on the given port.
    ///
    /// RC QPs get full remote access; UD QPs get the queue key instead.
    pub fn modify_to_init(&self, port_num: u8, qkey: u32) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT;
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = port_num;

        match self.qp_type {
            QpType::Rc => {
                attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                    .0 as _;
                attr_mask |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
            QpType::Ud => {
                attr.qkey = qkey;
                attr_mask |= ibv_qp_attr_mask::IBV_QP_QKEY;
            }
        }

        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.as_raw(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret)
    }

    /// Modify an RC queue pair from INIT to RTR against the remote endpoint.
    ///
    /// When `gid_index` is set the address vector carries a GRH towards the
    /// remote GID; otherwise routing is by LID only.
    pub fn modify_rc_to_rtr(
        &self,
        port_num: u8,
        dest_qpn: u32,
        dlid: u16,
        dgid: Gid,
        gid_index: Option<u8>,
        rq_psn: u32,
    ) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_4096;
        attr.dest_qp_num = dest_qpn;
        attr.rq_psn = rq_psn;
        attr.max_dest_rd_atomic = 16;
        attr.min_rnr_timer = 0x12;
        attr.ah_attr.is_global = 0;
        attr.ah_attr.dlid = dlid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = port_num;
        if let Some(index) = gid_index {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid = dgid.into();
            attr.ah_attr.grh.flow_label = 0;
            attr.ah_attr.grh.hop_limit = 1;
            attr.ah_attr.grh.sgid_index = index;
            attr.ah_attr.grh.traffic_class = 0;
        }

        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.as_raw(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret)
    }

    /// Modify an RC queue pair from RTR to RTS.
    pub fn modify_rc_to_rts(&self, sq_psn: u32) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = 0x12;
        attr.retry_cnt = 6;
        attr.rnr_retry = 0;
        attr.sq_psn = sq_psn;
        attr.max_rd_atomic = 16;

        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.as_raw(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret)
    }

    /// Modify a UD queue pair from INIT to RTR. No remote address is needed.
    pub fn modify_ud_to_rtr(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;

        // SAFETY: FFI.
        let ret = unsafe {
            ibv_modify_qp(
                self.as_raw(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
            )
        };
        from_c_ret(ret)
    }

    /// Modify a UD queue pair from RTR to RTS with the given initial PSN.
    pub fn modify_ud_to_rts(&self, sq_psn: u32) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = sq_psn;

        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.as_raw(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret)
    }

    /// Post a receive work request.
    ///
    /// A zero-length buffer posts a receive that matches zero-length sends
    /// and WRITE_WITH_IMM notifications.
    pub fn post_recv(&self, local: LocalBuf, wr_id: u64) -> io::Result<()> {
        let mut sge = ibv_sge::from(local);
        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_recv(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, recv_err_explanation)
    }

    /// Post a send work request, optionally with immediate data.
    ///
    /// For UD QPs a `peer` address handle must be given; RC QPs send to the
    /// connected remote end.
    pub fn post_send(
        &self,
        local: LocalBuf,
        peer: Option<&AddressHandle>,
        imm: Option<u32>,
        signaled: bool,
        inline_data: bool,
    ) -> io::Result<()> {
        let mut sge = ibv_sge::from(local);
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.next = ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = match imm {
            None => ibv_wr_opcode::IBV_WR_SEND,
            Some(_) => ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
        };
        wr.send_flags = send_flags(signaled, inline_data);
        wr.set_imm(imm.unwrap_or(0));
        if let Some(peer) = peer {
            wr.wr.ud = peer.ud();
        }

        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, send_err_explanation)
    }

    /// Post an RDMA write, optionally with immediate data. RC only.
    pub fn post_write(
        &self,
        local: LocalBuf,
        remote: RemoteBuf,
        imm: Option<u32>,
        signaled: bool,
    ) -> io::Result<()> {
        let mut sge = ibv_sge::from(local);
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = match imm {
            None => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Some(_) => ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
        };
        wr.send_flags = send_flags(signaled, false);
        wr.set_imm(imm.unwrap_or(0));
        wr.wr.rdma = remote.as_rdma_t();

        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, send_err_explanation)
    }

    /// Post an RDMA read. RC only.
    pub fn post_read(&self, local: LocalBuf, remote: RemoteBuf, signaled: bool) -> io::Result<()> {
        let mut sge = ibv_sge::from(local);
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.send_flags = send_flags(signaled, false);
        wr.wr.rdma = remote.as_rdma_t();

        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, send_err_explanation)
    }

    /// Post an atomic fetch-and-add on an 8-byte remote operand. RC only.
    ///
    /// The fetched value lands in `local` in the byte order the HCA
    /// delivers; no byteswap is performed on either side.
    pub fn post_fetch_add(
        &self,
        local: LocalBuf,
        remote: RemoteBuf,
        add: u64,
        signaled: bool,
    ) -> io::Result<()> {
        check_atomic_operands(&local, &remote)?;

        let mut sge = ibv_sge::from(local);
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
        wr.send_flags = send_flags(signaled, false);
        wr.wr.atomic = atomic_t {
            remote_addr: remote.addr,
            compare_add: add,
            swap: 0,
            rkey: remote.rkey,
        };

        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, send_err_explanation)
    }

    /// Post an atomic compare-and-swap on an 8-byte remote operand. RC only.
    ///
    /// The pre-swap value lands in `local` in the byte order the HCA
    /// delivers; no byteswap is performed on either side.
    pub fn post_compare_swap(
        &self,
        local: LocalBuf,
        remote: RemoteBuf,
        compare: u64,
        swap: u64,
        signaled: bool,
    ) -> io::Result<()> {
        check_atomic_operands(&local, &remote)?;

        let mut sge = ibv_sge::from(local);
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
        wr.send_flags = send_flags(signaled, false);
        wr.wr.atomic = atomic_t {
            remote_addr: remote.addr,
            compare_add: compare,
            swap,
            rkey: remote.rkey,
        };

        // SAFETY: FFI.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, send_err_explanation)
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.qp.destroy() }.expect("cannot destroy QP on drop");
    }
}

// The PD clone keeps the device context alive for as long as the QP exists.
unsafe impl Send for Qp {}
unsafe impl Sync for Qp {}

#[inline]
fn send_flags(signaled: bool, inline_data: bool) -> u32 {
    let mut flags = 0;
    if signaled {
        flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
    }
    if inline_data {
        flags |= ibv_send_flags::IBV_SEND_INLINE.0;
    }
    flags
}

fn check_atomic_operands(local: &LocalBuf, remote: &RemoteBuf) -> io::Result<()> {
    let size = mem::size_of::<u64>();
    if local.len as usize != size {
        return Err(IoError::new(
            IoErrorKind::InvalidInput,
            format!("atomics require 8-byte operands, got {}", local.len),
        ));
    }
    if local.addr % size as u64 != 0 || remote.addr % size as u64 != 0 {
        return Err(IoError::new(
            IoErrorKind::InvalidInput,
            format!(
                "atomics require 8-byte-aligned operands, got ({:#x}, {:#x})",
                local.addr, remote.addr
            ),
        ));
    }
    Ok(())
}

/// Explain `ibv_post_recv` errors.
fn recv_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => {
            Some("recv queue is full, or not enough resources to complete this operation")
        }
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}

/// Explain `ibv_post_send` errors.
fn send_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => {
            Some("send queue is full, or not enough resources to complete this operation")
        }
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}

/// Wrapper of `*mut ibv_ah`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvAh(NonNull<ibv_ah>);

impl IbvAh {
    /// Destroy the address handle.
    ///
    /// # Safety
    ///
    /// - An AH must not be destroyed more than once.
    /// - Destroyed AHs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_ah(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_ah, IbvAh);

/// The route to a remote UD queue pair, paired with the remote QP number and
/// queue key that sends must carry.
pub struct AddressHandle {
    _pd: Pd,
    ah: IbvAh,
    remote_qpn: u32,
    qkey: u32,
}

impl AddressHandle {
    /// Build an address handle from an exchanged remote endpoint.
    pub fn new(
        pd: &Pd,
        port_num: u8,
        dlid: u16,
        dgid: Gid,
        gid_index: Option<u8>,
        remote_qpn: u32,
        qkey: u32,
    ) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut ah_attr = unsafe { mem::zeroed::<ibv_ah_attr>() };
        ah_attr.is_global = 0;
        ah_attr.dlid = dlid;
        ah_attr.sl = 0;
        ah_attr.src_path_bits = 0;
        ah_attr.port_num = port_num;
        if let Some(index) = gid_index {
            ah_attr.is_global = 1;
            ah_attr.grh.dgid = dgid.into();
            ah_attr.grh.sgid_index = index;
            ah_attr.grh.hop_limit = 1;
        }

        // SAFETY: FFI.
        let ah = unsafe { ibv_create_ah(pd.as_raw(), &mut ah_attr) };
        let ah = NonNull::new(ah).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            _pd: pd.clone(),
            ah: IbvAh(ah),
            remote_qpn,
            qkey,
        })
    }

    /// Generate the `ud` member for send work requests to this peer.
    #[inline]
    pub(crate) fn ud(&self) -> ud_t {
        ud_t {
            ah: self.ah.as_ptr(),
            remote_qpn: self.remote_qpn,
            remote_qkey: self.qkey,
        }
    }
}

impl Drop for AddressHandle {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.ah.destroy() }.expect("cannot destroy AH on drop");
    }
}
