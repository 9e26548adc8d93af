//! Completion queue and work completion.

use std::io::{self, Error as IoError};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use thiserror::Error;

use super::context::Context;
use crate::bindings::*;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_cq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCq(NonNull<ibv_cq>);

impl IbvCq {
    /// Destroy the CQ.
    ///
    /// # Safety
    ///
    /// - A CQ must not be destroyed more than once.
    /// - Destroyed CQs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_cq(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_cq, IbvCq);

/// Ownership holder of completion queue.
struct CqInner {
    /// Keeps the device context alive for as long as the CQ exists.
    _ctx: Context,
    cq: IbvCq,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.cq.destroy() }.expect("cannot destroy CQ on drop");
    }
}

/// Completion queue.
#[derive(Clone)]
pub struct Cq {
    /// Cached CQ pointer.
    cq: IbvCq,

    /// CQ body.
    inner: Arc<CqInner>,
}

impl Cq {
    /// Create a new completion queue with the given capacity.
    pub fn new(ctx: &Context, capacity: u32) -> io::Result<Self> {
        let max_capacity = ctx.attr().max_cqe as u32;
        if capacity > max_capacity {
            return Err(IoError::new(
                io::ErrorKind::InvalidInput,
                format!("CQ capacity {} exceeds device maximum {}", capacity, max_capacity),
            ));
        }

        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                capacity as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(IoError::last_os_error)?;
        let cq = IbvCq(cq);

        Ok(Self {
            inner: Arc::new(CqInner {
                _ctx: ctx.clone(),
                cq,
            }),
            cq,
        })
    }

    /// Get the underlying `ibv_cq` pointer.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Non-blockingly poll at most one work completion into `wc`.
    /// Return the number of completions polled (0 or 1).
    ///
    /// It is the caller's responsibility to check the status code of the
    /// returned work completion entry.
    #[inline(always)]
    pub fn poll_one_into(&self, wc: &mut Wc) -> io::Result<u32> {
        // SAFETY: FFI, and `Wc` is transparent over `ibv_wc`.
        let num = unsafe { ibv_poll_cq(self.as_raw(), 1, (wc as *mut Wc).cast()) };
        if num >= 0 {
            Ok(num as u32)
        } else {
            Err(io::Error::from_raw_os_error(-num))
        }
    }

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled, which may be less than `wc.len()` or zero.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    #[inline]
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<u32> {
        if wc.is_empty() {
            return Ok(0);
        }
        // SAFETY: FFI, and `Wc` is transparent over `ibv_wc`.
        let num = unsafe { ibv_poll_cq(self.as_raw(), wc.len() as i32, wc.as_mut_ptr().cast()) };
        if num >= 0 {
            Ok(num as u32)
        } else {
            Err(io::Error::from_raw_os_error(-num))
        }
    }
}

/// Work completion.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Wc(ibv_wc);

impl Wc {
    /// A zeroed completion to poll into.
    pub fn zeroed() -> Self {
        // SAFETY: POD type.
        Wc(unsafe { std::mem::zeroed() })
    }

    /// The user-designated id of the completed work request.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    /// Completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from(self.0.status)
    }

    /// Whether the completion is successful.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Number of bytes transferred.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.0.byte_len as usize
    }

    /// Immediate data, if the sender attached any.
    #[inline]
    pub fn imm(&self) -> Option<u32> {
        ((self.0.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0) != 0).then(|| self.0.imm())
    }

    /// The local QP number this completion arrived on. Meaningful when
    /// polling a CQ shared by several QPs (SRQ setups).
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.0.qp_num
    }
}

impl Default for Wc {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Status of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// Operation completed successfully.
    #[error("success")]
    Success = ibv_wc_status::IBV_WC_SUCCESS as _,

    /// Message longer than the port or posted buffer allows.
    #[error("local length error")]
    LocLenErr = ibv_wc_status::IBV_WC_LOC_LEN_ERR as _,

    /// Internal QP consistency error.
    #[error("local QP operation error")]
    LocQpOpErr = ibv_wc_status::IBV_WC_LOC_QP_OP_ERR as _,

    /// Internal EE context error (unused on RC/UD).
    #[error("local EE context operation error")]
    LocEecOpErr = ibv_wc_status::IBV_WC_LOC_EEC_OP_ERR as _,

    /// A local scatter/gather entry referenced an invalid MR.
    #[error("local protection error")]
    LocProtErr = ibv_wc_status::IBV_WC_LOC_PROT_ERR as _,

    /// The WR was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr = ibv_wc_status::IBV_WC_WR_FLUSH_ERR as _,

    /// Memory window bind failure.
    #[error("memory window bind error")]
    MwBindErr = ibv_wc_status::IBV_WC_MW_BIND_ERR as _,

    /// Unexpected transport-layer opcode from the responder.
    #[error("bad response error")]
    BadRespErr = ibv_wc_status::IBV_WC_BAD_RESP_ERR as _,

    /// Local access error during incoming RDMA write processing.
    #[error("local access error")]
    LocAccessErr = ibv_wc_status::IBV_WC_LOC_ACCESS_ERR as _,

    /// The responder detected an invalid message on the channel.
    #[error("remote invalid request error")]
    RemInvReqErr = ibv_wc_status::IBV_WC_REM_INV_REQ_ERR as _,

    /// Remote side denied the access the operation required.
    #[error("remote access error")]
    RemAccessErr = ibv_wc_status::IBV_WC_REM_ACCESS_ERR as _,

    /// Remote side could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = ibv_wc_status::IBV_WC_REM_OP_ERR as _,

    /// Retry counter exhausted; the remote QP likely stopped responding.
    #[error("transport retry counter exceeded")]
    RetryExcErr = ibv_wc_status::IBV_WC_RETRY_EXC_ERR as _,

    /// RNR retry counter exhausted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR as _,

    /// Local RDD violation (RD only).
    #[error("local RDD violation error")]
    LocRddViolErr = ibv_wc_status::IBV_WC_LOC_RDD_VIOL_ERR as _,

    /// Invalid RD request from the remote side.
    #[error("remote invalid RD request")]
    RemInvRdReqErr = ibv_wc_status::IBV_WC_REM_INV_RD_REQ_ERR as _,

    /// The operation was aborted (RD only).
    #[error("remote aborted error")]
    RemAbortErr = ibv_wc_status::IBV_WC_REM_ABORT_ERR as _,

    /// Invalid EE context number.
    #[error("invalid EE context number")]
    InvEecnErr = ibv_wc_status::IBV_WC_INV_EECN_ERR as _,

    /// Invalid EE context state.
    #[error("invalid EE context state error")]
    InvEecStateErr = ibv_wc_status::IBV_WC_INV_EEC_STATE_ERR as _,

    /// A WR could not be completed in time.
    #[error("fatal error")]
    FatalErr = ibv_wc_status::IBV_WC_FATAL_ERR as _,

    /// The response timer expired before the response arrived.
    #[error("response timeout error")]
    RespTimeoutErr = ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR as _,

    /// General error not covered by the other statuses.
    #[error("general error")]
    GeneralErr = ibv_wc_status::IBV_WC_GENERAL_ERR as _,
}

impl From<u32> for WcStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => WcStatus::LocQpOpErr,
            ibv_wc_status::IBV_WC_LOC_EEC_OP_ERR => WcStatus::LocEecOpErr,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
            ibv_wc_status::IBV_WC_MW_BIND_ERR => WcStatus::MwBindErr,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => WcStatus::BadRespErr,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => WcStatus::LocAccessErr,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
            ibv_wc_status::IBV_WC_REM_OP_ERR => WcStatus::RemOpErr,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
            ibv_wc_status::IBV_WC_LOC_RDD_VIOL_ERR => WcStatus::LocRddViolErr,
            ibv_wc_status::IBV_WC_REM_INV_RD_REQ_ERR => WcStatus::RemInvRdReqErr,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => WcStatus::RemAbortErr,
            ibv_wc_status::IBV_WC_INV_EECN_ERR => WcStatus::InvEecnErr,
            ibv_wc_status::IBV_WC_INV_EEC_STATE_ERR => WcStatus::InvEecStateErr,
            ibv_wc_status::IBV_WC_FATAL_ERR => WcStatus::FatalErr,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => WcStatus::RespTimeoutErr,
            _ => WcStatus::GeneralErr,
        }
    }
}
