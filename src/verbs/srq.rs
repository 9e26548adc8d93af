//! Shared receive queues.

use std::io::{self, Error as IoError};
use std::ptr::{self, NonNull};

use super::pd::Pd;
use super::qp::LocalBuf;
use crate::bindings::*;
use crate::utils::interop::{from_c_ret, from_c_ret_explained};

/// Wrapper for `*mut ibv_srq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvSrq(NonNull<ibv_srq>);

impl IbvSrq {
    /// Destroy the SRQ.
    ///
    /// # Safety
    ///
    /// - An SRQ must not be destroyed more than once.
    /// - Destroyed SRQs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_srq(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_srq, IbvSrq);

/// Shared receive queue.
///
/// QPs created against an SRQ consume receives from it rather than from
/// their own receive queues; their receive completions must be polled from
/// the shared recv CQ the engine pairs with this SRQ.
pub struct Srq {
    srq: IbvSrq,
    pd: Pd,
}

impl Srq {
    /// Create a shared receive queue on the given protection domain.
    pub fn new(pd: &Pd, max_wr: u32, max_sge: u32) -> io::Result<Self> {
        let mut init_attr = ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ibv_srq_attr {
                max_wr,
                max_sge,
                srq_limit: 0,
            },
        };

        // SAFETY: FFI.
        let srq = unsafe { ibv_create_srq(pd.as_raw(), &mut init_attr) };
        let srq = NonNull::new(srq).ok_or_else(IoError::last_os_error)?;

        Ok(Self {
            srq: IbvSrq(srq),
            pd: pd.clone(),
        })
    }

    /// Get the underlying `ibv_srq` pointer.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ibv_srq {
        self.srq.as_ptr()
    }

    /// Get the protection domain of the SRQ.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Post a receive work request to the SRQ.
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
            ibv_post_srq_recv(self.as_raw(), &mut wr, &mut bad_wr)
        };
        from_c_ret_explained(ret, srq_recv_err_explanation)
    }
}

fn srq_recv_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => Some("shared receive queue is full"),
        _ => None,
    }
}
