//! Memory region registration.

use std::ffi::c_void;
use std::io::{self, Error as IoError};
use std::ptr::NonNull;

use super::pd::Pd;
use crate::bindings::*;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_mr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvMr(NonNull<ibv_mr>);

impl IbvMr {
    /// Get the local key of the memory region.
    pub fn lkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).lkey }
    }

    /// Get the remote key of the memory region.
    pub fn rkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).rkey }
    }

    /// Deregister the MR.
    ///
    /// # Safety
    ///
    /// - An MR must not be deregistered more than once.
    /// - Deregistered MRs must not be used anymore.
    pub unsafe fn dereg(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dereg_mr(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_mr, IbvMr);

/// A verbs registration of a byte range.
///
/// The registered memory itself is *not* owned by this type; it must stay
/// mapped and unmoved for the registration's entire lifetime. The lkey and
/// rkey are stable until the registration is dropped.
pub struct RegisteredMr {
    pd: Pd,
    mr: IbvMr,
}

impl RegisteredMr {
    /// Register `len` bytes starting at `addr` with the protection domain,
    /// with LOCAL_WRITE | REMOTE_READ | REMOTE_WRITE | REMOTE_ATOMIC access.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be a mapped, writable range that outlives
    /// the returned registration.
    pub unsafe fn register(pd: &Pd, addr: *mut u8, len: usize) -> io::Result<Self> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;

        // SAFETY: FFI.
        let mr = ibv_reg_mr(pd.as_raw(), addr as *mut c_void, len, access.0 as i32);
        let mr = NonNull::new(mr).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            pd: pd.clone(),
            mr: IbvMr(mr),
        })
    }

    /// Get the protection domain this registration belongs to.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.mr.rkey()
    }
}

impl Drop for RegisteredMr {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.mr.dereg() }.expect("cannot dereg MR on drop");
    }
}
