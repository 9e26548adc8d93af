//! Raw page-aligned buffer mappings.

use std::io::{self, Error as IoError};
use std::ptr::NonNull;

/// An anonymous, page-aligned, privately mapped byte buffer.
///
/// The mapping stays in place for the buffer's lifetime, which is what the
/// verbs registration pins against.
pub(crate) struct RawBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawBuffer {
    /// Map `len` bytes. With `huge`, try a huge-page mapping first and fall
    /// back to regular pages if the pool is empty.
    pub fn map(len: usize, huge: bool) -> io::Result<Self> {
        if huge {
            match Self::map_flags(len, libc::MAP_HUGETLB) {
                Ok(buf) => return Ok(buf),
                Err(e) => {
                    log::warn!("huge-page mapping of {} bytes failed ({}), using regular pages", len, e);
                }
            }
        }
        Self::map_flags(len, 0)
    }

    fn map_flags(len: usize, extra_flags: i32) -> io::Result<Self> {
        // SAFETY: FFI; a fresh anonymous mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(IoError::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned NULL"),
            len,
        })
    }

    /// Bind the mapping's pages to a NUMA node. Failure (no NUMA support,
    /// invalid node) is reported but tolerated; the pages then stay where
    /// the first touch places them.
    pub fn bind_numa(&self, node: u32) {
        const MPOL_BIND: libc::c_long = 2;
        let nodemask: u64 = 1 << node;
        // SAFETY: FFI; the mask outlives the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.ptr.as_ptr(),
                self.len,
                MPOL_BIND,
                &nodemask as *const u64,
                64usize,
                0,
            )
        };
        if ret != 0 {
            log::warn!(
                "cannot bind buffer to NUMA node {}: {}",
                node,
                IoError::last_os_error()
            );
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // SAFETY: mapped by us with this exact length, unmapped only here.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// The mapping is plain memory; sharing raw pointers across threads is
// guarded by the owning MemoryRegion's discipline.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}
