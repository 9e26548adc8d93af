//! Device context and discovery.

use std::ffi::CStr;
use std::io::{self, Error as IoError};
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use super::gid::Gid;
use crate::bindings::*;
use crate::utils::interop::{from_c_err, from_c_ret};

/// Wrapper for `*mut ibv_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvContext(NonNull<ibv_context>);

impl IbvContext {
    /// Query device attributes.
    pub fn query_device(&self) -> io::Result<ibv_device_attr> {
        // SAFETY: POD type.
        let mut dev_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_device(self.as_ptr(), &mut dev_attr) };
        match ret {
            0 => Ok(dev_attr),
            _ => from_c_err(ret),
        }
    }

    /// Close the context.
    ///
    /// # Safety
    ///
    /// - A context must not be closed more than once.
    /// - Closed contexts must not be used anymore.
    pub unsafe fn close(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_close_device(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_context, IbvContext);

/// Device open error type.
#[derive(Debug, Error)]
pub enum DeviceOpenError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    IoError(#[from] IoError),

    /// The name filter is not a valid regular expression.
    #[error("invalid device name pattern: {0}")]
    BadPattern(String),

    /// No device matched the filter.
    #[error("no eligible RDMA device found")]
    NotFound,
}

/// Ownership holder of device context.
struct ContextInner {
    ctx: IbvContext,
    attr: ibv_device_attr,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.ctx.close() }.expect("cannot close context on drop");
    }
}

/// An opened RDMA device context.
#[derive(Clone)]
pub struct Context {
    /// Cached context pointer.
    ctx: IbvContext,

    /// Context body.
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open the first RDMA device whose name matches the given pattern, or
    /// the first device of the host if no pattern is given.
    ///
    /// Device names are those shown by `ibv_devinfo` (e.g. `mlx5_0`), not
    /// network interface names.
    pub fn open(name_pattern: Option<&str>) -> Result<Self, DeviceOpenError> {
        let filter = match name_pattern {
            Some(pat) => Some(
                Regex::new(pat).map_err(|_| DeviceOpenError::BadPattern(pat.to_owned()))?,
            ),
            None => None,
        };

        // SAFETY: FFI; the device list is released before returning.
        unsafe {
            let mut num = 0;
            let list = ibv_get_device_list(&mut num);
            if list.is_null() {
                return Err(DeviceOpenError::IoError(IoError::last_os_error()));
            }

            let mut picked = None;
            for i in 0..num as usize {
                let dev = *list.add(i);
                if dev.is_null() {
                    break;
                }
                if let Some(re) = &filter {
                    let name = CStr::from_ptr(ibv_get_device_name(dev));
                    if !re.is_match(&name.to_string_lossy()) {
                        continue;
                    }
                }
                picked = Some(dev);
                break;
            }

            let result = match picked {
                Some(dev) => {
                    let ctx = ibv_open_device(dev);
                    match NonNull::new(ctx) {
                        Some(ctx) => {
                            let ctx = IbvContext(ctx);
                            match ctx.query_device() {
                                Ok(attr) => Ok(Context {
                                    inner: Arc::new(ContextInner { ctx, attr }),
                                    ctx,
                                }),
                                Err(e) => {
                                    let _ = ctx.close();
                                    Err(DeviceOpenError::IoError(e))
                                }
                            }
                        }
                        None => Err(DeviceOpenError::IoError(IoError::last_os_error())),
                    }
                }
                None => Err(DeviceOpenError::NotFound),
            };
            ibv_free_device_list(list);
            result
        }
    }

    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    /// Get the device attributes.
    #[inline]
    pub(crate) fn attr(&self) -> &ibv_device_attr {
        &self.inner.attr
    }

    /// Query the attributes of the given port.
    pub(crate) fn query_port(&self, port_num: u8) -> io::Result<ibv_port_attr> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_port(self.as_raw(), port_num, &mut attr) };
        from_c_ret(ret)?;
        Ok(attr)
    }

    /// Query a GID from the given port's GID table.
    pub fn query_gid(&self, port_num: u8, index: u8) -> io::Result<Gid> {
        let mut gid = ibv_gid::default();
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_gid(self.as_raw(), port_num, index as i32, &mut gid) };
        from_c_ret(ret)?;
        Ok(Gid::from(gid))
    }

    /// Query the LID of the given port.
    pub fn port_lid(&self, port_num: u8) -> io::Result<u16> {
        Ok(self.query_port(port_num)?.lid)
    }

    /// Whether the given port is in the active state.
    pub fn port_active(&self, port_num: u8) -> io::Result<bool> {
        Ok(self.query_port(port_num)?.state == ibv_port_state::IBV_PORT_ACTIVE)
    }
}
