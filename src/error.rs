//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::proto::MessageStatus;
use crate::verbs::WcStatus;

/// Errors surfaced by the transport engines, the memory region, and the
/// control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// The memory region's free list has no extent large enough.
    #[error("local memory region exhausted")]
    OutOfMemory,

    /// Malformed offset, size, double free, or unknown mode.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A verbs resource could not be created or registered.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[source] io::Error),

    /// A verbs post call rejected the work request. The connection remains
    /// usable.
    #[error("work request rejected: {0}")]
    PostFailed(#[source] io::Error),

    /// A completion carried a non-success status. The connection is torn
    /// down and transitions to DISCONNECTED.
    #[error("completion with status: {0}")]
    CompletionError(WcStatus),

    /// Socket error, timeout, or a reply of an unexpected kind on the
    /// control plane.
    #[error("control plane failure: {0}")]
    ControlPlane(String),

    /// The peer answered with an error message.
    #[error("peer rejected request with status {0:?}")]
    RemoteRejected(MessageStatus),

    /// The named connection id has no usable queue pair.
    #[error("connection {0} is not ready")]
    NotConnected(usize),

    /// Plain I/O error from the underlying OS facilities.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a control-plane I/O failure with context.
    pub(crate) fn ctrl(what: impl Into<String>) -> Self {
        Error::ControlPlane(what.into())
    }
}
