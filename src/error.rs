//! Error taxonomy.
//!
//! See spec §7 (Error Handling Design). `StreamError` and its
//! `CorruptFrame` subcategory are always fatal for the owning stream;
//! `ContextError` is the top-level category callers match on.

use std::io;

/// Transport-level failure: a stream could not be established or was
/// lost mid-call.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt frame: {0}")]
    CorruptFrame(#[from] CorruptFrameError),

    #[error("stream disconnected")]
    Disconnected,

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] crate::bootstrap::BootstrapError),
}

/// Subcategory of [`StreamError`]: MAC mismatch, unknown handle, or a
/// malformed payload. Never recoverable — the MAC chain cannot
/// resynchronise once a frame is dropped or corrupted.
#[derive(Debug, thiserror::Error)]
pub enum CorruptFrameError {
    #[error("MAC mismatch: frame integrity check failed")]
    MacMismatch,

    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    #[error("malformed payload: {0}")]
    Malformed(#[from] crate::marshal::MarshalError),

    #[error("frame exceeds maximum size ({0} bytes)")]
    TooLarge(usize),
}

/// Operation attempted on a closed or dead [`crate::channel::Channel`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    /// A deadline on [`crate::channel::Channel::receive`] elapsed with
    /// nothing queued. Benign — the channel is still open and a later
    /// receive may still succeed.
    #[error("receive timed out")]
    Timeout,
}

/// Deadline exceeded on a `CallWithDeadline`.
#[derive(Debug, thiserror::Error)]
#[error("call deadline exceeded")]
pub struct TimeoutError;

/// A remote call raised an exception. Carries the original message and a
/// serialisable traceback, per spec §6 "Call result body".
#[derive(Debug, thiserror::Error)]
#[error("remote exception: {message}")]
pub struct RemoteException {
    pub message: String,
    pub traceback: Vec<String>,
}

/// Top-level error category for [`crate::context::Context`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Remote(#[from] RemoteException),

    #[error("disallowed record type {0:?} received on this stream")]
    DisallowedType(String),
}
