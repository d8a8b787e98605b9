use std::io;

use fusion_arena::ArenaError;
use fusion_transport::{TransportError, WireError};
use thiserror::Error;

/// Convenience result alias for world operations.
pub type FusionResult<T, E = FusionError> = Result<T, E>;

/// Everything a world operation can fail with.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Bad index, role or handle combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The world runs a different ABI. Never retried.
    #[error("world ABI {found} does not match {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Backend setup failed; no world was created.
    #[error("initialisation failed: {0}")]
    Init(String),

    /// The target participant or the world is gone.
    #[error("{0} is gone")]
    Destroyed(&'static str),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("access denied")]
    AccessDenied,

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The active backend does not provide this.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A non-blocking attempt found the resource taken.
    #[error("{0} is busy")]
    Busy(&'static str),

    /// A shared table or the heap is full.
    #[error("{0} limit exceeded")]
    LimitExceeded(&'static str),
}

impl From<TransportError> for FusionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Destroyed => FusionError::Destroyed("peer"),
            TransportError::Io(err) => FusionError::Io(err),
            TransportError::VersionMismatch { expected, found } => {
                FusionError::VersionMismatch { expected, found }
            }
            TransportError::Init(msg) => FusionError::Init(msg),
            TransportError::MasterExists(_) => FusionError::Unsupported("world already has a master"),
            TransportError::Unsupported(what) => FusionError::Unsupported(what),
            TransportError::Timeout(what) => FusionError::Timeout(what),
            TransportError::Wire(err) => FusionError::from(err),
            TransportError::InvalidCapacity { .. } => FusionError::InvalidArgument("message too large"),
            TransportError::AllocationFailed { size, .. } => {
                FusionError::Init(format!("could not allocate {size} bytes"))
            }
        }
    }
}

impl From<WireError> for FusionError {
    fn from(err: WireError) -> Self {
        FusionError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl From<ArenaError> for FusionError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::Io(err) => FusionError::Io(err),
            ArenaError::Transport(err) => FusionError::from(err),
            ArenaError::VersionMismatch { expected, found } => {
                FusionError::VersionMismatch { expected, found }
            }
            ArenaError::Corrupt(what) => FusionError::Init(format!("shared arena is corrupt: {what}")),
            ArenaError::NotReady => FusionError::Init("master never initialised the arena".into()),
            ArenaError::Full(what) => FusionError::LimitExceeded(what),
            ArenaError::HeapExhausted { .. } => FusionError::LimitExceeded("shared heap"),
            ArenaError::Destroyed(what) => FusionError::Destroyed(what),
            ArenaError::AccessDenied(_) | ArenaError::NotHeld => FusionError::AccessDenied,
            ArenaError::Busy(what) => FusionError::Busy(what),
            ArenaError::Invalid(what) => FusionError::InvalidArgument(what),
        }
    }
}
