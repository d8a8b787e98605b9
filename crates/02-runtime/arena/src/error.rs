use std::io;

use fusion_transport::TransportError;
use thiserror::Error;

/// Convenience result alias for arena operations.
pub type ArenaResult<T, E = ArenaError> = Result<T, E>;

/// Errors raised while mapping or mutating the shared tables.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("arena mapping failed: {0}")]
    Transport(#[from] TransportError),

    #[error("world ABI {found} does not match {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("arena is corrupt: {0}")]
    Corrupt(&'static str),

    #[error("arena was not initialised in time")]
    NotReady,

    #[error("{0} table is full")]
    Full(&'static str),

    #[error("handle refers to a destroyed {0}")]
    Destroyed(&'static str),

    #[error("participant {0:#x} may not do this")]
    AccessDenied(u32),

    #[error("{0} is busy")]
    Busy(&'static str),

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    #[error("lock is not held by the caller")]
    NotHeld,

    #[error("shared heap exhausted ({requested} bytes requested, {available} available)")]
    HeapExhausted { requested: usize, available: usize },
}
