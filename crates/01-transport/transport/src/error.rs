//! Error surface of the transport crate.
//!
//! Backend failures are folded into a handful of variants so the world layer
//! can map them onto its own taxonomy. Interrupted system calls never show up
//! here; backends retry them internally.

use std::io;

use thiserror::Error;

use crate::wire::WireError;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by transports, rings and shared regions.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer (or the local endpoint) is gone.
    #[error("peer is gone")]
    Destroyed,

    /// Unexpected operating-system failure.
    #[error("transport i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The world was created with a different ABI.
    #[error("world ABI {found} does not match {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Backend-specific setup failed.
    #[error("backend initialisation failed: {0}")]
    Init(String),

    /// A master already owns the world.
    #[error("world {0} already has a master")]
    MasterExists(u32),

    /// Operation not provided by this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    /// Requested ring capacity is below the minimum or too large for a frame.
    #[error("ring capacity {requested} must be at least {minimum} bytes")]
    InvalidCapacity { requested: usize, minimum: usize },

    /// Allocation of a shared region failed for the given size/alignment pair.
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },
}

impl TransportError {
    /// Builds an [`TransportError::Init`] from any message.
    pub fn init(msg: impl Into<String>) -> Self {
        TransportError::Init(msg.into())
    }

    /// Classifies a failed send: a missing or refusing peer is `Destroyed`.
    pub(crate) fn from_send(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ECONNREFUSED) | Some(libc::ENOENT) | Some(libc::ENOTCONN) => {
                TransportError::Destroyed
            }
            _ => TransportError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_sends_count_as_destroyed() {
        let refused = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert!(matches!(
            TransportError::from_send(refused),
            TransportError::Destroyed
        ));

        let other = io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(
            TransportError::from_send(other),
            TransportError::Io(_)
        ));
    }
}
