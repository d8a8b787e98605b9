//! Transport strategies.
//!
//! Every backend is entered through its own constructor and then driven
//! through [`Transport`]. The world layer owns exactly one transport per
//! joined world and never looks at the concrete type again.

use std::io;
use std::time::Duration;

use crate::ids::{BackendKind, EnterRequest, ParticipantId, Target};
use crate::wire::Message;
use crate::{TransportError, TransportResult};

pub mod cooperative;
pub mod device;
pub mod socket;

/// Contract shared by the socket, device and cooperative backends.
pub trait Transport: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Id assigned to the local participant when it entered.
    fn local_id(&self) -> ParticipantId;

    /// Delivers `message` to `target`.
    ///
    /// [`TransportError::Destroyed`] means the recipient no longer exists.
    fn send(&self, target: Target, message: &Message) -> TransportResult<()>;

    /// Blocks until the next message for the local participant arrives.
    ///
    /// Returns [`TransportError::Destroyed`] once the endpoint is closed.
    fn recv_blocking(&self) -> TransportResult<Message>;

    /// Kicks a thread blocked in [`Transport::recv_blocking`].
    fn wake(&self) -> TransportResult<()> {
        let id = self.local_id();
        self.send(Target::Participant(id), &Message::wakeup(id))
    }

    /// Releases the local endpoint. Further sends from it fail.
    fn leave(&self, emergency: bool) -> TransportResult<()>;

    /// Lets go of the endpoint in a forked child without disturbing the
    /// parent, which still owns it.
    fn detach(&self) {}

    /// Removes world-wide backing state (socket directories and the like).
    ///
    /// Only the last participant calls this.
    fn remove_backing(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Builds the endpoint of a forked child.
    ///
    /// `Ok(None)` means the backend cannot give the child its own identity.
    fn fork(&self, request: &EnterRequest) -> TransportResult<Option<Box<dyn Transport>>>;

    /// Waits until every queued message of the world was delivered.
    fn sync(&self, _timeout: Duration) -> TransportResult<()> {
        Err(TransportError::Unsupported("sync"))
    }

    /// False only for the single-process backend.
    fn is_multi(&self) -> bool {
        true
    }

    /// True when the backend itself emits a LEAVE for departed participants.
    fn notifies_departure(&self) -> bool {
        false
    }
}

/// Re-issues a system call interrupted by a signal.
pub(crate) fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn interrupted_calls_are_retried() {
        let attempts = Cell::new(0);
        let value = retry_eintr(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.get(), 3);
    }
}
