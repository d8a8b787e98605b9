//! Single-process backend.
//!
//! There is only ever one participant, the master. Messages addressed to it
//! go through an in-process [`EventQueue`]; anything addressed elsewhere has
//! no recipient.

use crate::ids::{BackendKind, EnterRequest, ParticipantId, Target};
use crate::ring::{Envelope, EventQueue};
use crate::wire::{Message, WIRE_VERSION};
use crate::{Transport, TransportError, TransportResult};

/// Default queue capacity in bytes.
pub const DEFAULT_QUEUE_BYTES: usize = 256 * 1024;

/// In-process transport of a single-process world.
pub struct CooperativeTransport {
    queue: EventQueue,
}

impl CooperativeTransport {
    /// Enters the world; the caller always becomes the master.
    pub fn enter(request: &EnterRequest) -> TransportResult<Self> {
        Self::with_capacity(request, DEFAULT_QUEUE_BYTES)
    }

    /// Same as [`CooperativeTransport::enter`] with an explicit queue size.
    pub fn with_capacity(request: &EnterRequest, capacity_bytes: usize) -> TransportResult<Self> {
        tracing::debug!(
            "cooperative world {} entered (role {:?} ignored)",
            request.world_index,
            request.role
        );
        Ok(Self {
            queue: EventQueue::new(capacity_bytes)?,
        })
    }
}

impl Transport for CooperativeTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Cooperative
    }

    fn local_id(&self) -> ParticipantId {
        ParticipantId::MASTER
    }

    fn send(&self, target: Target, message: &Message) -> TransportResult<()> {
        match target {
            Target::Participant(id) if id == ParticipantId::MASTER => {
                let frame = message.encode()?;
                self.queue
                    .push(Envelope::new(message.kind as u8, WIRE_VERSION), &frame)
            }
            Target::Participant(_) => Err(TransportError::Destroyed),
            Target::Broadcast => Ok(()),
        }
    }

    fn recv_blocking(&self) -> TransportResult<Message> {
        let (_, frame) = self.queue.pop_blocking()?;
        Ok(Message::decode(&frame)?)
    }

    fn leave(&self, _emergency: bool) -> TransportResult<()> {
        self.queue.close();
        Ok(())
    }

    fn fork(&self, _request: &EnterRequest) -> TransportResult<Option<Box<dyn Transport>>> {
        Ok(None)
    }

    fn is_multi(&self) -> bool {
        false
    }
}
