//! Message transport between the participants of a Fusion world.
//!
//! The crate is split into the pieces every backend shares and the backends
//! themselves:
//! * [`Message`] / [`FrameReader`] – self-describing frames and a reassembly buffer.
//! * [`SharedRegion`] – anonymous or file-backed memory shared between processes.
//! * [`EventQueue`] – in-process ring used by the cooperative backend.
//! * [`Transport`] – the contract implemented by the socket, device and
//!   cooperative strategies.

mod error;
mod ids;
mod region;
mod ring;
pub mod backend;
pub mod schema;
pub mod wait;
pub mod wire;

pub use backend::cooperative::CooperativeTransport;
pub use backend::device::{
    CharDeviceOpener, DeviceOpener, DeviceTransport, FusionDevice, MemoryDeviceHub, OpenMode,
};
pub use backend::socket::SocketTransport;
pub use backend::Transport;
pub use error::{TransportError, TransportResult};
pub use ids::{BackendKind, EnterRequest, ParticipantId, Role, Target, MAX_PARTICIPANTS};
pub use region::{RegionInit, SharedRegion};
pub use ring::{Envelope, EventQueue, MsgRing};
pub use wire::{FrameReader, Message, MessageKind, WireError};
