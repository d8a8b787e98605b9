//! Identifiers and membership vocabulary shared by every backend.

use std::fmt;

/// Upper bound on concurrently attached participants of one world.
pub const MAX_PARTICIPANTS: usize = 64;

/// Identifier of a participant (fusionee) within one world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    /// Sender id of the transport itself; destructor-style calls carry it.
    pub const KERNEL: ParticipantId = ParticipantId(0);
    /// Id of the participant that created the world.
    pub const MASTER: ParticipantId = ParticipantId(1);
    /// First id handed out to slaves.
    pub const FIRST_SLAVE: ParticipantId = ParticipantId(2);

    /// Raw numeric value as carried on the wire.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// True for the transport-internal sender.
    pub const fn is_kernel(self) -> bool {
        self.0 == Self::KERNEL.0
    }

    /// True for the world's creator.
    pub const fn is_master(self) -> bool {
        self.0 == Self::MASTER.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Role requested when joining a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Create the world; fail if it already has a master.
    Master,
    /// Join an existing world; fail if there is no master.
    Slave,
    /// Create the world if needed, otherwise join it.
    Any,
}

impl Role {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Role::Master => 0,
            Role::Slave => 1,
            Role::Any => 2,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Role::Master),
            1 => Some(Role::Slave),
            2 => Some(Role::Any),
            _ => None,
        }
    }
}

/// Destination of an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// One participant, possibly the sender itself.
    Participant(ParticipantId),
    /// Every other participant currently reachable.
    Broadcast,
}

/// Which strategy moves messages for a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// One `AF_UNIX` datagram socket per participant.
    Socket,
    /// A fusion character device (or an in-memory stand-in).
    Device,
    /// Single process, in-process ring, one dispatcher.
    Cooperative,
}

/// Parameters presented to a backend when entering a world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnterRequest {
    /// Index of the world being entered.
    pub world_index: u32,
    /// ABI version the caller was built against.
    pub abi: u32,
    /// OS process id of the caller.
    pub pid: i32,
    /// Requested role.
    pub role: Role,
}

impl EnterRequest {
    /// Returns a copy with a different role.
    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }
}
