//! Shared-memory layout of a Fusion world.
//!
//! Every cross-process structure of a world lives in one mapping, addressed by
//! offsets so each participant may map it wherever it likes:
//!
//! ```text
//! +--------------+--------------+---------+--------+----------+------+-----------+------------+
//! | WorldHeader  | participants |  refs   | calls  | reactors | subs | skirmishes | heap ...  |
//! +--------------+--------------+---------+--------+----------+------+-----------+------------+
//! ```
//!
//! Tables are fixed arrays of slots. A slot is claimed and released through a
//! generation-tagged state word, so handles to a recycled slot are detected
//! as stale. Structures that need mutual exclusion use [`lock::OwnerLock`],
//! which records the holder and lets waiters take over from a dead one.

mod arena;
mod calls;
mod error;
mod heap;
mod layout;
mod lock;
mod participants;
mod reactors;
mod refs;
mod skirmish;
mod slot;

pub use arena::{Arena, Eviction, Notification};
pub use calls::{CallTable, Permissions};
pub use error::{ArenaError, ArenaResult};
pub use heap::{SharedHeap, ShmBlock, ShmPool};
pub use layout::{WorldHeader, ARENA_LAYOUT_VERSION, ARENA_MAGIC};
pub use lock::Acquired;
pub use participants::{pid_alive, Member, ParticipantTable};
pub use reactors::{Deliveries, ReactorTable};
pub use refs::{RefDown, RefTable, ZeroWatch};
pub use skirmish::SkirmishTable;
pub use slot::{CallId, ReactorId, RefId, SkirmishId, SubscriptionId};

/// Number of refs a world can hold.
pub const MAX_REFS: usize = 1024;
/// Number of calls a world can hold.
pub const MAX_CALLS: usize = 256;
/// Number of reactors a world can hold.
pub const MAX_REACTORS: usize = 128;
/// Number of `(reactor, participant, channel)` subscriptions.
pub const MAX_SUBSCRIPTIONS: usize = 512;
/// Number of skirmishes (cross-process locks).
pub const MAX_SKIRMISHES: usize = 256;
/// Explicit grants a restricted call can carry.
pub const MAX_CALL_PERMISSIONS: usize = 8;
/// Size of the bump heap behind the tables.
pub const HEAP_BYTES: usize = 1 << 20;

pub use fusion_transport::MAX_PARTICIPANTS;
