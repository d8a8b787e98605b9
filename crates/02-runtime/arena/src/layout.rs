//! `repr(C)` structures placed in the shared mapping.
//!
//! Everything here is made of atomics so that an all-zero mapping is a valid,
//! empty world and shared references never alias plain data.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::lock::OwnerLock;
use crate::slot::{SlotTag, Slotted};
use crate::{
    HEAP_BYTES, MAX_CALLS, MAX_CALL_PERMISSIONS, MAX_PARTICIPANTS, MAX_REACTORS, MAX_REFS,
    MAX_SKIRMISHES, MAX_SUBSCRIPTIONS,
};

/// `"FUSIONWD"` as a little-endian word.
pub const ARENA_MAGIC: u64 = 0x4457_4e4f_4953_5546;
/// Bumped whenever the shared layout changes.
pub const ARENA_LAYOUT_VERSION: u32 = 1;

/// World-wide bookkeeping at offset zero.
#[repr(C)]
pub struct WorldHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) layout_version: AtomicU32,
    pub(crate) abi: AtomicU32,
    pub(crate) world_index: AtomicU32,
    pub(crate) ready: AtomicU32,
    pub(crate) attached: AtomicU32,
    pub(crate) _pad: AtomicU32,
    pub(crate) start_time_us: AtomicU64,
    pub(crate) root: AtomicU64,
    pub(crate) heap_top: AtomicU64,
}

impl WorldHeader {
    pub fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn abi(&self) -> u32 {
        self.abi.load(Ordering::Acquire)
    }

    pub fn world_index(&self) -> u32 {
        self.world_index.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Participants currently registered.
    pub fn attached(&self) -> u32 {
        self.attached.load(Ordering::Acquire)
    }

    /// Shared clock epoch in microseconds since the Unix epoch.
    pub fn start_time_us(&self) -> u64 {
        self.start_time_us.load(Ordering::Acquire)
    }

    /// Heap offset published by the master; zero when unset.
    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, root: u64) {
        self.root.store(root, Ordering::Release);
    }
}

#[repr(C)]
pub(crate) struct ParticipantSlot {
    pub(crate) tag: SlotTag,
    pub(crate) id: AtomicU32,
    pub(crate) pid: AtomicI32,
    pub(crate) joined_us: AtomicU64,
}

/// Journal of the ref mutation in progress, replayed backwards on takeover.
#[repr(C)]
pub(crate) struct RefJournal {
    pub(crate) armed: AtomicU32,
    pub(crate) member_slot: AtomicU32,
    pub(crate) count: AtomicI32,
    pub(crate) contribution: AtomicU32,
}

#[repr(C)]
pub(crate) struct RefSlot {
    pub(crate) tag: SlotTag,
    pub(crate) lock: OwnerLock,
    pub(crate) count: AtomicI32,
    pub(crate) watch_call: AtomicU64,
    pub(crate) watch_arg: AtomicI32,
    pub(crate) creator: AtomicU32,
    pub(crate) journal: RefJournal,
    pub(crate) contributions: [AtomicU32; MAX_PARTICIPANTS],
}

#[repr(C)]
pub(crate) struct CallSlot {
    pub(crate) tag: SlotTag,
    pub(crate) owner_id: AtomicU32,
    pub(crate) owner_token: AtomicU32,
    pub(crate) restricted: AtomicU32,
    pub(crate) _pad: AtomicU32,
    pub(crate) granted: [AtomicU32; MAX_CALL_PERMISSIONS],
}

#[repr(C)]
pub(crate) struct ReactorSlot {
    pub(crate) tag: SlotTag,
    pub(crate) owner_id: AtomicU32,
    pub(crate) owner_token: AtomicU32,
    pub(crate) free_pending: AtomicU32,
    pub(crate) in_flight: AtomicU32,
}

#[repr(C)]
pub(crate) struct SubscriptionSlot {
    pub(crate) tag: SlotTag,
    pub(crate) reactor: AtomicU64,
    pub(crate) participant: AtomicU32,
    pub(crate) token: AtomicU32,
    pub(crate) channel: AtomicU32,
    pub(crate) in_flight: AtomicU32,
}

#[repr(C)]
pub(crate) struct SkirmishSlot {
    pub(crate) tag: SlotTag,
    pub(crate) lock: OwnerLock,
    pub(crate) depth: AtomicU32,
    pub(crate) owner_id: AtomicU32,
    /// Thread of the holding participant that may nest; zero when open.
    pub(crate) thread: AtomicU32,
}

macro_rules! slotted {
    ($($ty:ty),*) => {
        $(impl Slotted for $ty {
            fn tag(&self) -> &SlotTag {
                &self.tag
            }
        })*
    };
}

slotted!(ParticipantSlot, RefSlot, CallSlot, ReactorSlot, SubscriptionSlot, SkirmishSlot);

#[repr(C)]
pub(crate) struct ArenaLayout {
    pub(crate) header: WorldHeader,
    pub(crate) participants: [ParticipantSlot; MAX_PARTICIPANTS],
    pub(crate) refs: [RefSlot; MAX_REFS],
    pub(crate) calls: [CallSlot; MAX_CALLS],
    pub(crate) reactors: [ReactorSlot; MAX_REACTORS],
    pub(crate) subscriptions: [SubscriptionSlot; MAX_SUBSCRIPTIONS],
    pub(crate) skirmishes: [SkirmishSlot; MAX_SKIRMISHES],
}

const PAGE: usize = 4096;

/// Offset of the heap from the start of the mapping.
pub(crate) const HEAP_OFFSET: usize = (size_of::<ArenaLayout>() + PAGE - 1) & !(PAGE - 1);

/// Bytes mapped per world.
pub(crate) const ARENA_BYTES: usize = HEAP_OFFSET + HEAP_BYTES;
