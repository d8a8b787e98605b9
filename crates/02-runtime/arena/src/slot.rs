//! Generation-tagged slot states and the handles that point at them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const FREE: u32 = 0;
pub(crate) const CLAIMING: u32 = 1;
pub(crate) const LIVE: u32 = 2;
pub(crate) const PENDING: u32 = 3;

/// `generation << 32 | state`, all zero in a fresh mapping.
#[repr(transparent)]
pub(crate) struct SlotTag(AtomicU64);

const fn pack(generation: u32, state: u32) -> u64 {
    ((generation as u64) << 32) | state as u64
}

const fn unpack(raw: u64) -> (u32, u32) {
    ((raw >> 32) as u32, raw as u32)
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

impl SlotTag {
    pub(crate) fn load(&self) -> (u32, u32) {
        unpack(self.0.load(Ordering::Acquire))
    }

    /// Moves a free slot to CLAIMING under a fresh generation.
    pub(crate) fn try_claim(&self) -> Option<u32> {
        let (generation, state) = self.load();
        if state != FREE {
            return None;
        }
        let next = next_generation(generation);
        self.0
            .compare_exchange(
                pack(generation, FREE),
                pack(next, CLAIMING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| next)
    }

    /// Makes a claimed slot visible.
    pub(crate) fn publish(&self, generation: u32) {
        self.0.store(pack(generation, LIVE), Ordering::Release);
    }

    pub(crate) fn is_live(&self, generation: u32) -> bool {
        self.load() == (generation, LIVE)
    }

    /// Moves `from` to `to` for one generation; false when someone else won.
    pub(crate) fn transition(&self, generation: u32, from: u32, to: u32) -> bool {
        self.0
            .compare_exchange(
                pack(generation, from),
                pack(generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Frees a LIVE or PENDING slot of `generation`.
    pub(crate) fn release(&self, generation: u32) -> bool {
        self.transition(generation, LIVE, FREE) || self.transition(generation, PENDING, FREE)
    }
}

/// Slot types carry a tag as their first field.
pub(crate) trait Slotted {
    fn tag(&self) -> &SlotTag;
}

/// Claims the first free slot; returns its index and generation.
pub(crate) fn claim<S: Slotted>(slots: &[S]) -> Option<(usize, u32)> {
    slots
        .iter()
        .enumerate()
        .find_map(|(index, slot)| slot.tag().try_claim().map(|generation| (index, generation)))
}

/// Live slots as `(index, generation)` pairs.
pub(crate) fn live<S: Slotted>(slots: &[S]) -> impl Iterator<Item = (usize, u32)> + '_ {
    slots.iter().enumerate().filter_map(|(index, slot)| {
        let (generation, state) = slot.tag().load();
        (state == LIVE).then_some((index, generation))
    })
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub(crate) fn new(index: usize, generation: u32) -> Self {
                Self(((generation as u64) << 32) | index as u64)
            }

            /// Rebuilds a handle from its wire form; `None` for zero.
            pub fn from_raw(raw: u64) -> Option<Self> {
                (raw != 0).then_some(Self(raw))
            }

            /// Wire form, never zero.
            pub fn raw(self) -> u64 {
                self.0
            }

            pub(crate) fn index(self) -> usize {
                (self.0 & 0xFFFF_FFFF) as usize
            }

            pub(crate) fn generation(self) -> u32 {
                (self.0 >> 32) as u32
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}@{})", stringify!($name), self.index(), self.generation())
            }
        }
    };
}

handle!(
    /// Handle of a shared reference counter.
    RefId
);
handle!(
    /// Handle of a registered call.
    CallId
);
handle!(
    /// Handle of a reactor.
    ReactorId
);
handle!(
    /// Handle of one participant's subscription to a reactor channel.
    SubscriptionId
);
handle!(
    /// Handle of a skirmish.
    SkirmishId
);
