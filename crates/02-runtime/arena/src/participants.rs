//! Who is in the world.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use fusion_transport::ParticipantId;

use crate::layout::{ParticipantSlot, WorldHeader};
use crate::lock::Roster;
use crate::slot::{self, LIVE, PENDING};
use crate::{ArenaError, ArenaResult};

/// One registered participant: its table slot, that slot's generation and its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Member {
    pub slot: usize,
    pub generation: u32,
    pub id: ParticipantId,
}

impl Member {
    /// Non-zero tag written into locks this member holds.
    pub fn token(&self) -> u32 {
        token_of(self.slot, self.generation)
    }

    /// Slot and generation packed for the wire.
    pub fn to_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }
}

fn token_of(slot: usize, generation: u32) -> u32 {
    (((generation % 0x00FF_FFFF) + 1) << 8) | (slot as u32 & 0xFF)
}

/// True when `pid` names a running process.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// View over the participant slots.
#[derive(Clone, Copy)]
pub struct ParticipantTable<'a> {
    pub(crate) slots: &'a [ParticipantSlot],
    pub(crate) header: &'a WorldHeader,
}

impl<'a> ParticipantTable<'a> {
    /// Adds `id` to the table.
    ///
    /// Fails with [`ArenaError::Busy`] if a live entry already carries `id`.
    pub fn register(&self, id: ParticipantId, pid: i32) -> ArenaResult<Member> {
        if self.find(id).is_some() {
            return Err(ArenaError::Busy("participant id"));
        }
        self.take_over(id, pid).map(|(member, _)| member)
    }

    /// Registers `id` even if a live entry already carries it.
    ///
    /// The transport hands out ids, so such an entry belongs to a participant
    /// that vanished without being evicted. It is returned for the caller to
    /// evict.
    pub fn take_over(&self, id: ParticipantId, pid: i32) -> ArenaResult<(Member, Option<Member>)> {
        let stale = self.find(id);
        let (index, generation) = slot::claim(self.slots).ok_or(ArenaError::Full("participant"))?;
        let slot = &self.slots[index];
        slot.id.store(id.raw(), Ordering::Relaxed);
        slot.pid.store(pid, Ordering::Relaxed);
        slot.joined_us.store(now_us(), Ordering::Relaxed);
        slot.tag.publish(generation);
        self.header.attached.fetch_add(1, Ordering::AcqRel);
        Ok((
            Member {
                slot: index,
                generation,
                id,
            },
            stale,
        ))
    }

    /// Live entry carrying `id`.
    pub fn find(&self, id: ParticipantId) -> Option<Member> {
        slot::live(self.slots).find_map(|(index, generation)| {
            let member = self.member_at(index, generation);
            (member.id == id).then_some(member)
        })
    }

    /// Live entry of `id`, pinned to the slot in `raw` when it is non-zero.
    pub fn resolve(&self, id: ParticipantId, raw: u64) -> Option<Member> {
        if raw == 0 {
            return self.find(id);
        }
        let member = Member {
            slot: (raw & 0xFFFF_FFFF) as usize,
            generation: (raw >> 32) as u32,
            id,
        };
        let slot = self.slots.get(member.slot)?;
        (slot.tag.is_live(member.generation) && slot.id.load(Ordering::Acquire) == id.raw())
            .then_some(member)
    }

    /// True while `member` is registered and not being evicted.
    pub fn is_present(&self, member: &Member) -> bool {
        self.slots[member.slot].tag.is_live(member.generation)
    }

    pub fn pid_of(&self, id: ParticipantId) -> Option<i32> {
        self.find(id)
            .map(|member| self.slots[member.slot].pid.load(Ordering::Acquire))
    }

    /// Every live participant.
    pub fn active(&self) -> Vec<Member> {
        slot::live(self.slots)
            .map(|(index, generation)| self.member_at(index, generation))
            .collect()
    }

    /// Starts evicting `member`; only the first caller gets `true`.
    pub fn mark_gone(&self, member: &Member) -> bool {
        self.slots[member.slot]
            .tag
            .transition(member.generation, LIVE, PENDING)
    }

    /// Frees the slot of `member`; returns the number still attached.
    pub fn release(&self, member: &Member) -> u32 {
        if !self.slots[member.slot].tag.release(member.generation) {
            return self.header.attached();
        }
        let previous = self
            .header
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn member_at(&self, index: usize, generation: u32) -> Member {
        Member {
            slot: index,
            generation,
            id: ParticipantId(self.slots[index].id.load(Ordering::Acquire)),
        }
    }
}

/// A token stays live while its slot is being evicted; only a dead process
/// or a released slot lets waiters take its locks over.
impl Roster for ParticipantTable<'_> {
    fn is_live_token(&self, token: u32) -> bool {
        let index = (token & 0xFF) as usize;
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        let (generation, state) = slot.tag.load();
        (state == LIVE || state == PENDING)
            && token_of(index, generation) == token
            && pid_alive(slot.pid.load(Ordering::Acquire))
    }
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
