//! Skirmishes: recursive cross-process locks that survive their holder dying.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use fusion_transport::ParticipantId;

use crate::layout::SkirmishSlot;
use crate::lock::{Acquired, Backoff, Roster};
use crate::participants::{Member, ParticipantTable};
use crate::slot::{self, SkirmishId};
use crate::{ArenaError, ArenaResult};

static NEXT_THREAD: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD: Cell<u32> = const { Cell::new(0) };
}

/// Process-unique, nonzero number of the calling thread.
fn current_thread() -> u32 {
    THREAD.with(|thread| {
        if thread.get() == 0 {
            thread.set(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        }
        thread.get()
    })
}

#[derive(Clone, Copy)]
pub struct SkirmishTable<'a> {
    pub(crate) slots: &'a [SkirmishSlot],
    pub(crate) roster: ParticipantTable<'a>,
}

impl<'a> SkirmishTable<'a> {
    pub fn create(&self) -> ArenaResult<SkirmishId> {
        let (index, generation) = slot::claim(self.slots).ok_or(ArenaError::Full("skirmish"))?;
        let slot = &self.slots[index];
        slot.lock.force_release();
        slot.depth.store(0, Ordering::Relaxed);
        slot.owner_id.store(0, Ordering::Relaxed);
        slot.thread.store(0, Ordering::Relaxed);
        slot.tag.publish(generation);
        Ok(SkirmishId::new(index, generation))
    }

    /// Blocks until `member` holds the skirmish on the calling thread.
    ///
    /// Re-entrant for the holding thread only; other threads of the same
    /// participant wait like any other participant would.
    pub fn prevail(&self, id: SkirmishId, member: &Member) -> ArenaResult<Acquired> {
        let mut backoff = Backoff::new();
        loop {
            match self.attempt(id, member)? {
                Some(acquired) => return Ok(acquired),
                None => backoff.snooze(),
            }
        }
    }

    /// Like [`SkirmishTable::prevail`] but fails with [`ArenaError::Busy`]
    /// instead of waiting.
    pub fn swoop(&self, id: SkirmishId, member: &Member) -> ArenaResult<Acquired> {
        self.attempt(id, member)?.ok_or(ArenaError::Busy("skirmish"))
    }

    /// Drops one level of the calling thread's hold; the lock opens at zero.
    pub fn dismiss(&self, id: SkirmishId, member: &Member) -> ArenaResult<()> {
        let slot = self.slot(id)?;
        let token = member.token();
        if !held_here(slot, token) {
            return Err(ArenaError::NotHeld);
        }
        let previous = slot
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1))
            .map_err(|_| ArenaError::NotHeld)?;
        if previous == 1 {
            slot.owner_id.store(0, Ordering::Release);
            slot.thread.store(0, Ordering::Release);
            slot.lock.release(token);
        }
        Ok(())
    }

    /// Nesting depth held by `member` on the calling thread, zero otherwise.
    pub fn lock_count(&self, id: SkirmishId, member: &Member) -> ArenaResult<u32> {
        let slot = self.slot(id)?;
        Ok(if held_here(slot, member.token()) {
            slot.depth.load(Ordering::Acquire)
        } else {
            0
        })
    }

    /// Current holder, if any.
    pub fn holder(&self, id: SkirmishId) -> ArenaResult<Option<ParticipantId>> {
        let slot = self.slot(id)?;
        Ok((slot.lock.holder() != 0)
            .then(|| ParticipantId(slot.owner_id.load(Ordering::Acquire))))
    }

    /// Fails with [`ArenaError::Busy`] while another live participant holds it.
    pub fn destroy(&self, id: SkirmishId, member: &Member) -> ArenaResult<()> {
        let slot = self.slot(id)?;
        let holder = slot.lock.holder();
        if holder != 0 && holder != member.token() && self.roster.is_live_token(holder) {
            return Err(ArenaError::Busy("skirmish"));
        }
        if !slot.tag.release(id.generation()) {
            return Err(ArenaError::Destroyed("skirmish"));
        }
        slot.depth.store(0, Ordering::Release);
        slot.thread.store(0, Ordering::Release);
        slot.lock.force_release();
        Ok(())
    }

    /// Opens every skirmish `member` still holds; returns how many.
    pub fn release_owned(&self, member: &Member) -> usize {
        let token = member.token();
        slot::live(self.slots)
            .filter(|(index, _)| {
                let slot = &self.slots[*index];
                if slot.lock.holder() != token {
                    return false;
                }
                slot.depth.store(0, Ordering::Release);
                slot.owner_id.store(0, Ordering::Release);
                slot.thread.store(0, Ordering::Release);
                slot.lock.release(token)
            })
            .count()
    }

    fn attempt(&self, id: SkirmishId, member: &Member) -> ArenaResult<Option<Acquired>> {
        let slot = self.slot(id)?;
        let token = member.token();
        if held_here(slot, token) {
            slot.depth.fetch_add(1, Ordering::AcqRel);
            return Ok(Some(Acquired::Clean));
        }
        match slot.lock.try_acquire_robust(token, &self.roster) {
            Ok(acquired) => {
                if let Acquired::Recovered { previous } = acquired {
                    tracing::warn!("{id:?} taken over from departed holder {previous:#x}");
                }
                slot.thread.store(current_thread(), Ordering::Release);
                slot.depth.store(1, Ordering::Release);
                slot.owner_id.store(member.id.raw(), Ordering::Release);
                Ok(Some(acquired))
            }
            Err(_) => Ok(None),
        }
    }

    fn slot(&self, id: SkirmishId) -> ArenaResult<&'a SkirmishSlot> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.tag.is_live(id.generation()))
            .ok_or(ArenaError::Destroyed("skirmish"))
    }
}

fn held_here(slot: &SkirmishSlot, token: u32) -> bool {
    slot.lock.holder() == token && slot.thread.load(Ordering::Acquire) == current_thread()
}
