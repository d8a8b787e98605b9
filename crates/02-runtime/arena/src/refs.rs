//! Shared reference counters with per-participant attribution.
//!
//! Each ref keeps the total plus one contribution word per participant slot.
//! Every mutation happens under the ref's [`OwnerLock`](crate::lock) and is
//! journaled first, so a participant that dies mid-update leaves a record the
//! next lock holder rolls back before doing its own work.

use std::sync::atomic::Ordering;

use smallvec::SmallVec;

use crate::layout::RefSlot;
use crate::lock::Acquired;
use crate::participants::{Member, ParticipantTable};
use crate::slot::{self, CallId, RefId};
use crate::{ArenaError, ArenaResult, MAX_PARTICIPANTS};

/// A consumed zero-transition watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroWatch {
    pub reference: RefId,
    pub call: CallId,
    pub arg: i32,
}

/// Outcome of a decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefDown {
    pub count: i32,
    /// Set when this decrement reached zero and consumed the watch.
    pub watch: Option<ZeroWatch>,
}

/// View over the ref slots.
#[derive(Clone, Copy)]
pub struct RefTable<'a> {
    pub(crate) slots: &'a [RefSlot],
    pub(crate) roster: ParticipantTable<'a>,
}

impl<'a> RefTable<'a> {
    pub fn create(&self, member: &Member) -> ArenaResult<RefId> {
        let (index, generation) = slot::claim(self.slots).ok_or(ArenaError::Full("ref"))?;
        let slot = &self.slots[index];
        slot.lock.force_release();
        slot.count.store(0, Ordering::Relaxed);
        slot.watch_call.store(0, Ordering::Relaxed);
        slot.watch_arg.store(0, Ordering::Relaxed);
        slot.creator.store(member.id.raw(), Ordering::Relaxed);
        slot.journal.armed.store(0, Ordering::Relaxed);
        for contribution in &slot.contributions {
            contribution.store(0, Ordering::Relaxed);
        }
        slot.tag.publish(generation);
        Ok(RefId::new(index, generation))
    }

    /// Adds one to the count on behalf of `member`; returns the new count.
    pub fn up(&self, id: RefId, member: &Member) -> ArenaResult<i32> {
        let slot = self.slot(id)?;
        self.locked(slot, member, |slot| {
            journal(slot, member.slot);
            let count = slot.count.load(Ordering::Relaxed) + 1;
            slot.count.store(count, Ordering::Relaxed);
            slot.contributions[member.slot].fetch_add(1, Ordering::Relaxed);
            disarm(slot);
            Ok(count)
        })
    }

    /// Takes back one of `member`'s increments.
    ///
    /// When the count reaches zero and `notify_zero` is set, the watch is
    /// consumed and returned to the caller, who delivers it.
    pub fn down(&self, id: RefId, member: &Member, notify_zero: bool) -> ArenaResult<RefDown> {
        let slot = self.slot(id)?;
        self.locked(slot, member, |slot| {
            if slot.contributions[member.slot].load(Ordering::Relaxed) == 0 {
                return Err(ArenaError::Invalid("participant holds no increment on this ref"));
            }
            journal(slot, member.slot);
            let count = slot.count.load(Ordering::Relaxed) - 1;
            slot.count.store(count, Ordering::Relaxed);
            slot.contributions[member.slot].fetch_sub(1, Ordering::Relaxed);
            disarm(slot);

            let watch = if count == 0 && notify_zero {
                take_watch(slot, id)
            } else {
                None
            };
            Ok(RefDown { count, watch })
        })
    }

    pub fn stat(&self, id: RefId) -> ArenaResult<i32> {
        Ok(self.slot(id)?.count.load(Ordering::Acquire))
    }

    /// Increments currently attributed to `member`.
    pub fn contribution(&self, id: RefId, member: &Member) -> ArenaResult<u32> {
        Ok(self.slot(id)?.contributions[member.slot].load(Ordering::Acquire))
    }

    /// Arms the zero-transition watch; a ref carries at most one.
    pub fn watch(&self, id: RefId, member: &Member, call: CallId, arg: i32) -> ArenaResult<()> {
        let slot = self.slot(id)?;
        self.locked(slot, member, |slot| {
            if slot.watch_call.load(Ordering::Relaxed) != 0 {
                return Err(ArenaError::Busy("ref watch"));
            }
            slot.watch_arg.store(arg, Ordering::Relaxed);
            slot.watch_call.store(call.raw(), Ordering::Release);
            Ok(())
        })
    }

    pub fn destroy(&self, id: RefId, member: &Member) -> ArenaResult<()> {
        let slot = self.slot(id)?;
        slot.lock.acquire(member.token(), &self.roster);
        let released = slot.tag.release(id.generation());
        slot.lock.force_release();
        if released {
            Ok(())
        } else {
            Err(ArenaError::Destroyed("ref"))
        }
    }

    /// Reverses every increment `member` still holds. `by` holds the locks.
    ///
    /// Returns the watches of refs that dropped to zero as a result.
    pub fn unwind(&self, member: &Member, by: &Member) -> SmallVec<[ZeroWatch; 4]> {
        let mut fired = SmallVec::new();
        for (index, generation) in slot::live(self.slots) {
            let slot = &self.slots[index];
            if slot.contributions[member.slot].load(Ordering::Acquire) == 0 {
                continue;
            }
            let id = RefId::new(index, generation);
            let watch = self.locked(slot, by, |slot| {
                let owed = slot.contributions[member.slot].load(Ordering::Relaxed);
                if owed == 0 || !slot.tag.is_live(generation) {
                    return None;
                }
                journal(slot, member.slot);
                let count = slot.count.load(Ordering::Relaxed) - owed as i32;
                slot.count.store(count, Ordering::Relaxed);
                slot.contributions[member.slot].store(0, Ordering::Relaxed);
                disarm(slot);
                tracing::debug!("unwound {owed} increment(s) of {} on {id:?}", member.id);
                (count == 0).then(|| take_watch(slot, id)).flatten()
            });
            fired.extend(watch);
        }
        fired
    }

    /// Copies every contribution of `from` to `to`, raising the counts to match.
    pub fn duplicate(&self, from: &Member, to: &Member) -> usize {
        let mut copied = 0;
        for (index, _) in slot::live(self.slots) {
            let slot = &self.slots[index];
            if slot.contributions[from.slot].load(Ordering::Acquire) == 0 {
                continue;
            }
            self.locked(slot, to, |slot| {
                let held = slot.contributions[from.slot].load(Ordering::Relaxed);
                if held == 0 {
                    return;
                }
                journal(slot, to.slot);
                slot.count.fetch_add(held as i32, Ordering::Relaxed);
                slot.contributions[to.slot].fetch_add(held, Ordering::Relaxed);
                disarm(slot);
                copied += 1;
            });
        }
        copied
    }

    fn slot(&self, id: RefId) -> ArenaResult<&'a RefSlot> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.tag.is_live(id.generation()))
            .ok_or(ArenaError::Destroyed("ref"))
    }

    fn locked<R>(&self, slot: &RefSlot, member: &Member, f: impl FnOnce(&RefSlot) -> R) -> R {
        let token = member.token();
        if let Acquired::Recovered { previous } = slot.lock.acquire(token, &self.roster) {
            rollback(slot, previous);
        }
        let result = f(slot);
        slot.lock.release(token);
        result
    }
}

fn journal(slot: &RefSlot, member_slot: usize) {
    let journal = &slot.journal;
    journal.member_slot.store(member_slot as u32, Ordering::Relaxed);
    journal
        .count
        .store(slot.count.load(Ordering::Relaxed), Ordering::Relaxed);
    journal.contribution.store(
        slot.contributions[member_slot].load(Ordering::Relaxed),
        Ordering::Relaxed,
    );
    journal.armed.store(1, Ordering::Release);
}

fn disarm(slot: &RefSlot) {
    slot.journal.armed.store(0, Ordering::Release);
}

fn rollback(slot: &RefSlot, previous: u32) {
    let journal = &slot.journal;
    if journal.armed.swap(0, Ordering::AcqRel) == 0 {
        tracing::debug!("took over ref lock from departed holder {previous:#x}");
        return;
    }
    let member_slot = journal.member_slot.load(Ordering::Acquire) as usize;
    if member_slot >= MAX_PARTICIPANTS {
        tracing::error!("ref journal names slot {member_slot}, ignoring it");
        return;
    }
    slot.count
        .store(journal.count.load(Ordering::Acquire), Ordering::Release);
    slot.contributions[member_slot].store(
        journal.contribution.load(Ordering::Acquire),
        Ordering::Release,
    );
    tracing::warn!("rolled back ref update interrupted by departed holder {previous:#x}");
}

fn take_watch(slot: &RefSlot, reference: RefId) -> Option<ZeroWatch> {
    let arg = slot.watch_arg.load(Ordering::Acquire);
    CallId::from_raw(slot.watch_call.swap(0, Ordering::AcqRel)).map(|call| ZeroWatch {
        reference,
        call,
        arg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;
    use fusion_transport::ParticipantId;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn me() -> i32 {
        std::process::id() as i32
    }

    fn join(arena: &Arena, id: u32) -> Member {
        arena.participants().register(ParticipantId(id), me()).unwrap()
    }

    fn some_call(arena: &Arena, owner: &Member) -> CallId {
        arena
            .calls()
            .create(owner, crate::Permissions::Anyone)
            .unwrap()
    }

    #[test]
    fn counts_and_contributions_track_each_member() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (a, b) = (join(&arena, 1), join(&arena, 2));
        let refs = arena.refs();
        let id = refs.create(&a).unwrap();

        assert_eq!(refs.up(id, &a).unwrap(), 1);
        assert_eq!(refs.up(id, &b).unwrap(), 2);
        assert_eq!(refs.up(id, &b).unwrap(), 3);
        assert_eq!(refs.contribution(id, &b).unwrap(), 2);
        assert_eq!(refs.down(id, &a, true).unwrap().count, 2);
        assert!(matches!(
            refs.down(id, &a, true),
            Err(ArenaError::Invalid(_))
        ));
        assert_eq!(refs.stat(id).unwrap(), 2);
    }

    #[test]
    fn watch_fires_on_zero_only_once() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let a = join(&arena, 1);
        let refs = arena.refs();
        let call = some_call(&arena, &a);
        let id = refs.create(&a).unwrap();
        refs.watch(id, &a, call, 17).unwrap();
        assert!(matches!(
            refs.watch(id, &a, call, 18),
            Err(ArenaError::Busy(_))
        ));

        refs.up(id, &a).unwrap();
        let down = refs.down(id, &a, true).unwrap();
        assert_eq!(
            down.watch,
            Some(ZeroWatch {
                reference: id,
                call,
                arg: 17
            })
        );
        refs.up(id, &a).unwrap();
        assert_eq!(refs.down(id, &a, true).unwrap().watch, None);
    }

    #[test]
    fn silent_down_keeps_the_watch() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let a = join(&arena, 1);
        let refs = arena.refs();
        let call = some_call(&arena, &a);
        let id = refs.create(&a).unwrap();
        refs.watch(id, &a, call, 0).unwrap();
        refs.up(id, &a).unwrap();
        assert_eq!(refs.down(id, &a, false).unwrap().watch, None);
        refs.up(id, &a).unwrap();
        assert!(refs.down(id, &a, true).unwrap().watch.is_some());
    }

    /// Many threads race the last decrements; exactly one sees the watch.
    #[test]
    fn concurrent_zero_notifies_once() {
        let arena = Arc::new(Arena::anonymous(0, 1).unwrap());
        let members: Vec<_> = (1..=8).map(|id| join(&arena, id)).collect();
        let owner = members[0];
        let call = some_call(&arena, &owner);
        let id = arena.refs().create(&owner).unwrap();
        for member in &members {
            arena.refs().up(id, member).unwrap();
        }
        arena.refs().watch(id, &owner, call, 1).unwrap();

        let fired: usize = members
            .iter()
            .map(|member| {
                let (arena, member) = (arena.clone(), *member);
                thread::spawn(move || arena.refs().down(id, &member, true).unwrap().watch)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .count();
        assert_eq!(fired, 1);
        assert_eq!(arena.refs().stat(id).unwrap(), 0);
    }

    #[test]
    fn unwind_reverses_exactly_the_departed_share() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (master, slave) = (join(&arena, 1), join(&arena, 2));
        let refs = arena.refs();
        let call = some_call(&arena, &master);
        let shared = refs.create(&master).unwrap();
        let only_slave = refs.create(&master).unwrap();
        refs.up(shared, &master).unwrap();
        refs.up(shared, &slave).unwrap();
        refs.up(only_slave, &slave).unwrap();
        refs.up(only_slave, &slave).unwrap();
        refs.watch(only_slave, &master, call, 5).unwrap();
        refs.watch(shared, &master, call, 6).unwrap();

        let fired = refs.unwind(&slave, &master);
        assert_eq!(refs.stat(shared).unwrap(), 1);
        assert_eq!(refs.stat(only_slave).unwrap(), 0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reference, only_slave);
        assert!(refs.unwind(&slave, &master).is_empty());
    }

    /// A holder that died mid-update is rolled back by the next locker.
    #[test]
    fn interrupted_update_is_rolled_back() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (survivor, victim) = (join(&arena, 1), join(&arena, 2));
        let refs = arena.refs();
        let id = refs.create(&survivor).unwrap();
        refs.up(id, &victim).unwrap();

        let slot = &arena.layout().refs[id.index()];
        slot.lock.try_acquire(victim.token()).unwrap();
        journal(slot, victim.slot);
        slot.count.store(99, Ordering::Relaxed);
        slot.contributions[victim.slot].store(42, Ordering::Relaxed);
        arena.participants().mark_gone(&victim);
        arena.participants().release(&victim);

        assert_eq!(refs.up(id, &survivor).unwrap(), 2);
        assert_eq!(refs.contribution(id, &victim).unwrap(), 1);
    }

    #[test]
    fn duplicate_copies_contributions() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (parent, child) = (join(&arena, 2), join(&arena, 3));
        let refs = arena.refs();
        let id = refs.create(&parent).unwrap();
        refs.up(id, &parent).unwrap();
        refs.up(id, &parent).unwrap();
        assert_eq!(refs.duplicate(&parent, &child), 1);
        assert_eq!(refs.stat(id).unwrap(), 4);
        assert_eq!(refs.contribution(id, &child).unwrap(), 2);
    }

    #[test]
    fn destroyed_refs_reject_handles() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let a = join(&arena, 1);
        let refs = arena.refs();
        let id = refs.create(&a).unwrap();
        refs.destroy(id, &a).unwrap();
        assert!(matches!(refs.up(id, &a), Err(ArenaError::Destroyed("ref"))));
        assert!(matches!(refs.destroy(id, &a), Err(ArenaError::Destroyed("ref"))));
    }

    proptest! {
        /// Removing a participant leaves the count it would have had after
        /// issuing matching decrements for all of its increments.
        #[test]
        fn removal_conserves_counts(ops in prop::collection::vec((0usize..3, any::<bool>()), 0..64)) {
            let arena = Arena::anonymous(0, 1).unwrap();
            let members = [join(&arena, 1), join(&arena, 2), join(&arena, 3)];
            let refs = arena.refs();
            let id = refs.create(&members[0]).unwrap();
            let mut held = [0i32; 3];

            for (who, up) in ops {
                if up {
                    refs.up(id, &members[who]).unwrap();
                    held[who] += 1;
                } else if held[who] > 0 {
                    refs.down(id, &members[who], true).unwrap();
                    held[who] -= 1;
                }
            }

            refs.unwind(&members[2], &members[0]);
            prop_assert_eq!(refs.stat(id).unwrap(), held[0] + held[1]);
            prop_assert_eq!(refs.contribution(id, &members[2]).unwrap(), 0);
        }
    }
}
