//! Registered calls: who owns them and who may execute them.

use std::sync::atomic::Ordering;

use fusion_transport::ParticipantId;
use smallvec::SmallVec;

use crate::layout::CallSlot;
use crate::participants::Member;
use crate::slot::{self, CallId};
use crate::{ArenaError, ArenaResult};

/// Execution policy of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permissions {
    /// Every participant may execute it.
    Anyone,
    /// Only the owner and participants granted through
    /// [`CallTable::add_permission`].
    Listed,
}

/// View over the call slots.
#[derive(Clone, Copy)]
pub struct CallTable<'a> {
    pub(crate) slots: &'a [CallSlot],
}

impl<'a> CallTable<'a> {
    pub fn create(&self, owner: &Member, permissions: Permissions) -> ArenaResult<CallId> {
        let (index, generation) = slot::claim(self.slots).ok_or(ArenaError::Full("call"))?;
        let slot = &self.slots[index];
        slot.owner_id.store(owner.id.raw(), Ordering::Relaxed);
        slot.owner_token.store(owner.token(), Ordering::Relaxed);
        slot.restricted.store(
            u32::from(permissions == Permissions::Listed),
            Ordering::Relaxed,
        );
        for grant in &slot.granted {
            grant.store(0, Ordering::Relaxed);
        }
        slot.tag.publish(generation);
        Ok(CallId::new(index, generation))
    }

    pub fn owner(&self, id: CallId) -> ArenaResult<ParticipantId> {
        Ok(ParticipantId(
            self.slot(id)?.owner_id.load(Ordering::Acquire),
        ))
    }

    /// Checks that `caller` may execute `id`; returns the owner.
    pub fn authorize(&self, id: CallId, caller: ParticipantId) -> ArenaResult<ParticipantId> {
        let slot = self.slot(id)?;
        let owner = ParticipantId(slot.owner_id.load(Ordering::Acquire));
        if owner == caller || caller.is_kernel() || slot.restricted.load(Ordering::Acquire) == 0 {
            return Ok(owner);
        }
        if slot
            .granted
            .iter()
            .any(|grant| grant.load(Ordering::Acquire) == caller.raw())
        {
            Ok(owner)
        } else {
            Err(ArenaError::AccessDenied(caller.raw()))
        }
    }

    /// Grants `participant` the right to execute `id`. Owner only.
    pub fn add_permission(
        &self,
        id: CallId,
        owner: &Member,
        participant: ParticipantId,
    ) -> ArenaResult<()> {
        let slot = self.owned_slot(id, owner)?;
        if slot
            .granted
            .iter()
            .any(|grant| grant.load(Ordering::Acquire) == participant.raw())
        {
            return Ok(());
        }
        slot.granted
            .iter()
            .find(|grant| {
                grant
                    .compare_exchange(0, participant.raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .map(|_| ())
            .ok_or(ArenaError::Full("call permission"))
    }

    /// Drops every grant naming `participant`; returns how many.
    pub fn revoke_grants(&self, participant: ParticipantId) -> usize {
        let raw = participant.raw();
        slot::live(self.slots)
            .map(|(index, _)| {
                self.slots[index]
                    .granted
                    .iter()
                    .filter(|grant| {
                        grant
                            .compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    })
                    .count()
            })
            .sum()
    }

    /// Removes a call. Owner only.
    pub fn destroy(&self, id: CallId, owner: &Member) -> ArenaResult<()> {
        let slot = self.owned_slot(id, owner)?;
        if slot.tag.release(id.generation()) {
            Ok(())
        } else {
            Err(ArenaError::Destroyed("call"))
        }
    }

    /// Frees every call `owner` registered.
    pub fn release_owned(&self, owner: &Member) -> SmallVec<[CallId; 8]> {
        let token = owner.token();
        slot::live(self.slots)
            .filter(|(index, _)| self.slots[*index].owner_token.load(Ordering::Acquire) == token)
            .filter_map(|(index, generation)| {
                self.slots[index]
                    .tag
                    .release(generation)
                    .then(|| CallId::new(index, generation))
            })
            .collect()
    }

    fn slot(&self, id: CallId) -> ArenaResult<&'a CallSlot> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.tag.is_live(id.generation()))
            .ok_or(ArenaError::Destroyed("call"))
    }

    fn owned_slot(&self, id: CallId, owner: &Member) -> ArenaResult<&'a CallSlot> {
        let slot = self.slot(id)?;
        if slot.owner_token.load(Ordering::Acquire) != owner.token() {
            return Err(ArenaError::AccessDenied(owner.id.raw()));
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;

    fn join(arena: &Arena, id: u32) -> Member {
        arena
            .participants()
            .register(ParticipantId(id), std::process::id() as i32)
            .unwrap()
    }

    #[test]
    fn listed_calls_check_grants() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (owner, guest, stranger) = (join(&arena, 1), join(&arena, 2), join(&arena, 3));
        let calls = arena.calls();
        let id = calls.create(&owner, Permissions::Listed).unwrap();

        assert_eq!(calls.authorize(id, owner.id).unwrap(), owner.id);
        assert!(matches!(
            calls.authorize(id, guest.id),
            Err(ArenaError::AccessDenied(2))
        ));
        calls.add_permission(id, &owner, guest.id).unwrap();
        calls.add_permission(id, &owner, guest.id).unwrap();
        assert_eq!(calls.authorize(id, guest.id).unwrap(), owner.id);
        assert!(calls.authorize(id, stranger.id).is_err());
        assert!(calls.authorize(id, ParticipantId::KERNEL).is_ok());
        assert!(matches!(
            calls.add_permission(id, &guest, stranger.id),
            Err(ArenaError::AccessDenied(2))
        ));
    }

    #[test]
    fn grants_are_bounded() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let owner = join(&arena, 1);
        let calls = arena.calls();
        let id = calls.create(&owner, Permissions::Listed).unwrap();
        for raw in 0..crate::MAX_CALL_PERMISSIONS as u32 {
            calls.add_permission(id, &owner, ParticipantId(10 + raw)).unwrap();
        }
        assert!(matches!(
            calls.add_permission(id, &owner, ParticipantId(99)),
            Err(ArenaError::Full(_))
        ));
    }

    #[test]
    fn revoked_grants_free_their_entries() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (owner, guest) = (join(&arena, 1), join(&arena, 2));
        let calls = arena.calls();
        let first = calls.create(&owner, Permissions::Listed).unwrap();
        let second = calls.create(&owner, Permissions::Listed).unwrap();
        calls.add_permission(first, &owner, guest.id).unwrap();
        calls.add_permission(second, &owner, guest.id).unwrap();
        calls.add_permission(second, &owner, ParticipantId(3)).unwrap();

        assert_eq!(calls.revoke_grants(guest.id), 2);
        assert!(calls.authorize(first, guest.id).is_err());
        assert!(calls.authorize(second, guest.id).is_err());
        assert!(calls.authorize(second, ParticipantId(3)).is_ok());
        assert_eq!(calls.revoke_grants(guest.id), 0);
    }

    #[test]
    fn only_the_owner_destroys() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (owner, other) = (join(&arena, 1), join(&arena, 2));
        let calls = arena.calls();
        let id = calls.create(&owner, Permissions::Anyone).unwrap();
        assert!(calls.destroy(id, &other).is_err());
        calls.destroy(id, &owner).unwrap();
        assert!(matches!(calls.owner(id), Err(ArenaError::Destroyed(_))));
    }

    #[test]
    fn departed_owner_loses_its_calls() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let (owner, other) = (join(&arena, 1), join(&arena, 2));
        let calls = arena.calls();
        let mine = calls.create(&owner, Permissions::Anyone).unwrap();
        let theirs = calls.create(&other, Permissions::Anyone).unwrap();
        assert_eq!(calls.release_owned(&owner).as_slice(), &[mine]);
        assert!(calls.owner(theirs).is_ok());
    }
}
