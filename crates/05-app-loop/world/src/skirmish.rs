use fusion_arena::{Acquired, SkirmishId};
use fusion_transport::ParticipantId;

use crate::world::WorldCore;
use crate::FusionResult;

impl WorldCore {
    pub fn skirmish_create(&self) -> FusionResult<SkirmishId> {
        self.ensure_open()?;
        Ok(self.arena.skirmishes().create()?)
    }

    /// Blocks until the calling thread holds `id` for this participant.
    /// Re-entrant on that thread.
    pub fn skirmish_prevail(&self, id: SkirmishId) -> FusionResult<Acquired> {
        self.ensure_open()?;
        Ok(self.arena.skirmishes().prevail(id, &self.member())?)
    }

    /// Like [`WorldCore::skirmish_prevail`] but fails with `Busy` instead of
    /// waiting.
    pub fn skirmish_swoop(&self, id: SkirmishId) -> FusionResult<Acquired> {
        self.ensure_open()?;
        Ok(self.arena.skirmishes().swoop(id, &self.member())?)
    }

    pub fn skirmish_dismiss(&self, id: SkirmishId) -> FusionResult<()> {
        self.ensure_open()?;
        Ok(self.arena.skirmishes().dismiss(id, &self.member())?)
    }

    pub fn skirmish_lock_count(&self, id: SkirmishId) -> FusionResult<u32> {
        Ok(self.arena.skirmishes().lock_count(id, &self.member())?)
    }

    pub fn skirmish_holder(&self, id: SkirmishId) -> FusionResult<Option<ParticipantId>> {
        Ok(self.arena.skirmishes().holder(id)?)
    }

    pub fn skirmish_destroy(&self, id: SkirmishId) -> FusionResult<()> {
        self.ensure_open()?;
        Ok(self.arena.skirmishes().destroy(id, &self.member())?)
    }
}
