//! Reference counting on top of the shared ref table.
//!
//! Global references go straight to the arena. Local references are counted
//! in-process first and only touch the arena when the local count leaves or
//! returns to zero, so one process contributes at most one count per ref for
//! all of its local holders.

use std::collections::HashMap;

use fusion_arena::{CallId, RefId};
use parking_lot::Mutex;

use crate::world::WorldCore;
use crate::{FusionError, FusionResult};

/// Where a reference is counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefScope {
    /// Counted in the shared table under this participant.
    #[default]
    Global,
    /// Counted in this process; the shared table sees one reference for all
    /// local holders.
    Local,
}

#[derive(Default)]
pub(crate) struct LocalRefs {
    counts: Mutex<HashMap<RefId, u32>>,
}

impl LocalRefs {
    /// `true` when this took the local count off zero.
    fn up(&self, id: RefId) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// `None` without a local count; `Some(true)` when it reached zero.
    fn down(&self, id: RefId) -> Option<bool> {
        let mut counts = self.counts.lock();
        let count = counts.get_mut(&id)?;
        *count -= 1;
        if *count == 0 {
            counts.remove(&id);
            Some(true)
        } else {
            Some(false)
        }
    }

    fn count(&self, id: RefId) -> u32 {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    fn forget(&self, id: RefId) {
        self.counts.lock().remove(&id);
    }
}

impl WorldCore {
    pub fn ref_create(&self) -> FusionResult<RefId> {
        self.ensure_open()?;
        Ok(self.arena.refs().create(&self.member())?)
    }

    pub fn ref_up(&self, id: RefId, scope: RefScope) -> FusionResult<()> {
        self.ensure_open()?;
        let me = self.member();
        match scope {
            RefScope::Global => {
                self.arena.refs().up(id, &me)?;
            }
            RefScope::Local => {
                if self.refs.up(id) {
                    if let Err(err) = self.arena.refs().up(id, &me) {
                        self.refs.down(id);
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops a reference. A watched ref reaching zero notifies the owner of
    /// the watch call.
    pub fn ref_down(&self, id: RefId, scope: RefScope) -> FusionResult<()> {
        self.ensure_open()?;
        if scope == RefScope::Local {
            match self.refs.down(id) {
                None => return Err(FusionError::InvalidArgument("no local reference held")),
                Some(false) => return Ok(()),
                Some(true) => {}
            }
        }
        let down = self.arena.refs().down(id, &self.member(), true)?;
        if let Some(watch) = down.watch {
            match self.arena.calls().owner(watch.call) {
                Ok(owner) => self.notify_zero(owner, watch.call, watch.arg, watch.reference),
                Err(err) => tracing::debug!("{id:?} reached zero, watch dropped: {err}"),
            }
        }
        Ok(())
    }

    /// Total count across the world.
    pub fn ref_stat(&self, id: RefId) -> FusionResult<i32> {
        Ok(self.arena.refs().stat(id)?)
    }

    /// Holders counted in this process under [`RefScope::Local`].
    pub fn ref_local_count(&self, id: RefId) -> u32 {
        self.refs.count(id)
    }

    /// Executes `call` with `arg` once the total count of `id` drops to zero.
    pub fn ref_watch(&self, id: RefId, call: CallId, arg: i32) -> FusionResult<()> {
        self.ensure_open()?;
        Ok(self.arena.refs().watch(id, &self.member(), call, arg)?)
    }

    pub fn ref_destroy(&self, id: RefId) -> FusionResult<()> {
        self.ensure_open()?;
        self.arena.refs().destroy(id, &self.member())?;
        self.refs.forget(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_ref() -> RefId {
        RefId::from_raw((1 << 32) | 3).unwrap()
    }

    #[test]
    fn local_counts_report_zero_edges() {
        let refs = LocalRefs::default();
        let id = some_ref();
        assert!(refs.up(id));
        assert!(!refs.up(id));
        assert_eq!(refs.count(id), 2);
        assert_eq!(refs.down(id), Some(false));
        assert_eq!(refs.down(id), Some(true));
        assert_eq!(refs.down(id), None);
        assert_eq!(refs.count(id), 0);
    }

    #[test]
    fn forgetting_drops_the_local_count() {
        let refs = LocalRefs::default();
        let id = some_ref();
        refs.up(id);
        refs.forget(id);
        assert_eq!(refs.count(id), 0);
        assert!(refs.up(id));
    }
}
