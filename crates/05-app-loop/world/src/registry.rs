//! The per-process table of joined worlds.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use fusion_transport::{CharDeviceOpener, DeviceOpener, Role};
use parking_lot::Mutex;

use crate::config::FusionConfig;
use crate::dispatch::{Dispatch, QuiesceGuard};
use crate::fork::{ForkHooks, ForkState};
use crate::world::{World, WorldCore};
use crate::{FusionError, FusionResult};

/// Worlds one process can be joined to at a time.
pub const MAX_WORLDS: usize = 8;

struct Entry {
    core: Arc<WorldCore>,
    handles: usize,
}

pub(crate) struct RegistryInner {
    config: Arc<FusionConfig>,
    opener: Arc<dyn DeviceOpener>,
    worlds: Mutex<[Option<Entry>; MAX_WORLDS]>,
    hooks: Mutex<Vec<ForkHooks>>,
    fork_guards: Mutex<Vec<QuiesceGuard>>,
}

impl RegistryInner {
    /// Drops one handle of `core`; the last one shuts the world down.
    pub(crate) fn release(&self, core: &Arc<WorldCore>, emergency: bool) {
        let index = core.index() as usize;
        let last = {
            let mut worlds = self.worlds.lock();
            match worlds[index].as_mut() {
                Some(entry) if Arc::ptr_eq(&entry.core, core) => {
                    entry.handles -= 1;
                    if entry.handles == 0 {
                        worlds[index].take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(entry) = last {
            entry.core.shutdown(emergency);
        }
    }
}

/// Joins and tracks worlds for this process.
///
/// Cloning shares the table; joining the same index through any clone
/// returns another handle to the same world.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn config(&self) -> &FusionConfig {
        &self.inner.config
    }

    /// Joins world `index`, or the first free index for `-1`.
    ///
    /// Joining an index this process already joined hands out another
    /// handle after checking `abi` and `role` against the first join.
    pub fn join(&self, index: i32, abi: u32, role: Role) -> FusionResult<World> {
        let role = if self.inner.config.force_slave {
            Role::Slave
        } else {
            role
        };
        let mut worlds = self.inner.worlds.lock();

        let index = match index {
            -1 if role == Role::Slave => {
                return Err(FusionError::InvalidArgument(
                    "a slave cannot join an unspecified world",
                ))
            }
            -1 => return self.join_free(&mut worlds, abi),
            index if index < 0 || index as usize >= MAX_WORLDS => {
                return Err(FusionError::InvalidArgument("world index out of range"))
            }
            index => index as usize,
        };

        if let Some(entry) = worlds[index].as_mut() {
            entry.core.check_reentry(abi, role)?;
            entry.handles += 1;
            tracing::debug!("world {index}: {} handle(s)", entry.handles);
            return Ok(World::new(Arc::clone(&entry.core), Arc::clone(&self.inner)));
        }

        let core = WorldCore::enter(&self.inner.config, &self.inner.opener, index as u32, abi, role)?;
        worlds[index] = Some(Entry {
            core: Arc::clone(&core),
            handles: 1,
        });
        Ok(World::new(core, Arc::clone(&self.inner)))
    }

    fn join_free(&self, worlds: &mut [Option<Entry>; MAX_WORLDS], abi: u32) -> FusionResult<World> {
        for index in 0..MAX_WORLDS {
            if worlds[index].is_some() {
                continue;
            }
            match WorldCore::enter(&self.inner.config, &self.inner.opener, index as u32, abi, Role::Master) {
                Ok(core) => {
                    worlds[index] = Some(Entry {
                        core: Arc::clone(&core),
                        handles: 1,
                    });
                    return Ok(World::new(core, Arc::clone(&self.inner)));
                }
                Err(FusionError::Unsupported(reason)) => {
                    tracing::debug!("world {index} is taken: {reason}");
                }
                Err(err) => return Err(err),
            }
        }
        Err(FusionError::LimitExceeded("worlds"))
    }

    /// Indices this process is currently joined to.
    pub fn joined(&self) -> Vec<u32> {
        self.inner
            .worlds
            .lock()
            .iter()
            .flatten()
            .map(|entry| entry.core.index())
            .collect()
    }

    /// Adds process-wide hooks run around [`Registry::before_fork`] and
    /// [`Registry::after_fork`].
    pub fn register_fork_hooks(
        &self,
        prepare: impl Fn() + Send + Sync + 'static,
        parent: impl Fn() + Send + Sync + 'static,
        child: impl Fn() + Send + Sync + 'static,
    ) {
        self.inner.hooks.lock().push(ForkHooks {
            prepare: Box::new(prepare),
            parent: Box::new(parent),
            child: Box::new(child),
        });
    }

    /// Call right before `fork(2)`. Holds every dispatch loop between
    /// messages until [`Registry::after_fork`].
    pub fn before_fork(&self) {
        let cores = self.cores();
        let mut guards = self.inner.fork_guards.lock();
        for core in &cores {
            core.run_fork_callback(ForkState::Prepare);
            guards.push(Dispatch::quiesce(core));
        }
        drop(guards);
        for hooks in self.inner.hooks.lock().iter() {
            (hooks.prepare)();
        }
    }

    /// Call in both processes right after `fork(2)`.
    ///
    /// In the child, worlds set to [`crate::ForkAction::Close`] are dropped
    /// and worlds set to [`crate::ForkAction::Fork`] get a participant of
    /// their own.
    pub fn after_fork(&self, is_child: bool) {
        self.inner.fork_guards.lock().clear();
        let cores = self.cores();
        if !is_child {
            for core in &cores {
                core.run_fork_callback(ForkState::Parent);
            }
            for hooks in self.inner.hooks.lock().iter() {
                (hooks.parent)();
            }
            return;
        }

        for core in &cores {
            let kept = match core.after_fork_in_child() {
                Ok(kept) => kept,
                Err(err) => {
                    tracing::error!("world {}: forked child could not rejoin: {err}", core.index());
                    false
                }
            };
            if !kept {
                let mut worlds = self.inner.worlds.lock();
                let slot = &mut worlds[core.index() as usize];
                if slot.as_ref().is_some_and(|entry| Arc::ptr_eq(&entry.core, core)) {
                    slot.take();
                }
            }
            core.run_fork_callback(ForkState::Child);
        }
        for hooks in self.inner.hooks.lock().iter() {
            (hooks.child)();
        }
    }

    fn cores(&self) -> Vec<Arc<WorldCore>> {
        self.inner
            .worlds
            .lock()
            .iter()
            .flatten()
            .map(|entry| Arc::clone(&entry.core))
            .collect()
    }
}

/// Builds a [`Registry`].
pub struct RegistryBuilder {
    config: Option<FusionConfig>,
    opener: Option<Arc<dyn DeviceOpener>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            opener: None,
        }
    }

    pub fn config(mut self, config: FusionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Reads the configuration from the `FUSION_*` environment variables.
    pub fn config_from_env(self) -> Self {
        self.config(FusionConfig::from_env())
    }

    /// Overrides how the device backend opens its device.
    pub fn device_opener(mut self, opener: Arc<dyn DeviceOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let config = self.config.ok_or_else(|| anyhow!("missing fusion config"))?;
        if config.enter_timeout_ms == 0 {
            return Err(anyhow!("enter timeout must be positive"));
        }
        let opener = self.opener.unwrap_or_else(|| match &config.device_path {
            Some(path) => Arc::new(CharDeviceOpener::with_path(path.clone())),
            None => Arc::new(CharDeviceOpener::default()),
        });
        Ok(Registry {
            inner: Arc::new(RegistryInner {
                config: Arc::new(config),
                opener,
                worlds: Mutex::new(Default::default()),
                hooks: Mutex::new(Vec::new()),
                fork_guards: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
