//! A joined world: the shared arena, this process's transport endpoint and
//! the process-local state layered on top of them.

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use fusion_arena::{Arena, CallId, Member, Notification, RefId, SharedHeap, ShmBlock};
use fusion_transport::wire::flags;
use fusion_transport::{
    BackendKind, CooperativeTransport, DeviceOpener, DeviceTransport, EnterRequest, Message,
    MessageKind, ParticipantId, Role, SocketTransport, Target, Transport,
};
use parking_lot::Mutex;

use crate::calls::CallState;
use crate::config::{BackendChoice, FusionConfig};
use crate::dispatch::{Dispatch, QuiesceGuard};
use crate::fork::{ForkAction, ForkCallback, ForkState};
use crate::reactor::Reactions;
use crate::refs::LocalRefs;
use crate::registry::RegistryInner;
use crate::{FusionError, FusionResult};

/// Told about every participant that leaves or is evicted.
pub type LeaveCallback = Arc<dyn Fn(&WorldCore, ParticipantId) + Send + Sync>;

/// The endpoint this process is known by. Replaced when a forked child
/// takes on an identity of its own.
pub(crate) struct Identity {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) member: Member,
}

/// Per-process state of one world, shared by every [`World`] handle to it.
pub struct WorldCore {
    index: u32,
    abi: u32,
    pub(crate) config: Arc<FusionConfig>,
    pub(crate) arena: Arena,
    identity: ArcSwap<Identity>,
    pub(crate) refs: LocalRefs,
    pub(crate) calls: CallState,
    pub(crate) reactions: Reactions,
    pub(crate) dispatch: Dispatch,
    leave_callback: Mutex<Option<LeaveCallback>>,
    fork_callback: Mutex<Option<ForkCallback>>,
    fork_action: Mutex<ForkAction>,
    closed: AtomicBool,
}

impl WorldCore {
    pub(crate) fn enter(
        config: &Arc<FusionConfig>,
        opener: &Arc<dyn DeviceOpener>,
        index: u32,
        abi: u32,
        role: Role,
    ) -> FusionResult<Arc<Self>> {
        let pid = current_pid();
        let request = EnterRequest {
            world_index: index,
            abi,
            pid,
            role,
        };
        let transport: Box<dyn Transport> = match config.backend {
            BackendChoice::Socket => Box::new(SocketTransport::enter(
                &config.rundir,
                &request,
                config.enter_timeout(),
            )?),
            BackendChoice::Device => Box::new(DeviceTransport::enter(Arc::clone(opener), &request)?),
            BackendChoice::Cooperative => Box::new(CooperativeTransport::enter(&request)?),
        };
        let id = transport.local_id();

        let arena = match map_arena(config, &*transport, index, abi) {
            Ok(arena) => arena,
            Err(err) => {
                abandon(config, &*transport, index);
                return Err(err);
            }
        };
        let (member, stale) = match arena.participants().take_over(id, pid) {
            Ok(registered) => registered,
            Err(err) => {
                abandon(config, &*transport, index);
                return Err(err.into());
            }
        };

        let core = Arc::new(Self {
            index,
            abi,
            config: Arc::clone(config),
            arena,
            identity: ArcSwap::from_pointee(Identity { transport, member }),
            refs: LocalRefs::default(),
            calls: CallState::default(),
            reactions: Reactions::default(),
            dispatch: Dispatch::default(),
            leave_callback: Mutex::new(None),
            fork_callback: Mutex::new(None),
            fork_action: Mutex::new(ForkAction::default()),
            closed: AtomicBool::new(false),
        });

        if let Some(stale) = stale {
            tracing::warn!("world {index}: reclaiming stale entry of participant {id}");
            core.evict(&stale, false);
        }
        if let Err(err) = Dispatch::start(&core) {
            core.closed.store(true, Ordering::Release);
            let identity = core.identity.load();
            core.arena.evict(&identity.member, &identity.member);
            abandon(config, &*identity.transport, index);
            return Err(err);
        }

        tracing::info!(
            "joined world {index} as participant {id} ({:?} backend, requested {role:?})",
            config.backend
        );
        Ok(core)
    }

    /// Leaves the world for good. Runs once; later calls do nothing.
    pub(crate) fn shutdown(&self, emergency: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let identity = self.identity.load_full();
        let me = identity.member;

        self.calls.fail_all();
        self.dispatch
            .stop(&*identity.transport, emergency, self.config.leave_timeout());

        let remaining = if emergency {
            None
        } else {
            self.arena.evict(&me, &me).map(|eviction| {
                self.deliver(eviction.notifications);
                eviction.remaining
            })
        };
        self.announce_departure(&identity, emergency);
        if let Err(err) = identity.transport.leave(emergency) {
            tracing::warn!("world {}: transport leave failed: {err}", self.index);
        }
        if remaining == Some(0) {
            self.remove_backing(&*identity.transport);
        }
        tracing::info!(
            "participant {} left world {} (emergency: {emergency})",
            me.id,
            self.index
        );
    }

    /// Child side of a fork. Returns whether the world stays joined.
    pub(crate) fn after_fork_in_child(self: &Arc<Self>) -> FusionResult<bool> {
        let old = self.identity.load_full();
        if *self.fork_action.lock() == ForkAction::Close {
            self.forget(&old);
            return Ok(false);
        }

        let request = EnterRequest {
            world_index: self.index,
            abi: self.abi,
            pid: current_pid(),
            role: Role::Slave,
        };
        let Some(transport) = old.transport.fork(&request)? else {
            tracing::warn!(
                "world {}: {:?} backend cannot fork an identity, closing it in the child",
                self.index,
                old.transport.kind()
            );
            self.forget(&old);
            return Ok(false);
        };

        let id = transport.local_id();
        let (member, stale) = self.arena.participants().take_over(id, request.pid)?;
        if let Some(stale) = stale {
            self.arena.evict(&stale, &member);
        }
        let duplicated = self.arena.refs().duplicate(&old.member, &member);
        old.transport.detach();
        self.identity.store(Arc::new(Identity { transport, member }));
        Dispatch::start(self)?;
        tracing::info!(
            "forked child of participant {} is participant {id} in world {} ({duplicated} ref(s) duplicated)",
            old.member.id,
            self.index
        );
        Ok(true)
    }

    fn forget(&self, identity: &Identity) {
        self.closed.store(true, Ordering::Release);
        identity.transport.detach();
        self.dispatch.abandon();
        self.calls.fail_all();
    }

    /// Rejects re-entry with another ABI or the opposite role.
    pub(crate) fn check_reentry(&self, abi: u32, role: Role) -> FusionResult<()> {
        if abi != self.abi {
            return Err(FusionError::VersionMismatch {
                expected: abi,
                found: self.abi,
            });
        }
        match role {
            Role::Slave if self.is_master() => Err(FusionError::Unsupported(
                "already the master of this world",
            )),
            Role::Master if !self.is_master() => {
                Err(FusionError::Unsupported("already a slave of this world"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_open(&self) -> FusionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FusionError::Destroyed("world"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn identity(&self) -> Arc<Identity> {
        self.identity.load_full()
    }

    pub(crate) fn member(&self) -> Member {
        self.identity.load().member
    }

    /// Sends to one participant; a vanished recipient is evicted.
    pub(crate) fn send_to(&self, target: ParticipantId, message: &Message) -> FusionResult<()> {
        let result = self
            .identity
            .load()
            .transport
            .send(Target::Participant(target), message);
        match result {
            Ok(()) => Ok(()),
            Err(fusion_transport::TransportError::Destroyed) => {
                self.peer_gone(target, 0, false);
                Err(FusionError::Destroyed("participant"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cleans up after a participant that left or was found dead.
    ///
    /// `raw` pins the exact table entry when the departure notice carried it.
    pub(crate) fn peer_gone(&self, id: ParticipantId, raw: u64, announced: bool) {
        if id.is_kernel() || id == self.id() {
            return;
        }
        let evicted = self
            .arena
            .participants()
            .resolve(id, raw)
            .is_some_and(|member| self.evict(&member, announced));
        self.calls.fail_callee(id);
        if evicted || announced {
            let callback = self.leave_callback.lock().clone();
            if let Some(callback) = callback {
                callback(self, id);
            }
        }
    }

    /// Evicts `member`; `false` when someone else got there first.
    fn evict(&self, member: &Member, announced: bool) -> bool {
        let me = self.member();
        let Some(eviction) = self.arena.evict(member, &me) else {
            return false;
        };
        tracing::info!(
            "world {}: evicted participant {} ({}, {} call(s) dropped, {} zero notification(s))",
            self.index,
            member.id,
            if announced { "announced" } else { "detected" },
            eviction.calls.len(),
            eviction.notifications.len()
        );
        self.deliver(eviction.notifications);
        true
    }

    /// Sends zero notifications as kernel-originated oneway calls.
    pub(crate) fn deliver(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.notify_zero(
                notification.owner,
                notification.call,
                notification.arg,
                notification.reference,
            );
        }
    }

    pub(crate) fn notify_zero(&self, owner: ParticipantId, call: CallId, arg: i32, reference: RefId) {
        let message = Message::new(MessageKind::Call, ParticipantId::KERNEL)
            .with_flags(flags::ONEWAY)
            .with_object(call.raw())
            .with_arg(arg)
            .with_aux(reference.raw());
        if let Err(err) = self.send_to(owner, &message) {
            tracing::debug!("zero notification of {reference:?} to {owner} dropped: {err}");
        }
    }

    fn announce_departure(&self, identity: &Identity, emergency: bool) {
        let transport = &identity.transport;
        if !transport.is_multi() || transport.notifies_departure() {
            return;
        }
        let me = identity.member;
        let mut notice = Message::new(MessageKind::Leave, me.id).with_object(me.to_raw());
        if emergency {
            notice = notice.with_flags(flags::EMERGENCY);
        }

        let recipients: Vec<ParticipantId> = if me.id.is_master() && !emergency {
            self.arena
                .participants()
                .active()
                .into_iter()
                .map(|member| member.id)
                .filter(|id| *id != me.id)
                .collect()
        } else if me.id.is_master() {
            Vec::new()
        } else {
            vec![ParticipantId::MASTER]
        };
        for id in recipients {
            if let Err(err) = transport.send(Target::Participant(id), &notice) {
                tracing::debug!("departure notice to {id} failed: {err}");
            }
        }
    }

    fn remove_backing(&self, transport: &dyn Transport) {
        if let Err(err) = transport.remove_backing() {
            tracing::warn!("world {}: removing transport backing failed: {err}", self.index);
        }
        if self.arena.is_file_backed() {
            let path = Arena::core_path(&self.config.tmpfs, self.index);
            if let Err(err) = Arena::unlink(&path) {
                tracing::warn!("world {}: removing {} failed: {err}", self.index, path.display());
            }
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn abi(&self) -> u32 {
        self.abi
    }

    pub fn id(&self) -> ParticipantId {
        self.identity.load().member.id
    }

    pub fn is_master(&self) -> bool {
        self.id().is_master()
    }

    /// False on the single-process backend.
    pub fn is_multi(&self) -> bool {
        self.identity.load().transport.is_multi()
    }

    pub fn backend(&self) -> BackendKind {
        self.identity.load().transport.kind()
    }

    /// Shared clock epoch, set by the master when it created the world.
    pub fn start_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.arena.header().start_time_us())
    }

    pub fn tmpfs(&self) -> &Path {
        &self.config.tmpfs
    }

    pub fn participant_pid(&self, id: ParticipantId) -> Option<i32> {
        self.arena.participants().pid_of(id)
    }

    /// Participants currently registered, this one included.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.arena
            .participants()
            .active()
            .into_iter()
            .map(|member| member.id)
            .collect()
    }

    /// Shared tables of the world.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// World-shared allocator handed to collaborators.
    pub fn pool(&self) -> SharedHeap<'_> {
        self.arena.heap()
    }

    /// Publishes the root block. Master only.
    pub fn set_root(&self, block: ShmBlock) -> FusionResult<()> {
        self.ensure_open()?;
        if !self.is_master() {
            return Err(FusionError::AccessDenied);
        }
        self.arena.set_root(block);
        Ok(())
    }

    /// Heap offset of the root block, once the master published one.
    pub fn get_root(&self) -> Option<u64> {
        self.arena.root()
    }

    /// Waits until every queued message of the world was delivered.
    pub fn sync(&self, timeout: Duration) -> FusionResult<()> {
        self.ensure_open()?;
        Ok(self.identity.load().transport.sync(timeout)?)
    }

    pub fn set_leave_callback(
        &self,
        callback: impl Fn(&WorldCore, ParticipantId) + Send + Sync + 'static,
    ) {
        *self.leave_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_fork_callback(&self, callback: impl Fn(ForkAction, ForkState) + Send + Sync + 'static) {
        *self.fork_callback.lock() = Some(Arc::new(callback));
    }

    pub(crate) fn run_fork_callback(&self, state: ForkState) {
        let callback = self.fork_callback.lock().clone();
        if let Some(callback) = callback {
            callback(self.fork_action(), state);
        }
    }

    pub fn set_fork_action(&self, action: ForkAction) {
        *self.fork_action.lock() = action;
    }

    pub fn fork_action(&self) -> ForkAction {
        *self.fork_action.lock()
    }
}

fn map_arena(
    config: &FusionConfig,
    transport: &dyn Transport,
    index: u32,
    abi: u32,
) -> FusionResult<Arena> {
    if !transport.is_multi() {
        return Ok(Arena::anonymous(index, abi)?);
    }
    let path = Arena::core_path(&config.tmpfs, index);
    let arena = if transport.local_id().is_master() {
        Arena::create(&path, index, abi, config.shmfile_gid)?
    } else {
        Arena::open(&path, index, abi, config.enter_timeout())?
    };
    Ok(arena)
}

/// Undoes a half-finished join.
fn abandon(config: &FusionConfig, transport: &dyn Transport, index: u32) {
    if let Err(err) = transport.leave(true) {
        tracing::debug!("world {index}: leave after failed join: {err}");
    }
    if transport.local_id().is_master() && transport.is_multi() {
        if let Err(err) = transport.remove_backing() {
            tracing::debug!("world {index}: cleanup after failed join: {err}");
        }
        if let Err(err) = Arena::unlink(&Arena::core_path(&config.tmpfs, index)) {
            tracing::debug!("world {index}: cleanup after failed join: {err}");
        }
    }
}

pub(crate) fn current_pid() -> i32 {
    std::process::id() as i32
}

/// A handle returned by [`crate::Registry::join`].
///
/// Every handle must be left once; dropping one that was not left leaves it.
pub struct World {
    core: Arc<WorldCore>,
    registry: Arc<RegistryInner>,
    left: AtomicBool,
}

impl World {
    pub(crate) fn new(core: Arc<WorldCore>, registry: Arc<RegistryInner>) -> Self {
        Self {
            core,
            registry,
            left: AtomicBool::new(false),
        }
    }

    /// Drops this handle's hold on the world. The last handle of the process
    /// takes the participant out of the world; `emergency` skips the orderly
    /// teardown.
    pub fn leave(&self, emergency: bool) -> FusionResult<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.release(&self.core, emergency);
        Ok(())
    }

    /// Pauses the dispatch loop between messages until the guard drops.
    pub fn quiesce(&self) -> QuiesceGuard {
        Dispatch::quiesce(&self.core)
    }

    /// The shared core; two handles of one world return the same one.
    pub fn core(&self) -> &Arc<WorldCore> {
        &self.core
    }
}

impl Deref for World {
    type Target = WorldCore;

    fn deref(&self) -> &WorldCore {
        &self.core
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if let Err(err) = self.leave(false) {
            tracing::error!("leaving world {} on drop failed: {err}", self.core.index);
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("index", &self.core.index)
            .field("id", &self.core.id())
            .field("left", &self.left.load(Ordering::Relaxed))
            .finish()
    }
}
