//! Per-world receive loop.
//!
//! One thread per joined world pulls messages off the transport and routes
//! them. The loop can be held between messages ([`QuiesceGuard`]) and is
//! stopped by [`Dispatch::stop`] when the world is left.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fusion_arena::{ReactorId, SubscriptionId};
use fusion_transport::schema::{self, EnterStatus};
use fusion_transport::{Message, MessageKind, Target, Transport, TransportError};
use parking_lot::{Condvar, Mutex};

use crate::world::{Identity, WorldCore};
use crate::FusionResult;

/// Where the loop is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPhase {
    Running,
    /// Held between messages by at least one [`QuiesceGuard`].
    Quiescing,
    Stopped,
}

struct LoopState {
    phase: LoopPhase,
    /// A message is being handled.
    busy: bool,
    quiescers: usize,
    /// Bumped on every start; older loops exit when they see a newer one.
    generation: u64,
    thread: Option<ThreadId>,
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// A thread plus a way to learn that it ended.
struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> io::Result<Self> {
        let (alive, done) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name).spawn(move || {
            let _alive = alive;
            body();
        })?;
        Ok(Self { handle, done })
    }

    fn id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Joins the thread if it ends within `timeout`; detaches it otherwise.
    fn join_within(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::error!("fusion worker thread panicked");
                }
                true
            }
            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

struct Deferred {
    queue: Sender<Message>,
    worker: Worker,
}

pub(crate) struct Dispatch {
    state: Mutex<LoopState>,
    changed: Condvar,
    worker: Mutex<Option<Worker>>,
    deferred: Mutex<Option<Deferred>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            state: Mutex::new(LoopState {
                phase: LoopPhase::Stopped,
                busy: false,
                quiescers: 0,
                generation: 0,
                thread: None,
            }),
            changed: Condvar::new(),
            worker: Mutex::new(None),
            deferred: Mutex::new(None),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

impl Dispatch {
    /// Starts a loop for the current identity of `core`, superseding any
    /// loop that ran before.
    pub(crate) fn start(core: &Arc<WorldCore>) -> FusionResult<()> {
        let dispatch = &core.dispatch;
        let identity = core.identity();
        let generation = {
            let mut state = dispatch.state.lock();
            state.generation += 1;
            state.phase = LoopPhase::Running;
            state.busy = false;
            state.generation
        };

        let worker = Worker::spawn(format!("fusion-{}", core.index()), {
            let core = Arc::clone(core);
            move || run(core, identity, generation)
        })?;
        dispatch.worker.lock().replace(worker);

        if core.config.defer_destructors {
            let mut deferred = dispatch.deferred.lock();
            if deferred.is_none() {
                let (queue, incoming) = crossbeam_channel::unbounded::<Message>();
                let worker = Worker::spawn(format!("fusion-{}-deferred", core.index()), {
                    let core = Arc::clone(core);
                    move || {
                        for message in incoming {
                            core.serve_call(&message);
                        }
                    }
                })?;
                *deferred = Some(Deferred { queue, worker });
            }
        }
        Ok(())
    }

    pub(crate) fn phase(&self) -> LoopPhase {
        self.state.lock().phase
    }

    pub(crate) fn is_dispatch_thread(&self) -> bool {
        self.state.lock().thread == Some(thread::current().id())
    }

    /// Waits for the loop to be free; `false` tells the loop to exit.
    fn begin_message(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.phase == LoopPhase::Stopped || state.generation != generation {
                return false;
            }
            if state.phase == LoopPhase::Running {
                state.busy = true;
                return true;
            }
            self.changed.wait(&mut state);
        }
    }

    fn end_message(&self) {
        self.state.lock().busy = false;
        self.changed.notify_all();
    }

    /// Holds the loop between messages until the guard drops.
    pub(crate) fn quiesce(core: &Arc<WorldCore>) -> QuiesceGuard {
        let dispatch = &core.dispatch;
        let mut state = dispatch.state.lock();
        if state.thread == Some(thread::current().id()) {
            return QuiesceGuard {
                core: Arc::clone(core),
                counted: false,
            };
        }
        state.quiescers += 1;
        if state.phase == LoopPhase::Running {
            state.phase = LoopPhase::Quiescing;
        }
        while state.busy {
            dispatch.changed.wait(&mut state);
        }
        QuiesceGuard {
            core: Arc::clone(core),
            counted: true,
        }
    }

    fn release_quiesce(&self) {
        let mut state = self.state.lock();
        state.quiescers -= 1;
        if state.quiescers == 0 && state.phase == LoopPhase::Quiescing {
            state.phase = LoopPhase::Running;
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Hands a kernel-originated call to the deferred thread, giving it
    /// back when there is none.
    fn defer(&self, message: Message) -> Option<Message> {
        match self.deferred.lock().as_ref() {
            Some(deferred) => deferred.queue.send(message).err().map(|err| err.into_inner()),
            None => Some(message),
        }
    }

    /// Runs `cleanup` once the current message is handled, or right away
    /// when called off the dispatch thread.
    pub(crate) fn add_cleanup(&self, cleanup: Cleanup) {
        if self.is_dispatch_thread() {
            self.cleanups.lock().push(cleanup);
        } else {
            cleanup();
        }
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Stops the loop and the deferred thread.
    ///
    /// Waits up to `timeout` for each unless `emergency` is set or the
    /// caller is the loop itself; threads that do not finish are detached.
    pub(crate) fn stop(&self, transport: &dyn Transport, emergency: bool, timeout: Duration) {
        let on_loop = {
            let mut state = self.state.lock();
            state.phase = LoopPhase::Stopped;
            state.thread == Some(thread::current().id())
        };
        self.changed.notify_all();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = transport.wake() {
                tracing::debug!("waking the dispatch loop failed: {err}");
            }
            if !emergency && !on_loop && !worker.join_within(timeout) {
                tracing::warn!("dispatch loop did not stop within {timeout:?}, detaching it");
            }
        }

        let deferred = self.deferred.lock().take();
        if let Some(Deferred { queue, worker }) = deferred {
            drop(queue);
            let on_deferred = worker.id() == thread::current().id();
            if !emergency && !on_deferred && !worker.join_within(timeout) {
                tracing::warn!("deferred call thread did not stop within {timeout:?}, detaching it");
            }
        }
        self.state.lock().thread = None;
    }

    /// Forgets the threads without waiting; used when a forked child
    /// drops a world it inherited.
    pub(crate) fn abandon(&self) {
        self.state.lock().phase = LoopPhase::Stopped;
        self.changed.notify_all();
        self.worker.lock().take();
        self.deferred.lock().take();
    }
}

/// Keeps a world's dispatch loop paused between messages while alive.
///
/// Taken on the dispatch thread itself it does nothing.
#[must_use = "the loop resumes when the guard drops"]
pub struct QuiesceGuard {
    core: Arc<WorldCore>,
    counted: bool,
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        if self.counted {
            self.core.dispatch.release_quiesce();
        }
    }
}

fn run(core: Arc<WorldCore>, identity: Arc<Identity>, generation: u64) {
    let index = core.index();
    {
        let mut state = core.dispatch.state.lock();
        if state.generation != generation {
            return;
        }
        state.thread = Some(thread::current().id());
    }
    tracing::debug!("dispatch loop of world {index} started as {}", identity.member.id);
    loop {
        let message = match identity.transport.recv_blocking() {
            Ok(message) => message,
            Err(TransportError::Destroyed) => break,
            Err(TransportError::Wire(err)) => {
                tracing::warn!("world {index}: dropping malformed frame: {err}");
                continue;
            }
            Err(err) => {
                tracing::error!("world {index}: receive failed, stopping dispatch: {err}");
                break;
            }
        };
        if !core.dispatch.begin_message(generation) {
            break;
        }
        core.route(&*identity.transport, message);
        core.dispatch.run_cleanups();
        core.dispatch.end_message();
    }
    tracing::debug!("dispatch loop of world {index} exited");
}

impl WorldCore {
    fn route(&self, transport: &dyn Transport, message: Message) {
        match message.kind {
            MessageKind::Send => {}
            MessageKind::Enter => self.answer_enter(transport, &message),
            MessageKind::EnterAck => tracing::debug!(
                "world {}: stray enter acknowledgement from {}",
                self.index(),
                message.sender
            ),
            MessageKind::Leave => self.peer_gone(message.sender, message.object, true),
            MessageKind::Call | MessageKind::Call3 => {
                if message.sender.is_kernel() {
                    if let Some(message) = self.dispatch.defer(message) {
                        self.serve_call(&message);
                    }
                } else {
                    self.serve_call(&message);
                }
            }
            MessageKind::CallReturn => self.calls.complete(&message),
            MessageKind::Reactor => {
                let (Some(reactor), Some(subscription)) = (
                    ReactorId::from_raw(message.object),
                    SubscriptionId::from_raw(message.aux),
                ) else {
                    tracing::warn!(
                        "world {}: reactor frame without ids from {}",
                        self.index(),
                        message.sender
                    );
                    return;
                };
                self.reactions.deliver(
                    self,
                    reactor,
                    message.channel,
                    message.sender,
                    &message.payload,
                );
                self.arena.reactors().finish_delivery(subscription);
            }
        }
    }

    /// Master side of the socket handshake.
    fn answer_enter(&self, transport: &dyn Transport, message: &Message) {
        let status = match schema::decode_enter(&message.payload) {
            Ok(_) if !self.is_master() => EnterStatus::Refused,
            Ok(request) if request.abi == self.abi() => EnterStatus::Ok,
            Ok(request) => {
                tracing::warn!(
                    "world {}: participant {} runs ABI {}, refusing",
                    self.index(),
                    message.sender,
                    request.abi
                );
                EnterStatus::VersionMismatch
            }
            Err(err) => {
                tracing::warn!("world {}: unreadable enter request: {err}", self.index());
                EnterStatus::Refused
            }
        };
        let ack = match schema::encode_ack(status, self.abi()) {
            Ok(payload) => Message::new(MessageKind::EnterAck, self.id()).with_payload(payload),
            Err(err) => {
                tracing::error!(
                    "world {}: encoding enter acknowledgement failed: {err}",
                    self.index()
                );
                return;
            }
        };
        if let Err(err) = transport.send(Target::Participant(message.sender), &ack) {
            tracing::warn!(
                "world {}: acknowledging {} failed: {err}",
                self.index(),
                message.sender
            );
        }
    }

    pub fn loop_phase(&self) -> LoopPhase {
        self.dispatch.phase()
    }

    /// True on this world's dispatch thread, i.e. inside a handler or
    /// reaction delivered by the loop.
    pub fn in_dispatch(&self) -> bool {
        self.dispatch.is_dispatch_thread()
    }

    /// Runs `cleanup` after the message being dispatched, or immediately
    /// outside the dispatch thread.
    pub fn add_dispatch_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.dispatch.add_cleanup(Box::new(cleanup));
    }
}
