//! Remote procedure calls between participants.
//!
//! A call is registered in the arena with an owner; its handler lives in the
//! owner's process. Executing a call either runs the handler directly (when
//! the caller owns it) or sends a CALL frame and waits for the matching
//! CALL_RETURN.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fusion_arena::{ArenaError, CallId, Permissions};
use fusion_transport::wire::flags;
use fusion_transport::{Message, MessageKind, ParticipantId};
use parking_lot::{Condvar, Mutex};

use crate::world::WorldCore;
use crate::{FusionError, FusionResult};

/// Status codes carried in the `channel` field of a CALL_RETURN.
mod status {
    pub const OK: u32 = 0;
    pub const DESTROYED: u32 = 1;
    pub const ACCESS_DENIED: u32 = 2;
}

/// Serves one call.
pub type CallHandler = Arc<dyn Fn(&CallRequest<'_>) -> CallOutcome + Send + Sync>;

/// One invocation as seen by the handler.
#[derive(Debug)]
pub struct CallRequest<'a> {
    /// [`ParticipantId::KERNEL`] for zero notifications.
    pub caller: ParticipantId,
    pub call: CallId,
    pub arg: i32,
    pub payload: &'a [u8],
    /// Needed to answer later after returning [`CallOutcome::Retain`].
    pub ticket: ReturnTicket,
}

/// Identifies the caller waiting for a retained call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReturnTicket {
    caller: ParticipantId,
    serial: u32,
    oneway: bool,
}

impl ReturnTicket {
    pub fn caller(&self) -> ParticipantId {
        self.caller
    }

    /// Oneway callers expect no answer.
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }
}

/// What a handler did with a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answer now.
    Return(CallReply),
    /// The handler answers later through [`WorldCore::call_return`].
    Retain,
}

impl CallOutcome {
    pub fn value(value: i32) -> Self {
        CallOutcome::Return(CallReply {
            value,
            payload: Vec::new(),
        })
    }

    pub fn reply(value: i32, payload: impl Into<Vec<u8>>) -> Self {
        CallOutcome::Return(CallReply {
            value,
            payload: payload.into(),
        })
    }
}

/// Result of a call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallReply {
    pub value: i32,
    pub payload: Vec<u8>,
}

/// How a call is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// Do not wait for a result.
    pub oneway: bool,
    /// Route through the transport even when the caller owns the call.
    pub no_direct: bool,
    /// Give up waiting after this long.
    pub timeout: Option<Duration>,
}

impl CallFlags {
    pub const SYNC: CallFlags = CallFlags {
        oneway: false,
        no_direct: false,
        timeout: None,
    };

    pub const ONEWAY: CallFlags = CallFlags {
        oneway: true,
        no_direct: false,
        timeout: None,
    };

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_direct(mut self) -> Self {
        self.no_direct = true;
        self
    }
}

struct Pending {
    callee: ParticipantId,
    result: Option<FusionResult<CallReply>>,
}

/// Handlers owned by this process and callers waiting for answers.
#[derive(Default)]
pub(crate) struct CallState {
    handlers: Mutex<HashMap<CallId, CallHandler>>,
    pending: Mutex<HashMap<u32, Pending>>,
    completed: Condvar,
    next_serial: AtomicU32,
}

impl CallState {
    fn handler(&self, call: CallId) -> Option<CallHandler> {
        self.handlers.lock().get(&call).cloned()
    }

    /// Registers a waiter for an answer from `callee`.
    fn open(&self, callee: ParticipantId) -> u32 {
        let serial = loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                break serial;
            }
        };
        self.pending.lock().insert(
            serial,
            Pending {
                callee,
                result: None,
            },
        );
        serial
    }

    fn abandon(&self, serial: u32) {
        if serial != 0 {
            self.pending.lock().remove(&serial);
        }
    }

    /// Hands `result` to the waiter on `serial` if it expects an answer
    /// from `from`.
    fn resolve(&self, serial: u32, from: ParticipantId, result: FusionResult<CallReply>) -> bool {
        let mut pending = self.pending.lock();
        match pending.get_mut(&serial) {
            Some(waiter) if waiter.result.is_none() => {
                if waiter.callee != from {
                    tracing::warn!(
                        "return for serial {serial} came from {from}, expected {}",
                        waiter.callee
                    );
                    return false;
                }
                waiter.result = Some(result);
                drop(pending);
                self.completed.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Takes a CALL_RETURN off the wire.
    pub(crate) fn complete(&self, message: &Message) {
        let result = match message.channel {
            status::OK => Ok(CallReply {
                value: message.arg,
                payload: message.payload.clone(),
            }),
            status::ACCESS_DENIED => Err(FusionError::AccessDenied),
            _ => Err(FusionError::Destroyed("call")),
        };
        if !self.resolve(message.serial, message.sender, result) {
            tracing::debug!(
                "dropped return for serial {} from {}",
                message.serial,
                message.sender
            );
        }
    }

    /// Wakes every caller waiting on `callee` with `Destroyed`.
    pub(crate) fn fail_callee(&self, callee: ParticipantId) {
        self.fail_where(|waiter| waiter.callee == callee, "call owner");
    }

    pub(crate) fn fail_all(&self) {
        self.fail_where(|_| true, "world");
    }

    fn fail_where(&self, matches: impl Fn(&Pending) -> bool, what: &'static str) {
        let mut pending = self.pending.lock();
        let mut failed = 0;
        for waiter in pending.values_mut() {
            if waiter.result.is_none() && matches(waiter) {
                waiter.result = Some(Err(FusionError::Destroyed(what)));
                failed += 1;
            }
        }
        drop(pending);
        if failed > 0 {
            self.completed.notify_all();
        }
    }

    /// Blocks until `serial` is answered.
    ///
    /// Every `poll` without an answer `callee_alive` is consulted; a callee
    /// that vanished without answering fails the call.
    fn wait(
        &self,
        serial: u32,
        timeout: Option<Duration>,
        poll: Duration,
        callee_alive: impl Fn() -> bool,
    ) -> FusionResult<CallReply> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut pending = self.pending.lock();
        loop {
            match pending.get_mut(&serial) {
                None => return Err(FusionError::Destroyed("call")),
                Some(waiter) => {
                    if let Some(result) = waiter.result.take() {
                        pending.remove(&serial);
                        return result;
                    }
                }
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                pending.remove(&serial);
                return Err(FusionError::Timeout("call"));
            }
            let wake = deadline.map_or(now + poll, |deadline| deadline.min(now + poll));
            if self.completed.wait_until(&mut pending, wake).timed_out() && !callee_alive() {
                let answered = pending
                    .get(&serial)
                    .is_some_and(|waiter| waiter.result.is_some());
                if !answered {
                    pending.remove(&serial);
                    return Err(FusionError::Destroyed("call owner"));
                }
            }
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.pending.lock().len()
    }
}

impl WorldCore {
    /// Registers a call owned by this participant.
    pub fn call_create(
        &self,
        permissions: Permissions,
        handler: impl Fn(&CallRequest<'_>) -> CallOutcome + Send + Sync + 'static,
    ) -> FusionResult<CallId> {
        self.ensure_open()?;
        let call = self.arena.calls().create(&self.member(), permissions)?;
        self.calls.handlers.lock().insert(call, Arc::new(handler));
        tracing::debug!("world {}: created {call:?}", self.index());
        Ok(call)
    }

    /// Lets `participant` execute a call created with [`Permissions::Listed`].
    pub fn call_add_permission(&self, call: CallId, participant: ParticipantId) -> FusionResult<()> {
        self.ensure_open()?;
        Ok(self
            .arena
            .calls()
            .add_permission(call, &self.member(), participant)?)
    }

    pub fn call_destroy(&self, call: CallId) -> FusionResult<()> {
        self.ensure_open()?;
        self.arena.calls().destroy(call, &self.member())?;
        self.calls.handlers.lock().remove(&call);
        Ok(())
    }

    /// Executes `call` with `arg` and returns the handler's value.
    pub fn call_execute(&self, call: CallId, arg: i32, flags: CallFlags) -> FusionResult<i32> {
        self.execute(MessageKind::Call, call, arg, &[], flags)
            .map(|reply| reply.value)
    }

    /// Executes `call` with a payload and returns the handler's reply.
    pub fn call_execute3(
        &self,
        call: CallId,
        arg: i32,
        payload: &[u8],
        flags: CallFlags,
    ) -> FusionResult<CallReply> {
        self.execute(MessageKind::Call3, call, arg, payload, flags)
    }

    /// Answers a call whose handler returned [`CallOutcome::Retain`].
    pub fn call_return(&self, ticket: ReturnTicket, reply: CallReply) -> FusionResult<()> {
        if ticket.oneway || ticket.serial == 0 {
            return Err(FusionError::InvalidArgument("oneway calls take no return"));
        }
        if ticket.caller == self.id() {
            return if self.calls.resolve(ticket.serial, ticket.caller, Ok(reply)) {
                Ok(())
            } else {
                Err(FusionError::Destroyed("caller"))
            };
        }
        self.send_return(ticket, status::OK, reply)
    }

    fn execute(
        &self,
        kind: MessageKind,
        call: CallId,
        arg: i32,
        payload: &[u8],
        flags: CallFlags,
    ) -> FusionResult<CallReply> {
        self.ensure_open()?;
        let me = self.member();
        let owner = self.arena.calls().authorize(call, me.id)?;
        if owner == me.id && !flags.no_direct {
            return self.execute_direct(call, arg, payload, flags);
        }
        if !flags.oneway && self.dispatch.is_dispatch_thread() {
            return Err(FusionError::Unsupported(
                "synchronous call from the dispatch thread",
            ));
        }

        let serial = if flags.oneway { 0 } else { self.calls.open(owner) };
        let mut message = Message::new(kind, me.id)
            .with_object(call.raw())
            .with_arg(arg)
            .with_serial(serial)
            .with_payload(payload);
        if flags.oneway {
            message = message.with_flags(flags::ONEWAY);
        }
        if let Err(err) = self.send_to(owner, &message) {
            self.calls.abandon(serial);
            return Err(err);
        }
        if flags.oneway {
            return Ok(CallReply::default());
        }
        self.calls
            .wait(serial, flags.timeout, self.config.call_poll(), || {
                self.arena.participants().find(owner).is_some()
            })
    }

    fn execute_direct(
        &self,
        call: CallId,
        arg: i32,
        payload: &[u8],
        flags: CallFlags,
    ) -> FusionResult<CallReply> {
        let me = self.id();
        let handler = self
            .calls
            .handler(call)
            .ok_or(FusionError::Destroyed("call"))?;
        let serial = if flags.oneway { 0 } else { self.calls.open(me) };
        let request = CallRequest {
            caller: me,
            call,
            arg,
            payload,
            ticket: ReturnTicket {
                caller: me,
                serial,
                oneway: flags.oneway,
            },
        };
        match handler(&request) {
            CallOutcome::Return(reply) => {
                self.calls.abandon(serial);
                Ok(if flags.oneway { CallReply::default() } else { reply })
            }
            CallOutcome::Retain if flags.oneway => {
                tracing::warn!("handler of {call:?} retained a oneway call");
                Ok(CallReply::default())
            }
            CallOutcome::Retain => self
                .calls
                .wait(serial, flags.timeout, self.config.call_poll(), || true),
        }
    }

    /// Runs an incoming CALL or CALL3 frame against the local handler.
    pub(crate) fn serve_call(&self, message: &Message) {
        let oneway = message.has_flag(flags::ONEWAY);
        let ticket = ReturnTicket {
            caller: message.sender,
            serial: message.serial,
            oneway,
        };
        let Some(call) = CallId::from_raw(message.object) else {
            tracing::warn!("call frame without a call id from {}", message.sender);
            return;
        };

        let handler = match self.arena.calls().authorize(call, message.sender) {
            Ok(owner) if owner == self.id() => self.calls.handler(call),
            Ok(_) => None,
            Err(ArenaError::AccessDenied(_)) => {
                self.reject(ticket, status::ACCESS_DENIED);
                return;
            }
            Err(err) => {
                tracing::debug!("{call:?} from {} not served: {err}", message.sender);
                None
            }
        };
        let Some(handler) = handler else {
            self.reject(ticket, status::DESTROYED);
            return;
        };

        let request = CallRequest {
            caller: message.sender,
            call,
            arg: message.arg,
            payload: &message.payload,
            ticket,
        };
        match handler(&request) {
            CallOutcome::Return(_) if oneway => {}
            CallOutcome::Return(reply) => {
                if let Err(err) = self.send_return(ticket, status::OK, reply) {
                    tracing::debug!("return of {call:?} to {} dropped: {err}", ticket.caller);
                }
            }
            CallOutcome::Retain if oneway => {
                tracing::warn!(
                    "handler of {call:?} retained a oneway call from {}",
                    message.sender
                )
            }
            CallOutcome::Retain => {}
        }
    }

    fn reject(&self, ticket: ReturnTicket, code: u32) {
        if ticket.oneway {
            return;
        }
        if let Err(err) = self.send_return(ticket, code, CallReply::default()) {
            tracing::debug!("rejecting call of {} failed: {err}", ticket.caller);
        }
    }

    fn send_return(&self, ticket: ReturnTicket, code: u32, reply: CallReply) -> FusionResult<()> {
        let message = Message::new(MessageKind::CallReturn, self.id())
            .with_serial(ticket.serial)
            .with_channel(code)
            .with_arg(reply.value)
            .with_payload(reply.payload);
        self.send_to(ticket.caller, &message)
    }
}
