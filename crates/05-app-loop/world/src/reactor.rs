//! Reactor publish/subscribe.
//!
//! Subscriptions are shared; callbacks are local. The first callback a
//! process attaches to a reactor channel subscribes it in the arena and the
//! last one detached unsubscribes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fusion_arena::{ArenaError, ReactorId, SubscriptionId};
use fusion_transport::{Message, MessageKind, ParticipantId};
use parking_lot::Mutex;

use crate::world::WorldCore;
use crate::{FusionError, FusionResult};

/// Reacts to one published message.
pub type ReactionCallback = Arc<dyn Fn(&Reaction<'_>) -> ReactionResult + Send + Sync>;

/// A message as delivered to a callback.
#[derive(Debug)]
pub struct Reaction<'a> {
    pub reactor: ReactorId,
    pub channel: u32,
    pub sender: ParticipantId,
    pub payload: &'a [u8],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReactionResult {
    #[default]
    Keep,
    /// Detach the callback that returned this.
    Remove,
}

/// Token naming one attached callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub reactor: ReactorId,
    pub channel: u32,
    serial: u64,
}

struct Channel {
    subscription: SubscriptionId,
    callbacks: Vec<(u64, ReactionCallback)>,
}

#[derive(Default)]
pub(crate) struct Reactions {
    next: AtomicU64,
    channels: Mutex<HashMap<(ReactorId, u32), Channel>>,
}

impl Reactions {
    /// Runs the callbacks attached to `reactor`/`channel`.
    pub(crate) fn deliver(
        &self,
        core: &WorldCore,
        reactor: ReactorId,
        channel: u32,
        sender: ParticipantId,
        payload: &[u8],
    ) {
        let callbacks = match self.channels.lock().get(&(reactor, channel)) {
            Some(attached) => attached.callbacks.clone(),
            None => return,
        };
        let reaction = Reaction {
            reactor,
            channel,
            sender,
            payload,
        };
        for (serial, callback) in callbacks {
            if callback(&reaction) == ReactionResult::Remove {
                let attachment = Attachment {
                    reactor,
                    channel,
                    serial,
                };
                if let Err(err) = core.reactor_detach(attachment) {
                    tracing::debug!("detaching {attachment:?} failed: {err}");
                }
            }
        }
    }

    fn drop_reactor(&self, reactor: ReactorId) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|(attached, _), _| *attached != reactor);
        before - channels.len()
    }
}

impl WorldCore {
    pub fn reactor_create(&self) -> FusionResult<ReactorId> {
        self.ensure_open()?;
        Ok(self.arena.reactors().create(&self.member())?)
    }

    /// Attaches `callback` to `channel` of `reactor`.
    pub fn reactor_attach(
        &self,
        reactor: ReactorId,
        channel: u32,
        callback: impl Fn(&Reaction<'_>) -> ReactionResult + Send + Sync + 'static,
    ) -> FusionResult<Attachment> {
        self.ensure_open()?;
        let serial = self.reactions.next.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.reactions.channels.lock();
        let attached = match channels.entry((reactor, channel)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let subscription = self
                    .arena
                    .reactors()
                    .subscribe(reactor, &self.member(), channel)?;
                entry.insert(Channel {
                    subscription,
                    callbacks: Vec::new(),
                })
            }
        };
        attached.callbacks.push((serial, Arc::new(callback)));
        Ok(Attachment {
            reactor,
            channel,
            serial,
        })
    }

    pub fn reactor_detach(&self, attachment: Attachment) -> FusionResult<()> {
        let key = (attachment.reactor, attachment.channel);
        let mut channels = self.reactions.channels.lock();
        let attached = channels
            .get_mut(&key)
            .ok_or(FusionError::InvalidArgument("callback is not attached"))?;
        let before = attached.callbacks.len();
        attached
            .callbacks
            .retain(|(serial, _)| *serial != attachment.serial);
        if attached.callbacks.len() == before {
            return Err(FusionError::InvalidArgument("callback is not attached"));
        }
        if !attached.callbacks.is_empty() {
            return Ok(());
        }

        let subscription = attached.subscription;
        channels.remove(&key);
        drop(channels);
        match self
            .arena
            .reactors()
            .unsubscribe(subscription, &self.member())
        {
            Ok(()) | Err(ArenaError::Destroyed(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Sends `payload` to every subscriber of `channel`.
    ///
    /// With `include_self` this process's callbacks run before the call
    /// returns; otherwise they run on the dispatch thread like everyone
    /// else's.
    pub fn reactor_publish(
        &self,
        reactor: ReactorId,
        channel: u32,
        payload: &[u8],
        include_self: bool,
    ) -> FusionResult<()> {
        self.ensure_open()?;
        let me = self.member();
        let deliveries = self
            .arena
            .reactors()
            .begin_publish(reactor, &me, channel, include_self)?;
        if include_self {
            self.reactions.deliver(self, reactor, channel, me.id, payload);
        }

        let message = Message::new(MessageKind::Reactor, me.id)
            .with_object(reactor.raw())
            .with_channel(channel)
            .with_payload(payload);
        for (target, subscription) in deliveries.targets {
            let outbound = message.clone().with_aux(subscription.raw());
            if let Err(err) = self.send_to(target, &outbound) {
                self.arena.reactors().finish_delivery(subscription);
                tracing::debug!("{reactor:?} message to {target} dropped: {err}");
            }
        }
        Ok(())
    }

    /// Destroys a reactor this participant owns. It is freed once the
    /// deliveries in flight settle.
    pub fn reactor_destroy(&self, reactor: ReactorId) -> FusionResult<()> {
        self.ensure_open()?;
        let freed = self.arena.reactors().destroy(reactor, &self.member())?;
        let dropped = self.reactions.drop_reactor(reactor);
        tracing::debug!("destroyed {reactor:?} (freed now: {freed}, {dropped} local channel(s))");
        Ok(())
    }
}
