//! Reactors and the per-participant channel subscriptions that route publishes.
//!
//! A publish bumps an in-flight counter on the reactor and on every
//! subscription it targets; the receiving dispatcher drops them again once
//! its callbacks ran. A reactor whose destruction was requested stays
//! free-pending until that counter drains.

use std::sync::atomic::Ordering;

use fusion_transport::ParticipantId;
use smallvec::SmallVec;

use crate::layout::{ReactorSlot, SubscriptionSlot};
use crate::participants::Member;
use crate::slot::{self, ReactorId, SubscriptionId, LIVE, PENDING};
use crate::{ArenaError, ArenaResult};

/// Subscribers a publish must reach.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Deliveries {
    pub targets: SmallVec<[(ParticipantId, SubscriptionId); 8]>,
}

/// View over reactors and subscriptions.
#[derive(Clone, Copy)]
pub struct ReactorTable<'a> {
    pub(crate) reactors: &'a [ReactorSlot],
    pub(crate) subscriptions: &'a [SubscriptionSlot],
}

impl<'a> ReactorTable<'a> {
    pub fn create(&self, owner: &Member) -> ArenaResult<ReactorId> {
        let (index, generation) = slot::claim(self.reactors).ok_or(ArenaError::Full("reactor"))?;
        let slot = &self.reactors[index];
        slot.owner_id.store(owner.id.raw(), Ordering::Relaxed);
        slot.owner_token.store(owner.token(), Ordering::Relaxed);
        slot.free_pending.store(0, Ordering::Relaxed);
        slot.in_flight.store(0, Ordering::Relaxed);
        slot.tag.publish(generation);
        Ok(ReactorId::new(index, generation))
    }

    /// Subscribes `member` to `channel`; returns the existing entry if any.
    pub fn subscribe(
        &self,
        reactor: ReactorId,
        member: &Member,
        channel: u32,
    ) -> ArenaResult<SubscriptionId> {
        self.accepting(reactor)?;
        let token = member.token();
        if let Some(existing) = self.find_subscription(reactor, token, channel) {
            return Ok(existing);
        }

        let (index, generation) =
            slot::claim(self.subscriptions).ok_or(ArenaError::Full("subscription"))?;
        let slot = &self.subscriptions[index];
        slot.reactor.store(reactor.raw(), Ordering::Relaxed);
        slot.participant.store(member.id.raw(), Ordering::Relaxed);
        slot.token.store(token, Ordering::Relaxed);
        slot.channel.store(channel, Ordering::Relaxed);
        slot.in_flight.store(0, Ordering::Relaxed);
        slot.tag.publish(generation);
        Ok(SubscriptionId::new(index, generation))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId, member: &Member) -> ArenaResult<()> {
        let slot = self
            .subscriptions
            .get(subscription.index())
            .filter(|slot| slot.tag.is_live(subscription.generation()))
            .ok_or(ArenaError::Destroyed("subscription"))?;
        if slot.token.load(Ordering::Acquire) != member.token() {
            return Err(ArenaError::AccessDenied(member.id.raw()));
        }
        self.free_subscription(subscription.index(), subscription.generation());
        Ok(())
    }

    /// Reserves one delivery per subscriber of `channel`, leaving out the
    /// publisher's own subscription when `skip_publisher` is set.
    ///
    /// Every returned target must be settled with
    /// [`ReactorTable::finish_delivery`], whether or not the send succeeded.
    pub fn begin_publish(
        &self,
        reactor: ReactorId,
        publisher: &Member,
        channel: u32,
        skip_publisher: bool,
    ) -> ArenaResult<Deliveries> {
        let slot = self.reactor_slot(reactor)?;
        // Hold the reactor open while targets are collected.
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        if slot.free_pending.load(Ordering::SeqCst) != 0 {
            self.settle(reactor);
            return Err(ArenaError::Destroyed("reactor"));
        }

        let publisher_token = publisher.token();
        let mut deliveries = Deliveries::default();
        for (index, generation) in slot::live(self.subscriptions) {
            let sub = &self.subscriptions[index];
            if sub.reactor.load(Ordering::Acquire) != reactor.raw()
                || sub.channel.load(Ordering::Acquire) != channel
                || (skip_publisher && sub.token.load(Ordering::Acquire) == publisher_token)
            {
                continue;
            }
            slot.in_flight.fetch_add(1, Ordering::SeqCst);
            sub.in_flight.fetch_add(1, Ordering::SeqCst);
            deliveries.targets.push((
                ParticipantId(sub.participant.load(Ordering::Acquire)),
                SubscriptionId::new(index, generation),
            ));
        }

        self.settle(reactor);
        Ok(deliveries)
    }

    /// Settles one delivery reserved by [`ReactorTable::begin_publish`].
    ///
    /// Returns `true` when this released a free-pending reactor.
    pub fn finish_delivery(&self, subscription: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.get(subscription.index()) else {
            return false;
        };
        if !sub.tag.is_live(subscription.generation()) {
            return false;
        }
        let reactor_raw = sub.reactor.load(Ordering::Acquire);
        let taken = sub
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match (taken, ReactorId::from_raw(reactor_raw)) {
            (true, Some(reactor)) => self.settle(reactor),
            _ => false,
        }
    }

    /// Requests destruction. A reactor already free-pending or gone is left alone.
    ///
    /// Returns `true` when the reactor was released right away.
    pub fn destroy(&self, reactor: ReactorId, member: &Member) -> ArenaResult<bool> {
        let Ok(slot) = self.reactor_slot(reactor) else {
            tracing::debug!("{reactor:?} already released");
            return Ok(false);
        };
        if slot.owner_token.load(Ordering::Acquire) != member.token() {
            return Err(ArenaError::AccessDenied(member.id.raw()));
        }
        if slot.free_pending.swap(1, Ordering::SeqCst) != 0 {
            return Ok(false);
        }
        Ok(self.try_release(reactor))
    }

    pub fn is_free_pending(&self, reactor: ReactorId) -> bool {
        self.reactor_slot(reactor)
            .map(|slot| slot.free_pending.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// Deliveries of `reactor` not yet settled.
    pub fn in_flight(&self, reactor: ReactorId) -> u32 {
        self.reactor_slot(reactor)
            .map(|slot| slot.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// True while the handle names a reactor that has not been released.
    pub fn exists(&self, reactor: ReactorId) -> bool {
        self.reactor_slot(reactor).is_ok()
    }

    /// Drops everything `member` held: its subscriptions, with their
    /// unsettled deliveries, and the reactors it owns, which become
    /// free-pending. Returns `(subscriptions freed, reactors marked)`.
    pub fn evict(&self, member: &Member) -> (usize, usize) {
        let token = member.token();
        let mut freed = 0;
        for (index, generation) in slot::live(self.subscriptions) {
            if self.subscriptions[index].token.load(Ordering::Acquire) == token {
                self.free_subscription(index, generation);
                freed += 1;
            }
        }

        let mut marked = 0;
        for (index, generation) in slot::live(self.reactors) {
            let slot = &self.reactors[index];
            if slot.owner_token.load(Ordering::Acquire) != token {
                continue;
            }
            if slot.free_pending.swap(1, Ordering::SeqCst) == 0 {
                marked += 1;
            }
            self.try_release(ReactorId::new(index, generation));
        }
        (freed, marked)
    }

    fn accepting(&self, reactor: ReactorId) -> ArenaResult<&'a ReactorSlot> {
        let slot = self.reactor_slot(reactor)?;
        if slot.free_pending.load(Ordering::Acquire) != 0 {
            return Err(ArenaError::Destroyed("reactor"));
        }
        Ok(slot)
    }

    fn reactor_slot(&self, reactor: ReactorId) -> ArenaResult<&'a ReactorSlot> {
        self.reactors
            .get(reactor.index())
            .filter(|slot| slot.tag.is_live(reactor.generation()))
            .ok_or(ArenaError::Destroyed("reactor"))
    }

    fn find_subscription(
        &self,
        reactor: ReactorId,
        token: u32,
        channel: u32,
    ) -> Option<SubscriptionId> {
        slot::live(self.subscriptions).find_map(|(index, generation)| {
            let sub = &self.subscriptions[index];
            (sub.reactor.load(Ordering::Acquire) == reactor.raw()
                && sub.token.load(Ordering::Acquire) == token
                && sub.channel.load(Ordering::Acquire) == channel)
                .then(|| SubscriptionId::new(index, generation))
        })
    }

    /// Frees a subscription and settles whatever was still in flight to it.
    fn free_subscription(&self, index: usize, generation: u32) {
        let sub = &self.subscriptions[index];
        let owed = sub.in_flight.swap(0, Ordering::SeqCst);
        let reactor = ReactorId::from_raw(sub.reactor.load(Ordering::Acquire));
        if !sub.tag.release(generation) {
            return;
        }
        if let Some(reactor) = reactor {
            if let Ok(slot) = self.reactor_slot(reactor) {
                slot.in_flight.fetch_sub(owed, Ordering::SeqCst);
            }
            if owed > 0 {
                self.try_release(reactor);
            }
        }
    }

    fn settle(&self, reactor: ReactorId) -> bool {
        if let Ok(slot) = self.reactor_slot(reactor) {
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.try_release(reactor)
    }

    fn try_release(&self, reactor: ReactorId) -> bool {
        let Ok(slot) = self.reactor_slot(reactor) else {
            return false;
        };
        if slot.free_pending.load(Ordering::SeqCst) == 0 || slot.in_flight.load(Ordering::SeqCst) != 0
        {
            return false;
        }
        if !slot.tag.transition(reactor.generation(), LIVE, PENDING) {
            return false;
        }

        for (index, generation) in slot::live(self.subscriptions) {
            let sub = &self.subscriptions[index];
            if sub.reactor.load(Ordering::Acquire) == reactor.raw() {
                sub.in_flight.store(0, Ordering::Release);
                sub.tag.release(generation);
            }
        }
        slot.tag.release(reactor.generation());
        tracing::debug!("released {reactor:?}");
        true
    }
}
