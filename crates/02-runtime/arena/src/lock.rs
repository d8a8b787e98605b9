//! Robust owner-tagged spin lock.
//!
//! The lock word holds the holder's member token, or zero. A waiter that
//! finds the word owned by a participant that is no longer present takes the
//! lock over and learns about it through [`Acquired::Recovered`], so it can
//! repair whatever the dead holder left half-done.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// Answers whether a member token still belongs to a present participant.
pub(crate) trait Roster {
    fn is_live_token(&self, token: u32) -> bool;
}

/// How a lock was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// The lock was free.
    Clean,
    /// The lock was taken over from a departed holder.
    Recovered { previous: u32 },
}

#[repr(transparent)]
pub(crate) struct OwnerLock {
    owner: AtomicU32,
}

impl OwnerLock {
    pub(crate) fn holder(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Single attempt; `Err(holder)` when somebody else has it.
    pub(crate) fn try_acquire(&self, token: u32) -> Result<(), u32> {
        self.owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Single attempt that also takes the lock over from a departed holder.
    pub(crate) fn try_acquire_robust(
        &self,
        token: u32,
        roster: &impl Roster,
    ) -> Result<Acquired, u32> {
        match self.try_acquire(token) {
            Ok(()) => Ok(Acquired::Clean),
            Err(holder) if holder != token && !roster.is_live_token(holder) => self
                .owner
                .compare_exchange(holder, token, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| Acquired::Recovered { previous: holder }),
            Err(holder) => Err(holder),
        }
    }

    /// Spins, then yields, then sleeps until the lock is obtained.
    pub(crate) fn acquire(&self, token: u32, roster: &impl Roster) -> Acquired {
        let mut backoff = Backoff::new();
        loop {
            if let Ok(acquired) = self.try_acquire_robust(token, roster) {
                return acquired;
            }
            backoff.snooze();
        }
    }

    pub(crate) fn release(&self, token: u32) -> bool {
        self.owner
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn force_release(&self) {
        self.owner.store(0, Ordering::Release);
    }
}

pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 16;

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
        self.step = self.step.saturating_add(1);
    }
}
