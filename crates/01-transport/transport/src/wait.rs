//! Atomic wait/notify shims used by the in-process event ring.
//!
//! Native targets park on the `atomic-wait` crate (futex-backed on Linux).
//! Loom builds stub these operations so the model scheduler keeps spinning
//! instead of blocking.
//!
//! The futexes used here are process-private: they only work for waiters in
//! the same address space, never across two mappings of a shared file.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The value matched and the caller was woken by a notify.
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        let _ = (atomic, expected);
        loom::thread::yield_now();
        WaitResult::NotEqual
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::{AtomicU32, Ordering, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        if atomic.load(Ordering::Acquire) != expected {
            return WaitResult::NotEqual;
        }
        atomic_wait::wait(atomic, expected);
        WaitResult::Ok
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Blocks the caller until the atomic differs from `expected` or a wakeup occurs.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

#[inline]
fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}

/// Bumps a doorbell counter and wakes everybody parked on it.
#[inline]
pub fn ring(doorbell: &AtomicU32) {
    doorbell.fetch_add(1, Ordering::Release);
    wake_all(doorbell);
}
