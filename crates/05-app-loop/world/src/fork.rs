//! What happens to joined worlds when the process forks.

use std::sync::Arc;

/// Per-world behaviour in a forked child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForkAction {
    /// The child drops the world without touching shared state.
    #[default]
    Close,
    /// The child joins as a participant of its own, inheriting the
    /// parent's references.
    Fork,
}

/// Point in the fork a callback is told about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkState {
    Prepare,
    Parent,
    Child,
}

pub(crate) type ForkCallback = Arc<dyn Fn(ForkAction, ForkState) + Send + Sync>;

/// Process-wide hooks run around a fork, after the per-world handling.
pub(crate) struct ForkHooks {
    pub(crate) prepare: Box<dyn Fn() + Send + Sync>,
    pub(crate) parent: Box<dyn Fn() + Send + Sync>,
    pub(crate) child: Box<dyn Fn() + Send + Sync>,
}
