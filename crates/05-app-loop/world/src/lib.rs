//! Fusion worlds: shared state and messaging between cooperating processes.
//!
//! A [`Registry`] joins worlds by index. Each joined [`World`] owns one
//! transport endpoint, one mapping of the world's shared arena and one
//! dispatch thread that serves incoming calls, reactor messages and
//! departure notices.
//!
//! ```no_run
//! use fusion_world::{CallFlags, CallOutcome, FusionConfig, Permissions, Registry, Role};
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = Registry::builder().config(FusionConfig::from_env()).build()?;
//! let world = registry.join(0, 1, Role::Any)?;
//! let call = world.call_create(Permissions::Anyone, |request| {
//!     CallOutcome::value(request.arg * 2)
//! })?;
//! assert_eq!(world.call_execute(call, 21, CallFlags::SYNC)?, 42);
//! world.leave(false)?;
//! # Ok(())
//! # }
//! ```

mod calls;
mod config;
mod dispatch;
mod error;
mod fork;
mod liveness;
mod reactor;
mod refs;
mod registry;
mod skirmish;
mod world;

pub use calls::{CallFlags, CallHandler, CallOutcome, CallReply, CallRequest, ReturnTicket};
pub use config::{BackendChoice, FusionConfig};
pub use dispatch::{LoopPhase, QuiesceGuard};
pub use error::{FusionError, FusionResult};
pub use fork::{ForkAction, ForkState};
pub use reactor::{Attachment, Reaction, ReactionCallback, ReactionResult};
pub use refs::RefScope;
pub use registry::{Registry, RegistryBuilder, MAX_WORLDS};
pub use world::{LeaveCallback, World, WorldCore};

pub use fusion_arena::{
    Acquired, Arena, CallId, Permissions, ReactorId, RefId, SharedHeap, ShmBlock, ShmPool,
    SkirmishId,
};
pub use fusion_transport::{BackendKind, MemoryDeviceHub, ParticipantId, Role};
