//! Cross-participant scenarios for Fusion worlds.
//!
//! Each [`fusion_world::Registry`] stands in for one process. Several of them
//! joined to the same world index, sharing a temporary `tmpfs`/`rundir` (or
//! one in-memory device), behave like separate participants.

#[cfg(test)]
mod support;

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod socket_world;

#[cfg(test)]
mod device_world;

#[cfg(test)]
mod fork_world;
