//! Scenarios over the device backend, driven by the in-memory device.

use std::time::Duration;

use fusion_world::{FusionError, ReactionResult, Role};

use crate::scenarios;
use crate::support::{Backend, Cluster, ABI};

#[test]
fn slave_calls_master() {
    scenarios::slave_calls_master(Backend::Device);
}

#[test]
fn crashed_slave_refs_are_unwound() {
    scenarios::crashed_slave_refs_are_unwound(Backend::Device);
}

#[test]
fn reactor_reaches_the_slave() {
    scenarios::reactor_reaches_the_slave(Backend::Device);
}

#[test]
fn zero_notify_fires_once() {
    scenarios::zero_notify_fires_once(Backend::Device);
}

#[test]
fn join_is_idempotent() {
    scenarios::join_is_idempotent(Backend::Device);
}

#[test]
fn abi_gate() {
    scenarios::abi_gate(Backend::Device);
}

#[test]
fn messages_keep_their_order() {
    scenarios::messages_keep_their_order(Backend::Device);
}

#[test]
fn listed_calls_check_permissions() {
    scenarios::listed_calls_check_permissions(Backend::Device);
}

#[test]
fn departures_are_reported() {
    scenarios::departures_are_reported(Backend::Device);
}

#[test]
fn callee_departure_fails_the_caller() {
    scenarios::callee_departure_fails_the_caller(Backend::Device);
}

#[test]
fn skirmish_survives_its_holder() {
    scenarios::skirmish_survives_its_holder(Backend::Device);
}

#[test]
fn root_block_is_shared() {
    scenarios::root_block_is_shared(Backend::Device);
}

#[test]
fn roles_are_enforced() {
    let cluster = Cluster::new(Backend::Device);
    assert!(matches!(
        cluster.process().join(0, ABI, Role::Slave),
        Err(FusionError::Init(_))
    ));
    let _master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    assert!(matches!(
        cluster.process().join(0, ABI, Role::Master),
        Err(FusionError::Unsupported(_))
    ));
}

/// The device can tell when every queued message was read.
#[test]
fn sync_waits_for_delivery() {
    let cluster = Cluster::new(Backend::Device);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");
    let reactor = master.reactor_create().expect("reactor");
    slave
        .reactor_attach(reactor, 0, |_| ReactionResult::Keep)
        .expect("attach");
    for _ in 0..16 {
        master.reactor_publish(reactor, 0, b"tick", false).unwrap();
    }
    master.sync(Duration::from_secs(5)).expect("sync");
}
