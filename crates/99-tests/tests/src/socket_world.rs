//! Scenarios over the unix-socket backend.

use fusion_transport::SocketTransport;
use fusion_world::{FusionError, ParticipantId, Role};

use crate::scenarios;
use crate::support::{Backend, Cluster, ABI};

#[test]
fn slave_calls_master() {
    scenarios::slave_calls_master(Backend::Socket);
}

#[test]
fn crashed_slave_refs_are_unwound() {
    scenarios::crashed_slave_refs_are_unwound(Backend::Socket);
}

#[test]
fn reactor_reaches_the_slave() {
    scenarios::reactor_reaches_the_slave(Backend::Socket);
}

#[test]
fn zero_notify_fires_once() {
    scenarios::zero_notify_fires_once(Backend::Socket);
}

#[test]
fn join_is_idempotent() {
    scenarios::join_is_idempotent(Backend::Socket);
}

#[test]
fn abi_gate() {
    scenarios::abi_gate(Backend::Socket);
}

#[test]
fn messages_keep_their_order() {
    scenarios::messages_keep_their_order(Backend::Socket);
}

#[test]
fn listed_calls_check_permissions() {
    scenarios::listed_calls_check_permissions(Backend::Socket);
}

#[test]
fn departures_are_reported() {
    scenarios::departures_are_reported(Backend::Socket);
}

#[test]
fn callee_departure_fails_the_caller() {
    scenarios::callee_departure_fails_the_caller(Backend::Socket);
}

#[test]
fn skirmish_survives_its_holder() {
    scenarios::skirmish_survives_its_holder(Backend::Socket);
}

#[test]
fn root_block_is_shared() {
    scenarios::root_block_is_shared(Backend::Socket);
}

/// A second master is a role conflict; a slave needs a master to exist.
#[test]
fn roles_are_enforced() {
    let cluster = Cluster::new(Backend::Socket);
    assert!(matches!(
        cluster.process().join(0, ABI, Role::Slave),
        Err(FusionError::Init(_))
    ));

    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    assert!(matches!(
        cluster.process().join(0, ABI, Role::Master),
        Err(FusionError::Unsupported(_))
    ));
    let any = cluster.process().join(0, ABI, Role::Any).expect("any joins as slave");
    assert!(!any.is_master());
    assert_eq!(master.participants().len(), 2);
}

#[test]
fn free_index_skips_worlds_with_a_master() {
    let cluster = Cluster::new(Backend::Socket);
    let _taken = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let picked = cluster.process().join(-1, ABI, Role::Master).expect("free index");
    assert_eq!(picked.index(), 1);
    assert!(picked.is_master());
}

#[test]
fn forced_slave_joins_as_slave() {
    let cluster = Cluster::new(Backend::Socket);
    let _master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let forced = cluster
        .process_with(fusion_world::FusionConfig {
            force_slave: true,
            ..cluster.config().clone()
        })
        .join(0, ABI, Role::Master)
        .expect("forced slave joins");
    assert!(!forced.is_master());
}

/// The last participant out removes the socket directory and the core file.
#[test]
fn last_participant_cleans_up() {
    let cluster = Cluster::new(Backend::Socket);
    let socket_dir = SocketTransport::socket_dir(&cluster.config().rundir, 0);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");
    assert!(socket_dir.exists());

    master.leave(false).expect("master leaves");
    assert!(cluster.core_file(0).exists());
    crate::support::wait_until("master eviction", || {
        !slave.participants().contains(&ParticipantId::MASTER)
    });

    slave.leave(false).expect("slave leaves");
    assert!(!cluster.core_file(0).exists());
    assert!(!socket_dir.exists());
}

#[test]
fn sync_is_not_offered() {
    let cluster = Cluster::new(Backend::Socket);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    assert!(matches!(
        master.sync(std::time::Duration::from_millis(10)),
        Err(FusionError::Unsupported(_))
    ));
}
