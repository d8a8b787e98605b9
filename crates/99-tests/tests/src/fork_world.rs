//! Forking a joined process, simulated in one process.
//!
//! `after_fork(true)` is called without a real `fork(2)`: from then on the
//! registry behaves as the child, and the parent's participant stays behind
//! in the world as the real parent would.

use std::sync::Arc;

use fusion_world::{CallFlags, CallOutcome, ForkAction, ForkState, Permissions, RefScope, Role};
use parking_lot::Mutex;

use crate::support::{Backend, Cluster, ABI};

#[test]
fn forked_child_gets_its_own_participant() {
    let cluster = Cluster::new(Backend::Socket);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let registry = cluster.process();
    let world = registry.join(0, ABI, Role::Slave).expect("slave joins");
    world.set_fork_action(ForkAction::Fork);
    let states = Arc::new(Mutex::new(Vec::new()));
    world.set_fork_callback({
        let states = Arc::clone(&states);
        move |_, state| states.lock().push(state)
    });

    let reference = master.ref_create().expect("ref");
    master.ref_up(reference, RefScope::Global).unwrap();
    world.ref_up(reference, RefScope::Global).unwrap();
    let call = master
        .call_create(Permissions::Anyone, |request| CallOutcome::value(request.arg + 1))
        .expect("create call");
    let parent_id = world.id();

    registry.before_fork();
    registry.after_fork(true);

    assert_eq!(*states.lock(), vec![ForkState::Prepare, ForkState::Child]);
    assert_ne!(world.id(), parent_id);
    assert_eq!(master.ref_stat(reference).unwrap(), 3);
    assert_eq!(master.participants().len(), 3);
    assert_eq!(world.call_execute(call, 1, CallFlags::SYNC).unwrap(), 2);
    assert_eq!(registry.joined(), vec![0]);

    world.leave(false).expect("child leaves");
    assert_eq!(master.ref_stat(reference).unwrap(), 2);
}

/// Closing in the child leaves the parent's membership as it was.
#[test]
fn closed_world_is_left_untouched() {
    let cluster = Cluster::new(Backend::Socket);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let registry = cluster.process();
    let world = registry.join(0, ABI, Role::Slave).expect("slave joins");
    let reference = master.ref_create().expect("ref");
    world.ref_up(reference, RefScope::Global).unwrap();
    let parent_id = world.id();

    registry.before_fork();
    registry.after_fork(true);

    assert!(registry.joined().is_empty());
    assert!(world.ref_create().is_err());
    drop(world);
    assert!(master.participants().contains(&parent_id));
    assert_eq!(master.ref_stat(reference).unwrap(), 1);
}

#[test]
fn device_child_forks_through_the_device() {
    let cluster = Cluster::new(Backend::Device);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let registry = cluster.process();
    let world = registry.join(0, ABI, Role::Slave).expect("slave joins");
    world.set_fork_action(ForkAction::Fork);
    let reference = master.ref_create().expect("ref");
    world.ref_up(reference, RefScope::Global).unwrap();
    let parent_id = world.id();

    registry.before_fork();
    registry.after_fork(true);

    assert_ne!(world.id(), parent_id);
    assert!(master.participants().contains(&world.id()));
    assert_eq!(master.ref_stat(reference).unwrap(), 2);
}
