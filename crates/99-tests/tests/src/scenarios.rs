//! Scenarios run against every multi-process backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fusion_world::{
    CallFlags, CallOutcome, FusionError, ParticipantId, Permissions, ReactionResult, RefScope,
    Role,
};
use parking_lot::Mutex;

use crate::support::{settle, wait_until, Backend, Cluster, ABI};

/// A slave executes a master-owned call synchronously.
pub(crate) fn slave_calls_master(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");
    assert!(master.is_master());
    assert!(!slave.is_master());
    assert_ne!(slave.id(), master.id());

    let call = master
        .call_create(Permissions::Anyone, |request| {
            CallOutcome::value(request.arg * 2)
        })
        .expect("create call");
    let value = slave
        .call_execute(call, 42, CallFlags::SYNC.with_timeout(Duration::from_secs(5)))
        .expect("execute");
    assert_eq!(value, 84);

    let reply = slave
        .call_execute3(call, 1, b"payload", CallFlags::SYNC)
        .expect("execute3");
    assert_eq!(reply.value, 2);
}

/// A slave that dies holding a reference has its increments reversed.
pub(crate) fn crashed_slave_refs_are_unwound(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let notified = Arc::new(AtomicU32::new(0));
    let call = master
        .call_create(Permissions::Anyone, {
            let notified = Arc::clone(&notified);
            move |_| {
                notified.fetch_add(1, Ordering::SeqCst);
                CallOutcome::value(0)
            }
        })
        .expect("create call");
    let reference = master.ref_create().expect("ref");
    master.ref_up(reference, RefScope::Global).unwrap();
    master.ref_watch(reference, call, 0).unwrap();

    slave.ref_up(reference, RefScope::Global).unwrap();
    assert_eq!(master.ref_stat(reference).unwrap(), 2);
    let departed = slave.id();
    slave.leave(true).expect("emergency leave");

    wait_until("slave eviction", || !master.participants().contains(&departed));
    assert_eq!(master.ref_stat(reference).unwrap(), 1);
    settle();
    assert_eq!(notified.load(Ordering::SeqCst), 0);
}

/// Reactor messages reach remote callbacks once per publish and stop after
/// detaching.
pub(crate) fn reactor_reaches_the_slave(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let reactor = master.reactor_create().expect("reactor");
    let received = Arc::new(Mutex::new(Vec::new()));
    let attachment = slave
        .reactor_attach(reactor, 7, {
            let received = Arc::clone(&received);
            move |reaction| {
                received
                    .lock()
                    .push((reaction.sender, reaction.payload.to_vec()));
                ReactionResult::Keep
            }
        })
        .expect("attach");

    master.reactor_publish(reactor, 7, b"hello", false).unwrap();
    wait_until("reaction", || !received.lock().is_empty());
    settle();
    assert_eq!(
        *received.lock(),
        vec![(ParticipantId::MASTER, b"hello".to_vec())]
    );
    wait_until("settled delivery", || {
        master.arena().reactors().in_flight(reactor) == 0
    });

    slave.reactor_detach(attachment).expect("detach");
    master.reactor_publish(reactor, 7, b"again", false).unwrap();
    settle();
    assert_eq!(received.lock().len(), 1);
}

/// Concurrent decrements to zero from two participants fire one notification.
pub(crate) fn zero_notify_fires_once(backend: Backend) {
    const PER_SIDE: usize = 4;
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let notified = Arc::new(AtomicU32::new(0));
    let call = master
        .call_create(Permissions::Anyone, {
            let notified = Arc::clone(&notified);
            move |request| {
                assert_eq!(request.caller, ParticipantId::KERNEL);
                notified.fetch_add(1, Ordering::SeqCst);
                CallOutcome::value(0)
            }
        })
        .expect("create call");
    let reference = master.ref_create().expect("ref");
    for _ in 0..PER_SIDE {
        master.ref_up(reference, RefScope::Global).unwrap();
        slave.ref_up(reference, RefScope::Global).unwrap();
    }
    master.ref_watch(reference, call, 1).unwrap();

    let barrier = Arc::new(Barrier::new(2 * PER_SIDE));
    let workers: Vec<_> = [master.core(), slave.core()]
        .into_iter()
        .flat_map(|core| std::iter::repeat(core).take(PER_SIDE))
        .map(|core| {
            let core = Arc::clone(core);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                core.ref_down(reference, RefScope::Global).expect("down");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    assert_eq!(master.ref_stat(reference).unwrap(), 0);
    wait_until("zero notification", || notified.load(Ordering::SeqCst) > 0);
    settle();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

/// Joining twice hands out the same world; resources go away with the last
/// leave.
pub(crate) fn join_is_idempotent(backend: Backend) {
    let cluster = Cluster::new(backend);
    let registry = cluster.process();
    let first = registry.join(0, ABI, Role::Master).expect("first join");
    let second = registry.join(0, ABI, Role::Master).expect("second join");
    assert!(Arc::ptr_eq(first.core(), second.core()));
    assert!(cluster.core_file(0).exists());

    first.leave(false).expect("first leave");
    assert!(cluster.core_file(0).exists());
    assert_eq!(second.participants(), vec![ParticipantId::MASTER]);

    second.leave(false).expect("second leave");
    assert!(!cluster.core_file(0).exists());
}

/// A mismatched ABI never gets in and leaves the world alone.
pub(crate) fn abi_gate(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let result = cluster.process().join(0, ABI + 1, Role::Slave);
    assert!(
        matches!(
            result,
            Err(FusionError::VersionMismatch { expected, found }) if expected == ABI + 1 && found == ABI
        ),
        "unexpected {result:?}"
    );
    assert_eq!(master.participants(), vec![ParticipantId::MASTER]);
    assert!(cluster.core_file(0).exists());

    let slave = cluster.process().join(0, ABI, Role::Slave).expect("matching slave joins");
    assert_eq!(master.participants().len(), 2);
    drop(slave);
}

/// Messages from one sender are served in the order they were sent.
pub(crate) fn messages_keep_their_order(backend: Backend) {
    const COUNT: i32 = 200;
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let call = master
        .call_create(Permissions::Anyone, {
            let seen = Arc::clone(&seen);
            move |request| {
                seen.lock().push(request.arg);
                CallOutcome::value(0)
            }
        })
        .expect("create call");
    for arg in 0..COUNT {
        slave.call_execute(call, arg, CallFlags::ONEWAY).expect("send");
    }
    wait_until("all calls", || seen.lock().len() == COUNT as usize);
    assert_eq!(*seen.lock(), (0..COUNT).collect::<Vec<_>>());
}

/// Calls limited to a list reject everyone else until granted.
pub(crate) fn listed_calls_check_permissions(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let call = master
        .call_create(Permissions::Listed, |_| CallOutcome::value(1))
        .expect("create call");
    assert!(matches!(
        slave.call_execute(call, 0, CallFlags::SYNC),
        Err(FusionError::AccessDenied)
    ));
    master.call_add_permission(call, slave.id()).expect("grant");
    assert_eq!(slave.call_execute(call, 0, CallFlags::SYNC).unwrap(), 1);
}

/// An orderly leave is reported to the others and frees the leaver's calls.
pub(crate) fn departures_are_reported(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let departed = Arc::new(Mutex::new(Vec::new()));
    master.set_leave_callback({
        let departed = Arc::clone(&departed);
        move |_, id| departed.lock().push(id)
    });
    let slave_call = slave
        .call_create(Permissions::Anyone, |_| CallOutcome::value(0))
        .expect("slave call");
    let slave_id = slave.id();
    slave.leave(false).expect("leave");

    wait_until("leave callback", || departed.lock().contains(&slave_id));
    assert_eq!(master.participants(), vec![ParticipantId::MASTER]);
    assert!(matches!(
        master.call_execute(slave_call, 0, CallFlags::SYNC),
        Err(FusionError::Destroyed(_))
    ));
}

/// A caller blocked on a participant that leaves is released with `Destroyed`.
pub(crate) fn callee_departure_fails_the_caller(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let retained = Arc::new(AtomicU32::new(0));
    let call = master
        .call_create(Permissions::Anyone, {
            let retained = Arc::clone(&retained);
            move |_| {
                retained.fetch_add(1, Ordering::SeqCst);
                CallOutcome::Retain
            }
        })
        .expect("create call");

    let caller = {
        let core = Arc::clone(slave.core());
        thread::spawn(move || core.call_execute(call, 0, CallFlags::SYNC))
    };
    wait_until("retained call", || retained.load(Ordering::SeqCst) == 1);
    master.leave(false).expect("master leaves");

    let result = caller.join().expect("caller thread");
    assert!(matches!(result, Err(FusionError::Destroyed(_))), "unexpected {result:?}");
    wait_until("master eviction", || {
        !slave.participants().contains(&ParticipantId::MASTER)
    });
}

/// A lock held by a participant that vanished is taken over.
pub(crate) fn skirmish_survives_its_holder(backend: Backend) {
    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");

    let skirmish = master.skirmish_create().expect("skirmish");
    slave.skirmish_prevail(skirmish).unwrap();
    assert!(matches!(
        master.skirmish_swoop(skirmish),
        Err(FusionError::Busy(_))
    ));
    let holder = slave.id();
    assert_eq!(master.skirmish_holder(skirmish).unwrap(), Some(holder));

    slave.leave(true).expect("emergency leave");
    wait_until("slave eviction", || !master.participants().contains(&holder));
    master.skirmish_prevail(skirmish).expect("take over");
    assert_eq!(master.skirmish_holder(skirmish).unwrap(), Some(ParticipantId::MASTER));
}

/// Memory placed by the master is visible to a slave through the root.
pub(crate) fn root_block_is_shared(backend: Backend) {
    use fusion_world::ShmPool;

    let cluster = Cluster::new(backend);
    let master = cluster.process().join(0, ABI, Role::Master).expect("master joins");
    let block = master.pool().alloc(8).expect("alloc");
    let ptr = master.arena().block_ptr(block).expect("block");
    // SAFETY: eight bytes inside the heap, not yet published to anyone.
    unsafe { ptr.as_ptr().cast::<u64>().write_unaligned(0x00c0_ffee) };
    master.set_root(block).expect("set root");

    let slave = cluster.process().join(0, ABI, Role::Slave).expect("slave joins");
    assert!(matches!(slave.set_root(block), Err(FusionError::AccessDenied)));
    let root = slave.get_root().expect("root published");
    let seen = slave
        .arena()
        .block_ptr(fusion_world::ShmBlock { offset: root, len: 8 })
        .expect("block");
    // SAFETY: same block, mapped by the slave.
    assert_eq!(unsafe { seen.as_ptr().cast::<u64>().read_unaligned() }, 0x00c0_ffee);
}
