//! Integration tests for replica locks and dentry xlocks.

#[allow(dead_code)]
mod common;

use common::*;
use strata_mds::error::ErrorKind;
use strata_mds::mds::messages::LockMessage;
use strata_mds::mds::{MdsMessage, ReplyBody};
use strata_mds::types::InodeId;

fn is_lock(m: &SimMessage, f: impl Fn(&LockMessage) -> bool) -> bool {
    matches!(&m.msg, MdsMessage::Lock(l) if f(l))
}

/// `/d/f0` created on mds0 and replicated to mds1 and mds2.
fn replicated_file(sim: &mut SimCluster) -> InodeId {
    populate(sim, 0, "/d", 1);
    sim.ok(1, stat("/d/f0"));
    sim.ok(2, stat("/d/f0"));
    sim.ino(0, "/d/f0")
}

// =============================================================================
// Inode locks
// =============================================================================

#[test]
fn test_setattr_gathers_every_replica() {
    let mut sim = three_nodes();
    let f = replicated_file(&mut sim);
    sim.clear_log();

    assert_eq!(mode_of(&sim.ok(0, chmod("/d/f0", 0o600))), 0o600);

    let delivered = sim.delivered();
    let gathered: Vec<_> = delivered
        .iter()
        .filter(|m| is_lock(m, |l| matches!(l, LockMessage::Lock { ino, .. } if *ino == f)))
        .map(|m| m.to)
        .collect();
    assert_eq!(gathered, vec![1, 2]);
    let acks = delivered
        .iter()
        .filter(|m| is_lock(m, |l| matches!(l, LockMessage::LockAck { .. })))
        .count();
    assert_eq!(acks, 2);
    let synced: Vec<_> = delivered
        .iter()
        .filter(|m| is_lock(m, |l| matches!(l, LockMessage::Sync { ino, .. } if *ino == f)))
        .map(|m| m.to)
        .collect();
    assert_eq!(synced, vec![1, 2]);

    // Replicas answer locally with the pushed value
    sim.clear_log();
    assert_eq!(mode_of(&sim.ok(1, stat("/d/f0"))), 0o600);
    assert!(sim.delivered().is_empty());
}

#[test]
fn test_replica_read_waits_for_sync() {
    let mut sim = three_nodes();
    replicated_file(&mut sim);

    sim.hold_when(|m| m.from == 2 && is_lock(m, |l| matches!(l, LockMessage::LockAck { .. })));
    let write = sim.submit(0, chmod("/d/f0", 0o600));
    sim.run();
    assert!(sim.reply(write).is_none());
    assert_eq!(sim.held().len(), 1);

    let read = sim.submit(1, stat("/d/f0"));
    sim.run();
    assert!(sim.reply(read).is_none());

    sim.release_held();
    let written = sim.wait_reply(write);
    assert_eq!(mode_of(&written.result.unwrap()), 0o600);
    let seen = sim.wait_reply(read);
    assert_eq!(seen.served_by, 1);
    assert_eq!(mode_of(&seen.result.unwrap()), 0o600);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_lost_lock_ack_times_out_and_resyncs() {
    let mut sim = three_nodes();
    replicated_file(&mut sim);

    sim.drop_when(|m| m.from == 2 && is_lock(m, |l| matches!(l, LockMessage::LockAck { .. })));
    assert_eq!(sim.err(0, chmod("/d/f0", 0o600)), ErrorKind::Timeout);
    assert_eq!(sim.dropped().len(), 1);
    sim.release_held();

    // The failed write changed nothing and the replicas are readable again
    assert_eq!(mode_of(&sim.ok(2, stat("/d/f0"))), 0o644);

    assert_eq!(mode_of(&sim.ok(0, chmod("/d/f0", 0o640))), 0o640);
    assert_eq!(mode_of(&sim.ok(2, stat("/d/f0"))), 0o640);

    sim.settle();
    assert_quiescent(&sim);
}

// =============================================================================
// Dentry xlocks
// =============================================================================

#[test]
fn test_create_xlocks_dentry_on_replicas() {
    let mut sim = three_nodes();
    sim.ok(1, stat("/"));
    sim.ok(2, stat("/"));
    sim.clear_log();

    sim.ok(0, create("/new"));
    let delivered = sim.delivered();
    let locked: Vec<_> = delivered
        .iter()
        .filter(|m| is_lock(m, |l| matches!(l, LockMessage::DentryLock { key, .. } if key.name == "new")))
        .map(|m| m.to)
        .collect();
    assert_eq!(locked, vec![1, 2]);
    let unlocked: Vec<_> = delivered
        .iter()
        .filter(|m| {
            is_lock(m, |l| {
                matches!(l, LockMessage::DentryUnlock { key, binding: Some(_) } if key.name == "new")
            })
        })
        .map(|m| m.to)
        .collect();
    assert_eq!(unlocked, vec![1, 2]);

    let ino = sim.ino(0, "/new");
    assert_eq!(sim.node(1).lookup_cached("/new"), Some(ino));
    assert_eq!(sim.node(2).lookup_cached("/new"), Some(ino));
}

#[test]
fn test_discover_waits_for_xlocked_dentry() {
    let mut sim = three_nodes();
    sim.ok(1, stat("/"));

    sim.hold_when(|m| m.from == 1 && is_lock(m, |l| matches!(l, LockMessage::DentryLockAck { .. })));
    let create_id = sim.submit(0, create("/new"));
    sim.run();
    assert!(sim.reply(create_id).is_none());

    let lookup_id = sim.submit(2, lookup("/new"));
    sim.run();
    assert!(sim.reply(lookup_id).is_none());

    sim.release_held();
    let created = match sim.wait_reply(create_id).result.unwrap() {
        ReplyBody::Inode { ino, .. } => ino,
        other => panic!("unexpected reply {:?}", other),
    };
    match sim.wait_reply(lookup_id).result.unwrap() {
        ReplyBody::Inode { ino, .. } => assert_eq!(ino, created),
        other => panic!("unexpected reply {:?}", other),
    }

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}
