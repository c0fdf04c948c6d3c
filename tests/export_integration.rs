//! Integration tests for subtree export between metadata servers.

#[allow(dead_code)]
mod common;

use common::*;
use strata_mds::error::ErrorKind;
use strata_mds::mds::messages::ExportMessage;
use strata_mds::mds::{MdsMessage, ReplyBody};
use strata_mds::types::{DirAuthority, InodeId, ROOT_INO};

fn is_export(m: &SimMessage, f: impl Fn(&ExportMessage) -> bool) -> bool {
    matches!(&m.msg, MdsMessage::Export(e) if f(e))
}

// =============================================================================
// Migration
// =============================================================================

#[test]
fn test_export_moves_authority() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 10);
    sim.ok(1, stat("/d/f0"));

    sim.export(0, d, 2);

    assert_dir_owner(&sim, d, 2);
    assert_eq!(sim.node(1).dir_authority(d), Some(DirAuthority::Node(2)));
    assert!(sim.node(2).topology().is_import(d));
    assert!(!sim.node(0).topology().is_import(d));
    for i in 0..10 {
        let path = format!("/d/f{}", i);
        let ino = sim.node(2).lookup_cached(&path);
        assert!(ino.is_some(), "mds2 is missing {}", path);
        assert_eq!(sim.node(2).cache().get_or_null(ino.unwrap()).unwrap().authority, 2);
    }
    assert_quiescent(&sim);

    // New entries land on the new owner, wherever the request arrives
    let reply = sim.call(1, create("/d/new"));
    assert_eq!(reply.served_by, 2);
    let reply = sim.call(0, readdir("/d"));
    assert_eq!(reply.served_by, 2);
    assert_eq!(names(&reply.result.unwrap()).len(), 11);

    // The exporter still resolves the subtree
    assert_eq!(mode_of(&sim.ok(0, stat("/d/f3"))), 0o644);

    sim.settle();
    assert_no_request_pins(&sim);
}

#[test]
fn test_export_message_order() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 3);
    sim.ok(1, stat("/d/f0"));
    sim.clear_log();

    sim.export(0, d, 2);

    let dir_at = position(&sim, |m| {
        m.to == 2 && is_export(m, |e| matches!(e, ExportMessage::Dir { .. }))
    })
    .unwrap();
    let warning_at = position(&sim, |m| {
        m.to == 1 && is_export(m, |e| matches!(e, ExportMessage::Warning { .. }))
    })
    .unwrap();
    let notify_at = position(&sim, |m| {
        m.from == 2 && m.to == 1 && is_export(m, |e| matches!(e, ExportMessage::Notify { .. }))
    })
    .unwrap();
    let finish_at = position(&sim, |m| {
        m.to == 2 && is_export(m, |e| matches!(e, ExportMessage::Finish { .. }))
    })
    .unwrap();
    let prep_at = position(&sim, |m| {
        m.to == 2 && is_export(m, |e| matches!(e, ExportMessage::Prep { .. }))
    })
    .unwrap();

    assert!(prep_at < dir_at);
    assert!(warning_at < notify_at);
    assert!(dir_at < notify_at);
    assert!(notify_at < finish_at);
}

#[test]
fn test_request_during_export_is_forwarded() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 4);

    sim.hold_when(|m| m.to == 2 && is_export(m, |e| matches!(e, ExportMessage::Dir { .. })));
    sim.node_mut(0).export_dir(d, 2).unwrap();
    sim.run();
    assert_eq!(sim.held().len(), 1);
    assert!(sim.node(0).cache().dir(d).unwrap().is_frozen());

    let id = sim.submit(0, create("/d/new"));
    sim.run();
    assert!(sim.reply(id).is_none());

    sim.release_held();
    let reply = sim.wait_reply(id);
    assert_eq!(reply.served_by, 2);
    assert!(reply.result.is_ok());

    sim.settle();
    assert_dir_owner(&sim, d, 2);
    assert!(sim.node(2).lookup_cached("/d/new").is_some());
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_export_refusals() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 1);
    sim.ok(1, stat("/d/f0"));

    let kind = |r: strata_mds::Result<()>| r.unwrap_err().kind();
    assert_eq!(kind(sim.node_mut(0).export_dir(ROOT_INO, 2)), ErrorKind::InvalidOperation);
    assert_eq!(kind(sim.node_mut(0).export_dir(d, 0)), ErrorKind::InvalidOperation);
    assert_eq!(kind(sim.node_mut(0).export_dir(d, 9)), ErrorKind::InvalidOperation);
    assert_eq!(
        kind(sim.node_mut(1).export_dir(d, 2)),
        ErrorKind::NotAuthoritative(Some(0))
    );

    sim.node_mut(0).export_dir(d, 2).unwrap();
    assert_eq!(kind(sim.node_mut(0).export_dir(d, 1)), ErrorKind::Conflict);

    sim.settle();
    assert_dir_owner(&sim, d, 2);
    assert_quiescent(&sim);
}

#[test]
fn test_export_and_hash_exclude_each_other() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 2);
    let h = populate(&mut sim, 0, "/h", 2);
    let kind = |r: strata_mds::Result<()>| r.unwrap_err().kind();

    sim.node_mut(0).export_dir(d, 2).unwrap();
    assert_eq!(kind(sim.node_mut(0).hash_dir(d)), ErrorKind::Conflict);

    sim.node_mut(0).hash_dir(h).unwrap();
    assert_eq!(kind(sim.node_mut(0).export_dir(h, 1)), ErrorKind::Conflict);

    sim.settle();
    assert_dir_owner(&sim, d, 2);
    assert_hashed_everywhere(&sim, h);
    assert_quiescent(&sim);
}

#[test]
fn test_resolutions_across_an_export_stay_consistent() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 6);
    sim.ok(1, stat("/d/f0"));
    let expected: Vec<InodeId> = (0..6).map(|i| sim.ino(0, &format!("/d/f{}", i))).collect();

    let mut stats = Vec::new();
    for i in 0..6 {
        for node in 0..3 {
            stats.push((i, sim.submit(node, stat(&format!("/d/f{}", i)))));
        }
    }
    let creates: Vec<_> = (0..3)
        .map(|node| sim.submit(node, create(&format!("/d/n{}", node))))
        .collect();
    sim.node_mut(0).export_dir(d, 2).unwrap();
    sim.settle();

    for (i, id) in stats {
        match sim.wait_reply(id).result {
            Ok(ReplyBody::Inode { ino, .. }) => assert_eq!(ino, expected[i], "stat of f{}", i),
            other => panic!("stat of f{} answered {:?}", i, other),
        }
    }
    for id in creates {
        assert!(sim.wait_reply(id).result.is_ok());
    }

    assert_dir_owner(&sim, d, 2);
    assert_eq!(names(&sim.ok(1, readdir("/d"))).len(), 9);
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

// =============================================================================
// Duplicate acknowledgements
// =============================================================================

fn is_exporter_ack(m: &SimMessage) -> bool {
    is_export(m, |e| {
        matches!(
            e,
            ExportMessage::DiscoverAck { .. }
                | ExportMessage::PrepAck { .. }
                | ExportMessage::DirAck { .. }
                | ExportMessage::NotifyAck { .. }
        )
    })
}

#[test]
fn test_replayed_acks_after_export_are_dropped() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 3);
    sim.ok(1, stat("/d/f0"));
    sim.clear_log();
    sim.export(0, d, 2);

    let acks: Vec<SimMessage> = sim
        .delivered()
        .into_iter()
        .filter(|m| m.to == 0 && is_exporter_ack(m))
        .collect();
    assert_eq!(acks.len(), 4);

    sim.clear_log();
    for m in acks {
        sim.node_mut(0).proc_message(m.from, m.msg);
    }
    sim.run();
    assert!(sim.delivered().is_empty());

    assert_dir_owner(&sim, d, 2);
    assert!(sim.node(0).topology().exports().is_empty());
    assert!(sim.node(2).topology().is_import(d));
    assert_quiescent(&sim);
    assert_eq!(sim.call(1, create("/d/after")).served_by, 2);
}

#[test]
fn test_replayed_prep_ack_mid_export_is_dropped() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 3);
    sim.clear_log();

    sim.hold_when(|m| m.to == 2 && is_export(m, |e| matches!(e, ExportMessage::Dir { .. })));
    sim.node_mut(0).export_dir(d, 2).unwrap();
    sim.run();
    assert_eq!(sim.held().len(), 1);

    let prep_ack = sim
        .delivered()
        .into_iter()
        .find(|m| is_export(m, |e| matches!(e, ExportMessage::PrepAck { .. })))
        .unwrap();
    sim.node_mut(0).proc_message(prep_ack.from, prep_ack.msg);
    sim.run();
    assert_eq!(sim.held().len(), 1);
    assert!(sim.node(0).topology().exports().contains(&d));

    sim.release_held();
    sim.settle();
    let finishes = sim
        .delivered()
        .iter()
        .filter(|m| is_export(m, |e| matches!(e, ExportMessage::Finish { .. })))
        .count();
    assert_eq!(finishes, 1);
    assert_dir_owner(&sim, d, 2);
    assert_quiescent(&sim);
}

// =============================================================================
// Chains and nesting
// =============================================================================

#[test]
fn test_export_back_to_origin() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 3);

    sim.export(0, d, 2);
    sim.export(2, d, 0);

    assert_dir_owner(&sim, d, 0);
    assert!(!sim.node(2).topology().is_import(d));
    assert_eq!(sim.call(2, create("/d/back")).served_by, 0);
    assert_eq!(names(&sim.ok(1, readdir("/d"))).len(), 4);
    assert_quiescent(&sim);
}

#[test]
fn test_export_around_nested_import() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 2);
    let sub = populate(&mut sim, 0, "/d/sub", 2);

    sim.export(0, sub, 1);
    sim.export(0, d, 2);

    assert_dir_owner(&sim, d, 2);
    assert_dir_owner(&sim, sub, 1);
    assert!(sim.node(1).topology().is_import(sub));
    assert!(sim.node(2).topology().is_import(d));

    assert_eq!(sim.call(0, create("/d/sub/z")).served_by, 1);
    assert_eq!(sim.call(0, create("/d/z")).served_by, 2);
    assert_eq!(names(&sim.ok(2, readdir("/d/sub"))), vec!["f0", "f1", "z"]);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

// =============================================================================
// Shutdown drain
// =============================================================================

#[test]
fn test_shutdown_returns_imports_to_root() {
    let mut sim = three_nodes();
    let d = populate(&mut sim, 0, "/d", 3);
    sim.export(0, d, 2);

    let mut drained = false;
    for _ in 0..50 {
        drained = sim.node_mut(2).shutdown_step();
        sim.run();
        if drained {
            break;
        }
        sim.tick();
    }
    assert!(drained);
    assert!(sim.node(2).is_shutting_down());
    assert!(sim.node(2).topology().imports().is_empty());
    assert_dir_owner(&sim, d, 0);
    assert_eq!(names(&sim.ok(1, readdir("/d"))).len(), 3);
}
