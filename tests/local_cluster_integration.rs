//! Integration tests for the in-process tokio cluster.

#[allow(dead_code)]
mod common;

use common::*;
use std::time::Duration;
use strata_mds::cluster::{AdminOp, LocalCluster};
use strata_mds::config::MdsConfig;
use strata_mds::mds::ReplyBody;
use strata_mds::types::InodeId;

fn fast_config() -> MdsConfig {
    let mut config = MdsConfig::development();
    config.protocol.tick_interval = Duration::from_millis(2);
    config
}

fn ino_of(body: ReplyBody) -> InodeId {
    match body {
        ReplyBody::Inode { ino, .. } => ino,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_clients() {
    let cluster = LocalCluster::start(&fast_config()).unwrap();
    let setup = cluster.client();
    setup.call(0, mkdir("/shared")).await.unwrap();

    let mut tasks = Vec::new();
    for c in 0..6u64 {
        let client = cluster.client();
        tasks.push(tokio::spawn(async move {
            for i in 0..5 {
                let node = (c + i) % 3;
                client
                    .call(node, create(&format!("/shared/c{}-{}", c, i)))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let listed = names(&setup.call(2, readdir("/shared")).await.unwrap());
    assert_eq!(listed.len(), 30);
    assert!(listed.windows(2).all(|w| w[0] < w[1]));

    assert!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_admin_export_and_drain() {
    let cluster = LocalCluster::start(&fast_config()).unwrap();
    let client = cluster.client();
    let d = ino_of(client.call(0, mkdir("/d")).await.unwrap());
    client.call(1, create("/d/a")).await.unwrap();

    client.admin(0, AdminOp::Export { dir: d, dest: 2 }).await.unwrap();

    let mut moved = false;
    for _ in 0..200 {
        let reply = client.request(0, readdir("/d")).await.unwrap();
        if reply.served_by == 2 {
            assert_eq!(names(&reply.result.unwrap()), vec!["a"]);
            moved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(moved, "export of /d never completed");

    client.call(1, create("/d/b")).await.unwrap();
    assert_eq!(names(&client.call(0, readdir("/d")).await.unwrap()), vec!["a", "b"]);

    // mds2 hands the import back to the root node before stopping
    assert!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_admin_hash_round_trip() {
    let cluster = LocalCluster::start(&fast_config()).unwrap();
    let client = cluster.client();
    let h = ino_of(client.call(0, mkdir("/h")).await.unwrap());
    for i in 0..9 {
        client.call(0, create(&format!("/h/f{}", i))).await.unwrap();
    }

    client.admin(0, AdminOp::Hash { dir: h }).await.unwrap();
    // A second hash is refused while the first is in flight or done
    assert!(client.admin(0, AdminOp::Hash { dir: h }).await.is_err());

    let listed = names(&client.call(1, readdir("/h")).await.unwrap());
    assert_eq!(listed.len(), 9);

    let mut unhashed = false;
    for _ in 0..200 {
        if client.admin(0, AdminOp::Unhash { dir: h }).await.is_ok() {
            unhashed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(unhashed);
    client.call(2, create("/h/after")).await.unwrap();
    assert_eq!(names(&client.call(2, readdir("/h")).await.unwrap()).len(), 10);

    assert!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_unknown_node_is_rejected() {
    let cluster = LocalCluster::start(&fast_config()).unwrap();
    let client = cluster.client();
    assert!(client.call(9, stat("/")).await.is_err());
    assert!(client.admin(9, AdminOp::Hash { dir: 1 }).await.is_err());
    assert!(cluster.shutdown().await);
}
