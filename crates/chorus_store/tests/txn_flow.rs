//! End-to-end transaction flows on an in-process cluster.

mod common;

use std::time::Duration;

use chorus_store::{append_txn, decode_sequence, Cluster};
use chorus_txn::protocol::{
    route_for, Commit, Deps, PreAccept, Transport, TxnOutcome, WaitOnCommit,
};
use common::{get, init_logging, put, quiet_config, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_then_read_single_key() {
    init_logging();
    let cluster = Cluster::single_shard(3, test_config()).unwrap();

    let outcome = put(&cluster, 1, "k1", b"v1").await.unwrap();
    assert!(matches!(outcome, TxnOutcome::Applied { .. }));

    // The same client observes its own write, from any coordinator.
    assert_eq!(get(&cluster, 1, "k1").await.unwrap().as_ref(), b"v1");
    assert_eq!(get(&cluster, 2, "k1").await.unwrap().as_ref(), b"v1");
    assert_eq!(get(&cluster, 3, "k1").await.unwrap().as_ref(), b"v1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_writers_both_apply() {
    init_logging();
    let cluster = Cluster::single_shard(3, test_config()).unwrap();

    let (a, b) = tokio::join!(
        put(&cluster, 1, "ka", b"from-1"),
        put(&cluster, 2, "kb", b"from-2"),
    );
    assert!(matches!(a.unwrap(), TxnOutcome::Applied { .. }));
    assert!(matches!(b.unwrap(), TxnOutcome::Applied { .. }));

    assert_eq!(get(&cluster, 3, "ka").await.unwrap().as_ref(), b"from-1");
    assert_eq!(get(&cluster, 3, "kb").await.unwrap().as_ref(), b"from-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_appends_serialize() {
    init_logging();
    let cluster = Cluster::single_shard(3, test_config()).unwrap();

    let node1 = cluster.node(1);
    let node2 = cluster.node(2);
    let node3 = cluster.node(3);
    let (a, b, c) = tokio::join!(
        node1.submit(append_txn("list", 1)),
        node2.submit(append_txn("list", 2)),
        node3.submit(append_txn("list", 3)),
    );
    for outcome in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert!(matches!(outcome, TxnOutcome::Applied { .. }));
    }

    let raw = get(&cluster, 1, "list").await.unwrap();
    let mut seq = decode_sequence(&raw);
    assert_eq!(seq.len(), 3);
    seq.sort_unstable();
    assert_eq!(seq, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_path_survives_one_slow_replica() {
    init_logging();
    let cluster = Cluster::single_shard(5, test_config()).unwrap();

    // Five replicas, fast-path quorum of four: one silent replica must not
    // force the slow path or block commit.
    cluster.transport.set_down(5, true);
    let outcome = put(&cluster, 1, "fp", b"fast").await.unwrap();
    assert!(matches!(outcome, TxnOutcome::Applied { .. }));
    assert_eq!(get(&cluster, 2, "fp").await.unwrap().as_ref(), b"fast");

    // The revived replica serves later transactions; redelivered phases are
    // idempotent.
    cluster.transport.set_down(5, false);
    let outcome = put(&cluster, 5, "fp", b"later").await.unwrap();
    assert!(matches!(outcome, TxnOutcome::Applied { .. }));
    assert_eq!(get(&cluster, 4, "fp").await.unwrap().as_ref(), b"later");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_on_commit_blocks_until_every_replica_commits() {
    init_logging();
    let cluster = Cluster::single_shard(3, quiet_config()).unwrap();
    let node1 = cluster.node(1);
    let topology = node1.topology.current();
    let epoch = topology.epoch();

    let txn = chorus_store::put_txn("wk", b"wv");
    let route = route_for(&txn).unwrap();
    let txn_id = node1.clock().txn_id(txn.kind, epoch);

    // Pre-accept everywhere; nothing is committed yet.
    let mut witnessed = txn_id.ts;
    let mut deps = Deps::new();
    for id in 1..=3u64 {
        let req = PreAccept {
            txn_id,
            route: route.clone(),
            txn: txn.slice(&topology.ranges_for_node(id)),
            epoch,
        };
        let ok = cluster
            .transport
            .pre_accept(id, req)
            .await
            .unwrap()
            .ok()
            .expect("pre-accept accepted");
        witnessed = witnessed.max(ok.witnessed_execute_at);
        deps = deps.union(&ok.deps).unwrap();
    }

    // One wait per replica, scoped to that replica's slice.
    let mut waits = Vec::new();
    for id in 1..=3u64 {
        let transport = cluster.transport.clone();
        let req = WaitOnCommit {
            txn_id,
            scope: route
                .to_maximal_unseekables()
                .slice(&topology.ranges_for_node(id)),
            epoch,
        };
        waits.push(tokio::spawn(async move {
            transport.wait_on_commit(id, req).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for wait in &waits {
        assert!(!wait.is_finished(), "wait completed before any commit");
    }

    // Commit on two of three replicas: their waits complete, the third
    // still blocks.
    for id in [1u64, 2] {
        let req = Commit {
            txn_id,
            route: route.clone(),
            txn: txn.slice(&topology.ranges_for_node(id)),
            execute_at: witnessed,
            deps: deps.clone(),
            epoch,
        };
        assert!(cluster.transport.commit(id, req).await.unwrap().is_ok());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(waits[0].is_finished());
    assert!(waits[1].is_finished());
    assert!(!waits[2].is_finished(), "wait finished before its replica committed");

    let req = Commit {
        txn_id,
        route: route.clone(),
        txn: txn.slice(&topology.ranges_for_node(3)),
        execute_at: witnessed,
        deps,
        epoch,
    };
    assert!(cluster.transport.commit(3, req).await.unwrap().is_ok());

    for wait in waits {
        let reply = wait.await.unwrap().unwrap();
        assert!(reply.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_shard_transaction_commits_on_both_shards() {
    init_logging();
    const SPLIT: u64 = 1 << 63;
    let topology = chorus_txn::protocol::Topology::new(
        1,
        vec![
            chorus_txn::protocol::Shard::with_full_electorate(
                chorus_txn::protocol::KeyRange::new(0, SPLIT),
                vec![1, 2, 3],
            )
            .unwrap(),
            chorus_txn::protocol::Shard::with_full_electorate(
                chorus_txn::protocol::KeyRange::new(SPLIT, u64::MAX),
                vec![4, 5, 6],
            )
            .unwrap(),
        ],
    )
    .unwrap();
    let cluster = Cluster::with_topology(topology, test_config()).unwrap();

    let low = key_with_routing(|r| r < SPLIT);
    let high = key_with_routing(|r| r >= SPLIT);

    let outcome = cluster
        .node(1)
        .submit(chorus_store::put_many_txn(&[
            (low.as_str(), &b"va"[..]),
            (high.as_str(), &b"vb"[..]),
        ]))
        .await
        .unwrap();
    assert!(matches!(outcome, TxnOutcome::Applied { .. }));

    // Either shard's data is visible from any coordinator, including nodes
    // that replicate only the other shard.
    assert_eq!(get(&cluster, 4, &low).await.unwrap().as_ref(), b"va");
    assert_eq!(get(&cluster, 2, &high).await.unwrap().as_ref(), b"vb");

    // Writes are sliced to the owning shard: the other shard's replicas
    // never see them.
    assert!(cluster.data_of(4).get(low.as_bytes()).is_none());
    assert!(cluster.data_of(1).get(high.as_bytes()).is_none());
}

fn key_with_routing(accept: impl Fn(u64) -> bool) -> String {
    for i in 0..10_000u32 {
        let candidate = format!("key-{i}");
        if accept(chorus_txn::protocol::Key::new(candidate.clone()).routing().0) {
            return candidate;
        }
    }
    panic!("no key hashed into the requested range");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn topology_change_mid_transaction_applies_exactly_once() {
    init_logging();
    let cluster = Cluster::single_shard(3, test_config()).unwrap();

    // Install epoch 2 on two nodes; the third lags behind and must buffer
    // epoch-2 requests until it catches up.
    let next = {
        let current = cluster.node(1).topology.current();
        chorus_txn::protocol::Topology::new(2, current.shards().to_vec()).unwrap()
    };
    cluster.node(1).topology.add(next.clone()).unwrap();
    cluster.node(2).topology.add(next.clone()).unwrap();
    assert!(!cluster.node(1).topology.acknowledge(2, 1).unwrap());
    assert!(cluster.node(1).topology.acknowledge(2, 2).unwrap());
    assert!(cluster.node(1).topology.is_durable(2));

    let laggard = cluster.node(3);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        laggard.topology.add(next).unwrap();
    });

    let outcome = put(&cluster, 1, "ek", b"ev").await.unwrap();
    assert!(matches!(outcome, TxnOutcome::Applied { .. }));
    assert_eq!(get(&cluster, 3, "ek").await.unwrap().as_ref(), b"ev");
}
