//! History checks: every observed sequence on a key must linearize.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chorus_store::{append_txn, decode_sequence, Cluster, LinearizabilityVerifier};
use chorus_txn::protocol::{NodeId, TxnOutcome};
use common::{get, init_logging, test_config};

struct Observation {
    event_id: u32,
    start: i64,
    end: i64,
    sequence: Vec<u32>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_appends_read_in_submission_order() {
    init_logging();
    let cluster = Cluster::single_shard(3, test_config()).unwrap();
    let clock = AtomicI64::new(0);
    let mut verifier = LinearizabilityVerifier::new(1);

    for i in 0..5u32 {
        let from = (i as NodeId % 3) + 1;
        let start = clock.fetch_add(1, Ordering::SeqCst);
        let outcome = cluster.node(from).submit(append_txn("seq", i)).await.unwrap();
        let end = clock.fetch_add(1, Ordering::SeqCst);

        let TxnOutcome::Applied { result, .. } = outcome else {
            panic!("append invalidated");
        };
        let sequence = decode_sequence(&result);
        // A sequential client observes its writes in submission order.
        assert_eq!(sequence, (0..=i).collect::<Vec<_>>());

        verifier.witness_write(i, start, end, true).unwrap();
        verifier.witness_read(&sequence, start, end).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_linearize() {
    init_logging();
    let cluster = Arc::new(Cluster::single_shard(3, test_config()).unwrap());
    let clock = Arc::new(AtomicI64::new(0));
    let log: Arc<Mutex<Vec<Observation>>> = Arc::new(Mutex::new(Vec::new()));

    let mut writers = Vec::new();
    for writer in 0..3u32 {
        let cluster = cluster.clone();
        let clock = clock.clone();
        let log = log.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..4u32 {
                // Random jitter varies the interleaving between runs.
                let jitter = rand::random::<u64>() % 5;
                tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                let event_id = writer * 100 + i;
                let from = NodeId::from(writer) + 1;
                let start = clock.fetch_add(1, Ordering::SeqCst);
                let outcome = cluster
                    .node(from)
                    .submit(append_txn("burn", event_id))
                    .await
                    .unwrap();
                let end = clock.fetch_add(1, Ordering::SeqCst);
                let TxnOutcome::Applied { result, .. } = outcome else {
                    panic!("append invalidated");
                };
                log.lock().unwrap().push(Observation {
                    event_id,
                    start,
                    end,
                    sequence: decode_sequence(&result),
                });
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    // A final read from every coordinator: all must agree.
    let start = clock.fetch_add(1, Ordering::SeqCst);
    let final_raw = get(&cluster, 1, "burn").await.unwrap();
    let end = clock.fetch_add(1, Ordering::SeqCst);
    let final_seq = decode_sequence(&final_raw);
    assert_eq!(final_seq.len(), 12);
    for from in 2..=3u64 {
        let raw = get(&cluster, from, "burn").await.unwrap();
        assert_eq!(decode_sequence(&raw), final_seq);
    }

    let mut verifier = LinearizabilityVerifier::new(1);
    let observations = Arc::try_unwrap(log)
        .ok()
        .expect("writers finished")
        .into_inner()
        .unwrap();
    for obs in &observations {
        verifier
            .witness_write(obs.event_id, obs.start, obs.end, true)
            .unwrap();
    }
    for obs in &observations {
        if let Err(violation) = verifier.witness_read(&obs.sequence, obs.start, obs.end) {
            panic!("history violation: {violation}");
        }
    }
    verifier.witness_read(&final_seq, start, end).unwrap();
}
