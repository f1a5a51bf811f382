//! Shared helpers for the in-process cluster tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use chorus_store::{put_txn, read_txn, Cluster};
use chorus_txn::protocol::{Config, NodeId, TxnOutcome};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Tight timeouts so progress-log behavior is observable within a test run.
pub fn test_config() -> Config {
    Config {
        rpc_timeout: Duration::from_millis(500),
        propose_timeout: Duration::from_secs(3),
        recovery_min_delay: Duration::from_millis(50),
        progress_interval: Duration::from_millis(20),
        progress_stall: Duration::from_millis(150),
        accept_reject_limit: 3,
        command_stores: 4,
    }
}

/// A configuration whose progress log will not fire during the test, for
/// tests that drive protocol phases by hand.
pub fn quiet_config() -> Config {
    Config {
        progress_stall: Duration::from_secs(60),
        progress_interval: Duration::from_secs(10),
        ..test_config()
    }
}

pub async fn put(
    cluster: &Cluster,
    from: NodeId,
    key: &str,
    value: &[u8],
) -> anyhow::Result<TxnOutcome> {
    cluster.node(from).submit(put_txn(key, value)).await
}

pub async fn get(cluster: &Cluster, from: NodeId, key: &str) -> anyhow::Result<Bytes> {
    match cluster.node(from).submit(read_txn(key)).await? {
        TxnOutcome::Applied { result, .. } => Ok(result),
        TxnOutcome::Invalidated => bail!("read transaction was invalidated"),
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
