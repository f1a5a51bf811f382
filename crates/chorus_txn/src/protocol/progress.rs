//! Per-store progress log: nudges stuck transactions toward recovery.
//!
//! Every status change reschedules the command's deadline. When a deadline
//! fires below Committed, the monitor escalates: the home-key owner recovers
//! immediately, other replicas first nudge the home shard with WaitOnCommit
//! and recover themselves only if the transaction stays stuck.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::command::{CommandStore, PreLoadContext, Status};
use super::messages::WaitOnCommit;
use super::node::Node;
use super::recover;
use super::timestamp::TxnId;

#[derive(Clone, Copy, Debug)]
struct ProgressEntry {
    status: Status,
    deadline: Instant,
    expiries: u32,
}

/// Deadline table keyed by TxnId, owned by one command store and mutated
/// only from that store's context.
pub struct ProgressLog {
    entries: Mutex<HashMap<TxnId, ProgressEntry>>,
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLog {
    pub fn new() -> ProgressLog {
        ProgressLog {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Reschedule after a status change. Terminal states leave the log.
    pub fn track(&self, txn_id: TxnId, status: Status, stall: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if status.is_terminal() {
            entries.remove(&txn_id);
            return;
        }
        let deadline = Instant::now() + stall;
        match entries.get_mut(&txn_id) {
            Some(entry) => {
                if entry.status != status {
                    entry.expiries = 0;
                }
                entry.status = status;
                entry.deadline = deadline;
            }
            None => {
                entries.insert(
                    txn_id,
                    ProgressEntry {
                        status,
                        deadline,
                        expiries: 0,
                    },
                );
            }
        }
    }

    pub fn forget(&self, txn_id: TxnId) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&txn_id);
    }

    /// Expired entries below Committed. Each is pushed one stall interval
    /// into the future so escalation retries stay bounded.
    fn due(&self, now: Instant, stall: Duration) -> Vec<(TxnId, Status, u32)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut fired = Vec::new();
        for (txn_id, entry) in entries.iter_mut() {
            if entry.deadline > now || entry.status.is_committed() {
                continue;
            }
            entry.expiries = entry.expiries.saturating_add(1);
            entry.deadline = now + stall;
            fired.push((*txn_id, entry.status, entry.expiries));
        }
        fired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Background monitor for one store. Spawned once per store from
/// `Node::start`.
pub(crate) fn spawn_store_monitor(node: Arc<Node>, store: Arc<CommandStore>) {
    tokio::spawn(async move {
        let interval_period = node.config().progress_interval;
        let stall = node.config().progress_stall;
        let mut interval = tokio::time::interval(interval_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for (txn_id, status, expiries) in store.progress.due(Instant::now(), stall) {
                if let Err(err) = escalate(&node, &store, txn_id, status, expiries).await {
                    tracing::warn!(
                        txn_id = ?txn_id,
                        error = ?err,
                        "progress escalation failed"
                    );
                }
            }
        }
    });
}

async fn escalate(
    node: &Arc<Node>,
    store: &Arc<CommandStore>,
    txn_id: TxnId,
    logged_status: Status,
    expiries: u32,
) -> anyhow::Result<()> {
    let (status, route, known_scope) = store
        .exec(PreLoadContext::for_txn(txn_id), |s| {
            let cmd = s
                .command(txn_id)
                .expect("preloaded command exists");
            Ok((cmd.status, cmd.route.clone(), cmd.known_scope.clone()))
        })
        .await?;

    if status.is_committed() || status.is_terminal() {
        store
            .progress
            .track(txn_id, status, node.config().progress_stall);
        return Ok(());
    }

    let topology = node.topology.current();
    let home_local = route.as_ref().is_some_and(|r| {
        store.range().contains(r.home_key())
            && topology
                .shard_for(r.home_key())
                .is_some_and(|shard| shard.is_replica(node.id()))
    });

    let scope = match route.as_ref() {
        Some(r) => Some(r.to_maximal_unseekables()),
        None => known_scope,
    };
    let Some(scope) = scope else {
        // Nothing is known about the transaction yet; keep waiting for a
        // message that carries its route.
        return Ok(());
    };

    if home_local || expiries >= 2 {
        tracing::debug!(
            txn_id = ?txn_id,
            status = ?logged_status,
            expiries = expiries,
            home_local = home_local,
            "progress log escalating to recovery"
        );
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = recover::recover(&node, txn_id, scope).await {
                tracing::warn!(txn_id = ?txn_id, error = ?err, "progress-driven recovery failed");
            }
        });
        return Ok(());
    }

    // Not the home shard yet: ask the home shard to chase the commit.
    if let Some(route) = route {
        let home = route.home_key();
        if let Some(shard) = topology.shard_for(home) {
            let epoch = topology.epoch();
            for replica in shard.replicas().iter().copied() {
                let req = WaitOnCommit {
                    txn_id,
                    scope: route
                        .to_maximal_unseekables()
                        .slice(&topology.ranges_for_node(replica)),
                    epoch,
                };
                let transport = node.transport();
                tokio::spawn(async move {
                    let _ = transport.wait_on_commit(replica, req).await;
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::timestamp::{Timestamp, TxnKind};

    fn txn_id(hlc: u64) -> TxnId {
        TxnId::new(Timestamp::new(1, hlc, 1), TxnKind::Write)
    }

    #[test]
    fn terminal_states_leave_the_log() {
        let log = ProgressLog::new();
        log.track(txn_id(1), Status::PreAccepted, Duration::from_millis(10));
        assert_eq!(log.len(), 1);
        log.track(txn_id(1), Status::Applied, Duration::from_millis(10));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn due_fires_only_below_committed() {
        let log = ProgressLog::new();
        log.track(txn_id(1), Status::PreAccepted, Duration::from_millis(0));
        log.track(txn_id(2), Status::Committed, Duration::from_millis(0));
        let fired = log.due(Instant::now() + Duration::from_millis(1), Duration::from_secs(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, txn_id(1));
        assert_eq!(fired[0].2, 1);

        // Deadline was pushed forward; nothing fires immediately again.
        assert!(log.due(Instant::now(), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn status_change_resets_expiries() {
        let log = ProgressLog::new();
        log.track(txn_id(1), Status::PreAccepted, Duration::from_millis(0));
        let fired = log.due(Instant::now() + Duration::from_millis(1), Duration::from_millis(0));
        assert_eq!(fired[0].2, 1);
        log.track(txn_id(1), Status::Accepted, Duration::from_millis(0));
        let fired = log.due(Instant::now() + Duration::from_millis(1), Duration::from_millis(0));
        assert_eq!(fired[0].2, 1);
    }
}
