//! Epoch -> shard -> replica mapping and quorum arithmetic.
//!
//! Topologies are immutable snapshots; the manager keeps the copy-on-write
//! sequence of epochs and tracks durability acknowledgements. Readers take a
//! stable `Arc` snapshot per operation, so a topology change never tears an
//! in-flight message.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, ensure, Context};
use tokio::sync::watch;

use super::routing::{KeyRange, Ranges, RoutingKey, Unseekables};
use super::timestamp::{Epoch, NodeId};

/// One shard: a contiguous slice of the routing ring, its replica set, and
/// the electorate eligible to vote on the fast path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub range: KeyRange,
    replicas: Vec<NodeId>,
    fast_path_electorate: Vec<NodeId>,
}

impl Shard {
    pub fn new(
        range: KeyRange,
        mut replicas: Vec<NodeId>,
        mut fast_path_electorate: Vec<NodeId>,
    ) -> anyhow::Result<Shard> {
        ensure!(!range.is_empty(), "shard range cannot be empty");
        replicas.sort_unstable();
        replicas.dedup();
        ensure!(!replicas.is_empty(), "shard replica set cannot be empty");
        fast_path_electorate.sort_unstable();
        fast_path_electorate.dedup();
        let replica_set = replicas.iter().copied().collect::<HashSet<_>>();
        for member in &fast_path_electorate {
            ensure!(
                replica_set.contains(member),
                "fast-path elector {member} must also be a shard replica"
            );
        }
        let shard = Shard {
            range,
            replicas,
            fast_path_electorate,
        };
        ensure!(
            shard.fast_path_electorate.len() >= shard.replicas.len() - shard.max_failures(),
            "fast-path electorate too small to survive {} failures",
            shard.max_failures()
        );
        Ok(shard)
    }

    /// Every replica is a fast-path elector.
    pub fn with_full_electorate(range: KeyRange, replicas: Vec<NodeId>) -> anyhow::Result<Shard> {
        let electorate = replicas.clone();
        Shard::new(range, replicas, electorate)
    }

    pub fn replicas(&self) -> &[NodeId] {
        &self.replicas
    }

    pub fn fast_path_electorate(&self) -> &[NodeId] {
        &self.fast_path_electorate
    }

    pub fn is_replica(&self, node: NodeId) -> bool {
        self.replicas.binary_search(&node).is_ok()
    }

    pub fn in_electorate(&self, node: NodeId) -> bool {
        self.fast_path_electorate.binary_search(&node).is_ok()
    }

    pub fn max_failures(&self) -> usize {
        (self.replicas.len() - 1) / 2
    }

    /// Simple (slow-path, recovery) quorum: a majority of replicas.
    pub fn slow_quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    /// Fast-path quorum over the electorate: any two fast-path quorums
    /// intersect inside every recovery quorum, so a recovered proposal can
    /// always learn the fast-path outcome.
    pub fn fast_path_quorum(&self) -> usize {
        (self.fast_path_electorate.len() + self.max_failures()) / 2 + 1
    }
}

/// An epoch's shard layout: ordered, disjoint ranges over the routing ring.
#[derive(Clone, Debug)]
pub struct Topology {
    epoch: Epoch,
    shards: Vec<Shard>,
}

impl Topology {
    pub fn new(epoch: Epoch, mut shards: Vec<Shard>) -> anyhow::Result<Topology> {
        ensure!(!shards.is_empty(), "topology requires at least one shard");
        shards.sort_by_key(|s| s.range.start);
        for pair in shards.windows(2) {
            ensure!(
                pair[0].range.end <= pair[1].range.start,
                "topology shards overlap: {:?} and {:?}",
                pair[0].range,
                pair[1].range
            );
        }
        Ok(Topology { epoch, shards })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard_for(&self, rk: RoutingKey) -> Option<&Shard> {
        let idx = self
            .shards
            .partition_point(|s| s.range.end <= rk.0 && s.range.end != u64::MAX);
        self.shards.get(idx).filter(|s| s.range.contains(rk))
    }

    /// Shards intersecting an unseekables projection, in ring order.
    pub fn shards_for(&self, scope: &Unseekables) -> Vec<&Shard> {
        self.shards
            .iter()
            .filter(|s| scope.intersects(&s.range))
            .collect()
    }

    /// Union of all shard ranges that assign `node` as a replica.
    pub fn ranges_for_node(&self, node: NodeId) -> Ranges {
        Ranges::new(
            self.shards
                .iter()
                .filter(|s| s.is_replica(node))
                .map(|s| s.range)
                .collect(),
        )
    }

    /// All nodes appearing in any shard, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .shards
            .iter()
            .flat_map(|s| s.replicas.iter().copied())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

/// Keeper of the epoch sequence.
///
/// Epoch E counts as durable once a majority of epoch E-1's nodes have
/// acknowledged it. The first installed epoch is durable by construction.
pub struct TopologyManager {
    epochs: RwLock<Vec<Arc<Topology>>>,
    acks: Mutex<HashMap<Epoch, HashSet<NodeId>>>,
    durable: Mutex<HashSet<Epoch>>,
    epoch_tx: watch::Sender<Epoch>,
    epoch_rx: watch::Receiver<Epoch>,
}

impl TopologyManager {
    pub fn new(initial: Topology) -> TopologyManager {
        let epoch = initial.epoch();
        let (epoch_tx, epoch_rx) = watch::channel(epoch);
        let mut durable = HashSet::new();
        durable.insert(epoch);
        TopologyManager {
            epochs: RwLock::new(vec![Arc::new(initial)]),
            acks: Mutex::new(HashMap::new()),
            durable: Mutex::new(durable),
            epoch_tx,
            epoch_rx,
        }
    }

    pub fn current(&self) -> Arc<Topology> {
        let epochs = self.epochs.read().unwrap_or_else(|e| e.into_inner());
        epochs
            .last()
            .cloned()
            .expect("topology manager always holds at least one epoch")
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current().epoch()
    }

    pub fn at(&self, epoch: Epoch) -> Option<Arc<Topology>> {
        let epochs = self.epochs.read().unwrap_or_else(|e| e.into_inner());
        epochs.iter().find(|t| t.epoch() == epoch).cloned()
    }

    /// Install the next epoch. Epochs must be added in order, one at a time.
    pub fn add(&self, topology: Topology) -> anyhow::Result<()> {
        let mut epochs = self.epochs.write().unwrap_or_else(|e| e.into_inner());
        let last = epochs
            .last()
            .map(|t| t.epoch())
            .expect("topology manager always holds at least one epoch");
        if topology.epoch() <= last {
            // Re-delivery of an already-known epoch is not an error.
            ensure!(
                topology.epoch() >= epochs[0].epoch(),
                "topology epoch {} predates retained history",
                topology.epoch()
            );
            return Ok(());
        }
        if topology.epoch() != last + 1 {
            bail!(
                "topology epoch {} does not follow current epoch {last}",
                topology.epoch()
            );
        }
        let epoch = topology.epoch();
        epochs.push(Arc::new(topology));
        drop(epochs);
        let _ = self.epoch_tx.send(epoch);
        Ok(())
    }

    /// Record `node`'s acknowledgement of `epoch`. Returns true when the
    /// acknowledgement made the epoch durable.
    pub fn acknowledge(&self, epoch: Epoch, node: NodeId) -> anyhow::Result<bool> {
        let previous = self.at(epoch.saturating_sub(1)).with_context(|| {
            format!(
                "cannot acknowledge epoch {epoch} without epoch {}",
                epoch.saturating_sub(1)
            )
        })?;
        let quorum = previous.nodes().len() / 2 + 1;

        let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = acks.entry(epoch).or_default();
        entry.insert(node);
        if entry.len() < quorum {
            return Ok(false);
        }
        drop(acks);

        let mut durable = self.durable.lock().unwrap_or_else(|e| e.into_inner());
        Ok(durable.insert(epoch))
    }

    pub fn is_durable(&self, epoch: Epoch) -> bool {
        self.durable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&epoch)
    }

    /// Wait until the local sequence reaches `epoch`, then return it. Used by
    /// the epoch gate when a request from the future arrives.
    pub async fn wait_for(&self, epoch: Epoch) -> anyhow::Result<Arc<Topology>> {
        if let Some(t) = self.at(epoch) {
            return Ok(t);
        }
        let mut rx = self.epoch_rx.clone();
        loop {
            if *rx.borrow_and_update() >= epoch {
                break;
            }
            rx.changed()
                .await
                .context("topology manager closed while waiting for epoch")?;
        }
        self.at(epoch)
            .with_context(|| format!("epoch {epoch} missing after wait"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(start: u64, end: u64, replicas: Vec<NodeId>) -> Shard {
        Shard::with_full_electorate(KeyRange::new(start, end), replicas).unwrap()
    }

    #[test]
    fn quorum_sizes() {
        let s3 = shard(0, 100, vec![1, 2, 3]);
        assert_eq!(s3.max_failures(), 1);
        assert_eq!(s3.slow_quorum(), 2);
        assert_eq!(s3.fast_path_quorum(), 3);

        let s5 = shard(0, 100, vec![1, 2, 3, 4, 5]);
        assert_eq!(s5.max_failures(), 2);
        assert_eq!(s5.slow_quorum(), 3);
        assert_eq!(s5.fast_path_quorum(), 4);
    }

    #[test]
    fn electorate_must_be_replicas() {
        let err = Shard::new(KeyRange::new(0, 10), vec![1, 2, 3], vec![1, 4]);
        assert!(err.is_err());
    }

    #[test]
    fn shard_lookup_by_routing_point() {
        let topology = Topology::new(
            1,
            vec![
                shard(0, 100, vec![1, 2, 3]),
                shard(100, u64::MAX, vec![4, 5, 6]),
            ],
        )
        .unwrap();

        assert_eq!(topology.shard_for(RoutingKey(50)).unwrap().range.start, 0);
        assert_eq!(topology.shard_for(RoutingKey(100)).unwrap().range.start, 100);
        assert_eq!(
            topology.shard_for(RoutingKey(u64::MAX)).unwrap().range.start,
            100
        );
    }

    #[test]
    fn ranges_for_node_unions_assignments() {
        let topology = Topology::new(
            1,
            vec![
                shard(0, 100, vec![1, 2, 3]),
                shard(100, 200, vec![1, 4, 5]),
                shard(200, 300, vec![4, 5, 6]),
            ],
        )
        .unwrap();
        let ranges = topology.ranges_for_node(1);
        assert!(ranges.contains(RoutingKey(50)));
        assert!(ranges.contains(RoutingKey(150)));
        assert!(!ranges.contains(RoutingKey(250)));
        // Adjacent assignments merge into one range.
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn overlapping_shards_rejected() {
        let result = Topology::new(
            1,
            vec![shard(0, 150, vec![1, 2, 3]), shard(100, 200, vec![1, 2, 3])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn epoch_durability_needs_previous_quorum() {
        let manager = TopologyManager::new(
            Topology::new(1, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap(),
        );
        assert!(manager.is_durable(1));

        manager
            .add(Topology::new(2, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap())
            .unwrap();
        assert!(!manager.is_durable(2));
        assert!(!manager.acknowledge(2, 1).unwrap());
        assert!(manager.acknowledge(2, 2).unwrap());
        assert!(manager.is_durable(2));
        // Further acks are idempotent.
        assert!(!manager.acknowledge(2, 3).unwrap());
    }

    #[test]
    fn add_rejects_gaps_and_tolerates_redelivery() {
        let manager = TopologyManager::new(
            Topology::new(1, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap(),
        );
        assert!(manager
            .add(Topology::new(3, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap())
            .is_err());
        manager
            .add(Topology::new(2, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap())
            .unwrap();
        manager
            .add(Topology::new(2, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap())
            .unwrap();
        assert_eq!(manager.current_epoch(), 2);
    }

    #[tokio::test]
    async fn wait_for_unblocks_on_add() {
        let manager = Arc::new(TopologyManager::new(
            Topology::new(1, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap(),
        ));
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for(2).await.map(|t| t.epoch()) })
        };
        tokio::task::yield_now().await;
        manager
            .add(Topology::new(2, vec![shard(0, u64::MAX, vec![1, 2, 3])]).unwrap())
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 2);
    }
}
