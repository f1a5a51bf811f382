//! In-process transport and cluster wiring.
//!
//! `LocalTransport` dispatches requests straight into the target node's
//! handlers, which keeps multi-node protocol tests inside one process. Nodes
//! marked down return transport errors, which the protocol treats as dropped
//! messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use anyhow::{bail, Context};
use async_trait::async_trait;

use chorus_txn::protocol::{
    Accept, AcceptOk, Apply, ApplyOk, BeginRecovery, Commit, Config, Invalidate, InvalidateOk,
    KeyRange, Node, NodeId, PreAccept, PreAcceptOk, Read, ReadOk, RecoveryOk, Reply, Shard,
    Topology, Transport, WaitOnCommit, WaitOnCommitOk,
};

use crate::mem::MemStore;

#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeId, Weak<Node>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    pub fn new() -> Arc<LocalTransport> {
        Arc::new(LocalTransport::default())
    }

    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.id(), Arc::downgrade(node));
    }

    /// Simulate a crashed or partitioned node.
    pub fn set_down(&self, id: NodeId, down: bool) {
        let mut set = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    fn target(&self, id: NodeId) -> anyhow::Result<Arc<Node>> {
        if self
            .down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
        {
            bail!("node {id} is down");
        }
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .and_then(Weak::upgrade)
            .with_context(|| format!("unknown node {id}"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn pre_accept(&self, to: NodeId, req: PreAccept) -> anyhow::Result<Reply<PreAcceptOk>> {
        self.target(to)?.rpc_pre_accept(req).await
    }

    async fn accept(&self, to: NodeId, req: Accept) -> anyhow::Result<Reply<AcceptOk>> {
        self.target(to)?.rpc_accept(req).await
    }

    async fn commit(&self, to: NodeId, req: Commit) -> anyhow::Result<Reply<()>> {
        self.target(to)?.rpc_commit(req).await
    }

    async fn read(&self, to: NodeId, req: Read) -> anyhow::Result<Reply<ReadOk>> {
        self.target(to)?.rpc_read(req).await
    }

    async fn apply(&self, to: NodeId, req: Apply) -> anyhow::Result<Reply<ApplyOk>> {
        self.target(to)?.rpc_apply(req).await
    }

    async fn begin_recovery(
        &self,
        to: NodeId,
        req: BeginRecovery,
    ) -> anyhow::Result<Reply<RecoveryOk>> {
        self.target(to)?.rpc_begin_recovery(req).await
    }

    async fn wait_on_commit(
        &self,
        to: NodeId,
        req: WaitOnCommit,
    ) -> anyhow::Result<Reply<WaitOnCommitOk>> {
        self.target(to)?.rpc_wait_on_commit(req).await
    }

    async fn invalidate(&self, to: NodeId, req: Invalidate) -> anyhow::Result<Reply<InvalidateOk>> {
        self.target(to)?.rpc_invalidate(req).await
    }
}

/// A multi-node cluster wired over `LocalTransport`.
pub struct Cluster {
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<Arc<Node>>,
    data: HashMap<NodeId, Arc<MemStore>>,
}

impl Cluster {
    /// One shard covering the whole ring, replicated on nodes `1..=n`, every
    /// replica in the fast-path electorate.
    pub fn single_shard(n: usize, config: Config) -> anyhow::Result<Cluster> {
        let replicas: Vec<NodeId> = (1..=n as NodeId).collect();
        let topology = Topology::new(
            1,
            vec![Shard::with_full_electorate(KeyRange::FULL, replicas)?],
        )?;
        Cluster::with_topology(topology, config)
    }

    /// A cluster hosting every node the topology names.
    pub fn with_topology(topology: Topology, config: Config) -> anyhow::Result<Cluster> {
        let transport = LocalTransport::new();
        let mut nodes = Vec::new();
        let mut data = HashMap::new();
        for id in topology.nodes() {
            let store = MemStore::new();
            let node = Node::new(
                id,
                config.clone(),
                topology.clone(),
                transport.clone(),
                store.clone(),
            );
            transport.register(&node);
            node.start();
            data.insert(id, store);
            nodes.push(node);
        }
        Ok(Cluster {
            transport,
            nodes,
            data,
        })
    }

    pub fn node(&self, id: NodeId) -> Arc<Node> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .expect("node id present in cluster")
            .clone()
    }

    pub fn data_of(&self, id: NodeId) -> Arc<MemStore> {
        self.data.get(&id).expect("node id present in cluster").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn down_nodes_drop_messages() {
        let cluster = Cluster::single_shard(3, Config::default()).unwrap();
        cluster.transport.set_down(2, true);
        assert!(cluster.transport.target(2).is_err());
        cluster.transport.set_down(2, false);
        assert!(cluster.transport.target(2).is_ok());
        assert!(cluster.transport.target(9).is_err());
    }
}
