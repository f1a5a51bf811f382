//! Request/reply contracts and the seams an embedder supplies.
//!
//! Every request carries the epoch it was routed under. A replica behind that
//! epoch parks the request until its topology catches up; a replica ahead of
//! it nacks with its current epoch so the sender can re-route. Protocol
//! rejections are `Reply::Nack` values carrying the replica's view; they are
//! not transport errors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::command::Status;
use super::routing::{Key, Keys, Ranges, Route, Seekables, Unseekables};
use super::timestamp::{Ballot, Epoch, NodeId, Timestamp, TxnId, TxnKind};

/// Values gathered for a transaction's read scope.
pub type ReadValues = BTreeMap<Key, Option<Bytes>>;

/// A computed write set: sorted (key, value) pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Writes(Vec<(Key, Bytes)>);

impl Writes {
    pub fn new(mut items: Vec<(Key, Bytes)>) -> Writes {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.dedup_by(|a, b| a.0 == b.0);
        Writes(items)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Key, Bytes)> {
        self.0.iter()
    }

    pub fn slice(&self, by: &Ranges) -> Writes {
        Writes(
            self.0
                .iter()
                .filter(|(k, _)| by.contains(k.routing()))
                .cloned()
                .collect(),
        )
    }
}

/// Application logic of one transaction: given the values read, produce the
/// writes and the opaque client-visible result. Must be deterministic, since
/// recovery may re-run it.
pub trait Update: Send + Sync + 'static {
    fn compute(&self, reads: &ReadValues) -> (Writes, Bytes);
}

/// A full client transaction: the keys it may touch, the subset it reads,
/// and the update that turns read values into writes and a result.
#[derive(Clone)]
pub struct Txn {
    pub kind: TxnKind,
    pub keys: Seekables,
    pub reads: Seekables,
    pub update: Arc<dyn Update>,
}

impl Txn {
    pub fn new(kind: TxnKind, keys: Seekables, reads: Seekables, update: Arc<dyn Update>) -> Txn {
        Txn {
            kind,
            keys,
            reads,
            update,
        }
    }

    /// The projection of this transaction onto `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> PartialTxn {
        PartialTxn {
            kind: self.kind,
            keys: self.keys.slice(ranges),
            reads: self.reads.slice(ranges),
            update: self.update.clone(),
        }
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("kind", &self.kind)
            .field("keys", &self.keys)
            .field("reads", &self.reads)
            .finish_non_exhaustive()
    }
}

/// A transaction sliced to some replica's ranges. The update travels with
/// every slice so any witness can finish execution during recovery.
#[derive(Clone)]
pub struct PartialTxn {
    pub kind: TxnKind,
    pub keys: Seekables,
    pub reads: Seekables,
    pub update: Arc<dyn Update>,
}

impl PartialTxn {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn slice(&self, ranges: &Ranges) -> PartialTxn {
        PartialTxn {
            kind: self.kind,
            keys: self.keys.slice(ranges),
            reads: self.reads.slice(ranges),
            update: self.update.clone(),
        }
    }

    pub fn union(&self, other: &PartialTxn) -> anyhow::Result<PartialTxn> {
        Ok(PartialTxn {
            kind: self.kind,
            keys: self.keys.union(&other.keys)?,
            reads: self.reads.union(&other.reads)?,
            update: self.update.clone(),
        })
    }
}

impl fmt::Debug for PartialTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialTxn")
            .field("kind", &self.kind)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Dependency set: the transactions that must execute before a given one,
/// each tagged with the routing scope where the conflict was witnessed so a
/// replica can restrict its waits to its own slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deps(BTreeMap<TxnId, Unseekables>);

impl Deps {
    pub fn new() -> Deps {
        Deps::default()
    }

    pub fn insert(&mut self, txn_id: TxnId, scope: Unseekables) -> anyhow::Result<()> {
        match self.0.get_mut(&txn_id) {
            Some(existing) => {
                *existing = existing.union(&scope)?;
            }
            None => {
                self.0.insert(txn_id, scope);
            }
        }
        Ok(())
    }

    pub fn union(&self, other: &Deps) -> anyhow::Result<Deps> {
        let mut out = self.clone();
        for (txn_id, scope) in &other.0 {
            out.insert(*txn_id, scope.clone())?;
        }
        Ok(out)
    }

    pub fn slice(&self, by: &Ranges) -> Deps {
        Deps(
            self.0
                .iter()
                .map(|(txn_id, scope)| (*txn_id, scope.slice(by)))
                .filter(|(_, scope)| !scope.is_empty())
                .collect(),
        )
    }

    pub fn ids(&self) -> impl Iterator<Item = &TxnId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TxnId, &Unseekables)> {
        self.0.iter()
    }

    pub fn contains(&self, txn_id: &TxnId) -> bool {
        self.0.contains_key(txn_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fast-path agreement compares the dependency identities; witness scopes
    /// may legitimately differ between replicas and merge by union.
    pub fn same_ids(&self, other: &Deps) -> bool {
        self.0.len() == other.0.len() && self.0.keys().eq(other.0.keys())
    }
}

/// Rejection carrying the replica's current view so the sender can catch up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nack {
    pub status: Status,
    pub promised: Ballot,
    /// Set when the replica is at a later epoch than the request.
    pub retired_epoch: Option<Epoch>,
}

impl Nack {
    pub fn of(status: Status, promised: Ballot) -> Nack {
        Nack {
            status,
            promised,
            retired_epoch: None,
        }
    }

    pub fn retired(epoch: Epoch) -> Nack {
        Nack {
            status: Status::NotWitnessed,
            promised: Ballot::zero(),
            retired_epoch: Some(epoch),
        }
    }
}

/// Reply envelope: protocol rejections are values, not errors.
#[derive(Clone, Debug)]
pub enum Reply<T> {
    Ok(T),
    Nack(Nack),
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Reply::Ok(v) => Some(v),
            Reply::Nack(_) => None,
        }
    }

    pub fn nack(&self) -> Option<Nack> {
        match self {
            Reply::Ok(_) => None,
            Reply::Nack(n) => Some(*n),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PreAccept {
    pub txn_id: TxnId,
    pub route: Route,
    pub txn: PartialTxn,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct PreAcceptOk {
    /// max(TxnId, max(conflicting executeAt) + 1) over the replica's slice.
    pub witnessed_execute_at: Timestamp,
    pub deps: Deps,
}

#[derive(Clone, Debug)]
pub struct Accept {
    pub txn_id: TxnId,
    pub ballot: Ballot,
    pub route: Route,
    pub txn: PartialTxn,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct AcceptOk {
    /// Conflicts witnessed by accept time; the coordinator folds these into
    /// the committed dependency set.
    pub deps: Deps,
}

#[derive(Clone, Debug)]
pub struct Commit {
    pub txn_id: TxnId,
    pub route: Route,
    pub txn: PartialTxn,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct Read {
    pub txn_id: TxnId,
    pub keys: Seekables,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct ReadOk {
    pub values: ReadValues,
}

#[derive(Clone, Debug)]
pub struct Apply {
    pub txn_id: TxnId,
    pub route: Route,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub writes: Writes,
    pub result: Bytes,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug)]
pub struct ApplyOk;

#[derive(Clone, Debug)]
pub struct BeginRecovery {
    pub txn_id: TxnId,
    pub ballot: Ballot,
    pub scope: Unseekables,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct RecoveryOk {
    pub status: Status,
    pub accepted: Ballot,
    pub execute_at: Option<Timestamp>,
    pub deps: Deps,
    pub route: Option<Route>,
    pub txn: Option<PartialTxn>,
}

#[derive(Clone, Debug)]
pub struct WaitOnCommit {
    pub txn_id: TxnId,
    pub scope: Unseekables,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug)]
pub struct WaitOnCommitOk;

#[derive(Clone, Debug)]
pub struct Invalidate {
    pub txn_id: TxnId,
    pub ballot: Ballot,
    pub scope: Unseekables,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug)]
pub struct InvalidateOk {
    /// Status before invalidation, for the recovering coordinator's records.
    pub prior: Status,
}

/// Transport seam. The protocol core is transport-agnostic; implementations
/// can use RPC frameworks, in-memory dispatch, or test harnesses. A transport
/// error means the reply was never observed; the protocol treats it like a
/// dropped message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn pre_accept(&self, to: NodeId, req: PreAccept) -> anyhow::Result<Reply<PreAcceptOk>>;

    async fn accept(&self, to: NodeId, req: Accept) -> anyhow::Result<Reply<AcceptOk>>;

    async fn commit(&self, to: NodeId, req: Commit) -> anyhow::Result<Reply<()>>;

    async fn read(&self, to: NodeId, req: Read) -> anyhow::Result<Reply<ReadOk>>;

    async fn apply(&self, to: NodeId, req: Apply) -> anyhow::Result<Reply<ApplyOk>>;

    async fn begin_recovery(
        &self,
        to: NodeId,
        req: BeginRecovery,
    ) -> anyhow::Result<Reply<RecoveryOk>>;

    async fn wait_on_commit(
        &self,
        to: NodeId,
        req: WaitOnCommit,
    ) -> anyhow::Result<Reply<WaitOnCommitOk>>;

    async fn invalidate(&self, to: NodeId, req: Invalidate) -> anyhow::Result<Reply<InvalidateOk>>;
}

/// Data-store seam required of an embedder. Values are opaque byte strings;
/// the core never inspects them. `apply` is atomic at the per-CommandStore
/// level.
pub trait DataStore: Send + Sync + 'static {
    fn read(&self, keys: &Keys) -> anyhow::Result<ReadValues>;

    fn apply(&self, writes: &Writes) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::routing::{KeyRange, RoutingKey, RoutingKeys};
    use crate::protocol::timestamp::Timestamp;

    fn txn_id(hlc: u64, node: NodeId) -> TxnId {
        TxnId::new(Timestamp::new(1, hlc, node), TxnKind::Write)
    }

    fn key_scope(points: &[u64]) -> Unseekables {
        Unseekables::Keys(RoutingKeys::new(points.iter().map(|p| RoutingKey(*p)).collect()))
    }

    #[test]
    fn deps_union_merges_scopes() {
        let a_id = txn_id(1, 1);
        let mut a = Deps::new();
        a.insert(a_id, key_scope(&[10])).unwrap();
        let mut b = Deps::new();
        b.insert(a_id, key_scope(&[20])).unwrap();
        b.insert(txn_id(2, 2), key_scope(&[30])).unwrap();

        let merged = a.union(&b).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&a_id));
        let entry = merged.iter().next().unwrap();
        match entry.1 {
            Unseekables::Keys(keys) => assert_eq!(keys.len(), 2),
            other => panic!("unexpected scope {other:?}"),
        }
    }

    #[test]
    fn deps_slice_drops_out_of_range_entries() {
        let mut deps = Deps::new();
        deps.insert(txn_id(1, 1), key_scope(&[10])).unwrap();
        deps.insert(txn_id(2, 1), key_scope(&[200])).unwrap();

        let sliced = deps.slice(&Ranges::single(KeyRange::new(0, 100)));
        assert_eq!(sliced.len(), 1);
        assert!(sliced.contains(&txn_id(1, 1)));
    }

    #[test]
    fn deps_same_ids_ignores_scopes() {
        let id = txn_id(1, 1);
        let mut a = Deps::new();
        a.insert(id, key_scope(&[10])).unwrap();
        let mut b = Deps::new();
        b.insert(id, key_scope(&[99])).unwrap();
        assert!(a.same_ids(&b));
        b.insert(txn_id(2, 1), key_scope(&[1])).unwrap();
        assert!(!a.same_ids(&b));
    }

    #[test]
    fn writes_sort_and_slice() {
        let a = Key::new("a");
        let b = Key::new("b");
        let writes = Writes::new(vec![
            (b.clone(), Bytes::from_static(b"2")),
            (a.clone(), Bytes::from_static(b"1")),
        ]);
        assert_eq!(writes.len(), 2);
        let only_a = writes.slice(&Ranges::single(KeyRange::point(a.routing())));
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a.iter().next().unwrap().0, a);
    }
}
