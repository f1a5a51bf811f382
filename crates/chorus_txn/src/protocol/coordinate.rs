//! Coordinator-side state machines: PreAccept, Accept, Commit, Execute and
//! Apply, driven by replica replies and tallied per shard.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context};
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time;

use super::command::Status;
use super::messages::{
    Accept, Apply, Commit, Deps, PreAccept, PreAcceptOk, Read, Reply, Txn,
};
use super::node::Node;
use super::recover;
use super::routing::{Ranges, Route, RoutingKey, Seekables, Unseekables};
use super::timestamp::{Ballot, Epoch, NodeId, Timestamp, TxnId};
use super::topology::{Shard, Topology};

/// Client-visible end state of a transaction. A client that imposes its own
/// deadline simply drops the future; the transaction still commits or is
/// invalidated according to protocol rules.
#[derive(Clone, Debug)]
pub enum TxnOutcome {
    Applied {
        execute_at: Timestamp,
        result: Bytes,
    },
    Invalidated,
}

/// Internal phase failure, surfaced to the retry loop in `coordinate`.
#[derive(Debug)]
pub(crate) enum PhaseError {
    /// A replica is at a later epoch; re-route after catching up.
    Retired(Epoch),
    /// A higher ballot owns the transaction.
    Rejected { promised: Ballot },
    /// The transaction was invalidated by recovery.
    Invalidated,
    NoQuorum(anyhow::Error),
}

impl From<anyhow::Error> for PhaseError {
    fn from(value: anyhow::Error) -> Self {
        PhaseError::NoQuorum(value)
    }
}

/// Derive the full route of a transaction: its routing projection anchored at
/// the home key, which is the first routing point of the content.
pub fn route_for(txn: &Txn) -> anyhow::Result<Route> {
    ensure!(!txn.keys.is_empty(), "transaction touches no keys");
    match &txn.keys {
        Seekables::Keys(keys) => {
            let home = keys
                .iter()
                .next()
                .map(|k| k.routing())
                .expect("non-empty keys");
            Ok(Route::full_keys(home, keys.to_routing()))
        }
        Seekables::Ranges(ranges) => {
            let home = ranges
                .iter()
                .next()
                .map(|r| RoutingKey(r.start))
                .expect("non-empty ranges");
            Ok(Route::full_ranges(home, ranges.clone()))
        }
    }
}

/// Run a client transaction to completion from this node.
pub async fn coordinate(node: &Arc<Node>, txn: Txn) -> anyhow::Result<TxnOutcome> {
    let deadline = time::Instant::now() + node.config().propose_timeout;
    let mut topology = node.topology.current();
    let route = route_for(&txn)?;
    let txn_id = node.clock().txn_id(txn.kind, topology.epoch());

    loop {
        if time::Instant::now() > deadline {
            anyhow::bail!("proposal timed out for {txn_id:?}");
        }
        match attempt(node, &topology, txn_id, &txn, &route).await {
            Ok(outcome) => return Ok(outcome),
            Err(PhaseError::Invalidated) => return Ok(TxnOutcome::Invalidated),
            Err(PhaseError::Retired(epoch)) => {
                // Topology moved under us; re-dispatch the same TxnId under
                // the new epoch. Replica handlers are idempotent.
                tracing::debug!(txn_id = ?txn_id, epoch = epoch, "re-routing after epoch change");
                topology = time::timeout(
                    node.config().rpc_timeout,
                    node.topology.wait_for(epoch),
                )
                .await
                .with_context(|| format!("timed out catching up to epoch {epoch}"))??;
            }
            Err(PhaseError::Rejected { promised }) => {
                // A recovery owns the transaction; defer to it.
                tracing::debug!(
                    txn_id = ?txn_id,
                    promised = ?promised,
                    "proposal superseded, handing off to recovery"
                );
                match recover::recover(node, txn_id, route.to_maximal_unseekables()).await? {
                    recover::RecoveryOutcome::Applied { execute_at, result } => {
                        return Ok(TxnOutcome::Applied { execute_at, result });
                    }
                    recover::RecoveryOutcome::Invalidated => {
                        return Ok(TxnOutcome::Invalidated);
                    }
                    recover::RecoveryOutcome::InProgress => {
                        time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            Err(PhaseError::NoQuorum(err)) => return Err(err),
        }
    }
}

async fn attempt(
    node: &Arc<Node>,
    topology: &Arc<Topology>,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
) -> Result<TxnOutcome, PhaseError> {
    let plan = DispatchPlan::for_scope(topology, &route.to_maximal_unseekables())?;
    let pre = pre_accept_round(node, topology, &plan, txn_id, txn, route).await?;

    let (execute_at, deps) = if pre.fast_path {
        (txn_id.ts, pre.deps)
    } else {
        let mut ballot = txn_id.initial_ballot();
        let mut rejections = 0u32;
        let mut backoff = Duration::from_millis(10);
        loop {
            match accept_round(
                node,
                topology,
                &plan,
                txn_id,
                txn,
                route,
                ballot,
                pre.execute_at,
                pre.deps.clone(),
            )
            .await
            {
                Ok(reply_deps) => {
                    break (pre.execute_at, pre.deps.union(&reply_deps)?);
                }
                Err(PhaseError::Rejected { promised }) => {
                    rejections += 1;
                    if rejections >= node.config().accept_reject_limit {
                        return Err(PhaseError::Rejected { promised });
                    }
                    ballot = node.clock().ballot_after(promised, topology.epoch());
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
                Err(other) => return Err(other),
            }
        }
    };

    commit_round(
        node, topology, &plan, txn_id, txn, route, execute_at, &deps,
    )
    .await?;
    execute_and_apply(
        node, topology, &plan, txn_id, txn, route, execute_at, &deps,
    )
    .await
}

/// Shards touched by one dispatch, plus each replica's slice of them.
pub(crate) struct DispatchPlan {
    pub shards: Vec<Shard>,
    pub per_node: BTreeMap<NodeId, Ranges>,
}

impl DispatchPlan {
    pub fn for_scope(topology: &Topology, scope: &Unseekables) -> anyhow::Result<DispatchPlan> {
        let shards: Vec<Shard> = topology.shards_for(scope).into_iter().cloned().collect();
        ensure!(!shards.is_empty(), "dispatch scope touches no shards");
        let mut per_node: BTreeMap<NodeId, Ranges> = BTreeMap::new();
        for shard in &shards {
            for replica in shard.replicas() {
                let entry = per_node.entry(*replica).or_default();
                *entry = entry.union(&Ranges::single(shard.range));
            }
        }
        Ok(DispatchPlan { shards, per_node })
    }

    fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Ranges)> {
        self.per_node.iter()
    }
}

struct PreAcceptOutcome {
    fast_path: bool,
    execute_at: Timestamp,
    deps: Deps,
}

async fn pre_accept_round(
    node: &Arc<Node>,
    topology: &Arc<Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
) -> Result<PreAcceptOutcome, PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;
    let mut pending = FuturesUnordered::new();
    for (&to, ranges) in plan.nodes() {
        let req = PreAccept {
            txn_id,
            route: route.clone(),
            txn: txn.slice(ranges),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.pre_accept(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("pre-accept rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    let mut replies: BTreeMap<NodeId, PreAcceptOk> = BTreeMap::new();
    let mut max_promised: Option<Ballot> = None;
    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(ok)) => {
                replies.insert(to, ok);
            }
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
                if nack.status == Status::Invalidated {
                    return Err(PhaseError::Invalidated);
                }
                max_promised = Some(max_promised.map_or(nack.promised, |b| b.max(nack.promised)));
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "pre-accept dropped");
            }
        }
    }

    // Per-shard quorum check and fast-path evaluation.
    let mut fast_path = true;
    let mut fast_deps = Deps::new();
    for shard in &plan.shards {
        let oks: Vec<(&NodeId, &PreAcceptOk)> = shard
            .replicas()
            .iter()
            .filter_map(|r| replies.get_key_value(r))
            .collect();
        if oks.len() < shard.slow_quorum() {
            if let Some(promised) = max_promised {
                if promised > txn_id.initial_ballot() {
                    return Err(PhaseError::Rejected { promised });
                }
            }
            return Err(PhaseError::NoQuorum(anyhow!(
                "pre-accept quorum not reached in shard {:?} ({}/{})",
                shard.range,
                oks.len(),
                shard.slow_quorum()
            )));
        }

        let electorate_matches: Vec<&PreAcceptOk> = oks
            .iter()
            .filter(|(id, ok)| {
                shard.in_electorate(**id) && ok.witnessed_execute_at == txn_id.ts
            })
            .map(|(_, ok)| *ok)
            .collect();
        let shard_fast = electorate_matches.len() >= shard.fast_path_quorum()
            && electorate_matches
                .windows(2)
                .all(|pair| pair[0].deps.same_ids(&pair[1].deps));
        if shard_fast {
            for ok in &electorate_matches {
                fast_deps = fast_deps.union(&ok.deps)?;
            }
        } else {
            fast_path = false;
        }
    }

    let mut execute_at = txn_id.ts;
    let mut deps = Deps::new();
    for ok in replies.values() {
        if ok.witnessed_execute_at > execute_at {
            execute_at = ok.witnessed_execute_at;
        }
        deps = deps.union(&ok.deps)?;
    }

    if fast_path {
        tracing::debug!(txn_id = ?txn_id, "fast-path pre-accept");
        Ok(PreAcceptOutcome {
            fast_path: true,
            execute_at: txn_id.ts,
            deps: fast_deps,
        })
    } else {
        Ok(PreAcceptOutcome {
            fast_path: false,
            execute_at,
            deps,
        })
    }
}

/// One Accept round at `ballot`. Returns the union of reply-side
/// dependencies on success.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn accept_round(
    node: &Arc<Node>,
    topology: &Arc<Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
    ballot: Ballot,
    execute_at: Timestamp,
    deps: Deps,
) -> Result<Deps, PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;
    let mut pending = FuturesUnordered::new();
    for (&to, ranges) in plan.nodes() {
        let partial = txn.slice(ranges);
        let req = Accept {
            txn_id,
            ballot,
            route: route.clone(),
            txn: partial,
            execute_at,
            deps: deps.clone(),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.accept(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("accept rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    let mut oks: BTreeMap<NodeId, Deps> = BTreeMap::new();
    let mut max_promised: Option<Ballot> = None;
    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(ok)) => {
                oks.insert(to, ok.deps);
                if plan
                    .shards
                    .iter()
                    .all(|s| quorate(s, &oks, s.slow_quorum()))
                {
                    break;
                }
            }
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
                if nack.status == Status::Invalidated {
                    return Err(PhaseError::Invalidated);
                }
                max_promised = Some(max_promised.map_or(nack.promised, |b| b.max(nack.promised)));
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "accept dropped");
            }
        }
    }

    for shard in &plan.shards {
        if !quorate(shard, &oks, shard.slow_quorum()) {
            if let Some(promised) = max_promised {
                if promised > ballot {
                    return Err(PhaseError::Rejected { promised });
                }
            }
            return Err(PhaseError::NoQuorum(anyhow!(
                "accept quorum not reached in shard {:?}",
                shard.range
            )));
        }
    }

    let mut reply_deps = Deps::new();
    for d in oks.values() {
        reply_deps = reply_deps.union(d)?;
    }
    Ok(reply_deps)
}

fn quorate<T>(shard: &Shard, replies: &BTreeMap<NodeId, T>, quorum: usize) -> bool {
    shard
        .replicas()
        .iter()
        .filter(|r| replies.contains_key(r))
        .count()
        >= quorum
}

/// Broadcast the committed (executeAt, deps) to every replica of every shard.
/// Commit expects no reply; failures are left to the progress log.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn commit_round(
    node: &Arc<Node>,
    topology: &Arc<Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
    execute_at: Timestamp,
    deps: &Deps,
) -> Result<(), PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;
    let mut pending = FuturesUnordered::new();
    for (&to, ranges) in plan.nodes() {
        let req = Commit {
            txn_id,
            route: route.clone(),
            txn: txn.slice(ranges),
            execute_at,
            deps: deps.slice(ranges),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.commit(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("commit rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(())) => {}
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "commit dropped");
            }
        }
    }
    Ok(())
}

/// Gather reads, compute the writes and result, broadcast Apply, and wait
/// for a write quorum per shard.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_and_apply(
    node: &Arc<Node>,
    topology: &Arc<Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
    execute_at: Timestamp,
    deps: &Deps,
) -> Result<TxnOutcome, PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;

    // Execute: one up-to-date replica per read shard suffices; fall over to
    // the next replica on a nack or a dropped reply.
    let mut values = super::messages::ReadValues::new();
    if !txn.reads.is_empty() {
        for shard in &plan.shards {
            let shard_reads = txn.reads.slice(&Ranges::single(shard.range));
            if shard_reads.is_empty() {
                continue;
            }
            let deadline = time::Instant::now() + rpc_timeout;
            let mut done = false;
            'attempts: loop {
                for &replica in shard.replicas() {
                    let req = Read {
                        txn_id,
                        keys: shard_reads.clone(),
                        epoch: topology.epoch(),
                    };
                    match node.transport().read(replica, req).await {
                        Ok(Reply::Ok(ok)) => {
                            values.extend(ok.values);
                            done = true;
                            break 'attempts;
                        }
                        Ok(Reply::Nack(nack)) => {
                            if let Some(epoch) = nack.retired_epoch {
                                return Err(PhaseError::Retired(epoch));
                            }
                            if nack.status == Status::Invalidated {
                                return Err(PhaseError::Invalidated);
                            }
                        }
                        Err(err) => {
                            tracing::debug!(to = replica, error = ?err, "read dropped");
                        }
                    }
                }
                if time::Instant::now() > deadline {
                    break;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
            if !done {
                return Err(PhaseError::NoQuorum(anyhow!(
                    "no replica served reads for shard {:?}",
                    shard.range
                )));
            }
        }
    }

    let (writes, result) = txn.update.compute(&values);

    let mut pending = FuturesUnordered::new();
    for (&to, ranges) in plan.nodes() {
        let req = Apply {
            txn_id,
            route: route.clone(),
            execute_at,
            deps: deps.slice(ranges),
            writes: writes.slice(ranges),
            result: result.clone(),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.apply(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("apply rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    let mut acks: BTreeMap<NodeId, ()> = BTreeMap::new();
    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(_)) => {
                acks.insert(to, ());
                if plan
                    .shards
                    .iter()
                    .all(|s| quorate(s, &acks, s.slow_quorum()))
                {
                    break;
                }
            }
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
                if nack.status == Status::Invalidated {
                    return Err(PhaseError::Invalidated);
                }
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "apply dropped");
            }
        }
    }

    for shard in &plan.shards {
        if !quorate(shard, &acks, shard.slow_quorum()) {
            return Err(PhaseError::NoQuorum(anyhow!(
                "apply quorum not reached in shard {:?}",
                shard.range
            )));
        }
    }

    Ok(TxnOutcome::Applied { execute_at, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ReadValues, Update, Writes};
    use crate::protocol::routing::{Key, Keys};
    use crate::protocol::timestamp::TxnKind;

    struct Noop;

    impl Update for Noop {
        fn compute(&self, _reads: &ReadValues) -> (Writes, Bytes) {
            (Writes::default(), Bytes::new())
        }
    }

    #[test]
    fn route_home_is_first_routing_point() {
        let keys = Keys::new(vec![Key::new("b"), Key::new("a")]);
        let first = keys.iter().next().unwrap().routing();
        let txn = Txn::new(
            TxnKind::Write,
            Seekables::Keys(keys.clone()),
            Seekables::Keys(keys),
            Arc::new(Noop),
        );
        let route = route_for(&txn).unwrap();
        assert_eq!(route.home_key(), first);
        assert!(route.is_full());
    }

    #[test]
    fn empty_txn_has_no_route() {
        let txn = Txn::new(
            TxnKind::Write,
            Seekables::Keys(Keys::new(vec![])),
            Seekables::Keys(Keys::new(vec![])),
            Arc::new(Noop),
        );
        assert!(route_for(&txn).is_err());
    }
}
