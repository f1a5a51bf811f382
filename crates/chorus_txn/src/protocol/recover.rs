//! Recovery: higher-ballot re-proposal that restores progress after a
//! coordinator failure.
//!
//! The recoverer promises a fresh ballot on every replica of every touched
//! shard, then decides from the highest outcome it observed: adopt a
//! committed value, re-accept the highest accepted value, re-propose from
//! pre-accept witnesses, or invalidate a transaction nobody witnessed. If a
//! previous coordinator could have committed a value, recovery commits that
//! value or proves it unreachable before choosing another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time;

use super::command::Status;
use super::coordinate::{accept_round, commit_round, execute_and_apply, DispatchPlan, PhaseError, TxnOutcome};
use super::messages::{BeginRecovery, Deps, Invalidate, RecoveryOk, Reply, Txn};
use super::node::Node;
use super::routing::{Route, Unseekables};
use super::timestamp::{Ballot, NodeId, Timestamp, TxnId};
use super::topology::Shard;

#[derive(Clone, Debug)]
pub enum RecoveryOutcome {
    Applied {
        execute_at: Timestamp,
        result: Bytes,
    },
    Invalidated,
    /// Another recovery of the same transaction is already running here.
    InProgress,
}

/// Recover one transaction. Concurrent recoveries of the same TxnId on one
/// node collapse into a single attempt.
pub async fn recover(
    node: &Arc<Node>,
    txn_id: TxnId,
    scope: Unseekables,
) -> anyhow::Result<RecoveryOutcome> {
    if !node.try_begin_recovery(txn_id) {
        return Ok(RecoveryOutcome::InProgress);
    }
    let started = time::Instant::now();
    let result = recover_inner(node, txn_id, scope).await;
    node.finish_recovery(txn_id);
    match &result {
        Ok(outcome) => {
            tracing::info!(
                txn_id = ?txn_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                outcome = ?std::mem::discriminant(outcome),
                "recovery finished"
            );
        }
        Err(err) => {
            tracing::warn!(
                txn_id = ?txn_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = ?err,
                "recovery failed"
            );
        }
    }
    result
}

async fn recover_inner(
    node: &Arc<Node>,
    txn_id: TxnId,
    scope: Unseekables,
) -> anyhow::Result<RecoveryOutcome> {
    let deadline = time::Instant::now() + node.config().propose_timeout;
    let mut topology = node.topology.current();
    let mut ballot = node.clock().ballot_after(txn_id.initial_ballot(), topology.epoch());

    loop {
        if time::Instant::now() > deadline {
            anyhow::bail!("recovery timed out for {txn_id:?}");
        }

        let plan = DispatchPlan::for_scope(&topology, &scope)?;
        let gathered = match gather(node, &topology, &plan, txn_id, ballot, &scope).await {
            Ok(g) => g,
            Err(PhaseError::Retired(epoch)) => {
                topology = node.topology.wait_for(epoch).await?;
                continue;
            }
            Err(PhaseError::Rejected { promised }) => {
                ballot = node.clock().ballot_after(promised, topology.epoch());
                time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            Err(PhaseError::Invalidated) => return Ok(RecoveryOutcome::Invalidated),
            Err(PhaseError::NoQuorum(err)) => return Err(err),
        };

        let decision = decide(&plan, &gathered, txn_id)?;
        let acted = match decision {
            Decision::Invalidate => {
                invalidate_round(node, &topology, &plan, txn_id, ballot, &scope).await
            }
            Decision::Finish { execute_at, deps } => {
                finish(
                    node, &topology, &plan, txn_id, ballot, &gathered, execute_at, deps, false,
                )
                .await
            }
            Decision::Propose { execute_at, deps } => {
                finish(
                    node, &topology, &plan, txn_id, ballot, &gathered, execute_at, deps, true,
                )
                .await
            }
        };

        match acted {
            Ok(outcome) => return Ok(outcome),
            Err(PhaseError::Retired(epoch)) => {
                topology = node.topology.wait_for(epoch).await?;
            }
            Err(PhaseError::Rejected { promised }) => {
                ballot = node.clock().ballot_after(promised, topology.epoch());
                time::sleep(Duration::from_millis(10)).await;
            }
            Err(PhaseError::Invalidated) => return Ok(RecoveryOutcome::Invalidated),
            Err(PhaseError::NoQuorum(err)) => return Err(err),
        }
    }
}

struct Gathered {
    replies: BTreeMap<NodeId, RecoveryOk>,
}

impl Gathered {
    fn merged_status(&self) -> Status {
        self.replies
            .values()
            .map(|r| r.status)
            .max()
            .unwrap_or(Status::NotWitnessed)
    }

    fn union_deps(&self) -> anyhow::Result<Deps> {
        let mut deps = Deps::new();
        for reply in self.replies.values() {
            deps = deps.union(&reply.deps)?;
        }
        Ok(deps)
    }

    fn max_witnessed(&self, floor: Timestamp) -> Timestamp {
        self.replies
            .values()
            .filter(|r| r.status >= Status::PreAccepted && r.status <= Status::PreCommitted)
            .filter_map(|r| r.execute_at)
            .fold(floor, Timestamp::max)
    }

    fn execute_at_of(&self, at_least: Status) -> Option<Timestamp> {
        self.replies
            .values()
            .filter(|r| r.status >= at_least)
            .find_map(|r| r.execute_at)
    }

    fn best_accepted(&self) -> Option<&RecoveryOk> {
        self.replies
            .values()
            .filter(|r| r.status == Status::Accepted)
            .max_by_key(|r| r.accepted)
    }

    /// Reassemble the transaction and route from the witnesses' partials.
    fn reconstruct(&self) -> anyhow::Result<(Txn, Route)> {
        let mut route: Option<Route> = None;
        let mut txn = None;
        for reply in self.replies.values() {
            route = Route::merge(route.as_ref(), reply.route.as_ref())?;
            txn = match (txn, reply.txn.as_ref()) {
                (None, Some(partial)) => Some(partial.clone()),
                (Some(acc), Some(partial)) => Some(partial.union(&acc)?),
                (acc, None) => acc,
            };
        }
        let route = route.ok_or_else(|| anyhow!("no witness supplied a route"))?;
        let txn = txn.ok_or_else(|| anyhow!("no witness supplied the transaction body"))?;
        Ok((
            Txn::new(txn.kind, txn.keys.clone(), txn.reads.clone(), txn.update.clone()),
            route,
        ))
    }
}

async fn gather(
    node: &Arc<Node>,
    topology: &Arc<super::topology::Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    ballot: Ballot,
    scope: &Unseekables,
) -> Result<Gathered, PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;
    let mut pending = FuturesUnordered::new();
    for (&to, _) in plan.per_node.iter() {
        let req = BeginRecovery {
            txn_id,
            ballot,
            scope: scope.slice(&topology.ranges_for_node(to)),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.begin_recovery(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("recovery rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    let mut replies = BTreeMap::new();
    let mut max_promised: Option<Ballot> = None;
    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(info)) => {
                replies.insert(to, info);
            }
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
                max_promised = Some(max_promised.map_or(nack.promised, |b| b.max(nack.promised)));
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "recovery gather dropped");
            }
        }
    }

    for shard in &plan.shards {
        let count = shard
            .replicas()
            .iter()
            .filter(|r| replies.contains_key(r))
            .count();
        if count < shard.slow_quorum() {
            if let Some(promised) = max_promised {
                if promised > ballot {
                    return Err(PhaseError::Rejected { promised });
                }
            }
            return Err(PhaseError::NoQuorum(anyhow!(
                "recovery quorum not reached in shard {:?} ({count}/{})",
                shard.range,
                shard.slow_quorum()
            )));
        }
    }

    Ok(Gathered { replies })
}

enum Decision {
    /// The value is already committed somewhere; re-broadcast and execute.
    Finish { execute_at: Timestamp, deps: Deps },
    /// Run Accept with the recovered value, then commit and execute.
    Propose { execute_at: Timestamp, deps: Deps },
    /// Nobody witnessed the transaction; it can no longer commit.
    Invalidate,
}

fn decide(plan: &DispatchPlan, gathered: &Gathered, txn_id: TxnId) -> anyhow::Result<Decision> {
    let status = gathered.merged_status();
    match status {
        Status::Invalidated | Status::AcceptedInvalidate => Ok(Decision::Invalidate),
        s if s.is_committed() => {
            let execute_at = gathered
                .execute_at_of(Status::Committed)
                .ok_or_else(|| anyhow!("committed witness without executeAt"))?;
            Ok(Decision::Finish {
                execute_at,
                deps: gathered.union_deps()?,
            })
        }
        Status::PreCommitted => {
            // The decision's executeAt is fixed even though this witness has
            // no data slice; re-accept it under our ballot.
            let execute_at = gathered
                .execute_at_of(Status::PreCommitted)
                .ok_or_else(|| anyhow!("pre-committed witness without executeAt"))?;
            Ok(Decision::Propose {
                execute_at,
                deps: gathered.union_deps()?,
            })
        }
        Status::Accepted => {
            let best = gathered.best_accepted().expect("accepted witness exists");
            let execute_at = best
                .execute_at
                .ok_or_else(|| anyhow!("accepted witness without executeAt"))?;
            Ok(Decision::Propose {
                execute_at,
                deps: gathered.union_deps()?,
            })
        }
        Status::PreAccepted => {
            // A fast-path commit we cannot see may exist. If the witnesses
            // leave a fast quorum possible in every shard, the only value a
            // previous coordinator could have committed is (TxnId, those
            // deps); recovery must re-propose exactly that value.
            if let Some(deps) = fast_path_value(plan, gathered, txn_id)? {
                Ok(Decision::Propose {
                    execute_at: txn_id.ts,
                    deps,
                })
            } else {
                Ok(Decision::Propose {
                    execute_at: gathered.max_witnessed(txn_id.ts),
                    deps: gathered.union_deps()?,
                })
            }
        }
        _ => Ok(Decision::Invalidate),
    }
}

/// Decide whether a fast-path commit may have happened, and if so with which
/// dependencies.
///
/// A replica that answered our higher ballot can no longer vote for the
/// original pre-accept, so only responders that already witnessed
/// executeAt == TxnId, plus electorate members we did not hear from, can be
/// part of a fast quorum. When every shard still admits such a quorum, its
/// dependency set is known: a fast quorum always overlaps our responders.
fn fast_path_value(
    plan: &DispatchPlan,
    gathered: &Gathered,
    txn_id: TxnId,
) -> anyhow::Result<Option<Deps>> {
    let mut deps = Deps::new();
    for shard in &plan.shards {
        let Some(shard_deps) = shard_fast_path_value(shard, gathered, txn_id)? else {
            return Ok(None);
        };
        deps = deps.union(&shard_deps)?;
    }
    Ok(Some(deps))
}

fn shard_fast_path_value(
    shard: &Shard,
    gathered: &Gathered,
    txn_id: TxnId,
) -> anyhow::Result<Option<Deps>> {
    let electorate = shard.fast_path_electorate();
    let mut unknown = 0usize;
    let mut groups: Vec<(Vec<TxnId>, usize, Deps)> = Vec::new();
    for member in electorate {
        let Some(reply) = gathered.replies.get(member) else {
            unknown += 1;
            continue;
        };
        if reply.status != Status::PreAccepted || reply.execute_at != Some(txn_id.ts) {
            continue;
        }
        let signature: Vec<TxnId> = reply.deps.ids().copied().collect();
        match groups.iter_mut().find(|(sig, _, _)| *sig == signature) {
            Some((_, count, group_deps)) => {
                *count += 1;
                *group_deps = group_deps.union(&reply.deps)?;
            }
            None => groups.push((signature, 1, reply.deps.clone())),
        }
    }

    let best = groups.into_iter().max_by_key(|(_, count, _)| *count);
    match best {
        Some((_, count, deps)) if count + unknown >= shard.fast_path_quorum() => Ok(Some(deps)),
        _ => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish(
    node: &Arc<Node>,
    topology: &Arc<super::topology::Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    ballot: Ballot,
    gathered: &Gathered,
    execute_at: Timestamp,
    deps: Deps,
    needs_accept: bool,
) -> Result<RecoveryOutcome, PhaseError> {
    let (txn, route) = gathered.reconstruct()?;

    let deps = if needs_accept {
        let reply_deps = accept_round(
            node,
            topology,
            plan,
            txn_id,
            &txn,
            &route,
            ballot,
            execute_at,
            deps.clone(),
        )
        .await?;
        deps.union(&reply_deps)?
    } else {
        deps
    };

    commit_round(
        node, topology, plan, txn_id, &txn, &route, execute_at, &deps,
    )
    .await?;

    match execute_and_apply(
        node, topology, plan, txn_id, &txn, &route, execute_at, &deps,
    )
    .await?
    {
        TxnOutcome::Applied { execute_at, result } => {
            Ok(RecoveryOutcome::Applied { execute_at, result })
        }
        TxnOutcome::Invalidated => Ok(RecoveryOutcome::Invalidated),
    }
}

async fn invalidate_round(
    node: &Arc<Node>,
    topology: &Arc<super::topology::Topology>,
    plan: &DispatchPlan,
    txn_id: TxnId,
    ballot: Ballot,
    scope: &Unseekables,
) -> Result<RecoveryOutcome, PhaseError> {
    let rpc_timeout = node.config().rpc_timeout;
    let mut pending = FuturesUnordered::new();
    for (&to, _) in plan.per_node.iter() {
        let req = Invalidate {
            txn_id,
            ballot,
            scope: scope.slice(&topology.ranges_for_node(to)),
            epoch: topology.epoch(),
        };
        let transport = node.transport();
        pending.push(async move {
            let res = match time::timeout(rpc_timeout, transport.invalidate(to, req)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("invalidate rpc to {to} timed out")),
            };
            (to, res)
        });
    }

    let mut acks: BTreeMap<NodeId, ()> = BTreeMap::new();
    let mut max_promised: Option<Ballot> = None;
    while let Some((to, res)) = pending.next().await {
        match res {
            Ok(Reply::Ok(_)) => {
                acks.insert(to, ());
            }
            Ok(Reply::Nack(nack)) => {
                if let Some(epoch) = nack.retired_epoch {
                    return Err(PhaseError::Retired(epoch));
                }
                if nack.status.is_committed() {
                    // The transaction committed after all; rerun the decision
                    // with a fresh gather.
                    return Err(PhaseError::Rejected {
                        promised: nack.promised.max(ballot),
                    });
                }
                max_promised = Some(max_promised.map_or(nack.promised, |b| b.max(nack.promised)));
            }
            Err(err) => {
                tracing::debug!(to = to, error = ?err, "invalidate dropped");
            }
        }
    }

    for shard in &plan.shards {
        let count = shard
            .replicas()
            .iter()
            .filter(|r| acks.contains_key(r))
            .count();
        if count < shard.slow_quorum() {
            if let Some(promised) = max_promised {
                if promised > ballot {
                    return Err(PhaseError::Rejected { promised });
                }
            }
            return Err(PhaseError::NoQuorum(anyhow!(
                "invalidate quorum not reached in shard {:?}",
                shard.range
            )));
        }
    }

    tracing::info!(txn_id = ?txn_id, "transaction invalidated by recovery");
    Ok(RecoveryOutcome::Invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::routing::{Key, KeyRange, Keys, Seekables};
    use crate::protocol::timestamp::{Timestamp, TxnKind};

    fn shard(replicas: Vec<NodeId>) -> Shard {
        Shard::with_full_electorate(KeyRange::FULL, replicas).unwrap()
    }

    fn reply(status: Status, execute_at: Option<Timestamp>, deps: Deps) -> RecoveryOk {
        RecoveryOk {
            status,
            accepted: Ballot::zero(),
            execute_at,
            deps,
            route: None,
            txn: None,
        }
    }

    fn dep_on(id: TxnId) -> Deps {
        let key = Key::new("conflict");
        let mut deps = Deps::new();
        deps.insert(
            id,
            Seekables::Keys(Keys::new(vec![key])).to_unseekables(),
        )
        .unwrap();
        deps
    }

    fn plan_of(shards: Vec<Shard>) -> DispatchPlan {
        let mut per_node = BTreeMap::new();
        for s in &shards {
            for r in s.replicas() {
                per_node.insert(*r, crate::protocol::routing::Ranges::single(s.range));
            }
        }
        DispatchPlan { shards, per_node }
    }

    #[test]
    fn unwitnessed_transaction_is_invalidated() {
        let txn_id = TxnId::new(Timestamp::new(1, 10, 1), TxnKind::Write);
        let plan = plan_of(vec![shard(vec![1, 2, 3])]);
        let mut replies = BTreeMap::new();
        replies.insert(1, reply(Status::NotWitnessed, None, Deps::new()));
        replies.insert(2, reply(Status::NotWitnessed, None, Deps::new()));
        let gathered = Gathered { replies };
        assert!(matches!(
            decide(&plan, &gathered, txn_id).unwrap(),
            Decision::Invalidate
        ));
    }

    #[test]
    fn accepted_witness_wins_over_preaccepted() {
        let txn_id = TxnId::new(Timestamp::new(1, 10, 1), TxnKind::Write);
        let chosen = Timestamp::new(1, 42, 2);
        let plan = plan_of(vec![shard(vec![1, 2, 3])]);
        let mut replies = BTreeMap::new();
        replies.insert(1, reply(Status::Accepted, Some(chosen), Deps::new()));
        replies.insert(2, reply(Status::PreAccepted, Some(txn_id.ts), Deps::new()));
        let gathered = Gathered { replies };
        match decide(&plan, &gathered, txn_id).unwrap() {
            Decision::Propose { execute_at, .. } => assert_eq!(execute_at, chosen),
            other => panic!("unexpected decision {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn possible_fast_path_is_re_proposed_verbatim() {
        // Shard of five: recovery heard three replies. Two electorate
        // members witnessed exactly TxnId with identical deps, two are
        // unknown; with fast quorum 4, a fast-path commit is still possible
        // and must be preserved.
        let txn_id = TxnId::new(Timestamp::new(1, 10, 1), TxnKind::Write);
        let dep = TxnId::new(Timestamp::new(1, 5, 9), TxnKind::Write);
        let plan = plan_of(vec![shard(vec![1, 2, 3, 4, 5])]);
        let mut replies = BTreeMap::new();
        replies.insert(1, reply(Status::PreAccepted, Some(txn_id.ts), dep_on(dep)));
        replies.insert(2, reply(Status::PreAccepted, Some(txn_id.ts), dep_on(dep)));
        replies.insert(3, reply(Status::NotWitnessed, None, Deps::new()));
        let gathered = Gathered { replies };
        match decide(&plan, &gathered, txn_id).unwrap() {
            Decision::Propose { execute_at, deps } => {
                assert_eq!(execute_at, txn_id.ts);
                assert!(deps.contains(&dep));
            }
            other => panic!("unexpected decision {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn ruled_out_fast_path_uses_max_witnessed() {
        // Three of three replied; one witnessed a later executeAt, so no
        // fast quorum of matching witnesses can exist.
        let txn_id = TxnId::new(Timestamp::new(1, 10, 1), TxnKind::Write);
        let later = Timestamp::new(1, 20, 2);
        let plan = plan_of(vec![shard(vec![1, 2, 3])]);
        let mut replies = BTreeMap::new();
        replies.insert(1, reply(Status::PreAccepted, Some(txn_id.ts), Deps::new()));
        replies.insert(2, reply(Status::PreAccepted, Some(txn_id.ts), Deps::new()));
        replies.insert(3, reply(Status::PreAccepted, Some(later), Deps::new()));
        let gathered = Gathered { replies };
        match decide(&plan, &gathered, txn_id).unwrap() {
            Decision::Propose { execute_at, .. } => assert_eq!(execute_at, later),
            other => panic!("unexpected decision {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn committed_witness_finishes_without_accept() {
        let txn_id = TxnId::new(Timestamp::new(1, 10, 1), TxnKind::Write);
        let chosen = Timestamp::new(1, 42, 2);
        let plan = plan_of(vec![shard(vec![1, 2, 3])]);
        let mut replies = BTreeMap::new();
        replies.insert(1, reply(Status::Committed, Some(chosen), Deps::new()));
        replies.insert(2, reply(Status::PreAccepted, Some(txn_id.ts), Deps::new()));
        let gathered = Gathered { replies };
        match decide(&plan, &gathered, txn_id).unwrap() {
            Decision::Finish { execute_at, .. } => assert_eq!(execute_at, chosen),
            other => panic!("unexpected decision {:?}", std::mem::discriminant(&other)),
        }
    }
}
