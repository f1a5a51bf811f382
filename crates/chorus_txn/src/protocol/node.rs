//! A protocol node: clock, topology view, command stores, and the
//! replica-side message handlers.
//!
//! Each handler epoch-gates the request, fans out over the local command
//! stores owning the touched slice, performs exactly one guarded transition
//! per store, and merges the per-store votes into one reply. Waiting happens
//! outside the store locks via status waiters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use tokio::sync::oneshot;
use tokio::time;

use super::command::{CommandStore, PreLoadContext, Status};
use super::config::Config;
use super::coordinate::{self, TxnOutcome};
use super::messages::{
    Accept, AcceptOk, Apply, ApplyOk, BeginRecovery, Commit, DataStore, Deps, Invalidate,
    InvalidateOk, Nack, PreAccept, PreAcceptOk, Read, ReadOk, RecoveryOk, Reply, Transport, Txn,
    WaitOnCommit, WaitOnCommitOk,
};
use super::progress;
use super::routing::{KeyRange, Keys, Route, Seekables, Unseekables};
use super::timestamp::{Ballot, Epoch, HlcClock, NodeId, Timestamp, TxnId};
use super::topology::{Topology, TopologyManager};

/// One node of the cluster: coordinator entry point and replica state.
pub struct Node {
    id: NodeId,
    config: Config,
    clock: HlcClock,
    pub topology: TopologyManager,
    stores: Vec<Arc<CommandStore>>,
    transport: Arc<dyn Transport>,
    data: Arc<dyn DataStore>,
    recovering: StdMutex<HashSet<TxnId>>,
    started: AtomicBool,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: Config,
        initial_topology: Topology,
        transport: Arc<dyn Transport>,
        data: Arc<dyn DataStore>,
    ) -> Arc<Node> {
        let stores = partition_stores(config.command_stores.max(1));
        Arc::new(Node {
            id,
            clock: HlcClock::new(id),
            topology: TopologyManager::new(initial_topology),
            stores,
            transport,
            data,
            recovering: StdMutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn data_store(&self) -> Arc<dyn DataStore> {
        self.data.clone()
    }

    pub fn stores(&self) -> &[Arc<CommandStore>] {
        &self.stores
    }

    /// Spawn the per-store progress monitors. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for store in &self.stores {
            progress::spawn_store_monitor(self.clone(), store.clone());
        }
    }

    /// Coordinate a client transaction from this node.
    pub async fn submit(self: &Arc<Self>, txn: Txn) -> anyhow::Result<TxnOutcome> {
        coordinate::coordinate(self, txn).await
    }

    pub(crate) fn try_begin_recovery(&self, txn_id: TxnId) -> bool {
        self.recovering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(txn_id)
    }

    pub(crate) fn finish_recovery(&self, txn_id: TxnId) {
        self.recovering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&txn_id);
    }

    fn stores_for_seekables(&self, scope: &Seekables) -> Vec<Arc<CommandStore>> {
        self.stores
            .iter()
            .filter(|s| scope.intersects(&s.range()))
            .cloned()
            .collect()
    }

    fn stores_for_unseekables(&self, scope: &Unseekables) -> Vec<Arc<CommandStore>> {
        self.stores
            .iter()
            .filter(|s| scope.intersects(&s.range()))
            .cloned()
            .collect()
    }

    /// Epoch gate: park requests from the future until the topology catches
    /// up; reject requests from the past with the current epoch so the
    /// sender can re-route.
    async fn gate(&self, epoch: Epoch) -> anyhow::Result<Result<Arc<Topology>, Nack>> {
        let current = self.topology.current_epoch();
        if epoch < current {
            return Ok(Err(Nack::retired(current)));
        }
        let topology = time::timeout(self.config.rpc_timeout, self.topology.wait_for(epoch))
            .await
            .with_context(|| format!("timed out waiting for epoch {epoch}"))??;
        Ok(Ok(topology))
    }

    fn local_scope(&self, topology: &Topology, scope: &Unseekables) -> Unseekables {
        scope.slice(&topology.ranges_for_node(self.id))
    }

    /// Apply commands that became unblocked, cascading through dependents.
    async fn drain(&self, store: &Arc<CommandStore>, mut ready: Vec<TxnId>) -> anyhow::Result<()> {
        while let Some(txn_id) = ready.pop() {
            let writes = store
                .exec(PreLoadContext::for_txn(txn_id), |s| s.begin_apply(txn_id))
                .await?;
            let Some(writes) = writes else {
                continue;
            };
            self.data.apply(&writes)?;
            let woken = store
                .exec(PreLoadContext::for_txn(txn_id), |s| s.finish_apply(txn_id))
                .await?;
            store.progress.forget(txn_id);
            ready.extend(woken);
        }
        Ok(())
    }

    pub async fn rpc_pre_accept(&self, req: PreAccept) -> anyhow::Result<Reply<PreAcceptOk>> {
        self.clock.observe(req.txn_id.ts);
        let _topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let ballot = req.txn_id.initial_ballot();
        let stall = self.config.progress_stall;
        let mut witnessed = req.txn_id.ts;
        let mut deps = Deps::new();

        for store in self.stores_for_seekables(&req.txn.keys) {
            let txn = req.txn.slice(&store.ranges());
            if txn.is_empty() {
                continue;
            }
            let route = req.route.clone();
            let txn_id = req.txn_id;
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let (status, promised) = {
                        let cmd = s.ensure(txn_id);
                        (cmd.status, cmd.promised)
                    };
                    if status == Status::Invalidated || ballot < promised {
                        return Ok(StoreVote::Nack(Nack::of(status, promised)));
                    }
                    if status >= Status::PreAccepted {
                        // Idempotent re-delivery: answer from the record.
                        let cmd = s.command(txn_id).expect("record exists");
                        return Ok(StoreVote::Witnessed {
                            witnessed: cmd.execute_at.unwrap_or(txn_id.ts),
                            deps: cmd.deps.clone(),
                            status,
                        });
                    }

                    let (local_witnessed, local_deps) = s.witness(txn_id, &txn)?;
                    let merged_route = {
                        let cmd = s.command(txn_id).expect("record exists");
                        Route::merge(cmd.route.as_ref(), Some(&route))?
                    };
                    let cmd = s.command_mut(txn_id).expect("record exists");
                    cmd.route = merged_route;
                    cmd.txn = Some(txn.clone());
                    cmd.execute_at = Some(local_witnessed);
                    cmd.deps = local_deps.clone();
                    cmd.advance(Status::PreAccepted)?;
                    s.index(txn_id, &txn);
                    Ok(StoreVote::Witnessed {
                        witnessed: local_witnessed,
                        deps: local_deps,
                        status: Status::PreAccepted,
                    })
                })
                .await?;

            match vote {
                StoreVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                StoreVote::Witnessed {
                    witnessed: w,
                    deps: d,
                    status,
                } => {
                    store.progress.track(req.txn_id, status, stall);
                    if w > witnessed {
                        witnessed = w;
                    }
                    deps = deps.union(&d)?;
                }
            }
        }

        Ok(Reply::Ok(PreAcceptOk {
            witnessed_execute_at: witnessed,
            deps,
        }))
    }

    pub async fn rpc_accept(&self, req: Accept) -> anyhow::Result<Reply<AcceptOk>> {
        self.clock.observe(req.txn_id.ts);
        self.clock.observe(req.execute_at);
        let _topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let stall = self.config.progress_stall;
        let mut reply_deps = Deps::new();

        for store in self.stores_for_seekables(&req.txn.keys) {
            let txn = req.txn.slice(&store.ranges());
            if txn.is_empty() {
                continue;
            }
            let sliced_deps = req.deps.slice(&store.ranges());
            let route = req.route.clone();
            let txn_id = req.txn_id;
            let ballot = req.ballot;
            let execute_at = req.execute_at;
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let (status, promised) = {
                        let cmd = s.ensure(txn_id);
                        (cmd.status, cmd.promised)
                    };
                    if status == Status::Invalidated || ballot < promised {
                        return Ok(StoreVote::Nack(Nack::of(status, promised)));
                    }
                    if status.is_committed() {
                        // The decision is already durable here; the stored
                        // dependencies are final.
                        let cmd = s.command(txn_id).expect("record exists");
                        return Ok(StoreVote::Witnessed {
                            witnessed: execute_at,
                            deps: cmd.deps.clone(),
                            status,
                        });
                    }

                    let (_, fresh_deps) = s.witness(txn_id, &txn)?;
                    let merged_route = {
                        let cmd = s.command(txn_id).expect("record exists");
                        Route::merge(cmd.route.as_ref(), Some(&route))?
                    };
                    let cmd = s.command_mut(txn_id).expect("record exists");
                    cmd.route = merged_route;
                    if cmd.txn.is_none() {
                        cmd.txn = Some(txn.clone());
                    }
                    cmd.promised = ballot;
                    cmd.accepted = ballot;
                    cmd.execute_at = Some(execute_at);
                    cmd.deps = sliced_deps;
                    cmd.advance(Status::Accepted)?;
                    s.index(txn_id, &txn);
                    Ok(StoreVote::Witnessed {
                        witnessed: execute_at,
                        deps: fresh_deps,
                        status: Status::Accepted,
                    })
                })
                .await?;

            match vote {
                StoreVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                StoreVote::Witnessed { deps: d, status, .. } => {
                    store.progress.track(req.txn_id, status, stall);
                    reply_deps = reply_deps.union(&d)?;
                }
            }
        }

        Ok(Reply::Ok(AcceptOk { deps: reply_deps }))
    }

    pub async fn rpc_commit(&self, req: Commit) -> anyhow::Result<Reply<()>> {
        self.clock.observe(req.execute_at);
        let topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let scope = self.local_scope(&topology, &req.route.to_maximal_unseekables());
        let stall = self.config.progress_stall;

        for store in self.stores_for_unseekables(&scope) {
            let txn = req.txn.slice(&store.ranges());
            let sliced_deps = req.deps.slice(&store.ranges());
            let route = req.route.clone();
            let txn_id = req.txn_id;
            let execute_at = req.execute_at;
            let (status, ready) = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let status = {
                        let cmd = s.ensure(txn_id);
                        cmd.status
                    };
                    if status == Status::Invalidated {
                        // A commit and an invalidation for one TxnId means a
                        // quorum intersection was violated somewhere.
                        return Err(s.poison(format!(
                            "commit arrived for invalidated transaction {txn_id:?}"
                        )));
                    }
                    if status.is_committed() {
                        let cmd = s.command(txn_id).expect("record exists");
                        if cmd.execute_at != Some(execute_at) {
                            return Err(s.poison(format!(
                                "commit executeAt diverged for {txn_id:?}: {:?} vs {:?}",
                                cmd.execute_at, execute_at
                            )));
                        }
                        return Ok((status, Vec::new()));
                    }

                    let merged_route = {
                        let cmd = s.command(txn_id).expect("record exists");
                        Route::merge(cmd.route.as_ref(), Some(&route))?
                    };
                    let was_empty_shell = {
                        let cmd = s.command_mut(txn_id).expect("record exists");
                        cmd.route = merged_route;
                        if cmd.txn.is_none() && !txn.is_empty() {
                            cmd.txn = Some(txn.clone());
                        }
                        cmd.execute_at = Some(execute_at);
                        cmd.deps = sliced_deps;
                        cmd.txn.is_none()
                    };
                    if !txn.is_empty() {
                        s.index(txn_id, &txn);
                    }

                    // A store inside the route with none of the data learns
                    // the decision but has nothing to execute.
                    let target = if was_empty_shell {
                        Status::PreCommitted
                    } else {
                        Status::Committed
                    };
                    {
                        let cmd = s.command_mut(txn_id).expect("record exists");
                        cmd.advance(target)?;
                    }
                    let mut ready = Vec::new();
                    if target == Status::Committed {
                        s.register_waits(txn_id)?;
                        ready = s.settle(vec![txn_id])?;
                    }
                    let status = s.command(txn_id).expect("record exists").status;
                    Ok((status, ready))
                })
                .await?;

            store.progress.track(req.txn_id, status, stall);
            self.drain(&store, ready).await?;
        }

        Ok(Reply::Ok(()))
    }

    pub async fn rpc_read(&self, req: Read) -> anyhow::Result<Reply<ReadOk>> {
        let _topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let mut waits = Vec::new();
        for store in self.stores_for_seekables(&req.keys) {
            let txn_id = req.txn_id;
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let cmd = s.command_mut(txn_id).expect("preloaded");
                    if cmd.status == Status::Invalidated || !cmd.status.is_committed() {
                        return Ok(ReadVote::Nack(Nack::of(cmd.status, cmd.promised)));
                    }
                    if cmd.status >= Status::ReadyToExecute {
                        Ok(ReadVote::Ready)
                    } else {
                        Ok(ReadVote::Wait(cmd.add_waiter(Status::ReadyToExecute)))
                    }
                })
                .await?;
            match vote {
                ReadVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                ReadVote::Ready => {}
                ReadVote::Wait(rx) => waits.push(rx),
            }
        }

        for rx in waits {
            let status = time::timeout(self.config.rpc_timeout, rx)
                .await
                .context("read timed out waiting for dependencies")?
                .context("read waiter dropped")?;
            if status == Status::Invalidated {
                return Ok(Reply::Nack(Nack::of(status, Ballot::zero())));
            }
        }

        let keys = match &req.keys {
            Seekables::Keys(keys) => keys.clone(),
            Seekables::Ranges(_) => Keys::new(Vec::new()),
        };
        let values = self.data.read(&keys)?;
        Ok(Reply::Ok(ReadOk { values }))
    }

    pub async fn rpc_apply(&self, req: Apply) -> anyhow::Result<Reply<ApplyOk>> {
        self.clock.observe(req.execute_at);
        let topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let scope = self.local_scope(&topology, &req.route.to_maximal_unseekables());
        let stall = self.config.progress_stall;
        let mut waits = Vec::new();

        for store in self.stores_for_unseekables(&scope) {
            let writes = req.writes.slice(&store.ranges());
            let txn_id = req.txn_id;
            let result = req.result.clone();
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let cmd = s.command_mut(txn_id).expect("preloaded");
                    if cmd.status == Status::Invalidated {
                        return Ok(ApplyVote::Nack(Nack::of(cmd.status, cmd.promised)));
                    }
                    if !cmd.status.is_committed() {
                        // The commit must land first; the coordinator's write
                        // quorum tolerates this replica catching up later.
                        return Ok(ApplyVote::Nack(Nack::of(cmd.status, cmd.promised)));
                    }
                    if cmd.status == Status::Applied {
                        return Ok(ApplyVote::Done);
                    }
                    cmd.writes = Some(writes.clone());
                    cmd.result = Some(result);
                    cmd.advance(Status::PreApplied)?;
                    if cmd.is_blocked() {
                        Ok(ApplyVote::Wait(cmd.add_waiter(Status::Applied)))
                    } else {
                        Ok(ApplyVote::Ready)
                    }
                })
                .await?;

            match vote {
                ApplyVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                ApplyVote::Done => {}
                ApplyVote::Ready => {
                    self.drain(&store, vec![req.txn_id]).await?;
                }
                ApplyVote::Wait(rx) => {
                    store.progress.track(req.txn_id, Status::PreApplied, stall);
                    waits.push(rx);
                }
            }
        }

        for rx in waits {
            let status = time::timeout(self.config.rpc_timeout, rx)
                .await
                .context("apply timed out waiting for dependencies")?
                .context("apply waiter dropped")?;
            if status == Status::Invalidated {
                return Ok(Reply::Nack(Nack::of(status, Ballot::zero())));
            }
        }

        Ok(Reply::Ok(ApplyOk))
    }

    pub async fn rpc_begin_recovery(&self, req: BeginRecovery) -> anyhow::Result<Reply<RecoveryOk>> {
        self.clock.observe(req.ballot.0);
        let topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let scope = self.local_scope(&topology, &req.scope);
        let mut merged: Option<RecoveryOk> = None;

        for store in self.stores_for_unseekables(&scope) {
            let txn_id = req.txn_id;
            let ballot = req.ballot;
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let cmd = s.command_mut(txn_id).expect("preloaded");
                    if !cmd.status.is_committed() && cmd.status != Status::Invalidated {
                        if ballot < cmd.promised {
                            return Ok(RecoveryVote::Nack(Nack::of(cmd.status, cmd.promised)));
                        }
                        cmd.promised = ballot;
                    }
                    Ok(RecoveryVote::Info(RecoveryOk {
                        status: cmd.status,
                        accepted: cmd.accepted,
                        execute_at: cmd.execute_at,
                        deps: cmd.deps.clone(),
                        route: cmd.route.clone(),
                        txn: cmd.txn.clone(),
                    }))
                })
                .await?;

            match vote {
                RecoveryVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                RecoveryVote::Info(info) => {
                    merged = Some(match merged.take() {
                        None => info,
                        Some(prev) => merge_recovery_info(prev, info)?,
                    });
                }
            }
        }

        let reply = merged.unwrap_or(RecoveryOk {
            status: Status::NotWitnessed,
            accepted: Ballot::zero(),
            execute_at: None,
            deps: Deps::new(),
            route: None,
            txn: None,
        });
        Ok(Reply::Ok(reply))
    }

    pub async fn rpc_invalidate(&self, req: Invalidate) -> anyhow::Result<Reply<InvalidateOk>> {
        self.clock.observe(req.ballot.0);
        let topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let scope = self.local_scope(&topology, &req.scope);
        let mut prior = Status::NotWitnessed;

        for store in self.stores_for_unseekables(&scope) {
            let txn_id = req.txn_id;
            let ballot = req.ballot;
            let vote = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let (status, promised) = {
                        let cmd = s.ensure(txn_id);
                        (cmd.status, cmd.promised)
                    };
                    if status == Status::Invalidated {
                        return Ok(InvalidateVote::Done {
                            prior: status,
                            ready: Vec::new(),
                        });
                    }
                    if !status.may_invalidate() || ballot < promised {
                        return Ok(InvalidateVote::Nack(Nack::of(status, promised)));
                    }
                    s.command_mut(txn_id).expect("record exists").promised = ballot;
                    let ready = s.invalidate(txn_id)?;
                    Ok(InvalidateVote::Done {
                        prior: status,
                        ready,
                    })
                })
                .await?;

            match vote {
                InvalidateVote::Nack(nack) => return Ok(Reply::Nack(nack)),
                InvalidateVote::Done { prior: p, ready } => {
                    store.progress.forget(req.txn_id);
                    if p > prior {
                        prior = p;
                    }
                    self.drain(&store, ready).await?;
                }
            }
        }

        Ok(Reply::Ok(InvalidateOk { prior }))
    }

    /// Cross-replica blocking primitive: reply once every local command store
    /// in scope has the transaction at or beyond Committed.
    ///
    /// A pending counter is incremented per local dispatch and decremented
    /// per completion, with one extra decrement after the dispatch loop; the
    /// reply fires when the counter crosses -1, which closes the race
    /// between the loop finishing and a fast listener completing first.
    pub async fn rpc_wait_on_commit(&self, req: WaitOnCommit) -> anyhow::Result<Reply<WaitOnCommitOk>> {
        self.clock.observe(req.txn_id.ts);
        let topology = match self.gate(req.epoch).await? {
            Ok(t) => t,
            Err(nack) => return Ok(Reply::Nack(nack)),
        };

        let scope = self.local_scope(&topology, &req.scope);
        let stall = self.config.progress_stall;
        let pending = Arc::new(AtomicI64::new(0));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Arc::new(StdMutex::new(Some(done_tx)));

        for store in self.stores_for_unseekables(&scope) {
            pending.fetch_add(1, Ordering::SeqCst);
            let txn_id = req.txn_id;
            let registered = store
                .exec(PreLoadContext::for_txn(txn_id), move |s| {
                    let cmd = s.command_mut(txn_id).expect("preloaded");
                    if cmd.status >= Status::Committed || cmd.status.is_terminal() {
                        return Ok(None);
                    }
                    Ok(Some((cmd.add_waiter(Status::Committed), cmd.status)))
                })
                .await?;

            match registered {
                None => complete_one(&pending, &done_tx),
                Some((rx, status)) => {
                    // The command is below Committed here; make sure the
                    // progress log chases it.
                    store.progress.track(txn_id, status, stall);
                    let pending = pending.clone();
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        let _ = rx.await;
                        complete_one(&pending, &done_tx);
                    });
                }
            }
        }
        complete_one(&pending, &done_tx);

        done_rx
            .await
            .context("wait-on-commit dispatch dropped")?;
        Ok(Reply::Ok(WaitOnCommitOk))
    }
}

fn complete_one(pending: &Arc<AtomicI64>, done_tx: &Arc<StdMutex<Option<oneshot::Sender<()>>>>) {
    if pending.fetch_sub(1, Ordering::SeqCst) - 1 == -1 {
        if let Some(tx) = done_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

fn merge_recovery_info(a: RecoveryOk, b: RecoveryOk) -> anyhow::Result<RecoveryOk> {
    let (high, low) = if b.status > a.status { (b, a) } else { (a, b) };
    Ok(RecoveryOk {
        status: high.status,
        accepted: high.accepted.max(low.accepted),
        execute_at: high.execute_at.or(low.execute_at),
        deps: high.deps.union(&low.deps)?,
        route: Route::merge(high.route.as_ref(), low.route.as_ref())?,
        txn: match (&high.txn, &low.txn) {
            (Some(a), Some(b)) => Some(a.union(b)?),
            (Some(t), None) | (None, Some(t)) => Some(t.clone()),
            (None, None) => None,
        },
    })
}

enum StoreVote {
    Witnessed {
        witnessed: Timestamp,
        deps: Deps,
        status: Status,
    },
    Nack(Nack),
}

enum ReadVote {
    Ready,
    Wait(oneshot::Receiver<Status>),
    Nack(Nack),
}

enum ApplyVote {
    Ready,
    Done,
    Wait(oneshot::Receiver<Status>),
    Nack(Nack),
}

enum RecoveryVote {
    Info(RecoveryOk),
    Nack(Nack),
}

enum InvalidateVote {
    Done { prior: Status, ready: Vec<TxnId> },
    Nack(Nack),
}

fn partition_stores(count: usize) -> Vec<Arc<CommandStore>> {
    let span = u128::from(u64::MAX) + 1;
    (0..count)
        .map(|i| {
            let start = (span * i as u128 / count as u128) as u64;
            let end = if i + 1 == count {
                u64::MAX
            } else {
                (span * (i + 1) as u128 / count as u128) as u64
            };
            Arc::new(CommandStore::new(i, KeyRange::new(start, end)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_partition_covers_the_ring() {
        let stores = partition_stores(4);
        assert_eq!(stores.len(), 4);
        assert_eq!(stores[0].range().start, 0);
        assert_eq!(stores[3].range().end, u64::MAX);
        for pair in stores.windows(2) {
            assert_eq!(pair[0].range().end, pair[1].range().start);
        }
    }

    #[test]
    fn wait_counter_crosses_minus_one_exactly_once() {
        let pending = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = oneshot::channel::<()>();
        let done = Arc::new(StdMutex::new(Some(tx)));

        pending.fetch_add(1, Ordering::SeqCst);
        pending.fetch_add(1, Ordering::SeqCst);
        complete_one(&pending, &done); // first listener
        assert!(rx.try_recv().is_err());
        complete_one(&pending, &done); // second listener
        assert!(rx.try_recv().is_err());
        complete_one(&pending, &done); // dispatch loop finished
        assert!(rx.try_recv().is_ok());
    }
}
