//! Per-TxnId replica state and the stores that own it.
//!
//! A `CommandStore` owns a disjoint slice of the routing ring and the map
//! TxnId -> Command for every transaction touching that slice. All mutation
//! goes through `exec`, which serializes closures over the store's state, so
//! no two operations touching the same commands ever run concurrently and a
//! status transition sequence on one command is totally ordered.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use super::messages::{Deps, PartialTxn, Writes};
use super::progress::ProgressLog;
use super::routing::{KeyRange, Ranges, Route, Seekables, Unseekables};
use super::timestamp::{Ballot, Timestamp, TxnId, TxnKind};

/// Lifecycle state of a command on one replica.
///
/// Declaration order is the protocol's progress order; `Invalidated` sorts
/// last but is reachable only from `AcceptedInvalidate` or earlier, which
/// `Command::advance` enforces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    NotWitnessed,
    PreAccepted,
    Accepted,
    AcceptedInvalidate,
    PreCommitted,
    Committed,
    ReadyToExecute,
    PreApplied,
    Applied,
    Invalidated,
}

impl Status {
    /// Carries a durable (executeAt, deps) decision.
    pub fn is_committed(self) -> bool {
        matches!(
            self,
            Status::Committed | Status::ReadyToExecute | Status::PreApplied | Status::Applied
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Applied | Status::Invalidated)
    }

    /// May still be overturned by an invalidation.
    pub fn may_invalidate(self) -> bool {
        self <= Status::AcceptedInvalidate
    }
}

struct StatusWaiter {
    at_least: Status,
    tx: oneshot::Sender<Status>,
}

/// Per-replica, per-TxnId record. Created on the first message that mentions
/// the TxnId; retained after Applied/Invalidated so later conflict witnessing
/// still observes its executeAt.
pub struct Command {
    pub txn_id: TxnId,
    pub status: Status,
    pub promised: Ballot,
    pub accepted: Ballot,
    pub execute_at: Option<Timestamp>,
    pub deps: Deps,
    pub route: Option<Route>,
    pub txn: Option<PartialTxn>,
    pub writes: Option<Writes>,
    pub result: Option<Bytes>,
    /// Scope observed from dependency registrations when no route is known
    /// yet; recovery uses it to address an unwitnessed transaction.
    pub known_scope: Option<Unseekables>,
    /// Local commands that must be re-evaluated when this one transitions.
    listeners: BTreeSet<TxnId>,
    /// Dependencies this command still waits on before it may execute.
    waiting_on: BTreeSet<TxnId>,
    waiters: Vec<StatusWaiter>,
    applying: bool,
}

impl Command {
    fn new(txn_id: TxnId) -> Command {
        Command {
            txn_id,
            status: Status::NotWitnessed,
            promised: Ballot::zero(),
            accepted: Ballot::zero(),
            execute_at: None,
            deps: Deps::new(),
            route: None,
            txn: None,
            writes: None,
            result: None,
            known_scope: None,
            listeners: BTreeSet::new(),
            waiting_on: BTreeSet::new(),
            waiters: Vec::new(),
            applying: false,
        }
    }

    /// Move the status forward. Re-delivery of an earlier phase is a no-op;
    /// an illegal invalidation is an error for the caller to surface.
    pub fn advance(&mut self, to: Status) -> anyhow::Result<bool> {
        if to <= self.status {
            return Ok(false);
        }
        if to == Status::Invalidated && !self.status.may_invalidate() {
            bail!(
                "cannot invalidate {:?} at status {:?}",
                self.txn_id,
                self.status
            );
        }
        self.status = to;
        self.fire_waiters();
        Ok(true)
    }

    /// One-shot notification once the status reaches `at_least` or any
    /// terminal state.
    pub fn add_waiter(&mut self, at_least: Status) -> oneshot::Receiver<Status> {
        let (tx, rx) = oneshot::channel();
        if self.status >= at_least || self.status.is_terminal() {
            let _ = tx.send(self.status);
        } else {
            self.waiters.push(StatusWaiter { at_least, tx });
        }
        rx
    }

    fn fire_waiters(&mut self) {
        let status = self.status;
        let terminal = status.is_terminal();
        let fired = std::mem::take(&mut self.waiters);
        for waiter in fired {
            if terminal || status >= waiter.at_least {
                let _ = waiter.tx.send(status);
            } else {
                self.waiters.push(waiter);
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.waiting_on.is_empty()
    }
}

/// Scope of one `exec` call: the commands it intends to touch. Commands named
/// here are created as `NotWitnessed` shells before the closure runs.
#[derive(Clone, Debug, Default)]
pub struct PreLoadContext {
    pub txn_ids: Vec<TxnId>,
}

impl PreLoadContext {
    pub fn for_txn(txn_id: TxnId) -> PreLoadContext {
        PreLoadContext {
            txn_ids: vec![txn_id],
        }
    }
}

/// The state visible inside one `exec` closure: single-threaded
/// read-modify-write over the store's commands and conflict indexes.
pub struct SafeCommandStore {
    store_id: usize,
    range: KeyRange,
    poisoned: Option<String>,
    commands: HashMap<TxnId, Command>,
    by_key: BTreeMap<u64, BTreeSet<TxnId>>,
    by_range: Vec<(Ranges, TxnId)>,
}

impl SafeCommandStore {
    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn command(&self, txn_id: TxnId) -> Option<&Command> {
        self.commands.get(&txn_id)
    }

    pub fn command_mut(&mut self, txn_id: TxnId) -> Option<&mut Command> {
        self.commands.get_mut(&txn_id)
    }

    pub fn ensure(&mut self, txn_id: TxnId) -> &mut Command {
        self.commands
            .entry(txn_id)
            .or_insert_with(|| Command::new(txn_id))
    }

    /// Record a fatal invariant violation. The store refuses all further work
    /// and the operator is expected to intervene.
    pub fn poison(&mut self, reason: impl Into<String>) -> anyhow::Error {
        let reason = reason.into();
        tracing::error!(
            store = self.store_id,
            reason = %reason,
            "command store halted on invariant violation"
        );
        self.poisoned = Some(reason.clone());
        anyhow::anyhow!("command store {} halted: {reason}", self.store_id)
    }

    /// Add a command's data footprint to the conflict indexes.
    pub fn index(&mut self, txn_id: TxnId, txn: &PartialTxn) {
        match &txn.keys {
            Seekables::Keys(keys) => {
                for key in keys.iter() {
                    self.by_key
                        .entry(key.routing().0)
                        .or_default()
                        .insert(txn_id);
                }
            }
            Seekables::Ranges(ranges) => {
                if !ranges.is_empty() && !self.by_range.iter().any(|(_, id)| *id == txn_id) {
                    self.by_range.push((ranges.clone(), txn_id));
                }
            }
        }
    }

    fn unindex(&mut self, txn_id: TxnId) {
        let footprint = self
            .commands
            .get(&txn_id)
            .and_then(|c| c.txn.as_ref())
            .map(|t| t.keys.clone());
        match footprint {
            Some(Seekables::Keys(keys)) => {
                for key in keys.iter() {
                    if let Some(entry) = self.by_key.get_mut(&key.routing().0) {
                        entry.remove(&txn_id);
                        if entry.is_empty() {
                            self.by_key.remove(&key.routing().0);
                        }
                    }
                }
            }
            Some(Seekables::Ranges(_)) => {
                self.by_range.retain(|(_, id)| *id != txn_id);
            }
            None => {}
        }
    }

    /// Transactions whose footprint overlaps `scope` and whose kind conflicts
    /// with `kind`.
    fn conflicts(&self, kind: TxnKind, scope: &Seekables) -> Vec<TxnId> {
        let mut out = BTreeSet::new();
        match scope {
            Seekables::Keys(keys) => {
                for key in keys.iter() {
                    if let Some(ids) = self.by_key.get(&key.routing().0) {
                        out.extend(ids.iter().copied());
                    }
                }
                for (ranges, id) in &self.by_range {
                    if keys.iter().any(|k| ranges.contains(k.routing())) {
                        out.insert(*id);
                    }
                }
            }
            Seekables::Ranges(ranges) => {
                for range in ranges.iter() {
                    let upper_inclusive = range.end == u64::MAX;
                    let points = self.by_key.range(range.start..range.end);
                    for (_, ids) in points {
                        out.extend(ids.iter().copied());
                    }
                    if upper_inclusive {
                        if let Some(ids) = self.by_key.get(&u64::MAX) {
                            out.extend(ids.iter().copied());
                        }
                    }
                }
                for (other, id) in &self.by_range {
                    if ranges.iter().any(|r| other.intersects(r)) {
                        out.insert(*id);
                    }
                }
            }
        }
        out.into_iter()
            .filter(|id| id.kind.conflicts_with(kind))
            .collect()
    }

    /// Witness a transaction against the store's conflicts.
    ///
    /// Returns `(witnessed_execute_at, deps)`: the execute-at lower bound
    /// max(TxnId, max(conflicting executeAt) + 1), and the conflicting
    /// transactions not yet locally resolved, each tagged with the routing
    /// scope the conflict was observed at.
    pub fn witness(&self, txn_id: TxnId, txn: &PartialTxn) -> anyhow::Result<(Timestamp, Deps)> {
        let store_ranges = Ranges::single(self.range);
        let mut witnessed = txn_id.ts;
        let mut deps = Deps::new();
        for other_id in self.conflicts(txn.kind, &txn.keys) {
            if other_id == txn_id {
                continue;
            }
            let Some(other) = self.commands.get(&other_id) else {
                continue;
            };
            if let Some(at) = other.execute_at {
                let bound = at.next();
                if bound > witnessed {
                    witnessed = bound;
                }
            }
            if matches!(other.status, Status::Applied | Status::Invalidated) {
                continue;
            }
            let scope = other
                .txn
                .as_ref()
                .map(|t| t.keys.slice(&store_ranges).to_unseekables())
                .unwrap_or_else(|| Unseekables::Ranges(store_ranges.clone()));
            deps.insert(other_id, scope)?;
        }
        Ok((witnessed, deps))
    }

    /// True when dependency `dep_id` no longer holds up a command committed
    /// at `(execute_at, txn_id)`. Execution order is the lexicographic
    /// (executeAt, TxnId) pair, since executeAt alone is not unique.
    fn dep_satisfied(&self, dep_id: TxnId, execute_at: Timestamp, txn_id: TxnId) -> bool {
        let Some(dep) = self.commands.get(&dep_id) else {
            return false;
        };
        match dep.status {
            Status::Applied | Status::Invalidated => true,
            s if s.is_committed() => {
                let dep_at = dep.execute_at.unwrap_or(dep.txn_id.ts);
                (dep_at, dep.txn_id) > (execute_at, txn_id)
            }
            _ => false,
        }
    }

    /// After Commit fixes (executeAt, deps), register this command as a
    /// listener of each unresolved dependency in this store's slice. Promotes
    /// to ReadyToExecute immediately when nothing blocks.
    pub fn register_waits(&mut self, txn_id: TxnId) -> anyhow::Result<()> {
        let (execute_at, dep_ids, scopes) = {
            let Some(cmd) = self.commands.get(&txn_id) else {
                bail!("register_waits on unknown command {txn_id:?}");
            };
            let Some(execute_at) = cmd.execute_at else {
                bail!("register_waits before executeAt fixed for {txn_id:?}");
            };
            let dep_ids: Vec<TxnId> = cmd.deps.ids().copied().collect();
            let scopes: Vec<(TxnId, Unseekables)> = cmd
                .deps
                .iter()
                .map(|(id, scope)| (*id, scope.clone()))
                .collect();
            (execute_at, dep_ids, scopes)
        };

        let mut waiting = BTreeSet::new();
        for dep_id in dep_ids {
            if !self.dep_satisfied(dep_id, execute_at, txn_id) {
                waiting.insert(dep_id);
            }
        }
        for (dep_id, scope) in scopes {
            if !waiting.contains(&dep_id) {
                continue;
            }
            let dep = self.ensure(dep_id);
            dep.listeners.insert(txn_id);
            // Remember where the dependency was witnessed so recovery can
            // address it even if it is never witnessed here directly.
            dep.known_scope = match dep.known_scope.take() {
                Some(known) => Some(known.union(&scope).unwrap_or(scope)),
                None => Some(scope),
            };
        }

        let cmd = self
            .commands
            .get_mut(&txn_id)
            .expect("command ensured above");
        cmd.waiting_on = waiting;
        if cmd.waiting_on.is_empty() && cmd.status == Status::Committed {
            cmd.advance(Status::ReadyToExecute)?;
        }
        Ok(())
    }

    /// Propagate transitions of `roots` through the listener graph.
    ///
    /// Returns the commands that became ready to apply (PreApplied with no
    /// remaining blockers). Traversal is explicit BFS with a visited set, so
    /// dependency cycles are harmless.
    pub fn settle(&mut self, roots: Vec<TxnId>) -> anyhow::Result<Vec<TxnId>> {
        let mut ready = Vec::new();
        let mut queue: VecDeque<TxnId> = roots.into();
        let mut visited = HashSet::new();

        while let Some(root) = queue.pop_front() {
            if !visited.insert(root) {
                continue;
            }
            let listeners: Vec<TxnId> = self
                .commands
                .get(&root)
                .map(|c| c.listeners.iter().copied().collect())
                .unwrap_or_default();

            for listener_id in listeners {
                let Some(listener) = self.commands.get(&listener_id) else {
                    continue;
                };
                let Some(execute_at) = listener.execute_at else {
                    continue;
                };
                if !self.dep_satisfied(root, execute_at, listener_id) {
                    continue;
                }

                if let Some(cmd) = self.commands.get_mut(&root) {
                    cmd.listeners.remove(&listener_id);
                }
                let listener = self
                    .commands
                    .get_mut(&listener_id)
                    .expect("listener checked above");
                listener.waiting_on.remove(&root);
                if !listener.waiting_on.is_empty() {
                    continue;
                }
                match listener.status {
                    Status::Committed => {
                        listener.advance(Status::ReadyToExecute)?;
                        queue.push_back(listener_id);
                    }
                    Status::PreApplied => {
                        if !listener.applying {
                            ready.push(listener_id);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(ready)
    }

    /// Claim a command for application. Returns its writes when the caller
    /// should perform the data-store apply, None when someone already did.
    pub fn begin_apply(&mut self, txn_id: TxnId) -> anyhow::Result<Option<Writes>> {
        let range = Ranges::single(self.range);
        let Some(cmd) = self.commands.get_mut(&txn_id) else {
            bail!("begin_apply on unknown command {txn_id:?}");
        };
        if cmd.applying || cmd.status != Status::PreApplied || !cmd.waiting_on.is_empty() {
            return Ok(None);
        }
        cmd.applying = true;
        Ok(Some(
            cmd.writes
                .as_ref()
                .map(|w| w.slice(&range))
                .unwrap_or_default(),
        ))
    }

    /// Finish application: move to Applied and wake dependents. The §3.4
    /// invariant that an Applied command has no outstanding local
    /// dependencies is checked here and is fatal if broken.
    pub fn finish_apply(&mut self, txn_id: TxnId) -> anyhow::Result<Vec<TxnId>> {
        let blocked = {
            let Some(cmd) = self.commands.get_mut(&txn_id) else {
                bail!("finish_apply on unknown command {txn_id:?}");
            };
            let blocked = !cmd.waiting_on.is_empty();
            if !blocked {
                cmd.advance(Status::Applied)?;
            }
            blocked
        };
        if blocked {
            return Err(self.poison(format!(
                "command {txn_id:?} applied with unresolved dependencies"
            )));
        }
        self.settle(vec![txn_id])
    }

    /// Invalidate a command and wake everything that was waiting on it.
    pub fn invalidate(&mut self, txn_id: TxnId) -> anyhow::Result<Vec<TxnId>> {
        {
            let Some(cmd) = self.commands.get_mut(&txn_id) else {
                bail!("invalidate of unknown command {txn_id:?}");
            };
            cmd.advance(Status::AcceptedInvalidate)?;
            cmd.advance(Status::Invalidated)?;
        }
        self.unindex(txn_id);
        self.settle(vec![txn_id])
    }
}

/// Owner of one disjoint slice of the routing ring.
pub struct CommandStore {
    id: usize,
    range: KeyRange,
    state: Mutex<SafeCommandStore>,
    pub progress: ProgressLog,
}

impl CommandStore {
    pub fn new(id: usize, range: KeyRange) -> CommandStore {
        CommandStore {
            id,
            range,
            state: Mutex::new(SafeCommandStore {
                store_id: id,
                range,
                poisoned: None,
                commands: HashMap::new(),
                by_key: BTreeMap::new(),
                by_range: Vec::new(),
            }),
            progress: ProgressLog::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn ranges(&self) -> Ranges {
        Ranges::single(self.range)
    }

    /// Run one operation against the store. The context's commands are
    /// pre-created; the closure performs its reads and transitions with
    /// exclusive access and must not block.
    pub async fn exec<R>(
        &self,
        ctx: PreLoadContext,
        f: impl FnOnce(&mut SafeCommandStore) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.poisoned {
            bail!("command store {} halted: {reason}", self.id);
        }
        for txn_id in &ctx.txn_ids {
            state.ensure(*txn_id);
        }
        f(&mut state)
    }
}
