//! Hybrid-logical timestamps, transaction identity, and ballots.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by every other layer: the coordinator, the replica state machine, and
//! the transport contracts.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Topology epoch number.
pub type Epoch = u64;

/// A hybrid-logical timestamp: (epoch, hlc, node), lexicographically ordered.
///
/// The node component makes timestamps produced by distinct nodes unique, so
/// the ordering is total over all timestamps in the system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub epoch: Epoch,
    pub hlc: u64,
    pub node: NodeId,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        epoch: 0,
        hlc: 0,
        node: 0,
    };

    pub const fn new(epoch: Epoch, hlc: u64, node: NodeId) -> Self {
        Self { epoch, hlc, node }
    }

    /// The smallest timestamp strictly greater than `self` on the same node.
    pub fn next(self) -> Timestamp {
        Timestamp {
            epoch: self.epoch,
            hlc: self.hlc.saturating_add(1),
            node: self.node,
        }
    }
}

/// Transaction kind. Two reads never conflict; everything else does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxnKind {
    Read,
    Write,
    ExclusiveSync,
}

impl TxnKind {
    pub fn conflicts_with(self, other: TxnKind) -> bool {
        !(self == TxnKind::Read && other == TxnKind::Read)
    }

    pub fn is_write(self) -> bool {
        matches!(self, TxnKind::Write)
    }
}

/// Globally unique transaction identifier: a timestamp tagged with a kind.
///
/// Ordering follows the timestamp; the kind never participates in tie-breaks
/// because the timestamp alone is unique per originating node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId {
    pub ts: Timestamp,
    pub kind: TxnKind,
}

impl TxnId {
    pub const fn new(ts: Timestamp, kind: TxnKind) -> Self {
        Self { ts, kind }
    }

    pub fn epoch(&self) -> Epoch {
        self.ts.epoch
    }

    pub fn node(&self) -> NodeId {
        self.ts.node
    }

    /// The ballot a coordinator starts with: equal to the TxnId's timestamp.
    pub fn initial_ballot(&self) -> Ballot {
        Ballot(self.ts)
    }
}

/// Ballot used to order competing proposals during recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot(pub Timestamp);

impl Ballot {
    pub const fn zero() -> Self {
        Ballot(Timestamp::ZERO)
    }
}

/// Hybrid-logical clock: wall-clock microseconds merged with observed remote
/// timestamps so that every tick is strictly greater than anything this node
/// has produced or witnessed.
pub struct HlcClock {
    node: NodeId,
    last: Mutex<u64>,
}

impl HlcClock {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            last: Mutex::new(now_us()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Produce a fresh unique timestamp at `epoch`.
    pub fn tick(&self, epoch: Epoch) -> Timestamp {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = now_us().max(last.saturating_add(1));
        Timestamp::new(epoch, *last, self.node)
    }

    /// Fold a remote timestamp into the clock so later ticks sort after it.
    pub fn observe(&self, ts: Timestamp) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if ts.hlc > *last {
            *last = ts.hlc;
        }
    }

    pub fn txn_id(&self, kind: TxnKind, epoch: Epoch) -> TxnId {
        TxnId::new(self.tick(epoch), kind)
    }

    /// A ballot strictly greater than `after`, stamped by this node.
    pub fn ballot_after(&self, after: Ballot, epoch: Epoch) -> Ballot {
        self.observe(after.0);
        Ballot(self.tick(epoch))
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
