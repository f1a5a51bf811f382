//! Protocol module wiring.
//!
//! `timestamp` holds hybrid-logical time and ballots, `routing` the key/range
//! algebra and routes, `topology` the epoch -> shard mapping, `command` the
//! per-replica state machine and command stores, `messages` the wire contracts
//! (transport, data store, request/reply types), `node` the replica handlers,
//! `coordinate`/`recover` the coordinator-side state machines, and `progress`
//! the per-store liveness log.

pub mod command;
pub mod config;
pub mod coordinate;
pub mod messages;
pub mod node;
pub mod progress;
pub mod recover;
pub mod routing;
pub mod timestamp;
pub mod topology;

pub use command::{Command, CommandStore, PreLoadContext, SafeCommandStore, Status};
pub use config::{Config, ConfigOverrides};
pub use coordinate::{coordinate, route_for, TxnOutcome};
pub use messages::{
    Accept, AcceptOk, Apply, ApplyOk, BeginRecovery, Commit, DataStore, Deps, Invalidate,
    InvalidateOk, Nack, PartialTxn, PreAccept, PreAcceptOk, Read, ReadOk, ReadValues, RecoveryOk,
    Reply, Transport, Txn, Update, WaitOnCommit, WaitOnCommitOk, Writes,
};
pub use node::Node;
pub use recover::{recover, RecoveryOutcome};
pub use routing::{
    Key, KeyRange, Keys, Ranges, Route, RoutingKey, RoutingKeys, Seekables, Unseekables,
};
pub use timestamp::{Ballot, Epoch, HlcClock, NodeId, Timestamp, TxnId, TxnKind};
pub use topology::{Shard, Topology, TopologyManager};
