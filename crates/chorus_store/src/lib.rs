//! In-process embedder harness for the chorus transaction core.
//!
//! `mem` provides the in-memory data store and example transaction updates,
//! `local` wires a multi-node cluster inside one process, and `verify` is the
//! per-key linearizability oracle the history tests assert with.

pub mod local;
pub mod mem;
pub mod verify;

pub use local::{Cluster, LocalTransport};
pub use mem::{
    append_txn, decode_sequence, encode_sequence, put_many_txn, put_txn, read_txn, ListAppend,
    MemStore, PutMany, PutValue, ReadKey,
};
pub use verify::{HistoryViolation, LinearizabilityVerifier};
