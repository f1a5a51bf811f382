//! In-memory data store and example transaction updates.
//!
//! Values are opaque byte strings to the protocol; the list-append update
//! keeps a register whose value is the append-only sequence of u32 event
//! ids, which is the shape the linearizability verifier consumes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use chorus_txn::protocol::{
    DataStore, Key, Keys, ReadValues, Seekables, Txn, TxnKind, Update, Writes,
};

/// Keyed byte cells behind one lock, so `apply` is atomic per store.
#[derive(Default)]
pub struct MemStore {
    cells: Mutex<BTreeMap<Bytes, Bytes>>,
}

impl MemStore {
    pub fn new() -> Arc<MemStore> {
        Arc::new(MemStore::default())
    }

    /// Test peek below the protocol.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MemStore {
    fn read(&self, keys: &Keys) -> anyhow::Result<ReadValues> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .map(|k| (k.clone(), cells.get(k.data()).cloned()))
            .collect())
    }

    fn apply(&self, writes: &Writes) -> anyhow::Result<()> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in writes.iter() {
            cells.insert(key.data().clone(), value.clone());
        }
        Ok(())
    }
}

/// Blind write of one value.
pub struct PutValue {
    pub key: Key,
    pub value: Bytes,
}

impl Update for PutValue {
    fn compute(&self, _reads: &ReadValues) -> (Writes, Bytes) {
        (
            Writes::new(vec![(self.key.clone(), self.value.clone())]),
            self.value.clone(),
        )
    }
}

/// Read of one key; the result is the raw value, empty when absent.
pub struct ReadKey {
    pub key: Key,
}

impl Update for ReadKey {
    fn compute(&self, reads: &ReadValues) -> (Writes, Bytes) {
        let value = reads
            .get(&self.key)
            .and_then(|v| v.clone())
            .unwrap_or_default();
        (Writes::default(), value)
    }
}

/// Append one event id to a sequence register; the result is the new
/// sequence.
pub struct ListAppend {
    pub key: Key,
    pub event_id: u32,
}

impl Update for ListAppend {
    fn compute(&self, reads: &ReadValues) -> (Writes, Bytes) {
        let prior = reads
            .get(&self.key)
            .and_then(|v| v.clone())
            .unwrap_or_default();
        let mut next = BytesMut::with_capacity(prior.len() + 4);
        next.extend_from_slice(&prior);
        next.extend_from_slice(&self.event_id.to_le_bytes());
        let next = next.freeze();
        (
            Writes::new(vec![(self.key.clone(), next.clone())]),
            next,
        )
    }
}

/// Blind writes to several keys in one transaction; the keys may live on
/// different shards.
pub struct PutMany {
    pub entries: Vec<(Key, Bytes)>,
}

impl Update for PutMany {
    fn compute(&self, _reads: &ReadValues) -> (Writes, Bytes) {
        (
            Writes::new(self.entries.clone()),
            Bytes::from_static(b"OK"),
        )
    }
}

pub fn encode_sequence(ids: &[u32]) -> Bytes {
    let mut out = BytesMut::with_capacity(ids.len() * 4);
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out.freeze()
}

pub fn decode_sequence(raw: &[u8]) -> Vec<u32> {
    raw.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// A blind single-key write transaction.
pub fn put_txn(key: &str, value: &[u8]) -> Txn {
    let key = Key::new(key.to_string());
    let keys = Keys::new(vec![key.clone()]);
    Txn::new(
        TxnKind::Write,
        Seekables::Keys(keys),
        Seekables::Keys(Keys::new(vec![])),
        Arc::new(PutValue {
            key,
            value: Bytes::copy_from_slice(value),
        }),
    )
}

/// A single-key read transaction.
pub fn read_txn(key: &str) -> Txn {
    let key = Key::new(key.to_string());
    let keys = Keys::new(vec![key.clone()]);
    Txn::new(
        TxnKind::Read,
        Seekables::Keys(keys.clone()),
        Seekables::Keys(keys),
        Arc::new(ReadKey { key }),
    )
}

/// A blind multi-key write transaction.
pub fn put_many_txn(entries: &[(&str, &[u8])]) -> Txn {
    let entries: Vec<(Key, Bytes)> = entries
        .iter()
        .map(|(k, v)| (Key::new(k.to_string()), Bytes::copy_from_slice(v)))
        .collect();
    let keys = Keys::new(entries.iter().map(|(k, _)| k.clone()).collect());
    Txn::new(
        TxnKind::Write,
        Seekables::Keys(keys),
        Seekables::Keys(Keys::new(vec![])),
        Arc::new(PutMany { entries }),
    )
}

/// A read-modify-write append of one event id.
pub fn append_txn(key: &str, event_id: u32) -> Txn {
    let key = Key::new(key.to_string());
    let keys = Keys::new(vec![key.clone()]);
    Txn::new(
        TxnKind::Write,
        Seekables::Keys(keys.clone()),
        Seekables::Keys(keys),
        Arc::new(ListAppend { key, event_id }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_read_back() {
        let store = MemStore::new();
        let key = Key::new("k");
        store
            .apply(&Writes::new(vec![(key.clone(), Bytes::from_static(b"v"))]))
            .unwrap();
        let values = store.read(&Keys::new(vec![key.clone()])).unwrap();
        assert_eq!(values.get(&key).unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(store.get(b"k").as_deref(), Some(&b"v"[..]));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn list_append_builds_sequence() {
        let key = Key::new("list");
        let append = ListAppend {
            key: key.clone(),
            event_id: 7,
        };
        let mut reads = ReadValues::new();
        reads.insert(key.clone(), Some(encode_sequence(&[1, 2])));
        let (writes, result) = append.compute(&reads);
        assert_eq!(decode_sequence(&result), vec![1, 2, 7]);
        assert_eq!(writes.len(), 1);
    }

    #[test]
    fn sequence_round_trip() {
        let ids = vec![3, 1, 4, 1, 5];
        assert_eq!(decode_sequence(&encode_sequence(&ids)), ids);
        assert!(decode_sequence(b"").is_empty());
    }
}
