//! The object-store contract the peering core runs against, and an
//! in-memory implementation for tests and tooling.
//!
//! The store is transactional: mutations accumulate in a [`Transaction`] and
//! commit atomically. Writes within one PG are serialized by the store's
//! per-collection sequencer; the `pgid` passed to [`ObjectStore`] methods
//! names that sequencer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use atoll_core::{Eversion, ObjectId, PgId};

use crate::errors::StorageFatalError;

/// One mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write an object's content at a version.
    Put {
        pgid: PgId,
        oid: ObjectId,
        version: Eversion,
        data: Vec<u8>,
    },
    /// Remove an object.
    Remove { pgid: PgId, oid: ObjectId },
    /// Write a keyed metadata record under the PG prefix (info, log, ...).
    SetMeta {
        pgid: PgId,
        key: &'static str,
        data: Vec<u8>,
    },
    /// Drop the whole collection (PG deletion).
    RemoveCollection { pgid: PgId },
}

/// An ordered batch of mutations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, pgid: PgId, oid: ObjectId, version: Eversion, data: Vec<u8>) {
        self.ops.push(TxnOp::Put {
            pgid,
            oid,
            version,
            data,
        });
    }

    pub fn remove(&mut self, pgid: PgId, oid: ObjectId) {
        self.ops.push(TxnOp::Remove { pgid, oid });
    }

    pub fn set_meta(&mut self, pgid: PgId, key: &'static str, data: Vec<u8>) {
        self.ops.push(TxnOp::SetMeta { pgid, key, data });
    }

    pub fn remove_collection(&mut self, pgid: PgId) {
        self.ops.push(TxnOp::RemoveCollection { pgid });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TxnOp> {
        self.ops
    }
}

/// Completion callback; invoked once the store has made the work durable.
pub type Callback = Box<dyn FnOnce() + Send>;

/// A slice of a PG's object space returned by [`ObjectStore::scan_range`]:
/// the objects found and the exclusive end bound reached.
pub type ScanResult = (Vec<(ObjectId, Eversion)>, ObjectId);

/// Transactional byte/attribute storage with ordered per-PG write queues.
pub trait ObjectStore: Send + Sync {
    /// Commits `txn` through the PG's sequencer. `on_commit` fires once the
    /// batch is durable. Failure to commit is fatal for the node.
    fn apply_transaction(
        &self,
        pgid: PgId,
        txn: Transaction,
        on_commit: Option<Callback>,
    ) -> Result<(), StorageFatalError>;

    /// Reads an object's version and content.
    fn read(&self, pgid: PgId, oid: &ObjectId) -> Option<(Eversion, Vec<u8>)>;

    /// Reads a metadata record written with [`Transaction::set_meta`].
    fn get_meta(&self, pgid: PgId, key: &str) -> Option<Vec<u8>>;

    /// Enumerates up to `max` objects starting at `begin` (inclusive),
    /// in object order. The returned bound is the next unenumerated object,
    /// or [`ObjectId::MAX`] when the scan exhausted the collection.
    fn scan_range(&self, pgid: PgId, begin: &ObjectId, max: usize) -> ScanResult;

    /// Requests notification once every write applied to the PG's sequencer
    /// has reached stable storage.
    fn flush(&self, pgid: PgId, on_flushed: Callback);
}

#[derive(Debug, Default)]
struct Collection {
    objects: BTreeMap<ObjectId, (Eversion, Vec<u8>)>,
    meta: HashMap<String, Vec<u8>>,
}

/// In-memory [`ObjectStore`]: applies transactions inline and completes
/// callbacks synchronously, which preserves the per-PG ordering contract
/// trivially. Carries a fault hook so tests can exercise commit failure.
#[derive(Debug, Default)]
pub struct MemStore {
    collections: Mutex<HashMap<PgId, Collection>>,
    fail_next_apply: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `apply_transaction` fail with a storage-fatal error.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// Overwrites a metadata record with garbage, simulating on-disk
    /// corruption of a persisted chunk.
    pub fn corrupt_meta(&self, pgid: PgId, key: &str) {
        let mut collections = self.collections.lock().expect("mem store lock poisoned");
        if let Some(data) = collections
            .get_mut(&pgid)
            .and_then(|c| c.meta.get_mut(key))
        {
            for byte in data.iter_mut() {
                *byte ^= 0xa5;
            }
        }
    }

    pub fn object_count(&self, pgid: PgId) -> usize {
        let collections = self.collections.lock().expect("mem store lock poisoned");
        collections.get(&pgid).map(|c| c.objects.len()).unwrap_or(0)
    }
}

impl ObjectStore for MemStore {
    fn apply_transaction(
        &self,
        _pgid: PgId,
        txn: Transaction,
        on_commit: Option<Callback>,
    ) -> Result<(), StorageFatalError> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(StorageFatalError::new("injected commit failure"));
        }
        {
            let mut collections = self.collections.lock().expect("mem store lock poisoned");
            for op in txn.into_ops() {
                match op {
                    TxnOp::Put {
                        pgid,
                        oid,
                        version,
                        data,
                    } => {
                        collections
                            .entry(pgid)
                            .or_default()
                            .objects
                            .insert(oid, (version, data));
                    }
                    TxnOp::Remove { pgid, oid } => {
                        if let Some(collection) = collections.get_mut(&pgid) {
                            collection.objects.remove(&oid);
                        }
                    }
                    TxnOp::SetMeta { pgid, key, data } => {
                        collections
                            .entry(pgid)
                            .or_default()
                            .meta
                            .insert(key.to_owned(), data);
                    }
                    TxnOp::RemoveCollection { pgid } => {
                        collections.remove(&pgid);
                    }
                }
            }
        }
        if let Some(on_commit) = on_commit {
            on_commit();
        }
        Ok(())
    }

    fn read(&self, pgid: PgId, oid: &ObjectId) -> Option<(Eversion, Vec<u8>)> {
        let collections = self.collections.lock().expect("mem store lock poisoned");
        collections.get(&pgid)?.objects.get(oid).cloned()
    }

    fn get_meta(&self, pgid: PgId, key: &str) -> Option<Vec<u8>> {
        let collections = self.collections.lock().expect("mem store lock poisoned");
        collections.get(&pgid)?.meta.get(key).cloned()
    }

    fn scan_range(&self, pgid: PgId, begin: &ObjectId, max: usize) -> ScanResult {
        let collections = self.collections.lock().expect("mem store lock poisoned");
        let Some(collection) = collections.get(&pgid) else {
            return (Vec::new(), ObjectId::MAX);
        };
        let mut objects = Vec::with_capacity(max.min(64));
        let mut iter = collection.objects.range(begin.clone()..);
        for (oid, (version, _)) in iter.by_ref() {
            if objects.len() == max {
                return (objects, oid.clone());
            }
            objects.push((oid.clone(), *version));
        }
        (objects, ObjectId::MAX)
    }

    fn flush(&self, _pgid: PgId, on_flushed: Callback) {
        // Everything is already "durable" in memory.
        on_flushed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_applies_atomically() {
        let store = MemStore::new();
        let pgid = PgId(1);
        let mut txn = Transaction::new();
        txn.put(pgid, ObjectId::new("a"), Eversion::new(1, 1), vec![1]);
        txn.put(pgid, ObjectId::new("b"), Eversion::new(1, 2), vec![2]);
        txn.set_meta(pgid, "info", vec![9, 9]);

        store
            .apply_transaction(pgid, txn, None)
            .expect("apply should succeed");

        assert_eq!(
            store.read(pgid, &ObjectId::new("a")),
            Some((Eversion::new(1, 1), vec![1]))
        );
        assert_eq!(store.get_meta(pgid, "info"), Some(vec![9, 9]));
    }

    #[test]
    fn injected_failure_surfaces_as_storage_fatal() {
        let store = MemStore::new();
        store.fail_next_apply();
        let result = store.apply_transaction(PgId(1), Transaction::new(), None);
        assert!(result.is_err());
        // The failure is one-shot.
        assert!(store.apply_transaction(PgId(1), Transaction::new(), None).is_ok());
    }

    #[test]
    fn scan_range_reports_end_bound() {
        let store = MemStore::new();
        let pgid = PgId(2);
        let mut txn = Transaction::new();
        for name in ["a", "b", "c", "d"] {
            txn.put(pgid, ObjectId::new(name), Eversion::new(1, 1), vec![]);
        }
        store.apply_transaction(pgid, txn, None).expect("apply");

        let (objects, end) = store.scan_range(pgid, &ObjectId::new("a"), 2);
        assert_eq!(objects.len(), 2);
        assert_eq!(end, ObjectId::new("c"));

        let (rest, end) = store.scan_range(pgid, &end, 10);
        assert_eq!(rest.len(), 2);
        assert_eq!(end, ObjectId::MAX);
    }
}
