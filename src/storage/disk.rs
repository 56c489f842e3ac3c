//! Disk-backed document store
//!
//! Documents live in sled, keyed by `{generation}{path}`. Every concrete
//! partition points at exactly one live generation:
//!
//!   partitions tree:  /resources/fr/foo/authorization -> 0000000000000007
//!   documents tree:   0000000000000007/resources/fr/foo/authorization/x -> {...}
//!
//! A transaction writes into fresh generations. Commit carries forward any
//! untouched content, then swaps all of its partition pointers in a single
//! batch under the commit lock. Readers resolve pointers under the read side
//! of the same lock, so no reader ever sees a mix of old and new generations.
//! A generation no pointer references is garbage: an interrupted transaction
//! or the replaced side of a commit. Open sweeps all of them.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::partition::{Partition, PartitionSet};
use super::path::StoragePath;
use super::{Store, Transaction, BUNDLES_PARTITION};
use crate::error::StoreError;

/// Options for opening a [`DiskStore`]
#[derive(Debug, Clone)]
pub struct DiskOptions {
    /// Directory holding the sled database
    pub dir: PathBuf,
    /// Configured partitions; the reserved bundles partition is always added
    pub partitions: Vec<Partition>,
    /// sled page cache size in bytes
    pub cache_capacity: u64,
}

impl DiskOptions {
    pub fn new(dir: impl Into<PathBuf>, partitions: Vec<Partition>) -> Self {
        Self {
            dir: dir.into(),
            partitions,
            cache_capacity: 64 * 1024 * 1024, // 64MB
        }
    }
}

pub struct DiskStore {
    db: sled::Db,
    /// Concrete partition path -> live generation
    pointers: sled::Tree,
    documents: sled::Tree,
    partitions: PartitionSet,
    live: RwLock<HashMap<StoragePath, u64>>,
    locks: PartitionLocks,
}

impl DiskStore {
    pub fn open(options: DiskOptions) -> Result<Self, StoreError> {
        let mut partitions = options.partitions;
        partitions.push(Partition::parse(BUNDLES_PARTITION)?);
        let partitions = PartitionSet::new(partitions)?;

        std::fs::create_dir_all(&options.dir)
            .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {}", options.dir.display(), e)))?;

        let db = sled::Config::new()
            .path(&options.dir)
            .cache_capacity(options.cache_capacity)
            .open()?;
        let pointers = db.open_tree("partitions")?;
        let documents = db.open_tree("documents")?;

        let mut live = HashMap::new();
        for item in pointers.iter() {
            let (key, value) = item?;
            let path = StoragePath::parse(&String::from_utf8_lossy(&key))?;
            live.insert(path, decode_generation(&value)?);
        }

        let store = Self {
            db,
            pointers,
            documents,
            partitions,
            live: RwLock::new(live),
            locks: PartitionLocks::default(),
        };
        store.purge_unreferenced()?;

        info!(
            dir = %options.dir.display(),
            partitions = store.live_partitions().len(),
            "Opened disk store"
        );
        Ok(store)
    }

    /// Concrete partitions that currently have a live generation
    pub fn live_partitions(&self) -> Vec<StoragePath> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<StoragePath> = live.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Drop every generation no partition points at.
    ///
    /// Only sound while no transaction is open, i.e. during `open`.
    fn purge_unreferenced(&self) -> Result<(), StoreError> {
        let referenced: HashSet<u64> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect();

        // Visit each generation once by seeking past the one just seen
        let mut from = 0u64;
        while let Some(item) = self.documents.range(generation_prefix(from)..).next() {
            let (key, _) = item?;
            let generation = key_generation(&key)?;
            if !referenced.contains(&generation) {
                let removed = self.purge_generation(generation)?;
                warn!(generation, removed, "Purged unreferenced generation");
            }
            match generation.checked_add(1) {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(())
    }

    fn purge_generation(&self, generation: u64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for item in self.documents.scan_prefix(generation_prefix(generation)) {
            let (key, _) = item?;
            self.documents.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn read_generation(
        &self,
        generation: u64,
        partition: &StoragePath,
        path: &StoragePath,
    ) -> Result<Option<Value>, StoreError> {
        let mut result: Option<Value> = None;

        // Documents stored above `path` contribute the subtree they contain
        for depth in partition.len()..path.len() {
            let ancestor = path.truncate(depth);
            if let Some(bytes) = self.documents.get(document_key(generation, &ancestor))? {
                let value: Value = serde_json::from_slice(&bytes)?;
                if let Some(inner) = descend(value, &path.segments()[depth..]) {
                    merge_at(&mut result, &[], inner);
                }
            }
        }

        if let Some(bytes) = self.documents.get(document_key(generation, path))? {
            merge_at(&mut result, &[], serde_json::from_slice(&bytes)?);
        }

        let prefix = format!("{:016x}{}", generation, path.descendant_prefix());
        for item in self.documents.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = item?;
            let child = parse_document_key(&key)?;
            if let Some(rel) = child.strip_prefix(path) {
                merge_at(&mut result, rel, serde_json::from_slice(&bytes)?);
            }
        }

        Ok(result)
    }
}

impl Store for DiskStore {
    fn begin(&self, paths: &[StoragePath]) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let mut concrete: Vec<StoragePath> = Vec::new();
        for path in paths {
            let partition = self
                .partitions
                .resolve(path)
                .ok_or_else(|| StoreError::NoPartition(path.to_string()))?;
            if !concrete.contains(&partition) {
                concrete.push(partition);
            }
        }
        concrete.sort();

        let guard = self.locks.acquire(&concrete);

        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        let mut scope = Vec::with_capacity(concrete.len());
        for path in concrete {
            let new_generation = self.db.generate_id()?;
            scope.push(TxnPartition {
                old_generation: live.get(&path).copied(),
                path,
                new_generation,
                cleared: false,
                tombstones: Vec::new(),
            });
        }
        drop(live);

        debug!(partitions = scope.len(), "Transaction opened");
        Ok(Box::new(DiskTransaction {
            store: self,
            scope,
            finished: false,
            _guard: guard,
        }))
    }

    fn read(&self, path: &StoragePath) -> Result<Option<Value>, StoreError> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(partition) = self.partitions.resolve(path) {
            return match live.get(&partition) {
                Some(&generation) => self.read_generation(generation, &partition, path),
                None => Ok(None),
            };
        }

        // `path` lies above partitions: assemble it from every partition below
        let mut result: Option<Value> = None;
        for (partition, &generation) in live.iter() {
            if let Some(rel) = partition.strip_prefix(path) {
                if let Some(value) = self.read_generation(generation, partition, partition)? {
                    merge_at(&mut result, rel, value);
                }
            }
        }
        Ok(result)
    }

    fn partitions(&self) -> &PartitionSet {
        &self.partitions
    }
}

struct TxnPartition {
    path: StoragePath,
    old_generation: Option<u64>,
    new_generation: u64,
    /// Old content is dropped rather than carried forward
    cleared: bool,
    /// Subtrees of old content to drop
    tombstones: Vec<StoragePath>,
}

struct DiskTransaction<'a> {
    store: &'a DiskStore,
    scope: Vec<TxnPartition>,
    finished: bool,
    _guard: PartitionGuard<'a>,
}

impl DiskTransaction<'_> {
    fn owning(&mut self, path: &StoragePath) -> Result<&mut TxnPartition, StoreError> {
        self.scope
            .iter_mut()
            .find(|p| p.path.is_prefix_of(path))
            .ok_or_else(|| StoreError::OutsidePartitions(path.to_string()))
    }

    fn remove_new(&self, generation: u64, path: &StoragePath) -> Result<(), StoreError> {
        let documents = &self.store.documents;
        documents.remove(document_key(generation, path))?;
        let prefix = format!("{:016x}{}", generation, path.descendant_prefix());
        for item in documents.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            documents.remove(key)?;
        }
        Ok(())
    }

    /// Copy surviving old content into the new generations
    fn carry_forward(&self) -> Result<(), StoreError> {
        let documents = &self.store.documents;
        for part in &self.scope {
            let Some(old) = part.old_generation else { continue };
            if part.cleared {
                continue;
            }
            for item in documents.scan_prefix(generation_prefix(old)) {
                let (key, bytes) = item?;
                let path = parse_document_key(&key)?;
                if part.tombstones.iter().any(|t| t.is_prefix_of(&path)) {
                    continue;
                }
                let new_key = document_key(part.new_generation, &path);
                if !documents.contains_key(&new_key)? {
                    documents.insert(new_key, bytes)?;
                }
            }
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.finished = true;
        for part in &self.scope {
            if let Err(e) = self.store.purge_generation(part.new_generation) {
                warn!(generation = part.new_generation, error = %e, "Failed to purge aborted generation");
            }
        }
        debug!("Transaction aborted");
    }
}

impl Transaction for DiskTransaction<'_> {
    fn write(&mut self, path: &StoragePath, value: &Value) -> Result<(), StoreError> {
        let generation = self.owning(path)?.new_generation;
        let bytes = serde_json::to_vec(value)?;
        self.store.documents.insert(document_key(generation, path), bytes)?;
        Ok(())
    }

    fn delete(&mut self, path: &StoragePath) -> Result<(), StoreError> {
        // Deleting at or above a partition root clears the partition
        let mut covered = Vec::new();
        for part in self.scope.iter_mut() {
            if path.is_prefix_of(&part.path) {
                part.cleared = true;
                part.tombstones.clear();
                covered.push(part.new_generation);
            }
        }
        if !covered.is_empty() {
            for generation in covered {
                self.store.purge_generation(generation)?;
            }
            return Ok(());
        }

        let part = self.owning(path)?;
        part.tombstones.push(path.clone());
        let generation = part.new_generation;
        self.remove_new(generation, path)
    }

    fn contains(&self, path: &StoragePath) -> Result<bool, StoreError> {
        let Some(part) = self.scope.iter().find(|p| p.path.is_prefix_of(path)) else {
            return Ok(false);
        };
        Ok(self
            .store
            .documents
            .contains_key(document_key(part.new_generation, path))?)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let store = self.store;
        let mut live = store.live.write().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.carry_forward() {
            drop(live);
            self.discard();
            return Err(StoreError::Commit(e.to_string()));
        }

        let mut batch = sled::Batch::default();
        for part in &self.scope {
            batch.insert(part.path.key().into_bytes(), encode_generation(part.new_generation).to_vec());
        }
        if let Err(e) = store.pointers.apply_batch(batch) {
            drop(live);
            self.discard();
            return Err(StoreError::Commit(e.to_string()));
        }
        let durable = match store.db.flush() {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Flush after commit failed, keeping replaced generations");
                false
            }
        };

        for part in &self.scope {
            live.insert(part.path.clone(), part.new_generation);
        }
        // Old generations are unreachable once the pointers moved; a crash
        // before they are gone leaves them to the sweep on open
        if durable {
            for old in self.scope.iter().filter_map(|part| part.old_generation) {
                if let Err(e) = store.purge_generation(old) {
                    warn!(generation = old, error = %e, "Failed to purge replaced generation");
                }
            }
        }
        drop(live);

        self.finished = true;
        debug!(partitions = self.scope.len(), "Transaction committed");
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for DiskTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}

/// Exclusive ownership of concrete partitions for the lifetime of a transaction
#[derive(Default)]
struct PartitionLocks {
    held: Mutex<HashSet<StoragePath>>,
    released: Condvar,
}

impl PartitionLocks {
    fn acquire(&self, partitions: &[StoragePath]) -> PartitionGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while partitions.iter().any(|p| held.contains(p)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.extend(partitions.iter().cloned());
        PartitionGuard {
            locks: self,
            partitions: partitions.to_vec(),
        }
    }
}

struct PartitionGuard<'a> {
    locks: &'a PartitionLocks,
    partitions: Vec<StoragePath>,
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        for p in &self.partitions {
            held.remove(p);
        }
        self.locks.released.notify_all();
    }
}

fn generation_prefix(generation: u64) -> Vec<u8> {
    format!("{:016x}", generation).into_bytes()
}

fn document_key(generation: u64, path: &StoragePath) -> Vec<u8> {
    format!("{:016x}{}", generation, path).into_bytes()
}

fn key_generation(key: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(key.get(..16).unwrap_or_default())
        .ok()
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| StoreError::Corrupt("bad document key generation".to_string()))
}

fn parse_document_key(key: &[u8]) -> Result<StoragePath, StoreError> {
    let key = std::str::from_utf8(key).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let path = key
        .get(16..)
        .ok_or_else(|| StoreError::Corrupt(format!("short document key {}", key)))?;
    StoragePath::parse(path)
}

fn encode_generation(generation: u64) -> [u8; 8] {
    generation.to_be_bytes()
}

fn decode_generation(bytes: &[u8]) -> Result<u64, StoreError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("bad generation pointer".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// Walk `value` down `rel`, returning the nested value if every step exists
fn descend(mut value: Value, rel: &[String]) -> Option<Value> {
    for seg in rel {
        value = match value {
            Value::Object(mut map) => map.remove(seg)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Place `value` at `rel` below `target`, deep-merging objects
pub(crate) fn merge_at(target: &mut Option<Value>, rel: &[String], value: Value) {
    let slot = target.get_or_insert_with(|| Value::Object(Map::new()));
    let mut node = slot;
    for seg in rel {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(seg.clone()).or_insert(Value::Null),
            _ => return,
        };
    }
    merge_value(node, value);
}

fn merge_value(node: &mut Value, value: Value) {
    match (node, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_value(existing.entry(k).or_insert(Value::Null), v);
            }
        }
        (node, value) => *node = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    fn open(dir: &TempDir) -> DiskStore {
        DiskStore::open(DiskOptions::new(
            dir.path(),
            vec![Partition::parse("/a").unwrap(), Partition::parse("/b").unwrap()],
        ))
        .unwrap()
    }

    #[test]
    fn test_write_commit_read() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.write(&p("/a/x"), &json!({"k": 1})).unwrap();
        txn.write(&p("/a/y/z"), &json!("deep")).unwrap();
        assert!(txn.contains(&p("/a/x")).unwrap());
        assert_eq!(store.read(&p("/a/x")).unwrap(), None);
        txn.commit().unwrap();

        assert_eq!(store.read(&p("/a/x")).unwrap(), Some(json!({"k": 1})));
        assert_eq!(store.read(&p("/a/x/k")).unwrap(), Some(json!(1)));
        assert_eq!(
            store.read(&p("/a")).unwrap(),
            Some(json!({"x": {"k": 1}, "y": {"z": "deep"}}))
        );
        assert_eq!(
            store.read(&p("/")).unwrap(),
            Some(json!({"a": {"x": {"k": 1}, "y": {"z": "deep"}}}))
        );
        assert_eq!(store.read(&p("/b")).unwrap(), None);
    }

    #[test]
    fn test_abort_leaves_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.write(&p("/a/x"), &json!(1)).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.delete(&p("/a")).unwrap();
        txn.write(&p("/a/y"), &json!(2)).unwrap();
        txn.abort();

        assert_eq!(store.read(&p("/a")).unwrap(), Some(json!({"x": 1})));
    }

    #[test]
    fn test_dropped_transaction_aborts() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        {
            let mut txn = store.begin(&[p("/a")]).unwrap();
            txn.write(&p("/a/x"), &json!(1)).unwrap();
        }
        assert_eq!(store.read(&p("/a")).unwrap(), None);
        // Partition lock was released
        let txn = store.begin(&[p("/a")]).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_clear_replaces_partition() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.write(&p("/a/old"), &json!(1)).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.delete(&p("/a")).unwrap();
        txn.write(&p("/a/new"), &json!(2)).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.read(&p("/a")).unwrap(), Some(json!({"new": 2})));
    }

    #[test]
    fn test_untouched_content_is_carried_forward() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.write(&p("/a/keep"), &json!(1)).unwrap();
        txn.write(&p("/a/drop/x"), &json!(2)).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(&[p("/a")]).unwrap();
        txn.delete(&p("/a/drop")).unwrap();
        txn.write(&p("/a/added"), &json!(3)).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.read(&p("/a")).unwrap(), Some(json!({"keep": 1, "added": 3})));
    }

    #[test]
    fn test_write_outside_scope_fails() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut txn = store.begin(&[p("/a")]).unwrap();
        assert!(matches!(
            txn.write(&p("/b/x"), &json!(1)),
            Err(StoreError::OutsidePartitions(_))
        ));
        assert!(matches!(store.begin(&[p("/c")]), Err(StoreError::NoPartition(_))));
    }

    #[test]
    fn test_wildcard_partition_is_per_segment() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut txn = store.begin(&[p("/system/bundles/one")]).unwrap();
        txn.write(&p("/system/bundles/one/manifest"), &json!({"revision": "r1"})).unwrap();
        txn.commit().unwrap();

        // A different bundle's partition can be held concurrently
        let a = store.begin(&[p("/system/bundles/one")]).unwrap();
        let mut b = store.begin(&[p("/system/bundles/two")]).unwrap();
        b.write(&p("/system/bundles/two/manifest"), &json!({"revision": "r2"})).unwrap();
        b.commit().unwrap();
        a.abort();

        assert_eq!(
            store.read(&p("/system/bundles")).unwrap(),
            Some(json!({
                "one": {"manifest": {"revision": "r1"}},
                "two": {"manifest": {"revision": "r2"}}
            }))
        );
    }

    #[test]
    fn test_reopen_keeps_committed_and_purges_interrupted() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            let mut txn = store.begin(&[p("/a")]).unwrap();
            txn.write(&p("/a/x"), &json!(1)).unwrap();
            txn.commit().unwrap();

            let mut txn = store.begin(&[p("/a")]).unwrap();
            txn.write(&p("/a/y"), &json!(2)).unwrap();
            // Simulate a crash mid-transaction
            std::mem::forget(txn);
        }
        let store = open(&dir);
        assert_eq!(store.read(&p("/a")).unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.live_partitions(), vec![p("/a")]);
    }

    fn generations(store: &DiskStore) -> HashSet<u64> {
        store
            .documents
            .iter()
            .map(|item| key_generation(&item.unwrap().0).unwrap())
            .collect()
    }

    #[test]
    fn test_reopen_after_crash_between_swap_and_purge() {
        let dir = TempDir::new().unwrap();
        let (live, stale) = {
            let store = open(&dir);
            let mut txn = store.begin(&[p("/a")]).unwrap();
            txn.write(&p("/a/x"), &json!(1)).unwrap();
            txn.commit().unwrap();
            let live = store.live.read().unwrap()[&p("/a")];

            // Pointers swapped but neither the replaced generation nor an
            // in-flight one was purged
            let stale = store.db.generate_id().unwrap();
            let stray = store.db.generate_id().unwrap();
            store
                .documents
                .insert(document_key(stale, &p("/a/x")), serde_json::to_vec(&json!(0)).unwrap())
                .unwrap();
            store
                .documents
                .insert(document_key(stray, &p("/a/y")), serde_json::to_vec(&json!(2)).unwrap())
                .unwrap();
            store.db.flush().unwrap();
            assert_eq!(generations(&store).len(), 3);
            (live, stale)
        };

        let store = open(&dir);
        assert_eq!(store.read(&p("/a")).unwrap(), Some(json!({"x": 1})));
        assert_eq!(generations(&store), HashSet::from([live]));
        assert!(!generations(&store).contains(&stale));
    }

    #[test]
    fn test_live_generation_survives_repeated_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            let mut txn = store.begin(&[p("/a"), p("/system/bundles/b0")]).unwrap();
            txn.write(&p("/a/x"), &json!(1)).unwrap();
            txn.write(&p("/system/bundles/b0/manifest"), &json!({"revision": "r1"}))
                .unwrap();
            txn.commit().unwrap();
        }
        for _ in 0..3 {
            let store = open(&dir);
            assert_eq!(store.read(&p("/a/x")).unwrap(), Some(json!(1)));
            assert_eq!(
                store.read(&p("/system/bundles/b0/manifest/revision")).unwrap(),
                Some(json!("r1"))
            );
        }
    }

    #[test]
    fn test_merge_at_deep_merges_objects() {
        let mut target = None;
        merge_at(&mut target, &[], json!({"a": {"b": 1}}));
        merge_at(&mut target, &["a".to_string()], json!({"c": 2}));
        merge_at(&mut target, &["d".to_string()], json!([1, 2]));
        assert_eq!(target, Some(json!({"a": {"b": 1, "c": 2}, "d": [1, 2]})));
    }
}
