//! Persistent ordered storage behind a [`KvsService`](super::KvsService).
//!
//! The service only needs transactional point reads, writes and deletes
//! plus cursor-style range scans. [`MemoryBackend`] provides those over a
//! `BTreeMap`; hosts with real persistence implement [`StorageBackend`]
//! for their own engine.

use std::{collections::BTreeMap, ops::Bound};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;

use super::{Direction, Entry, Key, MaybeEntry, Value};
use crate::error::Result;

pub trait StorageBackend<K: Key, V: Value>: Send + Sync + 'static {
    /// Entries for the keys that exist, in request order.
    fn get(&self, keys: Vec<K>) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>>;

    /// Up to `limit` entries past `bound` (exclusive) in `direction`.
    fn range(
        &self,
        bound: Option<K>,
        direction: Direction,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>>;

    /// Applies all writes atomically; entries without a value are deleted.
    fn put(&self, entries: Vec<MaybeEntry<K, V>>) -> BoxFuture<'_, Result<()>>;

    fn delete(&self, keys: Vec<K>) -> BoxFuture<'_, Result<()>>;
}

/// In-memory backend.
///
/// `BTreeMap` gives the key ordering range scans rely on. The lock is only
/// held for the duration of a single call.
#[derive(Debug)]
pub struct MemoryBackend<K, V> {
    data: RwLock<BTreeMap<K, V>>,
}

impl<K: Key, V: Value> Default for MemoryBackend<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> MemoryBackend<K, V> {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Current value for `key`, read synchronously.
    pub fn value(&self, key: &K) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clones the entire map.
    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.data.read().clone()
    }

    fn scan(&self, bound: Option<K>, direction: Direction, limit: usize) -> Vec<Entry<K, V>> {
        let data = self.data.read();
        let to_entry = |(key, value): (&K, &V)| Entry::new(key.clone(), value.clone());
        match (direction, bound) {
            (Direction::Ascending, None) => data.iter().take(limit).map(to_entry).collect(),
            (Direction::Ascending, Some(bound)) => data
                .range((Bound::Excluded(bound), Bound::Unbounded))
                .take(limit)
                .map(to_entry)
                .collect(),
            (Direction::Descending, None) => {
                data.iter().rev().take(limit).map(to_entry).collect()
            }
            (Direction::Descending, Some(bound)) => data
                .range(..bound)
                .rev()
                .take(limit)
                .map(to_entry)
                .collect(),
        }
    }
}

impl<K: Key, V: Value> StorageBackend<K, V> for MemoryBackend<K, V> {
    fn get(&self, keys: Vec<K>) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        let data = self.data.read();
        let found = keys
            .into_iter()
            .filter_map(|key| data.get(&key).cloned().map(|value| Entry::new(key, value)))
            .collect();
        future::ready(Ok(found)).boxed()
    }

    fn range(
        &self,
        bound: Option<K>,
        direction: Direction,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        future::ready(Ok(self.scan(bound, direction, limit))).boxed()
    }

    fn put(&self, entries: Vec<MaybeEntry<K, V>>) -> BoxFuture<'_, Result<()>> {
        let mut data = self.data.write();
        for MaybeEntry { key, value } in entries {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        future::ready(Ok(())).boxed()
    }

    fn delete(&self, keys: Vec<K>) -> BoxFuture<'_, Result<()>> {
        let mut data = self.data.write();
        for key in &keys {
            data.remove(key);
        }
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with(keys: &[u32]) -> MemoryBackend<u32, String> {
        let backend = MemoryBackend::new();
        let entries = keys
            .iter()
            .map(|k| MaybeEntry::set(*k, format!("v{k}")))
            .collect();
        futures::executor::block_on(backend.put(entries)).unwrap();
        backend
    }

    fn keys(entries: Vec<Entry<u32, String>>) -> Vec<u32> {
        entries.into_iter().map(|e| e.key).collect()
    }

    #[test]
    fn range_bounds_are_exclusive() {
        let backend = backend_with(&[1, 2, 3, 4, 5]);
        let up = futures::executor::block_on(backend.range(Some(2), Direction::Ascending, 2));
        assert_eq!(keys(up.unwrap()), vec![3, 4]);

        let down = futures::executor::block_on(backend.range(Some(4), Direction::Descending, 10));
        assert_eq!(keys(down.unwrap()), vec![3, 2, 1]);
    }

    #[test]
    fn unbounded_scans_start_at_the_ends() {
        let backend = backend_with(&[10, 20, 30]);
        let first = futures::executor::block_on(backend.range(None, Direction::Ascending, 1));
        assert_eq!(keys(first.unwrap()), vec![10]);
        let last = futures::executor::block_on(backend.range(None, Direction::Descending, 1));
        assert_eq!(keys(last.unwrap()), vec![30]);
    }

    #[test]
    fn put_without_value_deletes() {
        let backend = backend_with(&[1, 2]);
        futures::executor::block_on(backend.put(vec![MaybeEntry::deleted(1)])).unwrap();
        assert_eq!(backend.value(&1), None);
        assert_eq!(backend.value(&2).as_deref(), Some("v2"));
        assert_eq!(backend.len(), 1);
        let snapshot: Vec<(u32, String)> = backend.snapshot().into_iter().collect();
        assert_eq!(snapshot, vec![(2, "v2".to_string())]);
    }

    #[test]
    fn get_skips_missing_keys() {
        let backend = backend_with(&[1, 3]);
        let found = futures::executor::block_on(backend.get(vec![3, 2, 1])).unwrap();
        assert_eq!(keys(found), vec![3, 1]);
    }
}
