//! Read-through, write-behind cache in front of a [`KeyValueStore`].
//!
//! Reads return a live [`CacheEntry`] at once and load it in the
//! background; writes land in memory at once and are flushed in the
//! background. Fetches and flushes are batched and run by a single I/O
//! task per cache, so there is at most one fetch batch and one flush batch
//! in flight. Change events from the store keep loaded entries current.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::{broadcast, oneshot, watch},
};
use tracing::{debug, error, warn};

use crate::{
    config::CacheConfig,
    error::Result,
    kvs::{Entry, Key, KeyValueStore, MaybeEntry, StoreEvent, Value},
};

/// Handle to one cached key. Clones share the same slot and see every
/// later change to it.
pub struct CacheEntry<K, V> {
    key: K,
    cell: Arc<RwLock<Cell<V>>>,
}

struct Cell<V> {
    value: Option<V>,
    loaded: bool,
}

impl<K: Clone, V> Clone for CacheEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<K, V: Clone> CacheEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// `None` while not loaded, and for keys the store does not have.
    pub fn value(&self) -> Option<V> {
        self.cell.read().value.clone()
    }

    /// Whether the value came from the store, a local write or a change
    /// event, as opposed to still waiting for its first fetch.
    pub fn is_loaded(&self) -> bool {
        self.cell.read().loaded
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.read();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("value", &cell.value)
            .field("loaded", &cell.loaded)
            .finish()
    }
}

pub struct KvsCache<K: Key, V: Value> {
    shared: Arc<CacheShared<K, V>>,
}

struct CacheShared<K: Key, V: Value> {
    store: Arc<dyn KeyValueStore<K, V>>,
    config: CacheConfig,
    state: Mutex<CacheState<K, V>>,
    idle: watch::Sender<bool>,
    _stop_listener: oneshot::Sender<()>,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<K, V>>,
    needs_fetch: BTreeSet<K>,
    needs_flush: BTreeSet<K>,
    io_running: bool,
    io_crashes: u32,
    io_disabled: bool,
}

impl<K: Key, V: Value> Clone for KvsCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Key, V: Value> KvsCache<K, V> {
    /// Must be called inside a tokio runtime; the cache spawns a task that
    /// follows the store's change events.
    pub fn new(store: Arc<dyn KeyValueStore<K, V>>, config: CacheConfig) -> Self {
        let events = store.subscribe();
        let (idle, _) = watch::channel(true);
        let (stop_tx, stop_rx) = oneshot::channel();
        let shared = Arc::new(CacheShared {
            store,
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                needs_fetch: BTreeSet::new(),
                needs_flush: BTreeSet::new(),
                io_running: false,
                io_crashes: 0,
                io_disabled: false,
            }),
            idle,
            _stop_listener: stop_tx,
        });
        tokio::spawn(listen(Arc::downgrade(&shared), events, stop_rx));
        Self { shared }
    }

    /// The entry for `key`, scheduling its first fetch if it is new.
    pub fn get(&self, key: K) -> CacheEntry<K, V> {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.entries.get(&key) {
            return entry.clone();
        }
        let entry = CacheEntry {
            key: key.clone(),
            cell: Arc::new(RwLock::new(Cell {
                value: None,
                loaded: false,
            })),
        };
        state.entries.insert(key.clone(), entry.clone());
        if !state.io_disabled {
            state.needs_fetch.insert(key);
            self.shared.schedule_io(&mut state);
        }
        entry
    }

    /// The entry for `key` if it is already cached. Never schedules I/O.
    pub fn get_if_exists(&self, key: &K) -> Option<CacheEntry<K, V>> {
        self.shared.state.lock().entries.get(key).cloned()
    }

    /// Updates the entry now and flushes it to the store later.
    pub fn set(&self, key: K, value: V) -> CacheEntry<K, V> {
        self.shared.write(key, Some(value))
    }

    /// Read-modify-write of one key. Waits for pending I/O first when the
    /// entry has not been loaded yet. Returning `None` deletes the key.
    ///
    /// Concurrent merges of the same key are not serialized; the last
    /// write wins.
    pub async fn merge(&self, key: K, merge: impl FnOnce(Option<V>) -> Option<V>) -> Option<V> {
        let entry = self.get(key.clone());
        if !entry.is_loaded() {
            self.sync().await;
        }
        let merged = merge(entry.value());
        self.shared.write(key, merged.clone());
        merged
    }

    /// Sets `key` only if it currently has no value. A fetch or change
    /// event landing afterwards may still replace it.
    pub fn maybe_insert(&self, key: K, value: V) -> bool {
        let entry = self.get(key.clone());
        if entry.value().is_some() {
            return false;
        }
        self.shared.write(key, Some(value));
        true
    }

    /// Resolves once every fetch and flush scheduled so far has settled.
    pub async fn sync(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// `true` once repeated I/O failures turned this into a memory-only
    /// cache.
    pub fn io_disabled(&self) -> bool {
        self.shared.state.lock().io_disabled
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Key, V: Value> CacheShared<K, V> {
    fn write(self: &Arc<Self>, key: K, value: Option<V>) -> CacheEntry<K, V> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry {
                key: key.clone(),
                cell: Arc::new(RwLock::new(Cell {
                    value: None,
                    loaded: false,
                })),
            })
            .clone();
        {
            let mut cell = entry.cell.write();
            cell.value = value;
            cell.loaded = true;
        }
        state.needs_fetch.remove(&key);
        if !state.io_disabled {
            state.needs_flush.insert(key);
            self.schedule_io(&mut state);
        }
        entry
    }

    fn schedule_io(self: &Arc<Self>, state: &mut CacheState<K, V>) {
        if state.io_running || state.io_disabled {
            return;
        }
        if state.needs_fetch.is_empty() && state.needs_flush.is_empty() {
            return;
        }
        state.io_running = true;
        self.idle.send_replace(false);
        tokio::spawn(run_io(Arc::clone(self)));
    }

    fn take_batch(&self, pick: Queue<K, V>) -> Vec<K> {
        let mut state = self.state.lock();
        let queue = pick(&mut *state);
        let mut batch = Vec::new();
        while batch.len() < self.config.batch_size.max(1) {
            match queue.pop_first() {
                Some(key) => batch.push(key),
                None => break,
            }
        }
        batch
    }

    fn requeue(&self, pick: Queue<K, V>, keys: Vec<K>) {
        let mut state = self.state.lock();
        pick(&mut *state).extend(keys);
    }

    /// One pass over everything queued: all fetch batches, then all flush
    /// batches. A failed batch is queued again and ends the cycle.
    async fn io_cycle(&self) -> Result<()> {
        loop {
            let batch = self.take_batch(fetch_queue);
            if batch.is_empty() {
                break;
            }
            debug!(keys = batch.len(), "cache fetch batch");
            match self.store.get(batch.clone()).await {
                Ok(found) => self.apply_fetch(batch, found),
                Err(err) => {
                    self.requeue(fetch_queue, batch);
                    return Err(err);
                }
            }
        }

        loop {
            let batch = self.take_batch(flush_queue);
            if batch.is_empty() {
                break;
            }
            let entries: Vec<MaybeEntry<K, V>> = {
                let state = self.state.lock();
                batch
                    .iter()
                    .filter_map(|key| state.entries.get(key))
                    .map(|entry| MaybeEntry {
                        key: entry.key.clone(),
                        value: entry.value(),
                    })
                    .collect()
            };
            debug!(keys = entries.len(), "cache flush batch");
            if let Err(err) = self.store.set(entries).await {
                self.requeue(flush_queue, batch);
                return Err(err);
            }
        }
        Ok(())
    }

    fn apply_fetch(&self, batch: Vec<K>, found: Vec<Entry<K, V>>) {
        let mut found: HashMap<K, V> = found
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        let state = self.state.lock();
        for key in batch {
            if state.needs_flush.contains(&key) {
                continue;
            }
            if let Some(entry) = state.entries.get(&key) {
                let mut cell = entry.cell.write();
                cell.value = found.remove(&key);
                cell.loaded = true;
            }
        }
    }

    fn apply_event(self: &Arc<Self>, event: StoreEvent<K, V>) {
        let mut state = self.state.lock();
        match event {
            StoreEvent::Set(entries) => {
                for MaybeEntry { key, value } in entries {
                    state.overwrite(key, value);
                }
            }
            StoreEvent::Delete(keys) => {
                for key in keys {
                    state.overwrite(key, None);
                }
            }
            StoreEvent::SyncLost if state.io_disabled => {}
            StoreEvent::SyncLost => {
                debug!(tracked = state.entries.len(), "cache refetching after sync loss");
                let CacheState {
                    entries,
                    needs_fetch,
                    needs_flush,
                    ..
                } = &mut *state;
                needs_fetch.extend(
                    entries
                        .keys()
                        .filter(|key| !needs_flush.contains(*key))
                        .cloned(),
                );
                self.schedule_io(&mut state);
            }
        }
    }
}

type Queue<K, V> = fn(&mut CacheState<K, V>) -> &mut BTreeSet<K>;

fn fetch_queue<K, V>(state: &mut CacheState<K, V>) -> &mut BTreeSet<K> {
    &mut state.needs_fetch
}

fn flush_queue<K, V>(state: &mut CacheState<K, V>) -> &mut BTreeSet<K> {
    &mut state.needs_flush
}

impl<K: Key, V: Value> CacheState<K, V> {
    /// Applies an authoritative value from the store to a tracked key.
    /// Any fetch or flush still queued for it is dropped.
    fn overwrite(&mut self, key: K, value: Option<V>) {
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        {
            let mut cell = entry.cell.write();
            cell.value = value;
            cell.loaded = true;
        }
        self.needs_fetch.remove(&key);
        self.needs_flush.remove(&key);
    }
}

async fn run_io<K: Key, V: Value>(cache: Arc<CacheShared<K, V>>) {
    // Let calls made in the same tick join the first batch.
    tokio::task::yield_now().await;
    loop {
        let outcome = cache.io_cycle().await;
        let mut state = cache.state.lock();
        match outcome {
            Ok(()) => state.io_crashes = 0,
            Err(err) => {
                state.io_crashes += 1;
                warn!(error = %err, crashes = state.io_crashes, "cache I/O cycle failed");
                if state.io_crashes >= cache.config.max_io_crashes {
                    error!(
                        crashes = state.io_crashes,
                        "cache I/O keeps failing; continuing memory-only"
                    );
                    state.io_disabled = true;
                    state.needs_fetch.clear();
                    state.needs_flush.clear();
                }
            }
        }
        let drained = state.needs_fetch.is_empty() && state.needs_flush.is_empty();
        if drained || state.io_disabled {
            state.io_running = false;
            cache.idle.send_replace(true);
            return;
        }
    }
}

async fn listen<K: Key, V: Value>(
    cache: Weak<CacheShared<K, V>>,
    mut events: broadcast::Receiver<StoreEvent<K, V>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let event = select! {
            event = events.recv() => event,
            _ = &mut stop => return,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "cache fell behind store events; refetching");
                StoreEvent::SyncLost
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.apply_event(event);
    }
}
