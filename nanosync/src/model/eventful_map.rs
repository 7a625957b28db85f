use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
};

/// Bounds for [`EventfulMap`] keys.
pub trait MapKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> MapKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Receives every change made to an [`EventfulMap`].
///
/// Callbacks run synchronously inside the map operation, after the change
/// has been applied, and see the map's contents through `entries`.
pub trait MapObserver<K, V>: Send + Sync {
    fn inserted(&self, entries: &Entries<K, V>, key: &K) {
        let _ = (entries, key);
    }

    fn updated(&self, entries: &Entries<K, V>, key: &K) {
        let _ = (entries, key);
    }

    /// `from` is gone and the same value now lives under `to`.
    fn moved(&self, entries: &Entries<K, V>, from: &K, to: &K) {
        let _ = (entries, from, to);
    }

    /// `value` has already been removed from `entries`.
    fn deleted(&self, entries: &Entries<K, V>, key: &K, value: &V) {
        let _ = (entries, key, value);
    }
}

struct Slot<V> {
    seq: u64,
    value: V,
}

/// Read-only view of a map's contents, in insertion order.
pub struct Entries<K, V> {
    slots: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: MapKey, V> Entries<K, V> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.order
            .values()
            .filter_map(|key| self.slots.get(key).map(|slot| (key, &slot.value)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.order.values()
    }
}

/// Key → value store that reports every change to its observers.
///
/// Values are owned by the map. Changes made in place must go through
/// [`update`](Self::update), or be announced with
/// [`notify_updated`](Self::notify_updated) when the value uses interior
/// mutability. Inserting a key that is already present is a programming
/// error and panics.
///
/// Observers are held weakly; dropping the last `Arc` to one detaches it.
pub struct EventfulMap<K, V> {
    entries: Entries<K, V>,
    observers: Vec<Weak<dyn MapObserver<K, V>>>,
}

impl<K: MapKey, V> Default for EventfulMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MapKey, V> EventfulMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Entries::new(),
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: &Arc<dyn MapObserver<K, V>>) {
        self.observers.push(Arc::downgrade(observer));
    }

    pub fn entries(&self) -> &Entries<K, V> {
        &self.entries
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order. A moved entry keeps its place.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.keys()
    }

    /// # Panics
    ///
    /// If `key` is already present.
    pub fn insert(&mut self, key: K, value: V) {
        assert!(
            !self.entries.contains_key(&key),
            "EventfulMap already contains key {key:?}"
        );
        let seq = self.entries.next_seq;
        self.entries.next_seq += 1;
        self.entries.order.insert(seq, key.clone());
        self.entries.slots.insert(key.clone(), Slot { seq, value });
        self.emit(|observer, entries| observer.inserted(entries, &key));
    }

    /// Mutates the value under `key` and raises an update. Returns `None`
    /// without calling `mutate` if the key is absent.
    pub fn update<T>(&mut self, key: &K, mutate: impl FnOnce(&mut V) -> T) -> Option<T> {
        let slot = self.entries.slots.get_mut(key)?;
        let outcome = mutate(&mut slot.value);
        self.emit(|observer, entries| observer.updated(entries, key));
        Some(outcome)
    }

    /// Raises an update for a value changed without going through
    /// [`update`](Self::update). Returns whether the key is present.
    pub fn notify_updated(&mut self, key: &K) -> bool {
        if !self.entries.contains_key(key) {
            return false;
        }
        self.emit(|observer, entries| observer.updated(entries, key));
        true
    }

    /// Re-keys the value under `from` without changing its iteration
    /// position. Returns `false` if `from` is absent.
    ///
    /// # Panics
    ///
    /// If `to` is already present.
    pub fn move_key(&mut self, from: &K, to: K) -> bool {
        if from == &to {
            return self.entries.contains_key(from);
        }
        assert!(
            !self.entries.contains_key(&to),
            "EventfulMap already contains key {to:?}"
        );
        let Some(slot) = self.entries.slots.remove(from) else {
            return false;
        };
        self.entries.order.insert(slot.seq, to.clone());
        self.entries.slots.insert(to.clone(), slot);
        self.emit(|observer, entries| observer.moved(entries, from, &to));
        true
    }

    /// Removes and returns the value. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.slots.remove(key)?;
        self.entries.order.remove(&slot.seq);
        self.emit(|observer, entries| observer.deleted(entries, key, &slot.value));
        Some(slot.value)
    }

    fn emit(&mut self, event: impl Fn(&dyn MapObserver<K, V>, &Entries<K, V>)) {
        self.observers.retain(|observer| observer.strong_count() > 0);
        for observer in self.observers.iter().filter_map(Weak::upgrade) {
            event(observer.as_ref(), &self.entries);
        }
    }
}
