use std::{collections::HashMap, fmt, ops::Range, sync::Arc};

use parking_lot::RwLock;

use super::eventful_map::{Entries, EventfulMap, MapKey, MapObserver};

type KeyFn<V, K2> = Box<dyn Fn(&V) -> K2 + Send + Sync>;
type PositionFn<V> = Box<dyn Fn(&V) -> usize + Send + Sync>;
type PositionChangedFn<K, V> = Box<dyn Fn(&K, &V, usize) + Send + Sync>;

/// How an [`Index`] groups and orders a map's values.
pub struct IndexDefinition<K, V, K2> {
    key_for: KeyFn<V, K2>,
    position_of: Option<PositionFn<V>>,
    position_changed: Option<PositionChangedFn<K, V>>,
}

impl<K, V, K2> IndexDefinition<K, V, K2> {
    /// Groups values by `key_for`. Without a position function, values
    /// are appended to their bucket in the order they arrive.
    pub fn new(key_for: impl Fn(&V) -> K2 + Send + Sync + 'static) -> Self {
        Self {
            key_for: Box::new(key_for),
            position_of: None,
            position_changed: None,
        }
    }

    /// Desired position of a value inside its bucket. Out-of-range
    /// positions are clamped to the end.
    pub fn with_position(mut self, position_of: impl Fn(&V) -> usize + Send + Sync + 'static) -> Self {
        self.position_of = Some(Box::new(position_of));
        self
    }

    /// Called with the new position of every value whose place in its
    /// bucket changed, the value that caused the change included.
    pub fn on_position_changed(
        mut self,
        callback: impl Fn(&K, &V, usize) + Send + Sync + 'static,
    ) -> Self {
        self.position_changed = Some(Box::new(callback));
        self
    }
}

/// Live, read-only list of the map keys in one bucket.
///
/// The handle keeps tracking the bucket after it becomes empty.
#[derive(Clone)]
pub struct Bucket<K> {
    keys: Arc<RwLock<Vec<K>>>,
}

impl<K: MapKey> Bucket<K> {
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.keys.read().clone()
    }

    pub fn get(&self, position: usize) -> Option<K> {
        self.keys.read().get(position).cloned()
    }

    pub fn position_of(&self, key: &K) -> Option<usize> {
        self.keys.read().iter().position(|k| k == key)
    }

    /// Resolves the bucket's keys against `map`.
    pub fn values<'m, V>(&self, map: &'m EventfulMap<K, V>) -> Vec<&'m V> {
        self.keys.read().iter().filter_map(|key| map.get(key)).collect()
    }
}

impl<K: fmt::Debug> fmt::Debug for Bucket<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys.read().iter()).finish()
    }
}

/// Secondary index over an [`EventfulMap`].
///
/// Every key of the map sits in exactly one bucket, chosen by the
/// definition's `key_for`. Buckets are created on first use and never
/// removed. The index stores map keys only and reads values through the
/// map when it needs them. Dropping the index detaches it from the map.
pub struct Index<K, V, K2> {
    shared: Arc<IndexShared<K, V, K2>>,
}

struct IndexShared<K, V, K2> {
    definition: IndexDefinition<K, V, K2>,
    state: RwLock<IndexState<K, K2>>,
}

struct IndexState<K, K2> {
    buckets: HashMap<K2, Arc<RwLock<Vec<K>>>>,
    placement: HashMap<K, Placement<K2>>,
}

#[derive(Debug, Clone)]
struct Placement<K2> {
    bucket: K2,
    position: usize,
}

/// `(key, new position)` pairs to report once the index is unlocked.
type Shifted<K> = Vec<(K, usize)>;

impl<K, V, K2> Index<K, V, K2>
where
    K: MapKey,
    V: Send + Sync + 'static,
    K2: MapKey,
{
    /// Indexes the map's current contents, then follows its changes.
    pub fn new(map: &mut EventfulMap<K, V>, definition: IndexDefinition<K, V, K2>) -> Self {
        let shared = Arc::new(IndexShared {
            definition,
            state: RwLock::new(IndexState {
                buckets: HashMap::new(),
                placement: HashMap::new(),
            }),
        });
        let keys: Vec<K> = map.keys().cloned().collect();
        for key in &keys {
            shared.inserted(map.entries(), key);
        }
        let observer: Arc<dyn MapObserver<K, V>> = shared.clone();
        map.subscribe(&observer);
        Self { shared }
    }

    /// The bucket for `key`, created empty if it does not exist yet.
    pub fn get(&self, key: &K2) -> Bucket<K> {
        if let Some(keys) = self.shared.state.read().buckets.get(key) {
            return Bucket { keys: keys.clone() };
        }
        let keys = self.shared.state.write().bucket(key);
        Bucket { keys }
    }

    pub fn bucket_keys(&self) -> Vec<K2> {
        self.shared.state.read().buckets.keys().cloned().collect()
    }

    /// Bucket and position currently recorded for a map key.
    pub fn placement_of(&self, key: &K) -> Option<(K2, usize)> {
        self.shared
            .state
            .read()
            .placement
            .get(key)
            .map(|placement| (placement.bucket.clone(), placement.position))
    }

    /// Number of map keys the index tracks.
    pub fn len(&self) -> usize {
        self.shared.state.read().placement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full consistency check.
    ///
    /// # Panics
    ///
    /// If any recorded position disagrees with its bucket, or a bucket
    /// holds a key the index does not track.
    pub fn check_invariants(&self) {
        let state = self.shared.state.read();
        for key in state.placement.keys() {
            state.assert_placed(key);
        }
        let bucketed: usize = state.buckets.values().map(|keys| keys.read().len()).sum();
        assert_eq!(
            bucketed,
            state.placement.len(),
            "index buckets hold {bucketed} keys but {} are tracked",
            state.placement.len()
        );
    }
}

impl<K, V, K2> IndexShared<K, V, K2> {
    fn position(&self, value: &V) -> Option<usize> {
        self.definition.position_of.as_ref().map(|position_of| position_of(value))
    }

    fn report(&self, entries: &Entries<K, V>, shifted: Shifted<K>)
    where
        K: MapKey,
    {
        let Some(callback) = &self.definition.position_changed else {
            return;
        };
        for (key, position) in shifted {
            if let Some(value) = entries.get(&key) {
                callback(&key, value, position);
            }
        }
    }
}

impl<K, V, K2> MapObserver<K, V> for IndexShared<K, V, K2>
where
    K: MapKey,
    V: Send + Sync + 'static,
    K2: MapKey,
{
    fn inserted(&self, entries: &Entries<K, V>, key: &K) {
        let Some(value) = entries.get(key) else {
            return;
        };
        let bucket = (self.definition.key_for)(value);
        let shifted = self
            .state
            .write()
            .insert(key.clone(), bucket, self.position(value));
        self.report(entries, shifted);
    }

    fn updated(&self, entries: &Entries<K, V>, key: &K) {
        let Some(value) = entries.get(key) else {
            return;
        };
        let bucket = (self.definition.key_for)(value);
        let shifted = self.state.write().update(key, bucket, self.position(value));
        self.report(entries, shifted);
    }

    fn moved(&self, _entries: &Entries<K, V>, from: &K, to: &K) {
        self.state.write().rename(from, to);
    }

    fn deleted(&self, entries: &Entries<K, V>, key: &K, _value: &V) {
        let shifted = self.state.write().remove(key);
        self.report(entries, shifted);
    }
}

impl<K: MapKey, K2: MapKey> IndexState<K, K2> {
    fn bucket(&mut self, key: &K2) -> Arc<RwLock<Vec<K>>> {
        self.buckets.entry(key.clone()).or_default().clone()
    }

    fn insert(&mut self, key: K, bucket_key: K2, desired: Option<usize>) -> Shifted<K> {
        assert!(
            !self.placement.contains_key(&key),
            "index already tracks key {key:?}"
        );
        let bucket = self.bucket(&bucket_key);
        let shifted = {
            let mut keys = bucket.write();
            let position = desired.unwrap_or(keys.len()).min(keys.len());
            keys.insert(position, key.clone());
            renumber(&mut self.placement, &bucket_key, &keys, position..keys.len())
        };
        self.assert_placed(&key);
        shifted
    }

    fn remove(&mut self, key: &K) -> Shifted<K> {
        self.assert_placed(key);
        let Some(Placement {
            bucket: bucket_key,
            position,
        }) = self.placement.remove(key)
        else {
            return Vec::new();
        };
        let bucket = self.bucket(&bucket_key);
        let mut keys = bucket.write();
        keys.remove(position);
        renumber(&mut self.placement, &bucket_key, &keys, position..keys.len())
    }

    fn update(&mut self, key: &K, bucket_key: K2, desired: Option<usize>) -> Shifted<K> {
        self.assert_placed(key);
        let Some(current) = self.placement.get(key).cloned() else {
            return Vec::new();
        };
        if current.bucket != bucket_key {
            let mut shifted = self.remove(key);
            shifted.extend(self.insert(key.clone(), bucket_key, desired));
            return shifted;
        }
        let Some(desired) = desired else {
            return Vec::new();
        };

        let bucket = self.bucket(&bucket_key);
        let shifted = {
            let mut keys = bucket.write();
            let target = desired.min(keys.len() - 1);
            if target == current.position {
                return Vec::new();
            }
            let moved = keys.remove(current.position);
            keys.insert(target, moved);
            let first = target.min(current.position);
            let last = target.max(current.position);
            renumber(&mut self.placement, &bucket_key, &keys, first..last + 1)
        };
        self.assert_placed(key);
        shifted
    }

    fn rename(&mut self, from: &K, to: &K) {
        self.assert_placed(from);
        let Some(placement) = self.placement.remove(from) else {
            return;
        };
        self.bucket(&placement.bucket).write()[placement.position] = to.clone();
        self.placement.insert(to.clone(), placement);
        self.assert_placed(to);
    }

    fn assert_placed(&self, key: &K) {
        let placement = self
            .placement
            .get(key)
            .unwrap_or_else(|| panic!("index lost track of key {key:?}"));
        let found = self
            .buckets
            .get(&placement.bucket)
            .and_then(|keys| keys.read().get(placement.position).cloned());
        assert!(
            found.as_ref() == Some(key),
            "index position mismatch: {key:?} recorded at {:?}[{}] but found {found:?}",
            placement.bucket,
            placement.position
        );
    }
}

fn renumber<K: MapKey, K2: Clone>(
    placement: &mut HashMap<K, Placement<K2>>,
    bucket: &K2,
    keys: &[K],
    range: Range<usize>,
) -> Shifted<K> {
    range
        .map(|position| {
            let key = keys[position].clone();
            placement.insert(
                key.clone(),
                Placement {
                    bucket: bucket.clone(),
                    position,
                },
            );
            (key, position)
        })
        .collect()
}
