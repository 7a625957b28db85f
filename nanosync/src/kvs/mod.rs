//! Key-value store contract, wire protocol, service and client.
//!
//! - [`KeyValueStore`] is the interface every store in the stack offers:
//!   the service (same-process callers), the client (remote callers) and
//!   anything a cache sits on.
//! - [`proto`] is the message set exchanged between client and service.
//! - [`backend`] abstracts the persistent ordered store behind a service.
//! - [`service`] exposes a backend to connecting clients and broadcasts
//!   every change.
//! - [`client`] survives service restarts by reconnecting and retrying,
//!   and reports [`StoreEvent::SyncLost`] when it may have missed changes.

use std::{fmt::Debug, hash::Hash};

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream, StreamExt},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

pub mod backend;
pub mod client;
pub mod proto;
pub mod service;

pub use backend::{MemoryBackend, StorageBackend};
pub use client::{Connector, KvsClient};
pub use service::KvsService;

/// Page size used by [`KeyValueStore::list`] and [`KeyValueStore::list_reverse`].
pub const LIST_PAGE_SIZE: usize = 100;

/// Capacity of every store's event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Bounds for store keys (strings, integers, ...).
pub trait Key:
    Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Key for T where
    T: Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds for store values; `serde_json::Value` covers arbitrary JSON.
pub trait Value: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// An entry whose value may be missing, which means "deleted".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaybeEntry<K, V> {
    pub key: K,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<V>,
}

impl<K, V> MaybeEntry<K, V> {
    pub fn set(key: K, value: V) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn deleted(key: K) -> Self {
        Self { key, value: None }
    }

    pub fn into_entry(self) -> Option<Entry<K, V>> {
        let MaybeEntry { key, value } = self;
        value.map(|value| Entry { key, value })
    }
}

impl<K, V> From<Entry<K, V>> for MaybeEntry<K, V> {
    fn from(entry: Entry<K, V>) -> Self {
        Self::set(entry.key, entry.value)
    }
}

/// Change notifications raised by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent<K, V> {
    /// Entries were written; a missing value is a deletion.
    Set(Vec<MaybeEntry<K, V>>),
    Delete(Vec<K>),
    /// Changes may have been missed; re-derive any state from scratch.
    SyncLost,
}

/// Scan direction for range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordered key-value store.
///
/// Range reads use an exclusive bound: `get_starting_from(Some(k), n)`
/// returns up to `n` entries with keys greater than `k` in ascending
/// order, `get_ending_at(Some(k), n)` up to `n` entries with keys less than
/// `k` in descending order. A `None` bound starts at the respective end.
pub trait KeyValueStore<K: Key, V: Value>: Send + Sync {
    fn get(&self, keys: Vec<K>) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>>;

    fn get_starting_from(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>>;

    fn get_ending_at(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>>;

    /// Upserts; entries without a value are deleted.
    fn set(&self, entries: Vec<MaybeEntry<K, V>>) -> BoxFuture<'_, Result<()>>;

    fn delete(&self, keys: Vec<K>) -> BoxFuture<'_, Result<()>>;

    fn delete_all(&self) -> BoxFuture<'_, Result<()>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<K, V>>;

    /// Every entry in ascending key order, fetched page by page.
    fn list(&self) -> BoxStream<'_, Result<Entry<K, V>>> {
        paged(self, Direction::Ascending)
    }

    /// Every entry in descending key order, fetched page by page.
    fn list_reverse(&self) -> BoxStream<'_, Result<Entry<K, V>>> {
        paged(self, Direction::Descending)
    }
}

fn paged<'a, K, V, S>(store: &'a S, direction: Direction) -> BoxStream<'a, Result<Entry<K, V>>>
where
    K: Key,
    V: Value,
    S: KeyValueStore<K, V> + ?Sized,
{
    // `None` as the state means the previous page was the last one.
    stream::unfold(Some(None::<K>), move |cursor| async move {
        let bound = cursor?;
        let page = match direction {
            Direction::Ascending => store.get_starting_from(bound, LIST_PAGE_SIZE).await,
            Direction::Descending => store.get_ending_at(bound, LIST_PAGE_SIZE).await,
        };
        match page {
            Ok(page) => {
                let next = match page.last() {
                    Some(last) if page.len() >= LIST_PAGE_SIZE => Some(Some(last.key.clone())),
                    _ => None,
                };
                Some((Ok(page), next))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
    .flat_map(|page| {
        let items: Vec<Result<Entry<K, V>>> = match page {
            Ok(page) => page.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        };
        stream::iter(items)
    })
    .boxed()
}
