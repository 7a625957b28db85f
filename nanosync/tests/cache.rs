mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use futures::future::{self, BoxFuture, FutureExt};
use nanosync::{
    cache::KvsCache,
    config::{CacheConfig, RetryPolicy, ServiceConfig},
    kvs::{
        proto::service_name, Entry, KeyValueStore, KvsClient, KvsService, MaybeEntry,
        MemoryBackend, StorageBackend, StoreEvent,
    },
    Error, Registry,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use common::{eventually, init_tracing, within};

type Backend = MemoryBackend<String, Value>;
type Service = KvsService<String, Value>;

/// Service, client and a cache on top of the client.
struct Stack {
    backend: Arc<Backend>,
    service: Service,
    cache: KvsCache<String, Value>,
}

impl Stack {
    fn new() -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let backend = Arc::new(Backend::new());
        let service: Service = KvsService::new(backend.clone(), ServiceConfig::default());
        service.register(&registry, service_name("cache-test"))?;
        let client: KvsClient<String, Value> =
            KvsClient::connect(registry, service_name("cache-test"), RetryPolicy::default());
        let cache: KvsCache<String, Value> =
            KvsCache::new(Arc::new(client), CacheConfig::default());
        Ok(Self {
            backend,
            service,
            cache,
        })
    }
}

#[tokio::test]
async fn writes_reach_the_service() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;

    stack.cache.set("foo".into(), json!("bar"));
    within(stack.cache.sync()).await?;

    assert_eq!(stack.backend.value(&"foo".to_string()), Some(json!("bar")));
    assert_eq!(stack.cache.get("foo".into()).value(), Some(json!("bar")));
    Ok(())
}

#[tokio::test]
async fn service_deletions_evict_loaded_entries() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    stack
        .service
        .set(vec![MaybeEntry::set("foo".to_string(), json!(1))])
        .await?;

    let entry = stack.cache.get("foo".into());
    within(stack.cache.sync()).await?;
    assert_eq!(entry.value(), Some(json!(1)));

    stack.service.delete(vec!["foo".to_string()]).await?;
    eventually(|| entry.value().is_none()).await?;
    assert!(entry.is_loaded());
    Ok(())
}

#[tokio::test]
async fn remote_writes_update_tracked_entries_only() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    let entry = stack.cache.set("watched".into(), json!("old"));
    within(stack.cache.sync()).await?;

    stack
        .service
        .set(vec![
            MaybeEntry::set("watched".to_string(), json!("new")),
            MaybeEntry::set("unrelated".to_string(), json!(0)),
        ])
        .await?;
    eventually(|| entry.value() == Some(json!("new"))).await?;
    assert!(stack.cache.get_if_exists(&"unrelated".to_string()).is_none());
    Ok(())
}

#[tokio::test]
async fn merge_waits_for_the_first_load() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    stack
        .service
        .set(vec![MaybeEntry::set("counter".to_string(), json!(41))])
        .await?;

    let merged = within(stack.cache.merge("counter".into(), |current| {
        let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
        Some(json!(n + 1))
    }))
    .await?;
    assert_eq!(merged, Some(json!(42)));

    within(stack.cache.sync()).await?;
    assert_eq!(stack.backend.value(&"counter".to_string()), Some(json!(42)));
    Ok(())
}

#[tokio::test]
async fn merge_can_delete() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    stack.cache.set("gone".into(), json!(true));
    within(stack.cache.sync()).await?;

    let merged = within(stack.cache.merge("gone".into(), |_| None)).await?;
    assert_eq!(merged, None);
    within(stack.cache.sync()).await?;
    assert_eq!(stack.backend.value(&"gone".to_string()), None);
    Ok(())
}

#[tokio::test]
async fn local_writes_cancel_pending_fetches() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    stack
        .service
        .set(vec![MaybeEntry::set("k".to_string(), json!("stored"))])
        .await?;

    let entry = stack.cache.get("k".into());
    stack.cache.set("k".into(), json!("local"));
    within(stack.cache.sync()).await?;

    assert_eq!(entry.value(), Some(json!("local")));
    assert_eq!(stack.backend.value(&"k".to_string()), Some(json!("local")));
    Ok(())
}

#[tokio::test]
async fn sync_loss_refetches_tracked_keys() -> Result<()> {
    init_tracing();
    let stack = Stack::new()?;
    stack
        .service
        .set(vec![MaybeEntry::set("k".to_string(), json!(1))])
        .await?;
    let entry = stack.cache.get("k".into());
    within(stack.cache.sync()).await?;
    assert_eq!(entry.value(), Some(json!(1)));

    // A change the client never hears about, then a dropped connection.
    stack
        .backend
        .put(vec![MaybeEntry::set("k".to_string(), json!(2))])
        .await?;
    stack.service.close();

    eventually(|| entry.value() == Some(json!(2))).await?;
    Ok(())
}

/// Wraps a service, recording batch sizes and failing reads on demand.
struct Instrumented {
    inner: Service,
    get_batches: Mutex<Vec<usize>>,
    set_batches: Mutex<Vec<usize>>,
    failing_gets: AtomicUsize,
}

impl Instrumented {
    fn new(failing_gets: usize) -> Arc<Self> {
        let backend: Arc<Backend> = Arc::new(Backend::new());
        Arc::new(Self {
            inner: KvsService::new(backend, ServiceConfig::default()),
            get_batches: Mutex::new(Vec::new()),
            set_batches: Mutex::new(Vec::new()),
            failing_gets: AtomicUsize::new(failing_gets),
        })
    }
}

impl KeyValueStore<String, Value> for Instrumented {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, nanosync::Result<Vec<Entry<String, Value>>>> {
        self.get_batches.lock().push(keys.len());
        let failing = self.failing_gets.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_gets.store(failing - 1, Ordering::SeqCst);
            return future::ready(Err(Error::Disconnected)).boxed();
        }
        self.inner.get(keys)
    }

    fn get_starting_from(
        &self,
        bound: Option<String>,
        limit: usize,
    ) -> BoxFuture<'_, nanosync::Result<Vec<Entry<String, Value>>>> {
        self.inner.get_starting_from(bound, limit)
    }

    fn get_ending_at(
        &self,
        bound: Option<String>,
        limit: usize,
    ) -> BoxFuture<'_, nanosync::Result<Vec<Entry<String, Value>>>> {
        self.inner.get_ending_at(bound, limit)
    }

    fn set(&self, entries: Vec<MaybeEntry<String, Value>>) -> BoxFuture<'_, nanosync::Result<()>> {
        self.set_batches.lock().push(entries.len());
        self.inner.set(entries)
    }

    fn delete(&self, keys: Vec<String>) -> BoxFuture<'_, nanosync::Result<()>> {
        self.inner.delete(keys)
    }

    fn delete_all(&self) -> BoxFuture<'_, nanosync::Result<()>> {
        self.inner.delete_all()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<String, Value>> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn io_is_batched() -> Result<()> {
    init_tracing();
    let store = Instrumented::new(0);
    let cache: KvsCache<String, Value> = KvsCache::new(store.clone(), CacheConfig::default());

    let entries: Vec<_> = (0..60).map(|i| cache.get(format!("k{i:02}"))).collect();
    within(cache.sync()).await?;
    assert_eq!(*store.get_batches.lock(), vec![25, 25, 10]);
    assert!(entries.iter().all(|e| e.is_loaded() && e.value().is_none()));

    for i in 0..30 {
        cache.set(format!("w{i:02}"), json!(i));
    }
    within(cache.sync()).await?;
    assert_eq!(*store.set_batches.lock(), vec![25, 5]);
    Ok(())
}

#[tokio::test]
async fn repeated_io_failures_disable_io() -> Result<()> {
    init_tracing();
    let store = Instrumented::new(usize::MAX);
    let cache: KvsCache<String, Value> = KvsCache::new(store.clone(), CacheConfig::default());

    let entry = cache.get("k".into());
    within(cache.sync()).await?;
    assert!(cache.io_disabled());
    assert_eq!(store.get_batches.lock().len(), 3);
    assert!(!entry.is_loaded());

    // Memory-only from now on.
    cache.set("k".into(), json!("kept"));
    within(cache.sync()).await?;
    assert_eq!(entry.value(), Some(json!("kept")));
    assert!(store.set_batches.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn transient_io_failures_are_retried() -> Result<()> {
    init_tracing();
    let store = Instrumented::new(2);
    store
        .inner
        .set(vec![MaybeEntry::set("k".to_string(), json!("v"))])
        .await?;
    let cache: KvsCache<String, Value> = KvsCache::new(store.clone(), CacheConfig::default());

    let entry = cache.get("k".into());
    within(cache.sync()).await?;
    assert!(!cache.io_disabled());
    assert_eq!(entry.value(), Some(json!("v")));
    assert_eq!(*store.get_batches.lock(), vec![1, 1, 1]);
    Ok(())
}
