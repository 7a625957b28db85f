use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Weak,
};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    proto::{KvsPort, Message, Reply},
    Entry, Key, KeyValueStore, MaybeEntry, StoreEvent, Value, EVENT_CAPACITY,
};
use crate::{
    channel::ChannelEnd,
    config::{PortConfig, RetryPolicy},
    error::{Error, Result},
    nanoservice::{NanoPort, PortHandler, PortId, Registry},
};

/// Opens a fresh channel to the service. Called once at start-up and again
/// after every unexpected disconnect.
pub type Connector = Arc<dyn Fn() -> ChannelEnd + Send + Sync>;

/// Remote [`KeyValueStore`] backed by a [`KvsService`](super::KvsService).
///
/// When the port drops, the client reconnects at once and publishes
/// [`StoreEvent::SyncLost`]: notifications sent during the outage are gone
/// and subscribers must rebuild whatever they derived from them. Requests
/// that fail in transit are retried on the new port according to the
/// [`RetryPolicy`]; errors raised by the service are returned as-is.
pub struct KvsClient<K: Key, V: Value> {
    inner: Arc<ClientInner<K, V>>,
}

struct ClientInner<K: Key, V: Value> {
    name: String,
    connector: Connector,
    port_config: PortConfig,
    retry: RetryPolicy,
    port: Mutex<KvsPort<K, V>>,
    events: broadcast::Sender<StoreEvent<K, V>>,
    closed: AtomicBool,
    /// Disconnects since traffic last got through. Past the first, each
    /// reconnect waits `retry.backoff(drops - 1)`.
    drops: AtomicU32,
}

/// Port callbacks. Holds the client weakly so a dropped client is not
/// kept alive by its own connection.
struct ClientHandler<K: Key, V: Value> {
    inner: Weak<ClientInner<K, V>>,
}

impl<K: Key, V: Value> Clone for KvsClient<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, V: Value> KvsClient<K, V> {
    /// Connects to the service registered as `name`.
    pub fn connect(registry: Arc<Registry>, name: impl Into<String>, retry: RetryPolicy) -> Self {
        let name = name.into();
        let port_config = registry.port_config().clone();
        let target = name.clone();
        let connector: Connector = Arc::new(move || registry.connect(&target));
        Self::with_connector(name, connector, port_config, retry)
    }

    /// Uses a custom way of reaching the service.
    pub fn with_connector(
        name: impl Into<String>,
        connector: Connector,
        port_config: PortConfig,
        retry: RetryPolicy,
    ) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<K, V>>| {
            let port = open_port(&name, &connector, &port_config, weak.clone());
            ClientInner {
                name,
                connector,
                port_config,
                retry,
                port: Mutex::new(port),
                events,
                closed: AtomicBool::new(false),
                drops: AtomicU32::new(0),
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.port.lock().is_connected()
    }

    /// Stops reconnecting and hangs up. Later calls fail with
    /// [`Error::Disconnected`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let port = self.inner.port.lock().clone();
        port.disconnect();
        debug!(store = %self.inner.name, "kvs client closed");
    }

    async fn entries(&self, message: Message<K, V>) -> Result<Vec<Entry<K, V>>> {
        match self.inner.request(message).await? {
            Some(Message::Set { entries }) => Ok(entries
                .into_iter()
                .filter_map(MaybeEntry::into_entry)
                .collect()),
            other => Err(Error::Malformed(format!("unexpected reply to a read: {other:?}"))),
        }
    }

    async fn mutate(&self, message: Message<K, V>) -> Result<()> {
        match self.inner.request(message).await? {
            None => Ok(()),
            Some(other) => Err(Error::Malformed(format!(
                "unexpected reply to a write: {other:?}"
            ))),
        }
    }
}

impl<K: Key, V: Value> ClientInner<K, V> {
    fn current_port(&self) -> Result<KvsPort<K, V>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        Ok(self.port.lock().clone())
    }

    async fn request(&self, message: Message<K, V>) -> Result<Reply<K, V>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let port = self.current_port()?;
            match port.request(&message).await {
                Ok(reply) => {
                    self.drops.store(0, Ordering::Release);
                    return Ok(reply);
                }
                Err(err)
                    if err.is_transport()
                        && attempt < self.retry.max_attempts
                        && !self.closed.load(Ordering::Acquire) =>
                {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        store = %self.name,
                        attempt,
                        ?delay,
                        error = %err,
                        "kvs request failed in transit; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replaces the port `stale` with a fresh one and reports the gap.
    fn reconnect(self: &Arc<Self>, stale: PortId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut current = self.port.lock();
            if current.id() != stale {
                return;
            }
            warn!(store = %self.name, port = %stale, "kvs port disconnected; reconnecting");
            *current = open_port(
                &self.name,
                &self.connector,
                &self.port_config,
                Arc::downgrade(self),
            );
            info!(store = %self.name, port = %current.id(), "kvs client reconnected");
        }
        let _ = self.events.send(StoreEvent::SyncLost);
    }
}

impl<K: Key, V: Value> Drop for ClientInner<K, V> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.port.get_mut().disconnect();
    }
}

fn open_port<K: Key, V: Value>(
    name: &str,
    connector: &Connector,
    config: &PortConfig,
    inner: Weak<ClientInner<K, V>>,
) -> KvsPort<K, V> {
    let handler: Arc<dyn PortHandler<Message<K, V>, Reply<K, V>>> =
        Arc::new(ClientHandler { inner });
    NanoPort::new(name, connector(), handler, config.clone())
}

impl<K: Key, V: Value> ClientHandler<K, V> {
    /// The client, if it is alive and `port` is still its current port.
    fn owner(&self, port: &KvsPort<K, V>) -> Option<Arc<ClientInner<K, V>>> {
        let inner = self.inner.upgrade()?;
        let current = inner.port.lock().id();
        (current == port.id()).then_some(inner)
    }
}

impl<K: Key, V: Value> PortHandler<Message<K, V>, Reply<K, V>> for ClientHandler<K, V> {
    fn on_notify(&self, port: &KvsPort<K, V>, message: Message<K, V>) -> BoxFuture<'static, ()> {
        let Some(inner) = self.owner(port) else {
            return future::ready(()).boxed();
        };
        let event = match message {
            Message::Set { entries } => StoreEvent::Set(entries),
            Message::Delete { keys } => StoreEvent::Delete(keys),
            other => {
                debug!(store = %inner.name, message = ?other, "ignoring unexpected notification");
                return future::ready(()).boxed();
            }
        };
        inner.drops.store(0, Ordering::Release);
        let _ = inner.events.send(event);
        future::ready(()).boxed()
    }

    fn on_disconnect(&self, port: &KvsPort<K, V>) {
        let Some(inner) = self.owner(port) else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let drops = inner.drops.fetch_add(1, Ordering::AcqRel) + 1;
        if drops == 1 {
            inner.reconnect(port.id());
            return;
        }
        let delay = inner.retry.backoff((drops - 1).min(inner.retry.max_attempts));
        warn!(
            store = %inner.name,
            port = %port.id(),
            drops,
            ?delay,
            "kvs port keeps dropping; delaying reconnect"
        );
        let weak = Arc::downgrade(&inner);
        let stale = port.id();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(stale);
            }
        });
    }
}

impl<K: Key, V: Value> KeyValueStore<K, V> for KvsClient<K, V> {
    fn get(&self, keys: Vec<K>) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        if keys.is_empty() {
            return future::ready(Ok(Vec::new())).boxed();
        }
        self.entries(Message::Get { keys }).boxed()
    }

    fn get_starting_from(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        self.entries(Message::GetStartingFrom { bound, limit })
            .boxed()
    }

    fn get_ending_at(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        self.entries(Message::GetEndingAt { bound, limit }).boxed()
    }

    fn set(&self, entries: Vec<MaybeEntry<K, V>>) -> BoxFuture<'_, Result<()>> {
        if entries.is_empty() {
            return future::ready(Ok(())).boxed();
        }
        self.mutate(Message::Set { entries }).boxed()
    }

    fn delete(&self, keys: Vec<K>) -> BoxFuture<'_, Result<()>> {
        if keys.is_empty() {
            return future::ready(Ok(())).boxed();
        }
        self.mutate(Message::Delete { keys }).boxed()
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<()>> {
        self.mutate(Message::DeleteAll).boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<K, V>> {
        self.inner.events.subscribe()
    }
}
