use std::{collections::HashMap, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    backend::StorageBackend,
    proto::{KvsPort, Message, Reply},
    Direction, Entry, Key, KeyValueStore, MaybeEntry, StoreEvent, Value, EVENT_CAPACITY,
};
use crate::{
    config::ServiceConfig,
    error::{ErrorInfo, Result},
    nanoservice::{NanoPort, NanoService, PortHandler, PortId, Registry},
};

/// Owns a [`StorageBackend`] and serves it to every connected client.
///
/// Each successful write is broadcast to all connected client ports, the
/// writer included, and raised as a local [`StoreEvent`] for same-process
/// subscribers. Handles are cheap to clone.
pub struct KvsService<K: Key, V: Value> {
    state: Arc<ServiceState<K, V>>,
}

struct ServiceState<K: Key, V: Value> {
    backend: Arc<dyn StorageBackend<K, V>>,
    config: ServiceConfig,
    clients: Mutex<HashMap<PortId, KvsPort<K, V>>>,
    events: broadcast::Sender<StoreEvent<K, V>>,
}

impl<K: Key, V: Value> Clone for KvsService<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: Key, V: Value> KvsService<K, V> {
    pub fn new(backend: Arc<dyn StorageBackend<K, V>>, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(ServiceState {
                backend,
                config,
                clients: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Makes the service reachable as `name` through `registry`.
    pub fn register(&self, registry: &Registry, name: impl Into<String>) -> Result<()> {
        registry.register::<_, Message<K, V>, Reply<K, V>>(name, Arc::new(self.clone()))
    }

    pub fn connected_clients(&self) -> usize {
        self.state.clients.lock().len()
    }

    /// Disconnects every client. Clients that are still alive reconnect on
    /// their own if the service stays registered.
    pub fn close(&self) {
        let clients = std::mem::take(&mut *self.state.clients.lock());
        for port in clients.into_values() {
            port.disconnect();
        }
    }

    async fn handle(&self, message: Message<K, V>) -> Result<Reply<K, V>> {
        let backend = &self.state.backend;
        match message {
            Message::Get { keys } => Ok(found(backend.get(keys).await?)),
            Message::GetStartingFrom { bound, limit } => Ok(found(
                backend.range(bound, Direction::Ascending, limit).await?,
            )),
            Message::GetEndingAt { bound, limit } => Ok(found(
                backend.range(bound, Direction::Descending, limit).await?,
            )),
            Message::Set { entries } => {
                self.write(entries).await?;
                Ok(None)
            }
            Message::Delete { keys } => {
                self.remove(keys).await?;
                Ok(None)
            }
            Message::DeleteAll => {
                self.remove_all().await?;
                Ok(None)
            }
        }
    }

    async fn write(&self, entries: Vec<MaybeEntry<K, V>>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.state.backend.put(entries.clone()).await?;
        self.broadcast(Message::Set {
            entries: entries.clone(),
        });
        let _ = self.state.events.send(StoreEvent::Set(entries));
        Ok(())
    }

    async fn remove(&self, keys: Vec<K>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.state.backend.delete(keys.clone()).await?;
        self.broadcast(Message::Delete { keys: keys.clone() });
        let _ = self.state.events.send(StoreEvent::Delete(keys));
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        let batch = self.state.config.delete_batch_size.max(1);
        loop {
            let page = self
                .state
                .backend
                .range(None, Direction::Ascending, batch)
                .await?;
            let last_page = page.len() < batch;
            let keys: Vec<K> = page.into_iter().map(|entry| entry.key).collect();
            debug!(deleted = keys.len(), "delete_all batch");
            self.remove(keys).await?;
            if last_page {
                return Ok(());
            }
        }
    }

    fn broadcast(&self, message: Message<K, V>) {
        let clients: Vec<KvsPort<K, V>> = self.state.clients.lock().values().cloned().collect();
        for port in clients {
            port.notify(&message);
        }
    }
}

fn found<K, V>(entries: Vec<Entry<K, V>>) -> Reply<K, V> {
    Some(Message::Set {
        entries: entries.into_iter().map(MaybeEntry::from).collect(),
    })
}

impl<K: Key, V: Value> KeyValueStore<K, V> for KvsService<K, V> {
    fn get(&self, keys: Vec<K>) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        self.state.backend.get(keys)
    }

    fn get_starting_from(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        self.state.backend.range(bound, Direction::Ascending, limit)
    }

    fn get_ending_at(
        &self,
        bound: Option<K>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Entry<K, V>>>> {
        self.state.backend.range(bound, Direction::Descending, limit)
    }

    fn set(&self, entries: Vec<MaybeEntry<K, V>>) -> BoxFuture<'_, Result<()>> {
        self.write(entries).boxed()
    }

    fn delete(&self, keys: Vec<K>) -> BoxFuture<'_, Result<()>> {
        self.remove(keys).boxed()
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<()>> {
        self.remove_all().boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<K, V>> {
        self.state.events.subscribe()
    }
}

impl<K: Key, V: Value> PortHandler<Message<K, V>, Reply<K, V>> for KvsService<K, V> {
    fn on_request(
        &self,
        port: &NanoPort<Message<K, V>, Reply<K, V>>,
        message: Message<K, V>,
    ) -> BoxFuture<'static, std::result::Result<Reply<K, V>, ErrorInfo>> {
        let service = self.clone();
        let port = port.id();
        async move {
            service.handle(message).await.map_err(|err| {
                debug!(%port, error = %err, "kvs request failed");
                ErrorInfo::from(err)
            })
        }
        .boxed()
    }

    fn on_disconnect(&self, port: &NanoPort<Message<K, V>, Reply<K, V>>) {
        if self.state.clients.lock().remove(&port.id()).is_some() {
            info!(port = %port.id(), store = %port.name(), "kvs client disconnected");
        }
    }
}

impl<K: Key, V: Value> NanoService<Message<K, V>, Reply<K, V>> for KvsService<K, V> {
    fn on_connect(&self, port: &NanoPort<Message<K, V>, Reply<K, V>>) {
        info!(port = %port.id(), store = %port.name(), "kvs client connected");
        self.state.clients.lock().insert(port.id(), port.clone());
    }
}
