use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::port::{NanoPort, Payload, PortHandler};
use crate::{
    channel::{self, ChannelEnd},
    config::PortConfig,
    error::{Error, Result},
};

/// Server side of a named connection.
///
/// A service sees every connecting client as its own [`NanoPort`], so it
/// can answer one client and broadcast to all of them.
pub trait NanoService<M: Payload, R: Payload>: PortHandler<M, R> {
    /// Runs before the new port processes any message.
    fn on_connect(&self, port: &NanoPort<M, R>) {
        let _ = port;
    }
}

trait Acceptor: Send + Sync {
    fn accept(&self, name: &str, end: ChannelEnd, config: &PortConfig);
}

struct ServiceAcceptor<S, M, R> {
    service: Arc<S>,
    _messages: PhantomData<fn() -> (M, R)>,
}

impl<S, M, R> Acceptor for ServiceAcceptor<S, M, R>
where
    S: NanoService<M, R>,
    M: Payload,
    R: Payload,
{
    fn accept(&self, name: &str, end: ChannelEnd, config: &PortConfig) {
        let handler: Arc<dyn PortHandler<M, R>> = self.service.clone();
        let (port, inbox) = NanoPort::attach(name, end, handler, config.clone());
        self.service.on_connect(&port);
        port.start(inbox);
    }
}

/// Name → service map that routes new connections.
///
/// Build one per process (or per test) and share it by reference with
/// everything that registers or connects.
pub struct Registry {
    services: Mutex<HashMap<String, Arc<dyn Acceptor>>>,
    config: PortConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(PortConfig::default())
    }
}

impl Registry {
    /// `config` applies to every port the registry creates.
    pub fn new(config: PortConfig) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn port_config(&self) -> &PortConfig {
        &self.config
    }

    /// Fails with [`Error::DuplicateService`] if the name is taken.
    pub fn register<S, M, R>(&self, name: impl Into<String>, service: Arc<S>) -> Result<()>
    where
        S: NanoService<M, R>,
        M: Payload,
        R: Payload,
    {
        let name = name.into();
        let mut services = self.services.lock();
        if services.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }
        info!(%name, "service registered");
        services.insert(
            name,
            Arc::new(ServiceAcceptor {
                service,
                _messages: PhantomData,
            }),
        );
        Ok(())
    }

    /// Stops routing new connections to `name`. Existing ports stay open.
    pub fn unregister(&self, name: &str) -> bool {
        self.services.lock().remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.services.lock().contains_key(name)
    }

    /// Opens a raw channel to the service registered as `name`.
    ///
    /// Connecting to an unknown name is not an error: nobody answers and the
    /// far end is simply drained until the caller hangs up.
    pub fn connect(&self, name: &str) -> ChannelEnd {
        let (client, server) = channel::pair();
        let acceptor = self.services.lock().get(name).cloned();
        match acceptor {
            Some(acceptor) => acceptor.accept(name, server, &self.config),
            None => {
                debug!(name, "no service registered; ignoring connection");
                park(server);
            }
        }
        client
    }

    /// [`connect`](Self::connect) wrapped in a client-side port.
    pub fn connect_port<M: Payload, R: Payload>(
        &self,
        name: &str,
        handler: Arc<dyn PortHandler<M, R>>,
    ) -> NanoPort<M, R> {
        NanoPort::new(name, self.connect(name), handler, self.config.clone())
    }
}

fn park(mut end: ChannelEnd) {
    tokio::spawn(async move { while end.recv().await.is_some() {} });
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    struct Silent;

    impl PortHandler<Value, Value> for Silent {}
    impl NanoService<Value, Value> for Silent {}

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = Registry::default();
        registry
            .register::<_, Value, Value>("kvs:settings", Arc::new(Silent))
            .expect("first registration");
        let second = registry.register::<_, Value, Value>("kvs:settings", Arc::new(Silent));
        assert!(matches!(second, Err(Error::DuplicateService(name)) if name == "kvs:settings"));
    }

    #[tokio::test]
    async fn unregister_frees_the_name() {
        let registry = Registry::default();
        registry.register::<_, Value, Value>("svc", Arc::new(Silent)).expect("register");
        assert!(registry.is_registered("svc"));
        assert!(registry.unregister("svc"));
        assert!(!registry.unregister("svc"));
        registry.register::<_, Value, Value>("svc", Arc::new(Silent)).expect("register again");
    }
}
