use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::{self, BoxFuture, FutureExt};
use nanoid::nanoid;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    select,
    sync::{mpsc, oneshot, Notify},
};
use tracing::{debug, error, warn};

use super::envelope::Envelope;
use crate::{
    channel::ChannelEnd,
    config::PortConfig,
    error::{Error, ErrorInfo, Result},
};

const TAG_LEN: usize = 8;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Anything that can travel inside an envelope.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Process-unique identity of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    fn next() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Callbacks a port invokes for traffic initiated by its peer.
///
/// Every method has a default: a missing request handler answers with a
/// `NotImplemented` error, a missing notification handler hands the
/// notification to `on_request` and discards the outcome, and disconnects
/// are ignored.
pub trait PortHandler<M: Payload, R: Payload>: Send + Sync + 'static {
    fn on_request(
        &self,
        port: &NanoPort<M, R>,
        message: M,
    ) -> BoxFuture<'static, std::result::Result<R, ErrorInfo>> {
        let _ = (port, message);
        future::ready(Err(ErrorInfo::not_implemented())).boxed()
    }

    fn on_notify(&self, port: &NanoPort<M, R>, message: M) -> BoxFuture<'static, ()> {
        self.on_request(port, message).map(|_| ()).boxed()
    }

    /// Called once, before outstanding requests are rejected.
    fn on_disconnect(&self, port: &NanoPort<M, R>) {
        let _ = port;
    }
}

/// A handler that relies on every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandler;

impl<M: Payload, R: Payload> PortHandler<M, R> for NoHandler {}

/// One endpoint of a request/response + notification protocol over a
/// [`ChannelEnd`].
///
/// `M` is the message type for requests and notifications in both
/// directions, `R` the reply type. Handles are cheap to clone and all
/// refer to the same connection.
pub struct NanoPort<M, R> {
    shared: Arc<PortShared<M, R>>,
}

struct PortShared<M, R> {
    id: PortId,
    name: String,
    config: PortConfig,
    outbox: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    pending: Mutex<PendingTable>,
    handler: Arc<dyn PortHandler<M, R>>,
    shutdown: Notify,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Result<Value>>>,
}

enum Job<M> {
    Request { tag: String, message: M },
    Notify(M),
}

impl<M, R> Clone for NanoPort<M, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M, R> fmt::Debug for NanoPort<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NanoPort")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<M: Payload, R: Payload> NanoPort<M, R> {
    /// Wraps a channel end and starts processing its traffic.
    pub fn new(
        name: impl Into<String>,
        end: ChannelEnd,
        handler: Arc<dyn PortHandler<M, R>>,
        config: PortConfig,
    ) -> Self {
        let (port, inbox) = Self::attach(name, end, handler, config);
        port.start(inbox);
        port
    }

    /// Builds the port without reading from the channel yet.
    pub(crate) fn attach(
        name: impl Into<String>,
        end: ChannelEnd,
        handler: Arc<dyn PortHandler<M, R>>,
        config: PortConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (outbox, inbox) = end.into_parts();
        let port = Self {
            shared: Arc::new(PortShared {
                id: PortId::next(),
                name: name.into(),
                config,
                outbox: Mutex::new(Some(outbox)),
                pending: Mutex::new(PendingTable::default()),
                handler,
                shutdown: Notify::new(),
            }),
        };
        (port, inbox)
    }

    pub(crate) fn start(&self, inbox: mpsc::UnboundedReceiver<Value>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(self.clone(), jobs_rx));
        tokio::spawn(run_reader(self.clone(), inbox, jobs_tx));
    }

    pub fn id(&self) -> PortId {
        self.shared.id
    }

    /// Service name this port was opened for.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.pending.lock().closed
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().waiters.len()
    }

    /// Fire-and-forget. Failures (including a dead channel) are swallowed.
    pub fn notify(&self, message: &M) {
        let notify = match serde_json::to_value(message) {
            Ok(notify) => notify,
            Err(error) => {
                warn!(port = %self.id(), %error, "dropping unserializable notification");
                return;
            }
        };
        if self.send(Envelope::Notify { notify }).is_err() {
            debug!(port = %self.id(), "notification dropped; port is disconnected");
        }
    }

    /// Sends a request and waits for the matching reply, using the port's
    /// default timeout.
    pub async fn request(&self, message: &M) -> Result<R> {
        self.request_with_timeout(message, self.shared.config.request_timeout())
            .await
    }

    pub async fn request_with_timeout(&self, message: &M, timeout: Duration) -> Result<R> {
        let request = serde_json::to_value(message)?;
        let (waiter, reply) = oneshot::channel();
        let tag = self.register(waiter)?;
        let _pending = PendingGuard {
            shared: &self.shared,
            tag: &tag,
        };
        self.send(Envelope::Request {
            tag: tag.clone(),
            request,
        })?;

        let reply = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => return Err(Error::Disconnected),
            Err(_) => {
                debug!(port = %self.id(), %tag, ?timeout, "request timed out");
                return Err(Error::Timeout(timeout));
            }
        };
        serde_json::from_value(reply).map_err(|err| Error::Malformed(err.to_string()))
    }

    /// Hangs up. The handler's `on_disconnect` runs and pending requests
    /// fail with [`Error::Disconnected`].
    pub fn disconnect(&self) {
        self.finish();
    }

    fn register(&self, waiter: oneshot::Sender<Result<Value>>) -> Result<String> {
        let mut pending = self.shared.pending.lock();
        if pending.closed {
            return Err(Error::Disconnected);
        }
        let tag = loop {
            let tag = nanoid!(TAG_LEN);
            if !pending.waiters.contains_key(&tag) {
                break tag;
            }
        };
        pending.waiters.insert(tag.clone(), waiter);
        Ok(tag)
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        let outbox = self.shared.outbox.lock();
        match outbox.as_ref() {
            Some(outbox) => outbox
                .send(envelope.into_value())
                .map_err(|_| Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }

    fn route(&self, message: Value, jobs: &mpsc::UnboundedSender<Job<M>>) {
        match Envelope::parse(message) {
            Some(Envelope::Response { tag, response }) => self.resolve(&tag, Ok(response)),
            Some(Envelope::Error { tag, error }) => self.resolve(&tag, Err(Error::Remote(error))),
            Some(Envelope::Request { tag, request }) => match serde_json::from_value(request) {
                Ok(message) => {
                    let _ = jobs.send(Job::Request { tag, message });
                }
                Err(err) => {
                    debug!(port = %self.id(), %tag, error = %err, "rejecting undecodable request");
                    self.reply(tag, Err(ErrorInfo::new("MalformedRequest", err.to_string())));
                }
            },
            Some(Envelope::Notify { notify }) => match serde_json::from_value(notify) {
                Ok(message) => {
                    let _ = jobs.send(Job::Notify(message));
                }
                Err(err) => debug!(port = %self.id(), error = %err, "dropping undecodable notification"),
            },
            None => debug!(port = %self.id(), "dropping malformed envelope"),
        }
    }

    fn resolve(&self, tag: &str, reply: Result<Value>) {
        let waiter = self.shared.pending.lock().waiters.remove(tag);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(port = %self.id(), tag, "dropping reply for unknown tag"),
        }
    }

    fn reply(&self, tag: String, outcome: std::result::Result<R, ErrorInfo>) {
        let envelope = match outcome.map(serde_json::to_value) {
            Ok(Ok(response)) => Envelope::Response { tag, response },
            Ok(Err(err)) => Envelope::Error {
                tag,
                error: ErrorInfo::from(Error::from(err)),
            },
            Err(error) => Envelope::Error { tag, error },
        };
        if self.send(envelope).is_err() {
            debug!(port = %self.id(), "reply dropped; port is disconnected");
        }
    }

    fn finish(&self) {
        let waiters = {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        self.shared.outbox.lock().take();
        self.shared.shutdown.notify_one();
        debug!(
            port = %self.id(),
            name = %self.name(),
            rejected = waiters.len(),
            "port disconnected"
        );

        self.shared.handler.on_disconnect(self);
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::Disconnected));
        }
    }
}

/// Removes a request's pending entry however the request ends, including
/// when the caller drops the future.
struct PendingGuard<'a, M, R> {
    shared: &'a PortShared<M, R>,
    tag: &'a str,
}

impl<M, R> Drop for PendingGuard<'_, M, R> {
    fn drop(&mut self) {
        self.shared.pending.lock().waiters.remove(self.tag);
    }
}

async fn run_reader<M: Payload, R: Payload>(
    port: NanoPort<M, R>,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    jobs: mpsc::UnboundedSender<Job<M>>,
) {
    loop {
        let message = select! {
            message = inbox.recv() => message,
            _ = port.shared.shutdown.notified() => None,
        };
        match message {
            Some(message) => port.route(message, &jobs),
            None => break,
        }
    }
    port.finish();
}

/// Runs handlers one at a time so requests and notifications are
/// processed in arrival order.
async fn run_dispatcher<M: Payload, R: Payload>(
    port: NanoPort<M, R>,
    mut jobs: mpsc::UnboundedReceiver<Job<M>>,
) {
    let handler = Arc::clone(&port.shared.handler);
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Request { tag, message } => {
                let outcome =
                    AssertUnwindSafe(async { handler.on_request(&port, message).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let info = panic_info(panic.as_ref());
                            error!(port = %port.id(), %tag, error = %info, "request handler panicked");
                            Err(info)
                        });
                port.reply(tag, outcome);
            }
            Job::Notify(message) => {
                let outcome = AssertUnwindSafe(async { handler.on_notify(&port, message).await })
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    let info = panic_info(panic.as_ref());
                    error!(port = %port.id(), error = %info, "notification handler panicked");
                }
            }
        }
    }
}

fn panic_info(panic: &(dyn Any + Send)) -> ErrorInfo {
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    ErrorInfo::new("Panic", message)
}
