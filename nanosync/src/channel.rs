//! In-memory duplex channel carrying JSON values.
//!
//! This is the raw transport the rest of the crate assumes: messages
//! arrive in send order, at most once, and either end may vanish at any
//! time. Dropping an end is the disconnect signal the other end observes.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// One side of a [`pair`].
#[derive(Debug)]
pub struct ChannelEnd {
    outbox: mpsc::UnboundedSender<Value>,
    inbox: mpsc::UnboundedReceiver<Value>,
}

/// Creates two connected ends.
pub fn pair() -> (ChannelEnd, ChannelEnd) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd {
            outbox: left_tx,
            inbox: left_rx,
        },
        ChannelEnd {
            outbox: right_tx,
            inbox: right_rx,
        },
    )
}

impl ChannelEnd {
    /// Queues a message for the peer. Fails once the peer has disconnected.
    pub fn post_message(&self, message: Value) -> Result<()> {
        self.outbox.send(message).map_err(|_| Error::Disconnected)
    }

    /// Next message from the peer, or `None` after the peer disconnected.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    pub fn is_connected(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Hangs up. Equivalent to dropping the end.
    pub fn disconnect(self) {}

    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
        (self.outbox, self.inbox)
    }
}
