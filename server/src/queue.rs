//! Bounded per-connection outbound queue.
//!
//! Every connection owns one queue. The hub holds the only [`QueueSender`] in
//! its registry entry and writes with [`QueueSender::try_enqueue`], which
//! never blocks; the connection's write pump holds the [`QueueReceiver`] and
//! drains it.
//!
//! A queue is closed by dropping its sender. The receiver then yields every
//! message still buffered, followed by `None`, which ends the write pump.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use chatter_server::queue::{outbound_queue, EnqueueError};
//! use chatter_server::types::{Identity, Message};
//!
//! let (tx, mut rx) = outbound_queue(1);
//! let ada = Identity::new("u-1", "Ada", "");
//!
//! tx.try_enqueue(Arc::new(Message::chat(&ada, "one"))).unwrap();
//! let err = tx.try_enqueue(Arc::new(Message::chat(&ada, "two"))).unwrap_err();
//! assert_eq!(err, EnqueueError::Full);
//!
//! drop(tx);
//! assert_eq!(rx.try_next().unwrap().text(), "one");
//! assert!(rx.try_next().is_none());
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::Message;

/// Default capacity for each connection's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity: the consumer is not keeping up.
    #[error("outbound queue is full")]
    Full,

    /// The write pump has gone away.
    #[error("outbound queue is closed")]
    Closed,
}

/// Creates a bounded outbound queue.
///
/// # Panics
///
/// Panics if `capacity` is 0. Configuration rejects a zero capacity before
/// any queue is built.
pub fn outbound_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { inner: tx }, QueueReceiver { inner: rx })
}

/// Writing half of an outbound queue.
///
/// Deliberately not `Clone`: a single owner means dropping it closes the
/// queue.
#[derive(Debug)]
pub struct QueueSender {
    inner: mpsc::Sender<Arc<Message>>,
}

impl QueueSender {
    /// Enqueues a message without waiting for space.
    pub fn try_enqueue(&self, message: Arc<Message>) -> Result<(), EnqueueError> {
        self.inner.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Number of messages that can still be enqueued.
    pub fn remaining(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns `true` once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Reading half of an outbound queue, owned by the write pump.
#[derive(Debug)]
pub struct QueueReceiver {
    inner: mpsc::Receiver<Arc<Message>>,
}

impl QueueReceiver {
    /// Waits for the next message.
    ///
    /// Returns `None` once the sender has been dropped and the buffer is
    /// empty.
    pub async fn next(&mut self) -> Option<Arc<Message>> {
        self.inner.recv().await
    }

    /// Takes the next buffered message, if any, without waiting.
    pub fn try_next(&mut self) -> Option<Arc<Message>> {
        self.inner.try_recv().ok()
    }

    /// Returns `true` when the sender is gone and nothing is left to drain.
    pub fn is_finished(&self) -> bool {
        self.inner.is_closed() && self.inner.is_empty()
    }
}
