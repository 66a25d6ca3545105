//! Message history persistence.
//!
//! Persistence is a collaborator of the hub, never part of its coordination
//! path. The hub hands each accepted chat message to an [`Archiver`], which
//! forwards it over a bounded channel to a dedicated task that calls
//! [`MessageStore::save`]. A full backlog or a failing store costs history,
//! never delivery.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chatter_server::store::{spawn_archiver, MemoryStore, MessageStore};
//! use chatter_server::types::{Identity, Message};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new(100));
//! let (archiver, task) = spawn_archiver(store.clone(), 64);
//!
//! let ada = Identity::new("u-1", "Ada", "");
//! archiver.submit(Arc::new(Message::chat(&ada, "hello")));
//!
//! drop(archiver);
//! task.await.unwrap();
//! assert_eq!(store.recent(10).await.unwrap().len(), 1);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::Message;

/// Default number of messages retained by [`MemoryStore`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Default backlog between the hub and the archiver task.
pub const DEFAULT_ARCHIVE_BACKLOG: usize = 256;

/// Errors reported by a [`MessageStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("message store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the message.
    #[error("message rejected by store: {0}")]
    Rejected(String),
}

/// Storage backend for chat history.
///
/// Implementations own their retry policy; callers treat every error as
/// final.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persists one message.
    async fn save(&self, message: &Message) -> Result<(), StoreError>;

    /// Returns up to `limit` of the most recent messages, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError>;
}

/// Bounded in-memory history. The oldest message is evicted first.
#[derive(Debug)]
pub struct MemoryStore {
    messages: RwLock<VecDeque<Message>>,
    capacity: usize,
}

impl MemoryStore {
    /// Creates a store retaining at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Number of messages currently retained.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<(), StoreError> {
        if self.capacity == 0 {
            return Err(StoreError::Rejected("store has zero capacity".to_string()));
        }

        let mut messages = self.messages.write().await;
        while messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(message.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.iter().skip(skip).cloned().collect())
    }
}

/// Non-blocking handle the hub uses to hand messages to the archiver task.
#[derive(Debug, Clone)]
pub struct Archiver {
    tx: mpsc::Sender<Arc<Message>>,
}

impl Archiver {
    /// Queues a message for persistence without waiting.
    ///
    /// Returns `false` if the message was dropped because the backlog is full
    /// or the archiver task has stopped.
    pub fn submit(&self, message: Arc<Message>) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Archive backlog full, message not persisted");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Archiver stopped, message not persisted");
                false
            }
        }
    }
}

/// Spawns the archiver task writing into `store`.
///
/// The task exits once every [`Archiver`] clone has been dropped and the
/// backlog is drained.
pub fn spawn_archiver(store: Arc<dyn MessageStore>, backlog: usize) -> (Archiver, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Arc<Message>>(backlog);

    let handle = tokio::spawn(async move {
        info!(backlog, "Archiver started");
        while let Some(message) = rx.recv().await {
            match store.save(&message).await {
                Ok(()) => debug!(author = %message.author().id, "Message persisted"),
                Err(err) => warn!(error = %err, "Failed to persist message"),
            }
        }
        info!("Archiver stopped");
    });

    (Archiver { tx }, handle)
}
