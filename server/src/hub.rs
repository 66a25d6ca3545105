//! The connection hub.
//!
//! The hub is the single owner of the registry of live connections and the
//! only component that decides fan-out. It runs as one task that processes
//! [`HubCommand`]s from a bounded channel, one at a time and in arrival
//! order. Because every registry read and write happens inside that loop, the
//! registry needs no lock, and all recipients observe broadcasts and
//! join/leave notices in the same relative order.
//!
//! # Architecture
//!
//! - [`Hub`] - the actor. Owns the registry and the receiving end of the
//!   command channel.
//! - [`HubHandle`] - cheap, cloneable sender used by connections and routes.
//!
//! # Delivery Policy
//!
//! Every delivery is a non-blocking [`try_enqueue`](crate::queue::QueueSender::try_enqueue)
//! onto the recipient's outbound queue. A recipient whose queue is full is
//! considered dead: its entry is removed, which drops the queue sender and
//! lets its write pump close the stream. No leave notice is emitted for such
//! a forced removal.
//!
//! # Example
//!
//! ```rust
//! use chatter_server::hub::{ConnectionId, Hub};
//! use chatter_server::queue::outbound_queue;
//! use chatter_server::types::Identity;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (hub, _task) = Hub::spawn(64, None);
//!
//! let ada = Identity::new("u-1", "Ada", "");
//! let (queue, _rx) = outbound_queue(16);
//! hub.register(ada.clone(), ConnectionId::new(), queue).await.unwrap();
//!
//! assert_eq!(hub.connection_count().await.unwrap(), 1);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::queue::{EnqueueError, QueueSender};
use crate::store::Archiver;
use crate::types::{Identity, Message};

/// Default capacity of the hub's inbound command channel.
pub const DEFAULT_HUB_CAPACITY: usize = 64;

/// Identifies one accepted stream.
///
/// An identity may reconnect; each stream still gets a fresh id, so the hub
/// can tell a superseded connection from its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors returned by [`HubHandle`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub task has stopped; no request can be delivered.
    #[error("hub is not running")]
    Closed,
}

/// A request processed by the hub loop.
#[derive(Debug)]
pub enum HubCommand {
    /// Admit a connection and announce it to everyone else.
    Register {
        identity: Identity,
        connection: ConnectionId,
        queue: QueueSender,
    },

    /// Remove a connection, if it is still the registered one, and announce
    /// its departure.
    Deregister {
        identity_id: String,
        connection: ConnectionId,
    },

    /// Deliver a chat message to every member except its author.
    Broadcast {
        connection: ConnectionId,
        message: Message,
    },

    /// Snapshot of the registered identities.
    Members { reply: oneshot::Sender<Vec<Identity>> },

    /// Number of registered connections.
    Count { reply: oneshot::Sender<usize> },
}

/// A registry entry.
#[derive(Debug)]
struct Member {
    identity: Identity,
    connection: ConnectionId,
    queue: QueueSender,
}

/// The hub actor.
///
/// Construct with [`Hub::new`] and drive with [`Hub::run`], or use
/// [`Hub::spawn`] to do both.
#[derive(Debug)]
pub struct Hub {
    registry: HashMap<String, Member>,
    commands: mpsc::Receiver<HubCommand>,
    archiver: Option<Archiver>,
}

impl Hub {
    /// Creates a hub and the handle used to reach it.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize, archiver: Option<Archiver>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        debug!(capacity, archive = archiver.is_some(), "Created hub");
        let hub = Self {
            registry: HashMap::new(),
            commands: rx,
            archiver,
        };
        (hub, HubHandle { commands: tx })
    }

    /// Creates a hub and spawns its loop on the current runtime.
    pub fn spawn(capacity: usize, archiver: Option<Archiver>) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(capacity, archiver);
        (handle, tokio::spawn(hub.run()))
    }

    /// Processes commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        info!(members = self.registry.len(), "Hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                identity,
                connection,
                queue,
            } => self.register(identity, connection, queue),
            HubCommand::Deregister {
                identity_id,
                connection,
            } => self.deregister(&identity_id, connection),
            HubCommand::Broadcast {
                connection,
                message,
            } => self.broadcast(connection, message),
            HubCommand::Members { reply } => {
                let mut members: Vec<Identity> = self
                    .registry
                    .values()
                    .map(|member| member.identity.clone())
                    .collect();
                members.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(members);
            }
            HubCommand::Count { reply } => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn register(&mut self, identity: Identity, connection: ConnectionId, queue: QueueSender) {
        let id = identity.id.clone();
        let notice = Arc::new(Message::joined(&identity));

        let member = Member {
            identity,
            connection,
            queue,
        };
        // Dropping the superseded entry closes its queue, which ends its
        // write pump and with it the old stream.
        if let Some(previous) = self.registry.insert(id.clone(), member) {
            warn!(
                identity = %id,
                previous_connection = %previous.connection,
                connection = %connection,
                "Identity re-registered, closing superseded connection"
            );
        }

        info!(
            identity = %id,
            connection = %connection,
            members = self.registry.len(),
            "Connection registered"
        );

        self.deliver(notice, Some(id.as_str()));
    }

    fn deregister(&mut self, identity_id: &str, connection: ConnectionId) {
        if !self.is_current(identity_id, connection) {
            debug!(
                identity = %identity_id,
                connection = %connection,
                "Deregister for connection no longer registered"
            );
            return;
        }
        let Some(member) = self.registry.remove(identity_id) else {
            return;
        };

        info!(
            identity = %identity_id,
            connection = %connection,
            members = self.registry.len(),
            "Connection deregistered"
        );

        let notice = Arc::new(Message::left(&member.identity));
        drop(member);
        self.deliver(notice, None);
    }

    fn broadcast(&mut self, connection: ConnectionId, message: Message) {
        let author_id = message.author().id.clone();
        if !self.is_current(&author_id, connection) {
            debug!(
                identity = %author_id,
                connection = %connection,
                "Dropping broadcast from connection no longer registered"
            );
            return;
        }

        let message = Arc::new(message);
        let delivered = self.deliver(Arc::clone(&message), Some(author_id.as_str()));
        trace!(identity = %author_id, recipients = delivered, "Broadcast delivered");

        if let Some(archiver) = &self.archiver {
            archiver.submit(message);
        }
    }

    /// Returns `true` if `connection` is the registered holder of `identity_id`.
    fn is_current(&self, identity_id: &str, connection: ConnectionId) -> bool {
        self.registry
            .get(identity_id)
            .is_some_and(|member| member.connection == connection)
    }

    /// Try-enqueues `message` to every member except `skip`, shedding any
    /// member whose queue is full. Returns the number of successful deliveries.
    fn deliver(&mut self, message: Arc<Message>, skip: Option<&str>) -> usize {
        let mut delivered = 0;
        let mut shed = Vec::new();

        for (id, member) in &self.registry {
            if skip == Some(id.as_str()) {
                continue;
            }
            match member.queue.try_enqueue(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => shed.push(id.clone()),
                // The write pump is gone; its read side will deregister.
                Err(EnqueueError::Closed) => {
                    trace!(identity = %id, "Skipping closed outbound queue");
                }
            }
        }

        for id in shed {
            if let Some(member) = self.registry.remove(&id) {
                warn!(
                    identity = %id,
                    connection = %member.connection,
                    members = self.registry.len(),
                    "Outbound queue full, dropping slow connection"
                );
            }
        }

        delivered
    }
}

/// Handle for sending requests to the hub.
///
/// Cloning is cheap. The hub stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    /// Requests admission of `connection` under `identity`.
    pub async fn register(
        &self,
        identity: Identity,
        connection: ConnectionId,
        queue: QueueSender,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Register {
            identity,
            connection,
            queue,
        })
        .await
    }

    /// Requests removal of `connection`. A no-op in the hub if it is not the
    /// registered holder of `identity_id`.
    pub async fn deregister(
        &self,
        identity_id: impl Into<String>,
        connection: ConnectionId,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Deregister {
            identity_id: identity_id.into(),
            connection,
        })
        .await
    }

    /// Builds a chat message from `author` and `text` and asks the hub to
    /// deliver it to every other member.
    pub async fn broadcast(
        &self,
        connection: ConnectionId,
        author: &Identity,
        text: impl Into<String>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast {
            connection,
            message: Message::chat(author, text),
        })
        .await
    }

    /// Identities currently registered, sorted by id.
    pub async fn members(&self) -> Result<Vec<Identity>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Count { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Returns `true` once the hub task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
