//! Shared message types for the Chatter server.
//!
//! This module defines the values that flow between connections. A [`Message`]
//! is immutable once created: the hub distributes it to every recipient behind
//! an `Arc`, and the author is a snapshot of the sender's [`Identity`], so a
//! message stays valid after its sender disconnects.
//!
//! # Wire Format
//!
//! Every message is written to a WebSocket as a JSON text frame:
//!
//! ```json
//! {
//!   "author": { "id": "…", "name": "Ada", "avatar": "/images/ada.png" },
//!   "text": ["hello"],
//!   "time": "2026-02-02T14:30:00Z",
//!   "type": "message"
//! }
//! ```
//!
//! `type` is `message` for chat, `system` for join/leave notices and
//! `initialize` for the welcome message sent to a newly accepted connection.
//! Join and leave notices are authored by `system` and carry no `id`.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Display name used as the author of hub-generated notices.
pub const SYSTEM_NAME: &str = "system";

/// Avatar shown next to hub-generated notices.
pub const SYSTEM_AVATAR: &str = "/images/system.png";

/// The resolved identity of a connected user.
///
/// Supplied once by an [`Authenticator`](crate::auth::Authenticator) when a
/// stream is accepted and never changed afterwards. Serialized as the
/// `author` object of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque, stable identifier. Registry key in the hub.
    ///
    /// Empty only for the hub's own notices, where it is left off the wire.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Display name.
    pub name: String,

    /// Avatar URL or path.
    #[serde(default)]
    pub avatar: String,
}

impl Identity {
    /// Creates a new identity.
    ///
    /// # Example
    ///
    /// ```
    /// use chatter_server::types::Identity;
    ///
    /// let ada = Identity::new("u-1", "Ada", "/images/ada.png");
    /// assert_eq!(ada.name, "Ada");
    /// ```
    pub fn new(id: impl Into<String>, name: impl Into<String>, avatar: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: avatar.into(),
        }
    }

    /// The author attached to join and leave notices.
    fn system() -> Self {
        Self::new("", SYSTEM_NAME, SYSTEM_AVATAR)
    }
}

/// What a message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A chat message from a connected client.
    Chat,
    /// "<name> has joined the conversation".
    Join,
    /// "<name> has left the conversation".
    Leave,
    /// Greeting sent only to the connection it names.
    Welcome,
}

/// The `type` field of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    Message,
    System,
    Initialize,
}

impl MessageKind {
    /// Maps the kind onto the `type` value clients see.
    ///
    /// Join and leave notices share the `system` wire type.
    pub fn wire_type(self) -> WireType {
        match self {
            Self::Chat => WireType::Message,
            Self::Join | Self::Leave => WireType::System,
            Self::Welcome => WireType::Initialize,
        }
    }

    /// Returns `true` for messages authored by the hub itself.
    pub fn is_system(self) -> bool {
        !matches!(self, Self::Chat)
    }
}

/// An immutable message broadcast between connections.
///
/// Created by a connection's read pump (chat) or by the hub (notices), then
/// never mutated. Use the constructors rather than building one by hand.
///
/// # Example
///
/// ```
/// use chatter_server::types::{Identity, Message, MessageKind};
///
/// let ada = Identity::new("u-1", "Ada", "/images/ada.png");
/// let msg = Message::chat(&ada, "hi");
///
/// assert_eq!(msg.kind(), MessageKind::Chat);
/// assert_eq!(msg.author().id, "u-1");
/// assert_eq!(msg.text(), "hi");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    author: Identity,
    text: String,
    time: DateTime<Utc>,
}

impl Message {
    fn new(kind: MessageKind, author: Identity, text: String) -> Self {
        Self {
            kind,
            author,
            text,
            time: Utc::now(),
        }
    }

    /// Creates a chat message authored by a snapshot of `author`.
    ///
    /// Empty text is accepted.
    pub fn chat(author: &Identity, text: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, author.clone(), text.into())
    }

    /// Hub-authored notice. Only [`Message::joined`] and [`Message::left`]
    /// build one.
    fn system(kind: MessageKind, text: String) -> Self {
        Self::new(kind, Identity::system(), text)
    }

    /// Join notice for `member`.
    pub fn joined(member: &Identity) -> Self {
        Self::system(
            MessageKind::Join,
            format!("{} has joined the conversation", member.name),
        )
    }

    /// Leave notice for `member`.
    pub fn left(member: &Identity) -> Self {
        Self::system(
            MessageKind::Leave,
            format!("{} has left the conversation", member.name),
        )
    }

    /// Greeting addressed to a newly accepted connection.
    ///
    /// Carries the recipient's own id and name so the client learns who it
    /// is, with the system avatar.
    pub fn welcome(recipient: &Identity) -> Self {
        let author = Identity::new(recipient.id.clone(), recipient.name.clone(), SYSTEM_AVATAR);
        Self::new(
            MessageKind::Welcome,
            author,
            format!("Welcome {}!", recipient.name),
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn author(&self) -> &Identity {
        &self.author
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Message", 4)?;
        state.serialize_field("author", &self.author)?;
        state.serialize_field("text", &[&self.text])?;
        state.serialize_field("time", &self.time)?;
        state.serialize_field("type", &self.kind.wire_type())?;
        state.end()
    }
}
