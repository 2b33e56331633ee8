//! Core data model: identities, peer references, messages and feeds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque identifier assigned to an identity by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one message event. Assigned by the sending session and carried
/// unchanged through the router and the store, so every copy of a message
/// (optimistic, delivered, fetched) shares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id for an outbound message.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A logged-in user (or a contact). Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub avatar_set: bool,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            avatar: None,
            avatar_set: false,
        }
    }
}

/// Registry key for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    /// The shared "General" room.
    Broadcast,
    User(IdentityId),
}

impl PeerKey {
    /// Address used on the wire for the broadcast room.
    pub const BROADCAST_WIRE_ID: &'static str = "general";

    pub fn wire_id(&self) -> &str {
        match self {
            PeerKey::Broadcast => Self::BROADCAST_WIRE_ID,
            PeerKey::User(id) => id.as_str(),
        }
    }

    pub fn from_wire(id: &str) -> Self {
        if id == Self::BROADCAST_WIRE_ID {
            PeerKey::Broadcast
        } else {
            PeerKey::User(IdentityId::from(id))
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_id())
    }
}

/// Who a conversation is with: a concrete identity or the broadcast room.
///
/// Equality and hashing go through [`PeerRef::key`], so two references to the
/// same identifier compare equal even if the rest of the identity differs.
#[derive(Debug, Clone)]
pub enum PeerRef {
    Broadcast,
    User(Identity),
}

impl PeerRef {
    pub fn key(&self) -> PeerKey {
        match self {
            PeerRef::Broadcast => PeerKey::Broadcast,
            PeerRef::User(identity) => PeerKey::User(identity.id.clone()),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            PeerRef::Broadcast => "General",
            PeerRef::User(identity) => &identity.username,
        }
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PeerRef {}

impl Hash for PeerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl From<Identity> for PeerRef {
    fn from(identity: Identity) -> Self {
        PeerRef::User(identity)
    }
}

/// Whether a message was produced by this session or arrived from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// One entry of a feed. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub origin: Origin,
    pub author: IdentityId,
    pub body: String,
    /// Session-local creation counter. Reflects creation order, not feed position.
    pub seq: u64,
}

/// Append-only, ordered sequence of messages for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feed {
    messages: Vec<Message>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Messages at or after position `mark`.
    pub fn tail_from(&self, mark: usize) -> &[Message] {
        &self.messages[mark.min(self.messages.len())..]
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Lifecycle of the single live connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// An inbound delivery event as surfaced by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub author: IdentityId,
    /// Wire address the sender used: our own id, or the broadcast room.
    pub to: String,
    pub body: String,
}

impl Delivery {
    /// The conversation this delivery belongs to.
    pub fn peer_key(&self) -> PeerKey {
        if self.to == PeerKey::BROADCAST_WIRE_ID {
            PeerKey::Broadcast
        } else {
            PeerKey::User(self.author.clone())
        }
    }
}
