//! Conversation Registry
//!
//! Holds one [`Feed`] per peer for the lifetime of a session, plus the
//! currently focused peer. Nothing is evicted until [`ConversationRegistry::clear`].

use std::collections::HashMap;

use crate::model::{Feed, Message, PeerKey, PeerRef};

#[derive(Debug, Default)]
pub struct ConversationRegistry {
    feeds: HashMap<PeerKey, Feed>,
    focused: Option<PeerRef>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed for `peer`, creating an empty one on first sight.
    pub fn get_or_create(&mut self, peer: &PeerKey) -> &Feed {
        self.feeds.entry(peer.clone()).or_default()
    }

    pub fn get(&self, peer: &PeerKey) -> Option<&Feed> {
        self.feeds.get(peer)
    }

    pub fn contains(&self, peer: &PeerKey) -> bool {
        self.feeds.contains_key(peer)
    }

    /// Wholesale replacement, used once fetched history is merged in.
    pub fn replace(&mut self, peer: &PeerKey, feed: Feed) {
        self.feeds.insert(peer.clone(), feed);
    }

    /// Append to the end of `peer`'s feed, creating it if needed.
    pub fn append(&mut self, peer: &PeerKey, message: Message) -> &Feed {
        let feed = self.feeds.entry(peer.clone()).or_default();
        feed.push(message);
        feed
    }

    pub fn focus(&mut self, peer: Option<PeerRef>) {
        self.focused = peer;
    }

    pub fn focused(&self) -> Option<&PeerRef> {
        self.focused.as_ref()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Drop every feed and the focus (logout).
    pub fn clear(&mut self) {
        self.feeds.clear();
        self.focused = None;
    }
}
