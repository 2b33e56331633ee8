//! Feed Reconciler
//!
//! Decides what each event does to the registry:
//!
//! - a focus switch to a user peer issues a history fetch and hides the feed
//!   until the fetch resolves; only the latest switch may apply its result
//! - local sends append immediately as [`Origin::Local`]
//! - inbound deliveries append to their author's feed whether focused or not
//!
//! Fetched history is merged into the feed already held for the peer, never
//! swapped in for it. Messages are matched by [`MessageId`] alone, so a
//! delivery nobody persisted, an optimistic send whose append failed and
//! anything seen while the fetch was pending all survive a refocus, and two
//! messages with the same text stay two messages.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::FetchError;
use crate::model::{Delivery, Feed, IdentityId, Message, MessageId, Origin, PeerKey, PeerRef};
use crate::registry::ConversationRegistry;
use crate::store::HistoryEntry;

/// Identifies one focus switch. A history result applies only with the
/// ticket of the most recent switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket(u64);

/// What the caller must do after a focus switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchPlan {
    /// Target is already focused.
    Unchanged,
    /// Focus cleared.
    Welcome,
    /// Feed is visible right away (broadcast room).
    Ready(PeerKey),
    /// Fetch history for `peer` and report back with `ticket`.
    Fetch { peer: IdentityId, ticket: FetchTicket },
}

/// Result of applying a history completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied(PeerKey),
    Failed(PeerKey, FetchError),
    /// Focus moved on since the fetch was issued; result discarded.
    Stale,
}

/// What the UI should currently show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedView {
    Welcome,
    Loading(PeerKey),
    Ready(PeerKey),
    Failed(PeerKey),
}

#[derive(Debug)]
struct PendingFetch {
    peer: IdentityId,
    ticket: FetchTicket,
}

#[derive(Debug)]
pub struct FeedReconciler {
    self_id: IdentityId,
    next_seq: u64,
    next_ticket: u64,
    pending: Option<PendingFetch>,
    failed: Option<IdentityId>,
}

impl FeedReconciler {
    pub fn new(self_id: IdentityId) -> Self {
        Self {
            self_id,
            next_seq: 0,
            next_ticket: 0,
            pending: None,
            failed: None,
        }
    }

    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Move focus to `target`.
    pub fn switch_focus(
        &mut self,
        registry: &mut ConversationRegistry,
        target: Option<PeerRef>,
    ) -> SwitchPlan {
        let refetch = match (&target, &self.failed) {
            (Some(PeerRef::User(identity)), Some(failed)) => &identity.id == failed,
            _ => false,
        };
        if registry.focused() == target.as_ref() && !refetch {
            return SwitchPlan::Unchanged;
        }

        self.pending = None;
        self.failed = None;
        registry.focus(target.clone());

        match target {
            None => SwitchPlan::Welcome,
            Some(PeerRef::Broadcast) => {
                registry.get_or_create(&PeerKey::Broadcast);
                SwitchPlan::Ready(PeerKey::Broadcast)
            }
            Some(PeerRef::User(identity)) => {
                let key = PeerKey::User(identity.id.clone());
                let retained = registry.get_or_create(&key).len();
                let ticket = FetchTicket(self.next_ticket);
                self.next_ticket += 1;
                self.pending = Some(PendingFetch {
                    peer: identity.id.clone(),
                    ticket,
                });
                debug!(peer = %identity.id, retained, "Focus switch issued history fetch");
                SwitchPlan::Fetch {
                    peer: identity.id,
                    ticket,
                }
            }
        }
    }

    /// Apply a history completion for `peer`/`ticket`.
    pub fn apply_history(
        &mut self,
        registry: &mut ConversationRegistry,
        peer: &IdentityId,
        ticket: FetchTicket,
        result: Result<Vec<HistoryEntry>, FetchError>,
    ) -> HistoryOutcome {
        let key = PeerKey::User(peer.clone());
        let current = matches!(
            &self.pending,
            Some(p) if &p.peer == peer && p.ticket == ticket
        ) && registry.focused().map(PeerRef::key).as_ref() == Some(&key);

        if !current {
            debug!(peer = %peer, "Discarding stale history result");
            return HistoryOutcome::Stale;
        }
        self.pending = None;

        match result {
            Ok(entries) => {
                let retained: Vec<Message> = registry
                    .get(&key)
                    .map(|f| f.messages().to_vec())
                    .unwrap_or_default();
                let kept = retained.len();
                let messages = self.merge_history(retained, entries);

                debug!(peer = %peer, count = messages.len(), kept, "History applied");
                registry.replace(&key, Feed::from_messages(messages));
                HistoryOutcome::Applied(key)
            }
            Err(err) => {
                self.failed = Some(peer.clone());
                HistoryOutcome::Failed(key, err)
            }
        }
    }

    /// Every retained message stays, in its current order. A history entry
    /// the feed lacks goes right before the next retained message that the
    /// history also lists, or at the end when there is none.
    fn merge_history(&mut self, retained: Vec<Message>, entries: Vec<HistoryEntry>) -> Vec<Message> {
        let position: HashMap<MessageId, usize> = retained
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        let mut merged = Vec::with_capacity(retained.len() + entries.len());
        let mut added = HashSet::new();
        let mut flushed = 0;

        for entry in entries {
            if let Some(&pos) = position.get(&entry.id) {
                if pos >= flushed {
                    merged.extend_from_slice(&retained[flushed..=pos]);
                    flushed = pos + 1;
                }
                continue;
            }
            if !added.insert(entry.id.clone()) {
                continue;
            }
            let origin = if entry.author == self.self_id {
                Origin::Local
            } else {
                Origin::Remote
            };
            let seq = self.next_seq();
            merged.push(Message {
                id: entry.id,
                origin,
                author: entry.author,
                body: entry.body,
                seq,
            });
        }
        merged.extend_from_slice(&retained[flushed..]);
        merged
    }

    /// Append a message this session just transmitted under `id`.
    pub fn record_local(
        &mut self,
        registry: &mut ConversationRegistry,
        peer: &PeerKey,
        id: MessageId,
        body: &str,
    ) -> Message {
        let message = Message {
            id,
            origin: Origin::Local,
            author: self.self_id.clone(),
            body: body.to_string(),
            seq: self.next_seq(),
        };
        registry.append(peer, message.clone());
        message
    }

    /// Append an inbound delivery. Returns the feed it landed in and whether
    /// that feed is currently on screen, or `None` if it was self-authored or
    /// its id is already in the feed.
    pub fn record_remote(
        &mut self,
        registry: &mut ConversationRegistry,
        delivery: Delivery,
    ) -> Option<(PeerKey, bool)> {
        if delivery.author == self.self_id {
            debug!(peer = %delivery.to, "Ignoring self-authored delivery");
            return None;
        }
        let key = delivery.peer_key();
        if registry.get(&key).is_some_and(|f| f.contains(&delivery.id)) {
            debug!(peer = %key, id = %delivery.id, "Ignoring repeated delivery");
            return None;
        }
        let message = Message {
            id: delivery.id,
            origin: Origin::Remote,
            author: delivery.author,
            body: delivery.body,
            seq: self.next_seq(),
        };
        registry.append(&key, message);
        let visible = matches!(self.view(registry), FeedView::Ready(ref k) | FeedView::Failed(ref k) if *k == key);
        Some((key, visible))
    }

    pub fn view(&self, registry: &ConversationRegistry) -> FeedView {
        let Some(focused) = registry.focused() else {
            return FeedView::Welcome;
        };
        let key = focused.key();
        let pending = matches!(
            (&self.pending, &key),
            (Some(p), PeerKey::User(id)) if &p.peer == id
        );
        let failed = matches!(
            (&self.failed, &key),
            (Some(f), PeerKey::User(id)) if f == id
        );
        if pending {
            FeedView::Loading(key)
        } else if failed {
            FeedView::Failed(key)
        } else {
            FeedView::Ready(key)
        }
    }

    /// The focused feed, if it is on screen.
    pub fn visible_feed<'r>(&self, registry: &'r ConversationRegistry) -> Option<&'r Feed> {
        match self.view(registry) {
            FeedView::Ready(key) | FeedView::Failed(key) => registry.get(&key),
            FeedView::Welcome | FeedView::Loading(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;

    fn me() -> IdentityId {
        "u-alice".into()
    }

    fn bob() -> Identity {
        Identity::new("u-bob", "bob")
    }

    fn carol() -> Identity {
        Identity::new("u-carol", "carol")
    }

    fn entry(id: &str, author: &str, body: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.into(),
            author: author.into(),
            body: body.into(),
            created_at: None,
        }
    }

    fn from(id: &str, author: &str, to: &str, body: &str) -> Delivery {
        Delivery {
            id: id.into(),
            author: author.into(),
            to: to.into(),
            body: body.into(),
        }
    }

    fn bodies(reg: &ConversationRegistry, key: &PeerKey) -> Vec<String> {
        reg.get(key)
            .map(|f| f.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn fetch_ticket(plan: SwitchPlan) -> FetchTicket {
        match plan {
            SwitchPlan::Fetch { ticket, .. } => ticket,
            other => panic!("expected Fetch, got {other:?}"),
        }
    }

    #[test]
    fn switch_to_user_hides_feed_until_history() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        assert_eq!(rec.view(&reg), FeedView::Loading(key.clone()));
        assert!(rec.visible_feed(&reg).is_none());

        let outcome = rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![
                entry("m-1", "u-bob", "old"),
                entry("m-2", "u-alice", "older reply"),
            ]),
        );
        assert_eq!(outcome, HistoryOutcome::Applied(key.clone()));
        assert_eq!(rec.view(&reg), FeedView::Ready(key.clone()));
        let feed = rec.visible_feed(&reg).unwrap();
        assert_eq!(feed.messages()[0].origin, Origin::Remote);
        assert_eq!(feed.messages()[1].origin, Origin::Local);
        assert_eq!(feed.messages()[1].id, MessageId::from("m-2"));
    }

    #[test]
    fn refocus_same_peer_is_noop() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        rec.switch_focus(&mut reg, Some(bob().into()));
        assert_eq!(
            rec.switch_focus(&mut reg, Some(bob().into())),
            SwitchPlan::Unchanged
        );
        assert_eq!(rec.switch_focus(&mut reg, None), SwitchPlan::Welcome);
        assert_eq!(rec.switch_focus(&mut reg, None), SwitchPlan::Unchanged);
    }

    #[test]
    fn broadcast_never_fetches() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        assert_eq!(
            rec.switch_focus(&mut reg, Some(PeerRef::Broadcast)),
            SwitchPlan::Ready(PeerKey::Broadcast)
        );
        assert!(rec.visible_feed(&reg).unwrap().is_empty());
    }

    #[test]
    fn last_focus_wins() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());

        let t_bob = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        let t_carol = fetch_ticket(rec.switch_focus(&mut reg, Some(carol().into())));

        // Bob's slower result resolves after the switch to carol
        let outcome = rec.apply_history(
            &mut reg,
            &bob().id,
            t_bob,
            Ok(vec![entry("m-1", "u-bob", "x")]),
        );
        assert_eq!(outcome, HistoryOutcome::Stale);
        assert!(bodies(&reg, &PeerKey::User(bob().id)).is_empty());

        rec.apply_history(
            &mut reg,
            &carol().id,
            t_carol,
            Ok(vec![entry("m-2", "u-carol", "y")]),
        );
        assert_eq!(bodies(&reg, &PeerKey::User(carol().id)), vec!["y"]);
    }

    #[test]
    fn return_to_peer_discards_first_fetch() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());

        let first = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.switch_focus(&mut reg, Some(carol().into()));
        let second = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        assert_ne!(first, second);

        let stale = rec.apply_history(
            &mut reg,
            &bob().id,
            first,
            Ok(vec![entry("m-1", "u-bob", "old")]),
        );
        assert_eq!(stale, HistoryOutcome::Stale);
        assert_eq!(rec.view(&reg), FeedView::Loading(PeerKey::User(bob().id)));

        rec.apply_history(
            &mut reg,
            &bob().id,
            second,
            Ok(vec![entry("m-1", "u-bob", "old"), entry("m-2", "u-bob", "new")]),
        );
        assert_eq!(bodies(&reg, &PeerKey::User(bob().id)), vec!["old", "new"]);
    }

    #[test]
    fn events_during_pending_fetch_follow_history() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        let (_, visible) = rec
            .record_remote(&mut reg, from("m-3", "u-bob", "u-alice", "during"))
            .unwrap();
        assert!(!visible, "nothing is visible while loading");
        rec.record_local(&mut reg, &key, "m-4".into(), "mine during");

        rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![entry("m-1", "u-bob", "h1"), entry("m-2", "u-bob", "h2")]),
        );
        assert_eq!(
            bodies(&reg, &key),
            vec!["h1", "h2", "during", "mine during"]
        );
    }

    #[test]
    fn message_already_persisted_is_not_duplicated() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.record_local(&mut reg, &key, "m-2".into(), "hi");
        rec.record_remote(&mut reg, from("m-3", "u-bob", "u-alice", "hello"));

        // The append of "hi" reached the store before the history query ran
        rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![entry("m-1", "u-bob", "earlier"), entry("m-2", "u-alice", "hi")]),
        );
        assert_eq!(bodies(&reg, &key), vec!["earlier", "hi", "hello"]);
        assert_eq!(reg.get(&key).unwrap().messages()[1].origin, Origin::Local);
    }

    #[test]
    fn repeated_text_is_a_new_message() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.record_local(&mut reg, &key, "m-new".into(), "ok");

        rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![
                entry("m-1", "u-bob", "ready?"),
                entry("m-2", "u-alice", "ok"),
            ]),
        );
        assert_eq!(bodies(&reg, &key), vec!["ready?", "ok", "ok"]);
    }

    #[test]
    fn refocus_keeps_messages_the_store_never_saw() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.apply_history(&mut reg, &bob().id, ticket, Ok(vec![]));
        rec.record_local(&mut reg, &key, "m-1".into(), "hi");
        rec.record_remote(&mut reg, from("m-2", "u-bob", "u-alice", "hello"));

        rec.switch_focus(&mut reg, Some(PeerRef::Broadcast));
        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        // Only the local send was persisted; bob's reply never was
        rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![entry("m-1", "u-alice", "hi")]),
        );
        assert_eq!(bodies(&reg, &key), vec!["hi", "hello"]);
    }

    #[test]
    fn unknown_history_lands_before_its_next_known_neighbour() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        // Retained before the first focus: "a" was never stored, "c" was
        rec.record_remote(&mut reg, from("m-a", "u-bob", "u-alice", "a"));
        rec.record_remote(&mut reg, from("m-c", "u-bob", "u-alice", "c"));

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Ok(vec![
                entry("m-old", "u-bob", "old"),
                entry("m-c", "u-bob", "c"),
                entry("m-d", "u-alice", "d"),
            ]),
        );
        assert_eq!(bodies(&reg, &key), vec!["old", "a", "c", "d"]);
    }

    #[test]
    fn fetch_failure_keeps_focus_and_allows_refetch() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        let ticket = fetch_ticket(rec.switch_focus(&mut reg, Some(bob().into())));
        rec.record_remote(&mut reg, from("m-1", "u-bob", "u-alice", "live"));
        let outcome = rec.apply_history(
            &mut reg,
            &bob().id,
            ticket,
            Err(FetchError::Status(500)),
        );
        assert_eq!(
            outcome,
            HistoryOutcome::Failed(key.clone(), FetchError::Status(500))
        );
        assert_eq!(rec.view(&reg), FeedView::Failed(key.clone()));
        assert_eq!(reg.focused().map(PeerRef::key), Some(key.clone()));
        assert_eq!(bodies(&reg, &key), vec!["live"]);

        assert!(matches!(
            rec.switch_focus(&mut reg, Some(bob().into())),
            SwitchPlan::Fetch { .. }
        ));
    }

    #[test]
    fn remote_to_unfocused_peer_is_retained_not_visible() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        rec.switch_focus(&mut reg, Some(PeerRef::Broadcast));

        let (key, visible) = rec
            .record_remote(&mut reg, from("m-1", "u-bob", "u-alice", "psst"))
            .unwrap();
        assert_eq!(key, PeerKey::User(bob().id));
        assert!(!visible);
        assert_eq!(bodies(&reg, &key), vec!["psst"]);

        let (key, visible) = rec
            .record_remote(&mut reg, from("m-2", "u-carol", "general", "hi all"))
            .unwrap();
        assert_eq!(key, PeerKey::Broadcast);
        assert!(visible);
    }

    #[test]
    fn repeated_delivery_is_recorded_once() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let key = PeerKey::User(bob().id);

        assert!(rec.record_remote(&mut reg, from("m-1", "u-bob", "u-alice", "ok")).is_some());
        assert!(rec.record_remote(&mut reg, from("m-1", "u-bob", "u-alice", "ok")).is_none());
        assert!(rec.record_remote(&mut reg, from("m-2", "u-bob", "u-alice", "ok")).is_some());
        assert_eq!(bodies(&reg, &key), vec!["ok", "ok"]);
    }

    #[test]
    fn self_authored_delivery_is_ignored() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        assert!(
            rec.record_remote(&mut reg, from("m-1", "u-alice", "general", "echo"))
                .is_none()
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn seq_is_creation_order() {
        let mut reg = ConversationRegistry::new();
        let mut rec = FeedReconciler::new(me());
        let a = rec.record_local(&mut reg, &PeerKey::Broadcast, "m-1".into(), "a");
        let b = rec.record_local(&mut reg, &PeerKey::User(bob().id), "m-2".into(), "b");
        assert!(a.seq < b.seq);
    }
}
