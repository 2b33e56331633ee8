//! Session Manager
//!
//! Top-level orchestrator. Owns the connection and the conversation registry
//! for the logged-in identity and runs every event to completion on a single
//! loop:
//!
//! ```text
//! Anonymous ──login──▶ Connecting ──▶ Active { focus: None }
//!     ▲                                   │ focus(P)
//!     │                                   ▼
//!     └──────────logout────────── Active { focus: Some(P) }
//! ```
//!
//! Background work (socket reader, history fetches, durable appends) never
//! touches session state; it posts events that the loop applies.
//! Every event carries the epoch of the login that spawned it, so work left
//! over from a previous identity is dropped on arrival.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, Connector};
use crate::error::{ConnectionError, FetchError, PersistenceError, ValidationError};
use crate::model::{ConnectionState, Delivery, Feed, Identity, IdentityId, PeerKey, PeerRef};
use crate::reconciler::{FeedReconciler, FeedView, FetchTicket, HistoryOutcome, SwitchPlan};
use crate::registry::ConversationRegistry;
use crate::store::{HistoryEntry, IdentityStore, MessageStore};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt number `attempt` (0-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(6)).min(MAX_RECONNECT_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Anonymous,
    Connecting,
    Active,
}

/// Requests from the UI collaborator.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Login(Identity),
    Focus(Option<PeerRef>),
    Send(String),
    Reconnect,
    Logout,
    Shutdown,
}

/// Non-fatal conditions surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The message was not transmitted and was not appended.
    NotSent {
        peer: PeerKey,
        body: String,
        reason: ConnectionError,
    },
    /// Focus stays on `peer`; only events seen since the switch are shown.
    HistoryFailed { peer: PeerKey, error: FetchError },
    /// The message was delivered live but could not be stored. Not rolled back.
    PersistFailed {
        peer: PeerKey,
        body: String,
        error: PersistenceError,
    },
    ConnectFailed(ConnectionError),
}

/// What the UI should re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The visible feed for `peer` changed.
    FeedChanged { peer: PeerKey, feed: Feed },
    /// Focus moved to `peer`; its history is loading.
    FeedLoading { peer: PeerKey },
    /// Focus cleared, show the welcome view.
    FocusCleared,
    ConnectionChanged(ConnectionState),
    Notice(Notice),
}

#[derive(Debug)]
enum SessionEvent {
    Delivered {
        epoch: u64,
        delivery: Delivery,
    },
    HistoryLoaded {
        epoch: u64,
        peer: IdentityId,
        ticket: FetchTicket,
        result: Result<Vec<HistoryEntry>, FetchError>,
    },
    PersistFailed {
        epoch: u64,
        peer: PeerKey,
        body: String,
        error: PersistenceError,
    },
}

impl SessionEvent {
    fn epoch(&self) -> u64 {
        match self {
            SessionEvent::Delivered { epoch, .. }
            | SessionEvent::HistoryLoaded { epoch, .. }
            | SessionEvent::PersistFailed { epoch, .. } => *epoch,
        }
    }
}

struct ActiveSession {
    identity: Identity,
    registry: ConversationRegistry,
    reconciler: FeedReconciler,
}

pub struct SessionManager<C, S> {
    connection: ConnectionManager<C>,
    store: S,
    identity_store: Option<Box<dyn IdentityStore>>,
    phase: Phase,
    active: Option<ActiveSession>,
    epoch: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    state_rx: watch::Receiver<ConnectionState>,
    last_state: ConnectionState,
    auto_reconnect: bool,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

impl<C: Connector, S: MessageStore> SessionManager<C, S> {
    /// Create an anonymous session and the stream of updates it publishes.
    pub fn new(connector: C, store: S) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let connection = ConnectionManager::new(connector);
        let state_rx = connection.subscribe_state();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let session = Self {
            connection,
            store,
            identity_store: None,
            phase: Phase::Anonymous,
            active: None,
            epoch: 0,
            events_tx,
            events_rx,
            updates,
            state_rx,
            last_state: ConnectionState::Disconnected,
            auto_reconnect: false,
            reconnect_attempt: 0,
            reconnect_at: None,
        };
        (session, updates_rx)
    }

    /// Persist the identity on login and forget it on logout.
    pub fn with_identity_store(mut self, store: impl IdentityStore + 'static) -> Self {
        self.identity_store = Some(Box::new(store));
        self
    }

    /// Retry the connection with exponential backoff when it drops.
    /// Only takes effect inside [`SessionManager::run`].
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.active.as_ref().map(|a| &a.identity)
    }

    pub fn focused(&self) -> Option<&PeerRef> {
        self.active.as_ref().and_then(|a| a.registry.focused())
    }

    pub fn view(&self) -> FeedView {
        match &self.active {
            Some(a) => a.reconciler.view(&a.registry),
            None => FeedView::Welcome,
        }
    }

    /// The focused feed, if it is on screen.
    pub fn visible_feed(&self) -> Option<&Feed> {
        self.active
            .as_ref()
            .and_then(|a| a.reconciler.visible_feed(&a.registry))
    }

    /// Any retained feed, focused or not.
    pub fn feed(&self, peer: &PeerKey) -> Option<&Feed> {
        self.active.as_ref().and_then(|a| a.registry.get(peer))
    }

    fn emit(&self, update: SessionUpdate) {
        if self.updates.send(update).is_err() {
            debug!("Update receiver dropped");
        }
    }

    fn note_state(&mut self, state: ConnectionState) {
        if state != self.last_state {
            self.last_state = state;
            self.emit(SessionUpdate::ConnectionChanged(state));
        }
    }

    /// Mark every transition so far as seen and publish the current state.
    fn sync_connection_state(&mut self) {
        let state = *self.state_rx.borrow_and_update();
        self.note_state(state);
    }

    /// Start a session for `identity`. A session that is already active is
    /// torn down first.
    ///
    /// A connection failure still leaves the session active (disconnected) and
    /// is also reported as [`Notice::ConnectFailed`].
    pub async fn login(&mut self, identity: Identity) -> Result<(), ConnectionError> {
        if self.active.is_some() {
            self.teardown();
        }

        self.epoch += 1;
        self.phase = Phase::Connecting;
        self.active = Some(ActiveSession {
            reconciler: FeedReconciler::new(identity.id.clone()),
            registry: ConversationRegistry::new(),
            identity: identity.clone(),
        });

        if let Some(store) = &self.identity_store {
            if let Err(e) = store.save(&identity) {
                warn!(user = %identity.id, "Failed to persist identity: {}", e);
            }
        }

        info!(user = %identity.id, "Logging in");
        let result = self.open_connection(&identity).await;
        self.phase = Phase::Active;
        result
    }

    async fn open_connection(&mut self, identity: &Identity) -> Result<(), ConnectionError> {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        self.connection.on_receive(move |delivery| {
            let _ = tx.send(SessionEvent::Delivered { epoch, delivery });
        });

        self.note_state(ConnectionState::Connecting);
        let result = self.connection.open(identity).await;
        self.sync_connection_state();

        match &result {
            Ok(()) => self.reconnect_attempt = 0,
            Err(e) => self.emit(SessionUpdate::Notice(Notice::ConnectFailed(e.clone()))),
        }
        result
    }

    /// Re-open the connection of the current identity.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        let Some(identity) = self.identity().cloned() else {
            return Err(ConnectionError::NotConnected);
        };
        if self.connection.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.open_connection(&identity).await
    }

    /// Move focus to `peer` (or back to the welcome view with `None`).
    pub fn focus(&mut self, peer: Option<PeerRef>) {
        let Some(active) = self.active.as_mut() else {
            debug!("Focus ignored: no active session");
            return;
        };

        match active.reconciler.switch_focus(&mut active.registry, peer) {
            SwitchPlan::Unchanged => {}
            SwitchPlan::Welcome => self.emit(SessionUpdate::FocusCleared),
            SwitchPlan::Ready(key) => {
                let feed = active.registry.get_or_create(&key).clone();
                self.emit(SessionUpdate::FeedChanged { peer: key, feed });
            }
            SwitchPlan::Fetch { peer, ticket } => {
                let me = active.identity.id.clone();
                self.emit(SessionUpdate::FeedLoading {
                    peer: PeerKey::User(peer.clone()),
                });

                let store = self.store.clone();
                let tx = self.events_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = store.fetch_history(&me, &peer).await;
                    let _ = tx.send(SessionEvent::HistoryLoaded {
                        epoch,
                        peer,
                        ticket,
                        result,
                    });
                });
            }
        }
    }

    /// Send `body` to the focused peer.
    ///
    /// Whitespace-only bodies are rejected without touching the network. A
    /// send while disconnected surfaces [`Notice::NotSent`] and appends nothing.
    pub fn send(&mut self, body: &str) -> Result<(), ValidationError> {
        if body.trim().is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        let Some(active) = self.active.as_mut() else {
            debug!("Send ignored: no active session");
            return Ok(());
        };
        let Some(peer) = active.registry.focused().map(PeerRef::key) else {
            debug!("Send ignored: nothing focused");
            return Ok(());
        };

        let id = match self.connection.send(&peer, body) {
            Ok(id) => id,
            Err(reason) => {
                warn!(peer = %peer, "Message not sent: {}", reason);
                self.emit(SessionUpdate::Notice(Notice::NotSent {
                    peer,
                    body: body.to_string(),
                    reason,
                }));
                return Ok(());
            }
        };

        active
            .reconciler
            .record_local(&mut active.registry, &peer, id.clone(), body);
        let visible = active.reconciler.visible_feed(&active.registry).cloned();
        let from = active.identity.id.clone();
        if let Some(feed) = visible {
            self.emit(SessionUpdate::FeedChanged {
                peer: peer.clone(),
                feed,
            });
        }

        if let PeerKey::User(to) = &peer {
            let store = self.store.clone();
            let tx = self.events_tx.clone();
            let epoch = self.epoch;
            let to = to.clone();
            let body = body.to_string();
            tokio::spawn(async move {
                if let Err(error) = store.append(&from, &to, &id, &body).await {
                    let _ = tx.send(SessionEvent::PersistFailed {
                        epoch,
                        peer: PeerKey::User(to),
                        body,
                        error,
                    });
                }
            });
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        self.connection.reset();
        if let Some(mut active) = self.active.take() {
            active.registry.clear();
            info!(user = %active.identity.id, "Session closed");
        }
        self.phase = Phase::Anonymous;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.sync_connection_state();
    }

    /// Close the connection, drop every feed and forget the persisted identity.
    pub fn logout(&mut self) {
        self.teardown();
        if let Some(store) = &self.identity_store {
            if let Err(e) = store.clear() {
                warn!("Failed to clear persisted identity: {}", e);
            }
        }
        self.emit(SessionUpdate::FocusCleared);
    }

    fn handle_event(&mut self, event: SessionEvent) {
        if event.epoch() != self.epoch {
            debug!("Dropping event from a previous session");
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match event {
            SessionEvent::Delivered { delivery, .. } => {
                let Some((peer, visible)) = active
                    .reconciler
                    .record_remote(&mut active.registry, delivery)
                else {
                    return;
                };
                if visible {
                    let feed = active.registry.get_or_create(&peer).clone();
                    self.emit(SessionUpdate::FeedChanged { peer, feed });
                } else {
                    debug!(peer = %peer, "Message retained for unfocused conversation");
                }
            }
            SessionEvent::HistoryLoaded {
                peer,
                ticket,
                result,
                ..
            } => match active
                .reconciler
                .apply_history(&mut active.registry, &peer, ticket, result)
            {
                HistoryOutcome::Applied(key) => {
                    let feed = active.registry.get_or_create(&key).clone();
                    self.emit(SessionUpdate::FeedChanged { peer: key, feed });
                }
                HistoryOutcome::Failed(key, error) => {
                    warn!(peer = %key, "History fetch failed: {}", error);
                    let feed = active.registry.get_or_create(&key).clone();
                    self.emit(SessionUpdate::Notice(Notice::HistoryFailed {
                        peer: key.clone(),
                        error,
                    }));
                    self.emit(SessionUpdate::FeedChanged { peer: key, feed });
                }
                HistoryOutcome::Stale => {}
            },
            SessionEvent::PersistFailed {
                peer, body, error, ..
            } => {
                warn!(peer = %peer, "Durable append failed: {}", error);
                self.emit(SessionUpdate::Notice(Notice::PersistFailed {
                    peer,
                    body,
                    error,
                }));
            }
        }
    }

    fn on_state_change(&mut self) {
        self.sync_connection_state();
        if self.auto_reconnect
            && self.phase == Phase::Active
            && self.last_state == ConnectionState::Disconnected
        {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let delay = reconnect_delay(self.reconnect_attempt);
        info!(attempt = self.reconnect_attempt, ?delay, "Scheduling reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Login(identity) => {
                let _ = self.login(identity).await;
                if self.auto_reconnect && self.connection_state() == ConnectionState::Disconnected
                {
                    self.schedule_reconnect();
                }
            }
            SessionCommand::Focus(peer) => self.focus(peer),
            SessionCommand::Send(body) => {
                if self.send(&body).is_err() {
                    debug!("Empty message ignored");
                }
            }
            SessionCommand::Reconnect => {
                self.reconnect_at = None;
                let _ = self.reconnect().await;
            }
            SessionCommand::Logout => self.logout(),
            SessionCommand::Shutdown => {}
        }
    }

    /// Apply the next internal event or connection-state change.
    pub async fn pump(&mut self) {
        tokio::select! {
            Some(event) = self.events_rx.recv() => self.handle_event(event),
            Ok(()) = self.state_rx.changed() => self.on_state_change(),
            else => {}
        }
    }

    /// Run the event loop until `commands` closes or yields `Shutdown`.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Ok(()) = self.state_rx.changed() => self.on_state_change(),
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.reconnect_attempt += 1;
                    if self.reconnect().await.is_err() && self.phase == Phase::Active {
                        self.schedule_reconnect();
                    }
                }
            }
        }
        self.connection.close();
        debug!("Session loop stopped");
    }
}
