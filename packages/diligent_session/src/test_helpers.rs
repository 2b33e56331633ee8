//! In-process router, connector and store for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

use crate::connection::{Connector, Link};
use crate::error::{ConnectionError, FetchError, PersistenceError};
use crate::model::{IdentityId, MessageId, PeerKey};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::store::{HistoryEntry, MessageStore};

/// Poll `cond` until it holds, panicking after 2s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

#[derive(Default)]
struct RouterState {
    unreachable: bool,
    next_conn: u64,
    connections: HashMap<IdentityId, (u64, mpsc::UnboundedSender<ServerFrame>)>,
    registrations: Vec<IdentityId>,
    sent: Vec<ClientFrame>,
}

/// Router with the same contract as the server switchboard: addressed
/// delivery, broadcast fan-out to everyone but the sender, no echo, last
/// registration wins.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    inner: Arc<Mutex<RouterState>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.inner.lock().unwrap()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            router: self.clone(),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn is_registered(&self, id: &IdentityId) -> bool {
        self.lock().connections.contains_key(id)
    }

    pub fn registrations(&self) -> Vec<IdentityId> {
        self.lock().registrations.clone()
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Push a delivery straight to `recipient`'s connection under a fresh id.
    pub fn inject(&self, recipient: &IdentityId, from: &str, to: &str, body: &str) -> MessageId {
        let id = MessageId::generate();
        self.inject_with_id(recipient, from, to, &id, body);
        id
    }

    pub fn inject_with_id(
        &self,
        recipient: &IdentityId,
        from: &str,
        to: &str,
        id: &MessageId,
        body: &str,
    ) {
        if let Some((_, tx)) = self.lock().connections.get(recipient) {
            let _ = tx.send(ServerFrame::Deliver {
                from: from.into(),
                to: to.into(),
                id: id.clone(),
                body: body.into(),
            });
        }
    }

    /// Sever `id`'s connection as if the transport died.
    pub fn drop_connection(&self, id: &IdentityId) {
        self.lock().connections.remove(id);
    }

    fn handle(
        &self,
        conn_id: u64,
        pending: &mut Option<mpsc::UnboundedSender<ServerFrame>>,
        registered: &mut Option<IdentityId>,
        frame: ClientFrame,
    ) {
        let mut state = self.lock();
        match frame {
            ClientFrame::Register { user_id } => {
                if let Some(tx) = pending.take() {
                    let _ = tx.send(ServerFrame::Registered {
                        user_id: user_id.clone(),
                    });
                    state.connections.insert(user_id.clone(), (conn_id, tx));
                    state.registrations.push(user_id.clone());
                    *registered = Some(user_id);
                }
            }
            ClientFrame::Send { to, from, id, body } => {
                state.sent.push(ClientFrame::Send {
                    to: to.clone(),
                    from: from.clone(),
                    id: id.clone(),
                    body: body.clone(),
                });
                match PeerKey::from_wire(&to) {
                    PeerKey::Broadcast => {
                        for (peer_id, (_, tx)) in state.connections.iter() {
                            if *peer_id != from {
                                let _ = tx.send(ServerFrame::Deliver {
                                    from: from.clone(),
                                    to: to.clone(),
                                    id: id.clone(),
                                    body: body.clone(),
                                });
                            }
                        }
                    }
                    PeerKey::User(recipient) => {
                        if recipient == from {
                            return;
                        }
                        if let Some((_, tx)) = state.connections.get(&recipient) {
                            let _ = tx.send(ServerFrame::Deliver { from, to, id, body });
                        }
                    }
                }
            }
        }
    }

    fn disconnect(&self, conn_id: u64, registered: Option<IdentityId>) {
        let mut state = self.lock();
        if let Some(id) = registered {
            if state.connections.get(&id).map(|(c, _)| *c) == Some(conn_id) {
                state.connections.remove(&id);
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    router: MemoryRouter,
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, ConnectionError> {
        let conn_id = {
            let mut state = self.router.lock();
            if state.unreachable {
                return Err(ConnectionError::Unreachable(
                    "memory router offline".to_string(),
                ));
            }
            state.next_conn += 1;
            state.next_conn
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let router = self.router.clone();
        tokio::spawn(async move {
            let mut pending = Some(in_tx);
            let mut registered = None;
            while let Some(frame) = out_rx.recv().await {
                router.handle(conn_id, &mut pending, &mut registered, frame);
            }
            router.disconnect(conn_id, registered);
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct StoredMessage {
    id: MessageId,
    from: IdentityId,
    to: IdentityId,
    body: String,
}

#[derive(Default)]
struct StoreState {
    messages: Vec<StoredMessage>,
    gates: HashMap<IdentityId, Arc<Semaphore>>,
    fetches: Vec<IdentityId>,
    fail_fetch: bool,
    fail_append: bool,
}

/// Message store with gates to hold fetches in flight and failure toggles.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap()
    }

    /// Store a message that predates the session. Returns its id.
    pub fn seed(&self, from: &str, to: &str, body: &str) -> MessageId {
        let id = MessageId::generate();
        self.lock().messages.push(StoredMessage {
            id: id.clone(),
            from: from.into(),
            to: to.into(),
            body: body.to_string(),
        });
        id
    }

    pub fn appended(&self) -> Vec<(IdentityId, IdentityId, String)> {
        self.lock()
            .messages
            .iter()
            .map(|m| (m.from.clone(), m.to.clone(), m.body.clone()))
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches.len()
    }

    /// Make fetches for `peer` wait until [`MemoryStore::release`].
    pub fn hold(&self, peer: &IdentityId) {
        self.lock()
            .gates
            .insert(peer.clone(), Arc::new(Semaphore::new(0)));
    }

    /// Let one held fetch for `peer` through.
    pub fn release(&self, peer: &IdentityId) {
        if let Some(gate) = self.lock().gates.get(peer) {
            gate.add_permits(1);
        }
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.lock().fail_fetch = fail;
    }

    pub fn fail_append(&self, fail: bool) {
        self.lock().fail_append = fail;
    }
}

impl MessageStore for MemoryStore {
    async fn fetch_history(
        &self,
        self_id: &IdentityId,
        peer: &IdentityId,
    ) -> Result<Vec<HistoryEntry>, FetchError> {
        let gate = {
            let mut state = self.lock();
            state.fetches.push(peer.clone());
            state.gates.get(peer).cloned()
        };
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?
                .forget();
        }

        let state = self.lock();
        if state.fail_fetch {
            return Err(FetchError::Status(500));
        }
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                (&m.from == self_id && &m.to == peer) || (&m.from == peer && &m.to == self_id)
            })
            .map(|m| HistoryEntry {
                id: m.id.clone(),
                author: m.from.clone(),
                body: m.body.clone(),
                created_at: None,
            })
            .collect())
    }

    async fn append(
        &self,
        from: &IdentityId,
        to: &IdentityId,
        id: &MessageId,
        body: &str,
    ) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        if state.fail_append {
            return Err(PersistenceError::Status(500));
        }
        if !state.messages.iter().any(|m| &m.id == id) {
            state.messages.push(StoredMessage {
                id: id.clone(),
                from: from.clone(),
                to: to.clone(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}
