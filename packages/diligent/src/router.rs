//! Switchboard: maps registered identities to live websocket connections and
//! forwards `Send` frames as `Deliver` frames.
//!
//! Routing rules:
//! - an addressed send reaches only the connection registered for `to`
//! - a send to the broadcast room reaches every registered connection except the sender's
//! - nothing is ever echoed back to `from`
//! - a later registration for the same identity replaces the earlier one
//! - an unknown recipient is dropped silently (no offline queue)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use diligent_session::{IdentityId, MessageId, PeerKey, ServerFrame};

use crate::metrics::ServerMetrics;

/// Per-socket identifier, distinct for every accepted websocket.
pub type ConnId = u64;

struct Registration {
    conn_id: ConnId,
    tx: mpsc::Sender<ServerFrame>,
}

/// How many connections a routed frame was queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(usize),
    /// No live recipient (unknown, offline, or the sender itself)
    NoRecipient,
}

pub struct Switchboard {
    connections: RwLock<HashMap<IdentityId, Registration>>,
    next_conn: AtomicU64,
    metrics: Arc<ServerMetrics>,
}

impl Switchboard {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn next_connection_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Associate `user_id` with a connection. Returns the connection id that
    /// was displaced, if another socket held the registration.
    pub async fn register(
        &self,
        conn_id: ConnId,
        user_id: IdentityId,
        tx: mpsc::Sender<ServerFrame>,
    ) -> Option<ConnId> {
        self.metrics.registered();
        let previous = self
            .connections
            .write()
            .await
            .insert(user_id.clone(), Registration { conn_id, tx })
            .map(|r| r.conn_id)
            .filter(|prev| *prev != conn_id);
        match previous {
            Some(prev) => info!(user = %user_id, conn_id, replaced = prev, "Registration replaced"),
            None => info!(user = %user_id, conn_id, "Registered"),
        }
        previous
    }

    /// Drop `user_id`'s registration if `conn_id` still holds it. A socket
    /// that was displaced by a newer registration must not unregister the
    /// newer one when it closes.
    pub async fn unregister(&self, user_id: &IdentityId, conn_id: ConnId) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(user_id).map(|r| r.conn_id) == Some(conn_id) {
            connections.remove(user_id);
            debug!(user = %user_id, conn_id, "Unregistered");
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, user_id: &IdentityId) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Forward message `id` from `from` to `to` (an identity id or the
    /// broadcast room). The id is passed through untouched.
    pub async fn route(
        &self,
        from: &IdentityId,
        to: &str,
        id: &MessageId,
        body: &str,
    ) -> RouteOutcome {
        let frame = ServerFrame::Deliver {
            from: from.clone(),
            to: to.to_string(),
            id: id.clone(),
            body: body.to_string(),
        };
        let connections = self.connections.read().await;

        let targets: Vec<(&IdentityId, &Registration)> = match PeerKey::from_wire(to) {
            PeerKey::Broadcast => connections.iter().filter(|(id, _)| *id != from).collect(),
            PeerKey::User(recipient) => {
                if recipient == *from {
                    return RouteOutcome::NoRecipient;
                }
                connections.get_key_value(&recipient).into_iter().collect()
            }
        };

        let mut delivered = 0;
        for (id, registration) in targets {
            match registration.tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.frame_routed();
                }
                Err(e) => {
                    self.metrics.frame_dropped();
                    warn!(recipient = %id, error = %e, "Dropping frame for slow or closed connection");
                }
            }
        }

        if delivered == 0 {
            debug!(from = %from, to, "No live recipient");
            RouteOutcome::NoRecipient
        } else {
            RouteOutcome::Delivered(delivered)
        }
    }
}
