//! Connection Lifecycle
//!
//! Owns the one persistent connection of an identity: opens it, performs the
//! registration handshake, pumps inbound frames into a single subscriber and
//! tracks `disconnected → connecting → connected` transitions.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::model::{ConnectionState, Delivery, Identity, IdentityId, MessageId, PeerKey};
use crate::protocol::{ClientFrame, ServerFrame};

/// Both halves of an established transport.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Something that can establish a [`Link`] to the router.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Link, ConnectionError>> + Send;
}

type DeliveryHandler = Box<dyn Fn(Delivery) + Send + Sync>;

/// Single-slot subscription: installing a handler drops the previous one.
#[derive(Clone, Default)]
struct Subscriber {
    slot: Arc<Mutex<Option<DeliveryHandler>>>,
}

impl Subscriber {
    fn replace(&self, handler: DeliveryHandler) {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    fn clear(&self) {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take();
    }

    fn dispatch(&self, delivery: Delivery) {
        let slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(handler) => handler(delivery),
            None => debug!(author = %delivery.author, "Delivery with no subscriber - dropped"),
        }
    }
}

/// Lifecycle manager for the single live connection.
pub struct ConnectionManager<C> {
    connector: C,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped on every open/close so a stale reader cannot flip the state of a newer link.
    epoch: Arc<AtomicU64>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    reader: Option<JoinHandle<()>>,
    subscriber: Subscriber,
    identity: Option<IdentityId>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
            outbound: None,
            reader: None,
            subscriber: Subscriber::default(),
            identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions, including drops detected by the reader.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Identity registered on the current (or last) connection.
    pub fn identity(&self) -> Option<&IdentityId> {
        self.identity.as_ref()
    }

    /// Install the inbound handler, replacing any previous one.
    pub fn on_receive(&self, handler: impl Fn(Delivery) + Send + Sync + 'static) {
        self.subscriber.replace(Box::new(handler));
    }

    /// Open the connection and register `identity` with the router.
    ///
    /// An already-open connection is closed first, so switching identity is
    /// close-then-reopen.
    pub async fn open(&mut self, identity: &Identity) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Disconnected || self.outbound.is_some() {
            self.close();
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connecting);
        debug!(user = %identity.id, "Opening connection");

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                warn!(user = %identity.id, "Failed to open connection: {}", e);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        // A close() issued while we were connecting wins.
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(ConnectionError::Closed);
        }

        let Link {
            outbound,
            mut inbound,
        } = link;

        if outbound
            .send(ClientFrame::Register {
                user_id: identity.id.clone(),
            })
            .is_err()
        {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(ConnectionError::Handshake(
                "link closed before registration".to_string(),
            ));
        }

        self.outbound = Some(outbound);
        self.identity = Some(identity.id.clone());
        self.state.send_replace(ConnectionState::Connected);
        info!(user = %identity.id, "Connected and registered");

        let subscriber = self.subscriber.clone();
        let state = self.state.clone();
        let current_epoch = self.epoch.clone();
        let user = identity.id.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    ServerFrame::Deliver { from, to, id, body } => {
                        subscriber.dispatch(Delivery {
                            id,
                            author: from,
                            to,
                            body,
                        });
                    }
                    ServerFrame::Registered { user_id } => {
                        debug!(user = %user_id, "Registration acknowledged");
                    }
                    ServerFrame::Error { message } => {
                        warn!(user = %user, "Router error: {}", message);
                    }
                }
            }
            if current_epoch.load(Ordering::SeqCst) == epoch {
                warn!(user = %user, "Connection dropped");
                state.send_replace(ConnectionState::Disconnected);
            }
        }));

        Ok(())
    }

    /// Enqueue an outbound delivery under a fresh [`MessageId`], returned so
    /// the caller can record and persist the same event. Fire-and-forget:
    /// nothing is awaited.
    pub fn send(&self, to: &PeerKey, body: &str) -> Result<MessageId, ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let (Some(outbound), Some(from)) = (&self.outbound, &self.identity) else {
            return Err(ConnectionError::NotConnected);
        };
        let id = MessageId::generate();
        outbound
            .send(ClientFrame::Send {
                to: to.wire_id().to_string(),
                from: from.clone(),
                id: id.clone(),
                body: body.to_string(),
            })
            .map_err(|_| {
                self.state.send_replace(ConnectionState::Disconnected);
                ConnectionError::Closed
            })?;
        Ok(id)
    }

    /// Release the connection. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.outbound.take().is_some() {
            debug!("Connection closed");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Close and also drop the inbound handler (logout).
    pub fn reset(&mut self) {
        self.close();
        self.subscriber.clear();
        self.identity = None;
    }
}

impl<C> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
