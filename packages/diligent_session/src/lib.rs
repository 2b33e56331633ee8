//! Diligent Session - realtime conversation session core
//!
//! Owns the single live connection of a logged-in identity, keeps one feed
//! per peer for the whole session, and reconciles optimistic local sends,
//! inbound deliveries and history fetches so nothing is lost or duplicated
//! across focus switches. No rendering and no HTTP server code lives here.
//!
//! # Example
//!
//! ```no_run
//! use diligent_session::{
//!     ApiClient, PeerRef, SessionCommand, SessionManager, SessionUpdate, WsConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let api = ApiClient::new("http://127.0.0.1:5000");
//!     let me = api.login("alice", "correct horse").await.unwrap();
//!
//!     let (session, mut updates) =
//!         SessionManager::new(WsConnector::new(api.ws_url()), api.message_store());
//!     let (commands, rx) = tokio::sync::mpsc::unbounded_channel();
//!     tokio::spawn(session.run(rx));
//!
//!     commands.send(SessionCommand::Login(me)).unwrap();
//!     commands.send(SessionCommand::Focus(Some(PeerRef::Broadcast))).unwrap();
//!     commands.send(SessionCommand::Send("hello everyone".into())).unwrap();
//!
//!     while let Some(update) = updates.recv().await {
//!         if let SessionUpdate::FeedChanged { peer, feed } = update {
//!             println!("{}: {} messages", peer, feed.len());
//!         }
//!     }
//! }
//! ```

pub mod connection;
mod error;
pub mod model;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod store;
mod ws_connector;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use connection::{ConnectionManager, Connector, Link};
pub use error::{
    ApiError, ConnectionError, FetchError, IdentityStoreError, PersistenceError, ValidationError,
};
pub use model::{
    ConnectionState, Delivery, Feed, Identity, IdentityId, Message, MessageId, Origin, PeerKey,
    PeerRef,
};
pub use protocol::{ClientFrame, ServerFrame};
pub use reconciler::{FeedReconciler, FeedView, FetchTicket, HistoryOutcome, SwitchPlan};
pub use registry::ConversationRegistry;
pub use session::{Notice, Phase, SessionCommand, SessionManager, SessionUpdate, reconnect_delay};
pub use store::{
    ApiClient, FileIdentityStore, HistoryEntry, HttpMessageStore, IdentityStore, MessageStore,
};
pub use ws_connector::{ConnectOptions, WsConnector};
