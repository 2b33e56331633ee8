//! Remote store seams and their HTTP implementations.
//!
//! [`MessageStore`] backs history fetches and durable appends, [`IdentityStore`]
//! persists the logged-in identity across restarts. [`ApiClient`] covers the
//! identity endpoints (login, register, avatar, contacts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ApiError, FetchError, IdentityStoreError, PersistenceError};
use crate::model::{Identity, IdentityId, MessageId};

/// One persisted message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub author: IdentityId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// The authoritative message store.
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Ordered history between `self_id` and `peer`, in either direction.
    fn fetch_history(
        &self,
        self_id: &IdentityId,
        peer: &IdentityId,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, FetchError>> + Send;

    /// Durably append one message. Appending an `id` the store already holds
    /// is a no-op.
    fn append(
        &self,
        from: &IdentityId,
        to: &IdentityId,
        id: &MessageId,
        body: &str,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// Local persistence of the logged-in identity.
pub trait IdentityStore: Send + Sync {
    fn current_identity(&self) -> Result<Option<Identity>, IdentityStoreError>;
    fn save(&self, identity: &Identity) -> Result<(), IdentityStoreError>;
    fn clear(&self) -> Result<(), IdentityStoreError>;
}

/// Identity persisted as JSON next to the rest of the client state.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub const FILE_NAME: &'static str = "identity.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/identity.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn current_identity(&self) -> Result<Option<Identity>, IdentityStoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(identity)?)?;
        debug!(user = %identity.id, path = %self.path.display(), "Identity saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), IdentityStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Serialize)]
struct AppendRequest<'a> {
    from: &'a IdentityId,
    to: &'a IdentityId,
    id: &'a MessageId,
    body: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct AvatarRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct AvatarResponse {
    is_set: bool,
    image: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`MessageStore`] over the server's `/api/messages` endpoints.
#[derive(Debug, Clone)]
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl MessageStore for HttpMessageStore {
    async fn fetch_history(
        &self,
        self_id: &IdentityId,
        peer: &IdentityId,
    ) -> Result<Vec<HistoryEntry>, FetchError> {
        let url = format!("{}/api/messages", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("from", self_id.as_str()), ("to", peer.as_str())])
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        resp.json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn append(
        &self,
        from: &IdentityId,
        to: &IdentityId,
        id: &MessageId,
        body: &str,
    ) -> Result<(), PersistenceError> {
        let url = format!("{}/api/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&AppendRequest { from, to, id, body })
            .send()
            .await
            .map_err(|e| PersistenceError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(from = %from, to = %to, status = %resp.status(), "Append rejected");
            return Err(PersistenceError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Client for the identity endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Websocket endpoint of the router on the same server.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/api/ws")
    }

    /// A message store sharing this client's connection pool.
    pub fn message_store(&self) -> HttpMessageStore {
        HttpMessageStore::with_client(self.client.clone(), self.base_url.clone())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/auth/register", self.base_url))
            .json(&RegisterRequest {
                username,
                email,
                password,
            })
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }

    /// Set the avatar of `identity`, returning the updated identity.
    pub async fn set_avatar(&self, identity: &Identity, image: &str) -> Result<Identity, ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/auth/avatar/{}", self.base_url, identity.id))
            .json(&AvatarRequest { image })
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let avatar: AvatarResponse = decode(resp).await?;
        Ok(Identity {
            avatar: Some(avatar.image),
            avatar_set: avatar.is_set,
            ..identity.clone()
        })
    }

    /// Every registered identity except `id`.
    pub async fn contacts(&self, id: &IdentityId) -> Result<Vec<Identity>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/api/users/{}/contacts", self.base_url, id))
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.map_err(ApiError::from_reqwest);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    Err(ApiError::Rejected {
        status: status.as_u16(),
        message,
    })
}
