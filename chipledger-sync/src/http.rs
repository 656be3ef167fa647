//! JSON-over-HTTP remote store.
//!
//! Routes:
//!
//! | call           | request                                  |
//! |----------------|------------------------------------------|
//! | `fetch_owned`  | `GET /users/{user}/sessions`             |
//! | `fetch_shared` | `GET /users/{user}/grants?status={s}`    |
//! | `create`       | `POST /sessions`                         |
//! | `update`       | `PUT /sessions/{id}`                     |
//! | `delete`       | `DELETE /sessions/{id}`                  |
//!
//! Session payloads from the server go through the same repair pass as
//! local snapshots; an unreadable entry is dropped with a warning instead of
//! failing the whole fetch.

use crate::error::{SyncError, SyncResult};
use crate::remote::{Grant, GrantStatus, RemoteSession, RemoteStore};
use async_trait::async_trait;
use chipledger_storage::repair_session;
use chipledger_types::{Session, SessionAccess, SessionId, UserId};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings for [`HttpRemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// Base URL without a trailing slash, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            token: None,
            request_timeout_ms: 30_000,
        }
    }
}

/// A [`RemoteStore`] speaking JSON REST.
#[derive(Debug)]
pub struct HttpRemoteStore {
    base_url: Url,
    client: Client,
    token: RwLock<Option<String>>,
}

impl HttpRemoteStore {
    /// Creates a store from `config`.
    pub fn new(config: HttpRemoteConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| SyncError::Network(format!("invalid base URL {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Network(format!("invalid base URL {}", config.base_url)));
        }
        Ok(Self {
            base_url,
            client,
            token: RwLock::new(config.token),
        })
    }

    /// Replaces the bearer token, e.g. after the user signs in again.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().unwrap_or_else(PoisonError::into_inner).as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> SyncResult<Response> {
        self.authorized(request).send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Network(format!("{what} failed: {e}"))
            }
        })
    }
}

/// Maps a non-success status to the sync error taxonomy.
///
/// `forbidden_is_auth` is set for reads: a 403 there means the token is not
/// valid for this user, while a 403 on a session write means the user is
/// not its owner.
async fn check(response: Response, what: &str, forbidden_is_auth: bool) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{what} failed: {status} {body}");
    Err(match status {
        StatusCode::UNAUTHORIZED => SyncError::Auth(detail),
        StatusCode::FORBIDDEN if forbidden_is_auth => SyncError::Auth(detail),
        StatusCode::FORBIDDEN => SyncError::Forbidden(detail),
        StatusCode::NOT_FOUND => SyncError::NotFound(detail),
        _ => SyncError::Network(detail),
    })
}

async fn read_array(response: Response, what: &str) -> SyncResult<Vec<Value>> {
    response
        .json::<Vec<Value>>()
        .await
        .map_err(|e| SyncError::Network(format!("failed to parse {what}: {e}")))
}

/// Repairs one session payload; `None` (with a warning) if it is unusable.
fn repaired(value: &Value, what: &str) -> Option<Session> {
    match repair_session(value) {
        Ok(repaired) => {
            for note in &repaired.notes {
                debug!("Repaired {} session {}: {}", what, repaired.session.id, note);
            }
            Some(repaired.session)
        }
        Err(e) => {
            warn!("Dropping unreadable {} session: {}", what, e);
            None
        }
    }
}

#[derive(Deserialize)]
struct SharedEntry {
    grant: Grant,
    session: Value,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_owned(&self, user: &UserId) -> SyncResult<Vec<RemoteSession>> {
        let url = self.url(&["users", user.as_str(), "sessions"]);
        let response = self.send(self.client.get(url), "owned session list").await?;
        let response = check(response, "owned session list", true).await?;
        let entries = read_array(response, "owned session list").await?;

        let sessions: Vec<RemoteSession> = entries
            .iter()
            .filter_map(|value| repaired(value, "owned"))
            .map(|mut session| {
                session.access = SessionAccess::Owner;
                session.owner_id = Some(user.clone());
                RemoteSession {
                    session,
                    grant: None,
                }
            })
            .collect();
        debug!("Fetched {} owned sessions for {}", sessions.len(), user);
        Ok(sessions)
    }

    async fn fetch_shared(&self, user: &UserId, status: GrantStatus) -> SyncResult<Vec<RemoteSession>> {
        let url = self.url(&["users", user.as_str(), "grants"]);
        let request = self.client.get(url).query(&[("status", status.as_str())]);
        let response = self.send(request, "shared session list").await?;
        let response = check(response, "shared session list", true).await?;
        let entries = read_array(response, "shared session list").await?;

        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry: SharedEntry = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Dropping unreadable grant entry: {}", e);
                    continue;
                }
            };
            if let Some(mut session) = repaired(&entry.session, "shared") {
                session.access = SessionAccess::Guest;
                sessions.push(RemoteSession {
                    session,
                    grant: Some(entry.grant),
                });
            }
        }
        debug!("Fetched {} shared sessions for {}", sessions.len(), user);
        Ok(sessions)
    }

    async fn create(&self, user: &UserId, session: &Session) -> SyncResult<()> {
        let mut body = session.clone();
        body.owner_id = Some(user.clone());
        let url = self.url(&["sessions"]);
        let response = self.send(self.client.post(url).json(&body), "create").await?;
        check(response, "create", false).await?;
        debug!("Created remote session {}", session.id);
        Ok(())
    }

    async fn update(&self, _user: &UserId, session: &Session) -> SyncResult<()> {
        let id = session.id.to_string();
        let url = self.url(&["sessions", id.as_str()]);
        let response = self.send(self.client.put(url).json(session), "update").await?;
        check(response, "update", false).await?;
        debug!("Updated remote session {}", session.id);
        Ok(())
    }

    async fn delete(&self, _user: &UserId, id: SessionId) -> SyncResult<()> {
        let segment = id.to_string();
        let url = self.url(&["sessions", segment.as_str()]);
        let response = self.send(self.client.delete(url), "delete").await?;
        check(response, "delete", false).await?;
        debug!("Deleted remote session {}", id);
        Ok(())
    }
}
