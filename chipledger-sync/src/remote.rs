//! Remote store abstraction.
//!
//! The coordinator talks to the server only through [`RemoteStore`]. Owned
//! sessions and sessions shared with the user through an accepted grant are
//! fetched separately; writes are whole-session (last writer wins).

use crate::error::SyncResult;
use async_trait::async_trait;
use chipledger_types::{Session, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// State of an invitation to a shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Pending,
    Accepted,
    Declined,
}

impl GrantStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

/// Access granted to a non-owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub status: GrantStatus,
}

/// A session as returned by the remote, with the grant it was reached through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub session: Session,
    /// `None` for sessions the user owns.
    pub grant: Option<Grant>,
}

/// Server-side session storage.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Sessions created by `user`.
    async fn fetch_owned(&self, user: &UserId) -> SyncResult<Vec<RemoteSession>>;

    /// Sessions shared with `user` through a grant in `status`.
    async fn fetch_shared(&self, user: &UserId, status: GrantStatus) -> SyncResult<Vec<RemoteSession>>;

    /// Creates a session owned by `user`.
    async fn create(&self, user: &UserId, session: &Session) -> SyncResult<()>;

    /// Replaces a session. Only the owner may update; others get `Forbidden`.
    async fn update(&self, user: &UserId, session: &Session) -> SyncResult<()>;

    /// Deletes the session if `user` owns it, otherwise revokes `user`'s grant.
    async fn delete(&self, user: &UserId, id: SessionId) -> SyncResult<()>;
}

/// An in-memory remote store for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use chipledger_types::SessionAccess;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    /// A failure the mock can be told to produce.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InjectedFailure {
        Network,
        Auth,
        Forbidden,
        NotFound,
    }

    impl InjectedFailure {
        fn to_error(self) -> SyncError {
            match self {
                Self::Network => SyncError::Network("injected network failure".into()),
                Self::Auth => SyncError::Auth("injected auth failure".into()),
                Self::Forbidden => SyncError::Forbidden("injected forbidden".into()),
                Self::NotFound => SyncError::NotFound("injected not found".into()),
            }
        }
    }

    /// Number of calls per operation.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CallCounts {
        pub fetch_owned: usize,
        pub fetch_shared: usize,
        pub create: usize,
        pub update: usize,
        pub delete: usize,
    }

    #[derive(Debug, Default)]
    struct Counters {
        fetch_owned: AtomicUsize,
        fetch_shared: AtomicUsize,
        create: AtomicUsize,
        update: AtomicUsize,
        delete: AtomicUsize,
    }

    #[derive(Debug, Default)]
    struct Inner {
        sessions: HashMap<SessionId, (UserId, Session)>,
        grants: Vec<Grant>,
        fail_next: VecDeque<InjectedFailure>,
        fail_always: Option<InjectedFailure>,
        latency: Duration,
    }

    /// A remote store backed by a map, with failure injection and latency.
    #[derive(Debug, Default)]
    pub struct MemoryRemoteStore {
        inner: Mutex<Inner>,
        counters: Counters,
    }

    impl MemoryRemoteStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a session owned by `owner`.
        pub fn insert(&self, owner: &UserId, session: Session) {
            self.lock().sessions.insert(session.id, (owner.clone(), session));
        }

        /// Grants `user` access to a stored session.
        pub fn share(&self, id: SessionId, user: &UserId, status: GrantStatus) {
            let mut inner = self.lock();
            inner.grants.retain(|g| !(g.session_id == id && &g.user_id == user));
            inner.grants.push(Grant {
                session_id: id,
                user_id: user.clone(),
                status,
            });
        }

        /// Current server copy of a session.
        pub fn session(&self, id: SessionId) -> Option<Session> {
            self.lock().sessions.get(&id).map(|(_, s)| s.clone())
        }

        pub fn session_count(&self) -> usize {
            self.lock().sessions.len()
        }

        pub fn grants(&self) -> Vec<Grant> {
            self.lock().grants.clone()
        }

        /// Makes the next call fail with `failure`. Queued failures are consumed in order.
        pub fn fail_next(&self, failure: InjectedFailure) {
            self.lock().fail_next.push_back(failure);
        }

        /// Makes every call fail with `failure` until cleared with `None`.
        pub fn fail_always(&self, failure: Option<InjectedFailure>) {
            self.lock().fail_always = failure;
        }

        /// Delays every call by `latency` (tokio time).
        pub fn set_latency(&self, latency: Duration) {
            self.lock().latency = latency;
        }

        pub fn calls(&self) -> CallCounts {
            CallCounts {
                fetch_owned: self.counters.fetch_owned.load(Ordering::SeqCst),
                fetch_shared: self.counters.fetch_shared.load(Ordering::SeqCst),
                create: self.counters.create.load(Ordering::SeqCst),
                update: self.counters.update.load(Ordering::SeqCst),
                delete: self.counters.delete.load(Ordering::SeqCst),
            }
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Applies latency, then any injected failure.
        async fn enter(&self, counter: &AtomicUsize) -> SyncResult<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            let latency = self.lock().latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut inner = self.lock();
            if let Some(failure) = inner.fail_next.pop_front().or(inner.fail_always) {
                return Err(failure.to_error());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemoteStore {
        async fn fetch_owned(&self, user: &UserId) -> SyncResult<Vec<RemoteSession>> {
            self.enter(&self.counters.fetch_owned).await?;
            let inner = self.lock();
            let mut owned: Vec<RemoteSession> = inner
                .sessions
                .values()
                .filter(|(owner, _)| owner == user)
                .map(|(owner, session)| {
                    let mut session = session.clone();
                    session.access = SessionAccess::Owner;
                    session.owner_id = Some(owner.clone());
                    RemoteSession {
                        session,
                        grant: None,
                    }
                })
                .collect();
            owned.sort_by_key(|r| r.session.id);
            Ok(owned)
        }

        async fn fetch_shared(&self, user: &UserId, status: GrantStatus) -> SyncResult<Vec<RemoteSession>> {
            self.enter(&self.counters.fetch_shared).await?;
            let inner = self.lock();
            let shared = inner
                .grants
                .iter()
                .filter(|g| &g.user_id == user && g.status == status)
                .filter_map(|grant| {
                    let (owner, session) = inner.sessions.get(&grant.session_id)?;
                    let mut session = session.clone();
                    session.access = SessionAccess::Guest;
                    session.owner_id = Some(owner.clone());
                    Some(RemoteSession {
                        session,
                        grant: Some(grant.clone()),
                    })
                })
                .collect();
            Ok(shared)
        }

        async fn create(&self, user: &UserId, session: &Session) -> SyncResult<()> {
            self.enter(&self.counters.create).await?;
            let mut inner = self.lock();
            let owned_by_other = matches!(inner.sessions.get(&session.id), Some((owner, _)) if owner != user);
            if owned_by_other {
                return Err(SyncError::Forbidden(format!(
                    "session {} belongs to another user",
                    session.id
                )));
            }
            inner.sessions.insert(session.id, (user.clone(), session.clone()));
            Ok(())
        }

        async fn update(&self, user: &UserId, session: &Session) -> SyncResult<()> {
            self.enter(&self.counters.update).await?;
            let mut inner = self.lock();
            match inner.sessions.get_mut(&session.id) {
                None => Err(SyncError::NotFound(format!("session {}", session.id))),
                Some((owner, _)) if *owner != *user => {
                    Err(SyncError::Forbidden(format!("only the owner may update {}", session.id)))
                }
                Some((_, stored)) => {
                    *stored = session.clone();
                    Ok(())
                }
            }
        }

        async fn delete(&self, user: &UserId, id: SessionId) -> SyncResult<()> {
            self.enter(&self.counters.delete).await?;
            let mut inner = self.lock();
            let owner = inner.sessions.get(&id).map(|(owner, _)| owner.clone());
            match owner {
                Some(owner) if &owner == user => {
                    inner.sessions.remove(&id);
                    inner.grants.retain(|g| g.session_id != id);
                    Ok(())
                }
                Some(_) => {
                    let before = inner.grants.len();
                    inner.grants.retain(|g| !(g.session_id == id && &g.user_id == user));
                    if inner.grants.len() == before {
                        return Err(SyncError::NotFound(format!("no grant on {id}")));
                    }
                    Ok(())
                }
                None => Err(SyncError::NotFound(format!("session {id}"))),
            }
        }
    }
}
