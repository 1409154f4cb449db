use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cloudplay_protocol::SessionId;
use cloudplay_protocol::proto;
use serde::Serialize;
use tokio::sync::RwLock;

/// Lifecycle of a session. Deletion is terminal and leaves no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    WaitingForSession,
    Signaling,
    Provisioning,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::WaitingForSession => "waiting_for_session",
            SessionState::Signaling => "signaling",
            SessionState::Provisioning => "provisioning",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One player's claim on one allocated host for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub game_id: String,
    pub allocated_server_id: String,
    pub state: SessionState,
    /// Unix epoch seconds
    pub created_at: u64,
}

impl Session {
    /// Wire form for the host-facing gRPC API.
    pub fn to_proto(&self, metadata_body: Option<String>) -> proto::Session {
        proto::Session {
            session_id: self.id.to_string(),
            allocated_server_id: self.allocated_server_id.clone(),
            game_id: self.game_id.clone(),
            state: self.state.as_str().to_string(),
            game_metadata: metadata_body.map(|body| proto::GameMetadataBody { body }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed storage for session records.
///
/// Misses are `Ok(None)` / `Ok(false)`, never errors: hosts routinely poll
/// before a player has shown up.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new record in `WaitingForSession` under a fresh id.
    async fn create(&self, game_id: &str, allocated_server_id: &str)
    -> Result<Session, StoreError>;

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    async fn get_by_allocated_server_id(
        &self,
        allocated_server_id: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Returns `false` if the session does not exist.
    async fn update_state(&self, id: SessionId, state: SessionState) -> Result<bool, StoreError>;

    /// Idempotent.
    async fn delete(&self, id: SessionId) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    /// allocated_server_id -> most recently created session on that host
    by_host: HashMap<String, SessionId>,
}

/// Process-local session store. One reader/writer lock covers both the
/// records and the host index.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        game_id: &str,
        allocated_server_id: &str,
    ) -> Result<Session, StoreError> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut inner = self.inner.write().await;
        let mut id = SessionId::new();
        while inner.sessions.contains_key(&id) {
            id = SessionId::new();
        }

        let session = Session {
            id,
            game_id: game_id.to_string(),
            allocated_server_id: allocated_server_id.to_string(),
            state: SessionState::WaitingForSession,
            created_at,
        };

        let previous = inner.by_host.insert(allocated_server_id.to_string(), id);
        if let Some(previous) = previous.filter(|prev| inner.sessions.contains_key(prev)) {
            tracing::warn!(
                host_id = %allocated_server_id,
                %previous,
                session_id = %id,
                "Host already has a live session; it is no longer reachable by host lookup, \
                 even after the new one is deleted"
            );
        }
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn get_by_allocated_server_id(
        &self,
        allocated_server_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_host
            .get(allocated_server_id)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn update_state(&self, id: SessionId, state: SessionState) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                session.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.remove(&id) {
            // Only drop the index entry if it still points at this session.
            if inner.by_host.get(&session.allocated_server_id) == Some(&id) {
                inner.by_host.remove(&session.allocated_server_id);
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.inner.read().await.sessions.values().cloned().collect())
    }
}
