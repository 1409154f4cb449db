//! Session lifecycle: create (allocate + persist), resolve by host, release.

use std::sync::Arc;

use cloudplay_protocol::{GameMetadata, MetadataBodyError, SessionId};

use crate::allocator::{AllocatedServer, Allocator, AllocatorError};
use crate::metadata::{MetadataError, MetadataStore};
use crate::session::{Session, SessionState, SessionStore, StoreError};
use crate::signaling::ChannelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("game metadata not found for '{0}'")]
    MetadataNotFound(String),
    #[error("game metadata for '{game_id}' vanished while session {session_id} was live")]
    MetadataVanished {
        session_id: SessionId,
        game_id: String,
    },
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("session {session_id} is not bound to host '{caller}'")]
    NotOwner {
        session_id: SessionId,
        caller: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    MetadataBody(#[from] MetadataBodyError),
}

/// A session found by host identity, with the metadata the host needs to
/// launch the game.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub session: Session,
    pub metadata: GameMetadata,
    /// Serialized `metadata`, as carried on the wire.
    pub metadata_body: String,
}

/// Orchestrates sessions over injected store, metadata, allocator and
/// channel registry. Shared as `Arc<Broker>`.
pub struct Broker {
    sessions: Arc<dyn SessionStore>,
    metadata: Arc<dyn MetadataStore>,
    allocator: Arc<dyn Allocator>,
    channels: ChannelRegistry,
}

impl Broker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        metadata: Arc<dyn MetadataStore>,
        allocator: Arc<dyn Allocator>,
        channels: ChannelRegistry,
    ) -> Self {
        Self {
            sessions,
            metadata,
            allocator,
            channels,
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Allocate a host for `game_id` and bind a new session to it. The
    /// session's signaling channels are created here and live until
    /// `delete_session`; endpoints only ever look them up.
    ///
    /// If the session cannot be stored, the host is handed back to the
    /// allocator; a host that cannot be handed back is logged under the
    /// `leak` target.
    pub async fn new_game(&self, game_id: &str) -> Result<Session, BrokerError> {
        let game_id = game_id.trim();
        if game_id.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "game id must not be empty".to_string(),
            ));
        }
        if self.metadata.get(game_id).await?.is_none() {
            return Err(BrokerError::MetadataNotFound(game_id.to_string()));
        }

        let host = self.allocator.allocate().await?;
        match self.sessions.create(game_id, &host.id).await {
            Ok(session) => {
                self.channels.get_or_create(session.id).await;
                tracing::info!(
                    session_id = %session.id,
                    host_id = %host.id,
                    game_id,
                    "New game session created"
                );
                Ok(session)
            }
            Err(e) => {
                tracing::error!(host_id = %host.id, game_id, "Failed to store session: {e}");
                if let Err(release_err) = self.allocator.release(&host).await {
                    tracing::error!(
                        target: "leak",
                        host_id = %host.id,
                        game_id,
                        "Allocated host leaked after failed session create: {release_err}"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Look up the session bound to `host_id`. `Ok(None)` is a normal polling
    /// outcome. A hit also begins signaling on the session.
    pub async fn find_session(&self, host_id: &str) -> Result<Option<Resolution>, BrokerError> {
        let Some(session) = self.sessions.get_by_allocated_server_id(host_id).await? else {
            return Ok(None);
        };
        let metadata = self.metadata.get(&session.game_id).await?.ok_or_else(|| {
            BrokerError::MetadataVanished {
                session_id: session.id,
                game_id: session.game_id.clone(),
            }
        })?;
        let metadata_body = metadata.to_body()?;
        let session = self.begin_signaling(session.id).await?;
        Ok(Some(Resolution {
            session,
            metadata,
            metadata_body,
        }))
    }

    /// Move `WaitingForSession` to `Signaling`. Sessions already past that
    /// point are returned unchanged.
    pub async fn begin_signaling(&self, session_id: SessionId) -> Result<Session, BrokerError> {
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(BrokerError::SessionNotFound(session_id))?;
        if session.state == SessionState::WaitingForSession {
            if !self
                .sessions
                .update_state(session_id, SessionState::Signaling)
                .await?
            {
                return Err(BrokerError::SessionNotFound(session_id));
            }
            session.state = SessionState::Signaling;
            tracing::info!(%session_id, host_id = %session.allocated_server_id, "Session is signaling");
        }
        Ok(session)
    }

    /// Delete a session on behalf of the host bound to it, tearing down its
    /// signaling channels and returning the host to the allocator.
    pub async fn delete_session(
        &self,
        session_id: SessionId,
        host_id: &str,
    ) -> Result<(), BrokerError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(BrokerError::SessionNotFound(session_id))?;
        if session.allocated_server_id != host_id {
            tracing::warn!(
                %session_id,
                host_id,
                owner = %session.allocated_server_id,
                "Rejected delete from a host that does not own the session"
            );
            return Err(BrokerError::NotOwner {
                session_id,
                caller: host_id.to_string(),
            });
        }

        self.sessions.delete(session_id).await?;
        self.channels.remove(session_id).await;

        match self
            .allocator
            .release(&AllocatedServer::new(session.allocated_server_id.clone()))
            .await
        {
            Ok(()) | Err(AllocatorError::ReleaseUnsupported) => {}
            Err(e) => tracing::warn!(%session_id, host_id, "Failed to release host: {e}"),
        }
        tracing::info!(%session_id, host_id, "Session deleted");
        Ok(())
    }

    pub async fn session_exists(&self, session_id: SessionId) -> Result<bool, BrokerError> {
        Ok(self.sessions.get(session_id).await?.is_some())
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, BrokerError> {
        Ok(self.sessions.get(session_id).await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, BrokerError> {
        Ok(self.sessions.list().await?)
    }

    pub async fn game_metadata(&self, game_id: &str) -> Result<GameMetadata, BrokerError> {
        self.metadata
            .get(game_id)
            .await?
            .ok_or_else(|| BrokerError::MetadataNotFound(game_id.to_string()))
    }
}
