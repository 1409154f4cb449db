//! Discovering the session the broker bound to this host.

use std::time::Duration;

use anyhow::Context;
use cloudplay_protocol::proto::broker_client::BrokerClient;
use cloudplay_protocol::proto::{self, FindSessionRequest, WatchSessionRequest};
use cloudplay_protocol::{GameMetadata, MetadataBodyError, SessionId, SessionIdError};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Session assigned to this host, with the game it should launch.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedSession {
    pub session_id: SessionId,
    pub game_id: String,
    pub metadata: GameMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum AssignedSessionError {
    #[error(transparent)]
    SessionId(#[from] SessionIdError),
    #[error("session {0} arrived without game metadata")]
    MissingMetadata(SessionId),
    #[error("undecodable game metadata: {0}")]
    Metadata(#[from] MetadataBodyError),
}

impl TryFrom<proto::Session> for AssignedSession {
    type Error = AssignedSessionError;

    fn try_from(session: proto::Session) -> Result<Self, Self::Error> {
        let session_id: SessionId = session.session_id.parse()?;
        let body = session
            .game_metadata
            .ok_or(AssignedSessionError::MissingMetadata(session_id))?
            .body;
        Ok(Self {
            session_id,
            game_id: session.game_id,
            metadata: GameMetadata::from_body(&body)?,
        })
    }
}

/// Poll `FindSession` every `poll` until a session is bound to `host_id`.
/// `Ok(None)` if cancelled first.
pub async fn wait_for_session(
    client: &mut BrokerClient<Channel>,
    host_id: &str,
    poll: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<AssignedSession>> {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = ticker.tick() => {}
        }
        let resp = client
            .find_session(FindSessionRequest {
                allocated_server_id: host_id.to_string(),
            })
            .await
            .context("FindSession failed")?
            .into_inner();
        if let Some(session) = resp.session.filter(|_| resp.found) {
            let assigned = AssignedSession::try_from(session)?;
            tracing::info!(session_id = %assigned.session_id, game_id = %assigned.game_id, "Session assigned");
            return Ok(Some(assigned));
        }
    }
}

/// Push-based variant of [`wait_for_session`] over `WatchSession`.
pub async fn watch_for_session(
    client: &mut BrokerClient<Channel>,
    host_id: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<AssignedSession>> {
    let mut stream = client
        .watch_session(WatchSessionRequest {
            allocated_server_id: host_id.to_string(),
        })
        .await
        .context("WatchSession failed")?
        .into_inner();
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            update = stream.message() => update.context("WatchSession stream failed")?,
        };
        let Some(update) = update else {
            anyhow::bail!("broker closed the session watch");
        };
        if let Some(session) = update.session.filter(|_| update.found) {
            let assigned = AssignedSession::try_from(session)?;
            tracing::info!(session_id = %assigned.session_id, game_id = %assigned.game_id, "Session assigned (watch)");
            return Ok(Some(assigned));
        }
    }
}
