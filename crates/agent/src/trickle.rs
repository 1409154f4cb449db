//! Host side of `TrickleSignaling`: one outbound stream per session.
//!
//! Local candidates are pushed with [`TrickleRelay::send_candidate`]; every
//! candidate the broker relays from the player is handed to the callback
//! given at registration. A stream that fails to open, or whose receive loop
//! errors, removes its session from the relay and is not retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cloudplay_protocol::SessionId;
use cloudplay_protocol::proto::TrickleSignalingRequest;
use cloudplay_protocol::proto::signaling_client::SignalingClient;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

const OUTBOUND_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TrickleError {
    #[error("no trickle stream registered for session {0}")]
    NotRegistered(SessionId),
    #[error("trickle stream for session {0} is closed")]
    StreamClosed(SessionId),
}

struct Registration {
    id: u64,
    tx: mpsc::Sender<TrickleSignalingRequest>,
}

#[derive(Clone)]
pub struct TrickleRelay {
    client: SignalingClient<Channel>,
    sessions: Arc<RwLock<HashMap<SessionId, Registration>>>,
    next_id: Arc<AtomicU64>,
}

impl TrickleRelay {
    pub fn new(client: SignalingClient<Channel>) -> Self {
        Self {
            client,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the trickle stream for `session_id`.
    ///
    /// The broker only answers the call once it has read the first candidate,
    /// so the session is registered immediately and the call completes in the
    /// background after the first [`send_candidate`](Self::send_candidate).
    /// Registering a session again replaces its previous stream.
    pub async fn register<F>(&self, session_id: SessionId, on_candidate: F, cancel: CancellationToken)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .sessions
            .write()
            .await
            .insert(session_id, Registration { id, tx })
            .is_some()
        {
            tracing::debug!(%session_id, "Replaced existing trickle stream");
        }

        let relay = self.clone();
        let mut client = self.client.clone();
        tokio::spawn(async move {
            let call = client.trickle_signaling(ReceiverStream::new(rx));
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    relay.forget(session_id, id).await;
                    return;
                }
                res = call => res,
            };
            let mut inbound = match response {
                Ok(resp) => resp.into_inner(),
                Err(status) => {
                    tracing::warn!(%session_id, "Trickle stream setup failed: {status}");
                    relay.forget(session_id, id).await;
                    return;
                }
            };
            tracing::debug!(%session_id, "Trickle stream open");

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = inbound.message() => next,
                };
                match next {
                    Ok(Some(msg)) => on_candidate(msg.body().to_string()),
                    Ok(None) => {
                        tracing::debug!(%session_id, "Broker ended trickle stream");
                        break;
                    }
                    Err(status) => {
                        tracing::warn!(%session_id, "Trickle receive failed: {status}");
                        break;
                    }
                }
            }
            relay.forget(session_id, id).await;
        });
    }

    /// Forward one local candidate body. An empty body marks end-of-candidates.
    pub async fn send_candidate(
        &self,
        session_id: SessionId,
        body: impl Into<String>,
    ) -> Result<(), TrickleError> {
        let tx = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|r| r.tx.clone())
            .ok_or(TrickleError::NotRegistered(session_id))?;
        tx.send(TrickleSignalingRequest::new(session_id.to_string(), body))
            .await
            .map_err(|_| TrickleError::StreamClosed(session_id))
    }

    /// Drop the session's stream. The broker sees the request side end.
    pub async fn deregister(&self, session_id: SessionId) -> bool {
        self.sessions.write().await.remove(&session_id).is_some()
    }

    pub async fn is_registered(&self, session_id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Remove the registration made by one stream task, leaving any newer
    /// registration for the same session in place.
    async fn forget(&self, session_id: SessionId, id: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session_id).is_some_and(|r| r.id == id) {
            sessions.remove(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBroker;
    use cloudplay_server::signaling::Queue;
    use std::time::Duration;

    const LIMIT: Duration = Duration::from_secs(5);

    async fn wait_deregistered(relay: &TrickleRelay, session_id: SessionId) {
        tokio::time::timeout(LIMIT, async {
            while relay.is_registered(session_id).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session stayed registered");
    }

    #[tokio::test]
    async fn candidates_flow_both_ways() {
        let broker = TestBroker::start().await;
        let session_id = broker.new_session().await;
        let relay = TrickleRelay::new(broker.signaling_client().await);
        let channels = broker.broker.channels().get_or_create(session_id).await;
        let scope = CancellationToken::new();

        let (got_tx, mut got_rx) = mpsc::unbounded_channel();
        relay
            .register(session_id, move |body| { let _ = got_tx.send(body); }, scope.clone())
            .await;
        assert!(relay.is_registered(session_id).await);

        relay.send_candidate(session_id, "host-1").await.unwrap();
        relay.send_candidate(session_id, "host-2").await.unwrap();
        for want in ["host-1", "host-2"] {
            let got = tokio::time::timeout(LIMIT, channels.pop(Queue::AnswerCandidates, &scope))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, want);
        }

        channels
            .push(Queue::OfferCandidates, "player-1".into(), &scope)
            .await
            .unwrap();
        channels
            .push(Queue::OfferCandidates, String::new(), &scope)
            .await
            .unwrap();
        assert_eq!(tokio::time::timeout(LIMIT, got_rx.recv()).await.unwrap().unwrap(), "player-1");
        assert_eq!(tokio::time::timeout(LIMIT, got_rx.recv()).await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn setup_failure_abandons_registration() {
        let broker = TestBroker::start().await;
        let relay = TrickleRelay::new(broker.signaling_client().await);
        let unknown = SessionId::new();

        relay.register(unknown, |_| {}, CancellationToken::new()).await;
        // The first candidate lets the broker reject the stream.
        relay.send_candidate(unknown, "host-1").await.unwrap();
        wait_deregistered(&relay, unknown).await;
        assert!(matches!(
            relay.send_candidate(unknown, "host-2").await,
            Err(TrickleError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn session_teardown_deregisters() {
        let broker = TestBroker::start().await;
        let session_id = broker.new_session().await;
        let relay = TrickleRelay::new(broker.signaling_client().await);

        relay.register(session_id, |_| {}, CancellationToken::new()).await;
        relay.send_candidate(session_id, "host-1").await.unwrap();
        // Give the broker time to accept the stream before tearing it down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker
            .broker
            .delete_session(session_id, crate::testing::HOST)
            .await
            .unwrap();
        wait_deregistered(&relay, session_id).await;
    }

    #[tokio::test]
    async fn explicit_deregister_and_unknown_session() {
        let broker = TestBroker::start().await;
        let session_id = broker.new_session().await;
        let relay = TrickleRelay::new(broker.signaling_client().await);

        assert!(matches!(
            relay.send_candidate(session_id, "x").await,
            Err(TrickleError::NotRegistered(_))
        ));
        relay.register(session_id, |_| {}, CancellationToken::new()).await;
        assert!(relay.deregister(session_id).await);
        assert!(!relay.deregister(session_id).await);
        assert!(!relay.is_registered(session_id).await);
    }

    #[tokio::test]
    async fn cancel_ends_the_stream_task() {
        let broker = TestBroker::start().await;
        let session_id = broker.new_session().await;
        let relay = TrickleRelay::new(broker.signaling_client().await);
        let scope = CancellationToken::new();

        relay.register(session_id, |_| {}, scope.clone()).await;
        scope.cancel();
        wait_deregistered(&relay, session_id).await;
    }
}
