use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use cloudplay_protocol::{Operation, SessionId, SignalingMessage};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;

/// Player candidates buffered per connection ahead of the session queues.
const CANDIDATE_BUFFER: usize = 32;

/// One of the four per-session signaling queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Player SDP offer, consumed by the host
    Offer,
    /// Host SDP answer, consumed by the player's connection
    Answer,
    /// Player ICE candidates, streamed to the host
    OfferCandidates,
    /// Host ICE candidates, relayed to the player
    AnswerCandidates,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling channels for this session were torn down")]
    Closed,
    #[error("signaling wait cancelled")]
    Cancelled,
    #[error("an answer was already sent for this negotiation")]
    AnswerAlreadySent,
    #[error("timed out waiting for the host's answer")]
    Timeout,
}

struct BoundedQueue {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// The four bounded FIFO queues of one session.
///
/// Producers block while a queue is full and consumers while it is empty.
/// Every wait ends early when the caller's token is cancelled
/// (`SignalingError::Cancelled`) or the set is torn down
/// (`SignalingError::Closed`).
pub struct SignalingChannels {
    session_id: SessionId,
    offer: BoundedQueue,
    answer: BoundedQueue,
    offer_candidates: BoundedQueue,
    answer_candidates: BoundedQueue,
    closed: CancellationToken,
    answer_sent: AtomicBool,
}

impl SignalingChannels {
    fn new(session_id: SessionId, capacity: usize) -> Self {
        Self {
            session_id,
            offer: BoundedQueue::new(capacity),
            answer: BoundedQueue::new(capacity),
            offer_candidates: BoundedQueue::new(capacity),
            answer_candidates: BoundedQueue::new(capacity),
            closed: CancellationToken::new(),
            answer_sent: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn queue(&self, queue: Queue) -> &BoundedQueue {
        match queue {
            Queue::Offer => &self.offer,
            Queue::Answer => &self.answer,
            Queue::OfferCandidates => &self.offer_candidates,
            Queue::AnswerCandidates => &self.answer_candidates,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Release every producer and consumer blocked on this set.
    fn close(&self) {
        self.closed.cancel();
    }

    pub async fn push(
        &self,
        queue: Queue,
        body: String,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let q = self.queue(queue);
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SignalingError::Closed),
            _ = cancel.cancelled() => Err(SignalingError::Cancelled),
            res = q.tx.send(body) => res.map_err(|_| SignalingError::Closed),
        }
    }

    pub async fn pop(&self, queue: Queue, cancel: &CancellationToken) -> Result<String, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let q = self.queue(queue);
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(SignalingError::Closed),
            _ = cancel.cancelled() => return Err(SignalingError::Cancelled),
            rx = q.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SignalingError::Closed),
            _ = cancel.cancelled() => Err(SignalingError::Cancelled),
            body = rx.recv() => body.ok_or(SignalingError::Closed),
        }
    }

    /// Non-blocking read. `Ok(None)` when the queue is empty or another
    /// consumer currently holds it.
    pub fn try_pop(&self, queue: Queue) -> Result<Option<String>, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let Ok(mut rx) = self.queue(queue).rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(body) => Ok(Some(body)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(SignalingError::Closed),
        }
    }

    /// Queue a new offer, opening a fresh negotiation that accepts one answer.
    pub async fn submit_offer(
        &self,
        body: String,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        self.answer_sent.store(false, Ordering::SeqCst);
        self.push(Queue::Offer, body, cancel).await
    }

    /// Queue the host's answer. Only the first answer of a negotiation is
    /// accepted; later ones fail without being queued.
    pub async fn submit_answer(
        &self,
        body: String,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        if self.answer_sent.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AnswerAlreadySent);
        }
        let res = self.push(Queue::Answer, body, cancel).await;
        if res.is_err() {
            self.answer_sent.store(false, Ordering::SeqCst);
        }
        res
    }
}

/// Table of per-session signaling channels. Cloned handles share one table.
#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<SessionId, Arc<SignalingChannels>>>>,
    capacity: usize,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Get or create the channel set for the given session.
    pub async fn get_or_create(&self, session_id: SessionId) -> Arc<SignalingChannels> {
        {
            let channels = self.channels.read().await;
            if let Some(ch) = channels.get(&session_id) {
                return Arc::clone(ch);
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(session_id)
            .or_insert_with(|| {
                tracing::debug!(%session_id, "Signaling channels created");
                Arc::new(SignalingChannels::new(session_id, self.capacity))
            })
            .clone()
    }

    pub async fn get(&self, session_id: SessionId) -> Option<Arc<SignalingChannels>> {
        self.channels.read().await.get(&session_id).cloned()
    }

    /// Tear down a session's channels, waking everything blocked on them.
    /// Returns whether the session had any.
    pub async fn remove(&self, session_id: SessionId) -> bool {
        let removed = self.channels.write().await.remove(&session_id);
        match removed {
            Some(ch) => {
                ch.close();
                tracing::debug!(%session_id, "Signaling channels removed");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Handle one player's signaling WebSocket.
///
/// The connection is the cancellation scope: when it closes, every task it
/// started stops waiting on the session's queues. Malformed messages,
/// unknown sessions and unexpected operations are logged and dropped.
pub async fn handle_player_ws(
    mut socket: WebSocket,
    broker: Arc<Broker>,
    answer_timeout: Option<Duration>,
) {
    let conn = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<SignalingMessage>(32);
    let (cand_tx, cand_rx) = mpsc::channel::<(SessionId, String)>(CANDIDATE_BUFFER);
    tokio::spawn(forward_offer_candidates(
        Arc::clone(&broker),
        cand_rx,
        conn.clone(),
    ));

    tracing::info!("Player WebSocket connected");

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize signaling message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!("Player WebSocket send failed");
                    break;
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!("Invalid player message: {e}");
                                continue;
                            }
                        };
                        handle_player_message(msg, &broker, &out_tx, &cand_tx, &conn, answer_timeout).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Player WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Player WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    conn.cancel();
    tracing::info!("Player WebSocket disconnected");
}

async fn handle_player_message(
    msg: SignalingMessage,
    broker: &Arc<Broker>,
    out_tx: &mpsc::Sender<SignalingMessage>,
    cand_tx: &mpsc::Sender<(SessionId, String)>,
    conn: &CancellationToken,
    answer_timeout: Option<Duration>,
) {
    let Some(session_id) = msg.session_id else {
        tracing::warn!(operation = ?msg.operation, "Player message without session_id dropped");
        return;
    };
    if !matches!(msg.operation, Operation::Offer | Operation::IceCandidate) {
        tracing::warn!(%session_id, operation = ?msg.operation, "Unexpected operation from player");
        return;
    }

    match broker.session_exists(session_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(%session_id, "Session not found");
            return;
        }
        Err(e) => {
            tracing::error!(%session_id, "Failed to look up session: {e}");
            return;
        }
    }

    match msg.operation {
        Operation::Offer => {
            tokio::spawn(negotiate(
                Arc::clone(broker),
                session_id,
                msg.body,
                out_tx.clone(),
                conn.clone(),
                answer_timeout,
            ));
        }
        Operation::IceCandidate => match cand_tx.try_send((session_id, msg.body)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%session_id, "Host is not draining candidates, dropping player candidate");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(%session_id, "Candidate forwarder gone");
            }
        },
        _ => {}
    }
}

/// Push player candidates onto `offerCandidates` in arrival order. A full
/// queue stalls this task and then fills the bounded buffer in front of it,
/// after which the socket loop drops candidates instead of blocking.
async fn forward_offer_candidates(
    broker: Arc<Broker>,
    mut rx: mpsc::Receiver<(SessionId, String)>,
    conn: CancellationToken,
) {
    loop {
        let (session_id, body) = tokio::select! {
            _ = conn.cancelled() => return,
            next = rx.recv() => match next {
                Some(item) => item,
                None => return,
            },
        };
        let Some(channels) = broker.channels().get(session_id).await else {
            tracing::debug!(%session_id, "Dropped offer candidate for a closed session");
            continue;
        };
        match channels.push(Queue::OfferCandidates, body, &conn).await {
            Ok(()) => {}
            Err(SignalingError::Cancelled) => return,
            Err(e) => tracing::debug!(%session_id, "Dropped offer candidate: {e}"),
        }
    }
}

/// One offer/answer exchange, followed by relaying the host's candidates
/// until the end-of-candidates sentinel.
async fn negotiate(
    broker: Arc<Broker>,
    session_id: SessionId,
    offer: String,
    out_tx: mpsc::Sender<SignalingMessage>,
    conn: CancellationToken,
    answer_timeout: Option<Duration>,
) {
    match run_negotiation(&broker, session_id, offer, &out_tx, &conn, answer_timeout).await {
        Ok(()) => {}
        Err(SignalingError::Cancelled) => {
            tracing::debug!(%session_id, "Negotiation abandoned, player disconnected");
        }
        Err(e) => tracing::warn!(%session_id, "Negotiation ended: {e}"),
    }
}

async fn run_negotiation(
    broker: &Broker,
    session_id: SessionId,
    offer: String,
    out_tx: &mpsc::Sender<SignalingMessage>,
    conn: &CancellationToken,
    answer_timeout: Option<Duration>,
) -> Result<(), SignalingError> {
    let channels = broker
        .channels()
        .get(session_id)
        .await
        .ok_or(SignalingError::Closed)?;
    channels.submit_offer(offer, conn).await?;
    tracing::info!(%session_id, "Offer queued, waiting for answer");

    let answer = match answer_timeout {
        Some(limit) => tokio::time::timeout(limit, channels.pop(Queue::Answer, conn))
            .await
            .map_err(|_| SignalingError::Timeout)??,
        None => channels.pop(Queue::Answer, conn).await?,
    };
    if out_tx
        .send(SignalingMessage::answer(session_id, answer))
        .await
        .is_err()
    {
        return Err(SignalingError::Cancelled);
    }
    tracing::info!(%session_id, "Answer delivered to player");

    loop {
        let candidate = channels.pop(Queue::AnswerCandidates, conn).await?;
        let last = candidate.is_empty();
        if out_tx
            .send(SignalingMessage::ice_candidate(session_id, candidate))
            .await
            .is_err()
        {
            return Err(SignalingError::Cancelled);
        }
        if last {
            tracing::debug!(%session_id, "Host finished gathering candidates");
            return Ok(());
        }
    }
}
