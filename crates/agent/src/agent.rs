//! Host lifecycle: discover the session, negotiate with the player, stream
//! until the session ends, then release it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cloudplay_protocol::proto::broker_client::BrokerClient;
use cloudplay_protocol::proto::signaling_client::SignalingClient;
use cloudplay_protocol::proto::{DeleteSessionRequest, SendSignalingAnswerRequest, SignalingAnswer};
use cloudplay_protocol::{GameMetadata, IceConfig, SamplePacket, SessionId};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::broadcast::Broadcast;
use crate::capture::CaptureArea;
use crate::input::{InputOutcome, InputSink, run_input};
use crate::media::SampleSink;
use crate::offer::{decode_candidate, encode_candidate, encode_sdp, wait_for_offer};
use crate::peer::{AnswerPeer, PeerChannels, PeerEvent, wait_connected, wait_disconnected};
use crate::session::{AssignedSession, wait_for_session, watch_for_session};
use crate::trickle::TrickleRelay;

/// How long the player gets to complete ICE after the answer is sent.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The peer currently streaming, if any. Media ingest writes through this so
/// the streamer connection survives session changes.
#[derive(Default)]
pub struct ActivePeer(RwLock<Option<Arc<AnswerPeer>>>);

impl ActivePeer {
    async fn set(&self, peer: Option<Arc<AnswerPeer>>) {
        *self.0.write().await = peer;
    }

    pub async fn is_active(&self) -> bool {
        self.0.read().await.is_some()
    }
}

#[async_trait]
impl SampleSink for ActivePeer {
    async fn write_sample(&self, packet: &SamplePacket) -> anyhow::Result<()> {
        // Clone out so the lock is not held across the write.
        let peer = self.0.read().await.clone().context("no active peer")?;
        peer.write_sample(packet).await
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PlayerExit,
    PeerClosed(PeerEvent),
    InputClosed,
    GameExited,
    Cancelled,
}

pub struct AgentOptions {
    pub host_id: String,
    pub ice: IceConfig,
    pub watch: bool,
    pub poll: Duration,
    pub capture_area: CaptureArea,
    pub launch_game: bool,
    pub connect_timeout: Duration,
}

pub struct Agent {
    options: AgentOptions,
    broker: BrokerClient<Channel>,
    signaling: SignalingClient<Channel>,
    trickle: TrickleRelay,
    areas: Broadcast<CaptureArea>,
    active: Arc<ActivePeer>,
    input: Box<dyn InputSink>,
}

impl Agent {
    pub fn new(
        options: AgentOptions,
        channel: Channel,
        areas: Broadcast<CaptureArea>,
        active: Arc<ActivePeer>,
        input: Box<dyn InputSink>,
    ) -> Self {
        let signaling = SignalingClient::new(channel.clone());
        Self {
            options,
            broker: BrokerClient::new(channel),
            trickle: TrickleRelay::new(signaling.clone()),
            signaling,
            areas,
            active,
            input,
        }
    }

    /// Serve sessions one after another until `cancel` fires. A failed
    /// session is logged and released; only losing the broker stops the loop.
    pub async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        info!(host_id = %self.options.host_id, "Waiting for sessions");
        while !cancel.is_cancelled() {
            let Some(assigned) = self.next_session(cancel).await? else {
                break;
            };
            let session_id = assigned.session_id;
            match self.serve_session(assigned, cancel).await {
                Ok(end) => info!(%session_id, ?end, "Session finished"),
                Err(e) => warn!(%session_id, "Session failed: {e:#}"),
            }
        }
        Ok(())
    }

    /// Wait for one session and drive it to the end. `Ok(None)` if cancelled
    /// before a session was assigned.
    pub async fn run_session(&mut self, cancel: &CancellationToken) -> anyhow::Result<Option<SessionEnd>> {
        match self.next_session(cancel).await? {
            Some(assigned) => self.serve_session(assigned, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    async fn next_session(&mut self, cancel: &CancellationToken) -> anyhow::Result<Option<AssignedSession>> {
        let host_id = self.options.host_id.clone();
        if self.options.watch {
            watch_for_session(&mut self.broker, &host_id, cancel).await
        } else {
            wait_for_session(&mut self.broker, &host_id, self.options.poll, cancel).await
        }
    }

    /// Drive an assigned session to its end, then release it whatever the
    /// outcome.
    async fn serve_session(
        &mut self,
        assigned: AssignedSession,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SessionEnd> {
        let host_id = self.options.host_id.clone();
        let session_id = assigned.session_id;

        let scope = cancel.child_token();
        let result = self.play(&assigned, &scope).await;
        scope.cancel();
        self.active.set(None).await;
        self.trickle.deregister(session_id).await;

        if let Err(e) = self
            .broker
            .delete_session(DeleteSessionRequest {
                session_id: session_id.to_string(),
                allocated_server_id: host_id,
            })
            .await
        {
            warn!(%session_id, "Failed to release session: {}", e.message());
        } else {
            info!(%session_id, "Session released");
        }
        result
    }

    async fn play(&mut self, assigned: &AssignedSession, scope: &CancellationToken) -> anyhow::Result<SessionEnd> {
        let session_id = assigned.session_id;

        let Some(offer) = wait_for_offer(&mut self.signaling, session_id, self.options.poll, scope).await? else {
            return Ok(SessionEnd::Cancelled);
        };

        let (peer, channels) = AnswerPeer::new(&self.options.ice).await?;
        let peer = Arc::new(peer);
        let result = self
            .stream(session_id, &assigned.metadata, offer, &peer, channels, scope)
            .await;
        if let Err(e) = peer.close().await {
            debug!(%session_id, "Closing peer: {e}");
        }
        result
    }

    async fn stream(
        &mut self,
        session_id: SessionId,
        metadata: &GameMetadata,
        offer: RTCSessionDescription,
        peer: &Arc<AnswerPeer>,
        channels: PeerChannels,
        scope: &CancellationToken,
    ) -> anyhow::Result<SessionEnd> {
        let PeerChannels {
            mut events,
            local_candidates,
            input,
        } = channels;
        self.start_trickle(session_id, peer, local_candidates, scope).await;

        let answer = peer.answer(offer).await?;
        self.signaling
            .send_signaling_answer(SendSignalingAnswerRequest {
                session_id: session_id.to_string(),
                signaling_answer: Some(SignalingAnswer {
                    body: encode_sdp(&answer)?,
                }),
            })
            .await
            .context("SendSignalingAnswer failed")?;
        info!(%session_id, "Answer sent, waiting for connection");

        tokio::select! {
            _ = scope.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = tokio::time::timeout(self.options.connect_timeout, wait_connected(&mut events)) => {
                connected
                    .context("Timed out waiting for the player to connect")?
                    .context("Peer connection did not come up")?;
            }
        }
        info!(%session_id, "Player connected");

        let mut game = if self.options.launch_game {
            Some(launch_game(metadata)?)
        } else {
            None
        };

        self.active.set(Some(Arc::clone(peer))).await;
        let areas = self.areas.subscribe().await?;
        // Each session starts from the configured area.
        self.areas.publish(self.options.capture_area).await?;

        let end = tokio::select! {
            outcome = run_input(input, areas, self.areas.clone(), self.input.as_mut(), scope) => match outcome {
                InputOutcome::Exit => SessionEnd::PlayerExit,
                InputOutcome::Closed => SessionEnd::InputClosed,
                InputOutcome::Cancelled => SessionEnd::Cancelled,
            },
            state = wait_disconnected(&mut events) => SessionEnd::PeerClosed(state),
            status = wait_game(game.as_mut()) => {
                info!(%session_id, ?status, "Game process exited");
                SessionEnd::GameExited
            }
        };
        Ok(end)
    }

    /// Register the trickle stream and wire both candidate directions to the peer.
    async fn start_trickle(
        &self,
        session_id: SessionId,
        peer: &Arc<AnswerPeer>,
        mut local: mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>>,
        scope: &CancellationToken,
    ) {
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<String>();
        self.trickle
            .register(
                session_id,
                move |body| {
                    let _ = remote_tx.send(body);
                },
                scope.clone(),
            )
            .await;

        // Player candidates -> peer.
        let remote_peer = Arc::clone(peer);
        tokio::spawn(async move {
            while let Some(body) = remote_rx.recv().await {
                match decode_candidate(&body) {
                    Ok(Some(candidate)) => {
                        if let Err(e) = remote_peer.add_remote_candidate(candidate).await {
                            warn!(%session_id, "Rejected player candidate: {e}");
                        }
                    }
                    Ok(None) => {
                        debug!(%session_id, "Player finished gathering candidates");
                        break;
                    }
                    Err(e) => warn!(%session_id, "Undecodable player candidate: {e}"),
                }
            }
        });

        // Local candidates -> broker.
        let trickle = self.trickle.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = scope.cancelled() => break,
                    next = local.recv() => next,
                };
                let Some(candidate) = next else { break };
                let done = candidate.is_none();
                let body = match candidate.as_ref().map(encode_candidate).transpose() {
                    Ok(body) => body.unwrap_or_default(),
                    Err(e) => {
                        warn!(%session_id, "Failed to encode local candidate: {e}");
                        continue;
                    }
                };
                if let Err(e) = trickle.send_candidate(session_id, body).await {
                    debug!(%session_id, "Stopped forwarding local candidates: {e}");
                    break;
                }
                if done {
                    debug!(%session_id, "Finished gathering local candidates");
                    break;
                }
            }
        });
    }
}

/// Start the game's command line with the agent's environment.
fn launch_game(metadata: &GameMetadata) -> anyhow::Result<Child> {
    let (program, args) = metadata.parse_command()?;
    info!(game_id = %metadata.game_id, %program, "Launching game");
    Command::new(&program)
        .args(&args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to launch {program}"))
}

async fn wait_game(game: Option<&mut Child>) -> Option<std::process::ExitStatus> {
    match game {
        Some(child) => child.wait().await.ok(),
        None => std::future::pending().await,
    }
}
