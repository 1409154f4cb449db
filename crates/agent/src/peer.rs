use std::sync::Arc;

use anyhow::Context;
use cloudplay_protocol::{IceConfig, InputEvent, SamplePacket};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const INPUT_CHANNEL_LABEL: &str = "input";
const INPUT_QUEUE: usize = 256;

/// Connection state transitions, published on a `watch` channel instead of
/// connect/disconnect callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    New,
    Connecting,
    Connected,
    /// ICE lost connectivity; it may still recover.
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerEvent {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerEvent::New,
            RTCPeerConnectionState::Connecting => PeerEvent::Connecting,
            RTCPeerConnectionState::Connected => PeerEvent::Connected,
            RTCPeerConnectionState::Disconnected => PeerEvent::Disconnected,
            RTCPeerConnectionState::Failed => PeerEvent::Failed,
            RTCPeerConnectionState::Closed => PeerEvent::Closed,
        }
    }
}

impl PeerEvent {
    /// The connection will not come back from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerEvent::Failed | PeerEvent::Closed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer connection ended before connecting ({0:?})")]
pub struct PeerEnded(pub Option<PeerEvent>);

/// Wait for `Connected`. Fails if the connection reaches a terminal state or
/// the peer is dropped first.
pub async fn wait_connected(events: &mut watch::Receiver<PeerEvent>) -> Result<(), PeerEnded> {
    match events.wait_for(|e| *e == PeerEvent::Connected || e.is_terminal()).await {
        Ok(e) if *e == PeerEvent::Connected => Ok(()),
        Ok(e) => Err(PeerEnded(Some(*e))),
        Err(_) => Err(PeerEnded(None)),
    }
}

/// Wait until the connection is over for good.
pub async fn wait_disconnected(events: &mut watch::Receiver<PeerEvent>) -> PeerEvent {
    match events.wait_for(|e| e.is_terminal()).await {
        Ok(e) => *e,
        Err(_) => PeerEvent::Closed,
    }
}

/// Receiving ends of a new peer's event sources.
pub struct PeerChannels {
    pub events: watch::Receiver<PeerEvent>,
    /// Locally gathered candidates; `None` once gathering is complete.
    pub local_candidates: mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>>,
    /// Events decoded from the player's `input` data channel.
    pub input: mpsc::Receiver<InputEvent>,
}

/// Answer-side peer connection sending H.264 video and Opus audio.
pub struct AnswerPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    /// Remote candidates that arrived before the offer was applied.
    /// `None` once the remote description is set.
    pending_candidates: Mutex<Option<Vec<RTCIceCandidateInit>>>,
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

fn media_engine() -> anyhow::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    // Only H.264 and Opus; offering other codecs lets browsers pick one we
    // never send.
    let feedback = [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli"), ("transport-cc", "")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.into(),
            parameter: parameter.into(),
        })
        .collect();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_string(),
                rtcp_feedback: feedback,
            },
            payload_type: 125,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(media_engine)
}

impl AnswerPeer {
    pub async fn new(ice: &IceConfig) -> anyhow::Result<(Self, PeerChannels)> {
        let mut media_engine = media_engine()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "cloudplay".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "cloudplay".to_string(),
        ));
        peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;
        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;

        let (event_tx, events) = watch::channel(PeerEvent::New);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let event = PeerEvent::from(state);
            match event {
                PeerEvent::Disconnected => warn!("Peer connection disconnected (ICE may recover)"),
                PeerEvent::Failed => warn!("Peer connection failed"),
                _ => info!(?event, "Peer connection state changed"),
            }
            event_tx.send_replace(event);
            Box::pin(async {})
        }));

        let (candidate_tx, local_candidates) = mpsc::unbounded_channel();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let item = match candidate {
                None => None,
                Some(c) => match c.to_json() {
                    Ok(init) => Some(init),
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {e}");
                        return Box::pin(async {});
                    }
                },
            };
            let _ = candidate_tx.send(item);
            Box::pin(async {})
        }));

        let (input_tx, input) = mpsc::channel(INPUT_QUEUE);
        peer_connection.on_data_channel(Box::new(move |dc| {
            let input_tx = input_tx.clone();
            Box::pin(async move {
                if dc.label() != INPUT_CHANNEL_LABEL {
                    debug!(label = dc.label(), "Ignoring data channel");
                    return;
                }
                info!("Input data channel opened");
                dc.on_message(Box::new(move |msg| {
                    match serde_json::from_slice::<InputEvent>(&msg.data) {
                        Ok(event) => {
                            if input_tx.try_send(event).is_err() {
                                warn!("Input queue full, dropping event");
                            }
                        }
                        Err(e) => warn!("Invalid input event: {e}"),
                    }
                    Box::pin(async {})
                }));
            })
        }));

        info!("WebRTC answer peer created");
        Ok((
            Self {
                peer_connection,
                video_track,
                audio_track,
                pending_candidates: Mutex::new(Some(Vec::new())),
            },
            PeerChannels {
                events,
                local_candidates,
                input,
            },
        ))
    }

    /// Apply the player's offer and produce the local answer. Candidates
    /// buffered before the offer are applied once it is set.
    pub async fn answer(&self, offer: RTCSessionDescription) -> anyhow::Result<RTCSessionDescription> {
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let pending = self.pending_candidates.lock().await.take().unwrap_or_default();
        for candidate in pending {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!("Dropping buffered remote candidate: {e}");
            }
        }

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        debug!(sdp_len = answer.sdp.len(), "Answer created");
        Ok(answer)
    }

    /// Apply a remote candidate, or buffer it until the offer is applied.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()> {
        {
            let mut pending = self.pending_candidates.lock().await;
            if let Some(buffer) = pending.as_mut() {
                buffer.push(candidate);
                return Ok(());
            }
        }
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .context("Failed to add ICE candidate")
    }

    /// Number of remote candidates waiting for the offer, if it has not been
    /// applied yet.
    pub async fn pending_candidates(&self) -> Option<usize> {
        self.pending_candidates.lock().await.as_ref().map(Vec::len)
    }

    pub async fn write_video_sample(&self, packet: &SamplePacket) -> anyhow::Result<()> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::copy_from_slice(&packet.data),
                duration: packet.duration,
                ..Default::default()
            })
            .await
            .context("Failed to write video sample")
    }

    pub async fn write_audio_sample(&self, packet: &SamplePacket) -> anyhow::Result<()> {
        self.audio_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::copy_from_slice(&packet.data),
                duration: packet.duration,
                ..Default::default()
            })
            .await
            .context("Failed to write audio sample")
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    fn no_ice() -> IceConfig {
        IceConfig {
            stun_urls: vec![],
            ..Default::default()
        }
    }

    /// Browser stand-in: receives video and opens the input channel.
    async fn offerer() -> RTCPeerConnection {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        pc.create_data_channel(INPUT_CHANNEL_LABEL, None)
            .await
            .unwrap();
        pc
    }

    #[test]
    fn state_mapping() {
        assert_eq!(PeerEvent::from(RTCPeerConnectionState::Connected), PeerEvent::Connected);
        assert_eq!(PeerEvent::from(RTCPeerConnectionState::Unspecified), PeerEvent::New);
        assert!(PeerEvent::Failed.is_terminal());
        assert!(PeerEvent::Closed.is_terminal());
        assert!(!PeerEvent::Disconnected.is_terminal());
    }

    #[test]
    fn turn_credentials_are_attached() {
        let ice = IceConfig {
            stun_urls: vec!["stun:stun.example.com:3478".into()],
            turn_urls: vec!["turn:turn.example.com:3478".into()],
            turn_username: Some("u".into()),
            turn_credential: Some("p".into()),
        };
        let servers = ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "u");
        assert_eq!(servers[1].credential, "p");
        assert!(ice_servers(&no_ice()).is_empty());
    }

    #[tokio::test]
    async fn wait_connected_sees_connection() {
        let (tx, mut rx) = watch::channel(PeerEvent::New);
        let waiter = tokio::spawn(async move { wait_connected(&mut rx).await });
        tx.send_replace(PeerEvent::Connecting);
        tx.send_replace(PeerEvent::Connected);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_connected_fails_on_terminal_state() {
        let (tx, mut rx) = watch::channel(PeerEvent::Connecting);
        tx.send_replace(PeerEvent::Failed);
        let err = wait_connected(&mut rx).await.unwrap_err();
        assert_eq!(err.0, Some(PeerEvent::Failed));

        let (tx, mut rx) = watch::channel(PeerEvent::New);
        drop(tx);
        assert_eq!(wait_connected(&mut rx).await.unwrap_err().0, None);
    }

    #[tokio::test]
    async fn transient_disconnect_is_not_the_end() {
        let (tx, mut rx) = watch::channel(PeerEvent::Connected);
        let waiter = tokio::spawn(async move { wait_disconnected(&mut rx).await });
        tx.send_replace(PeerEvent::Disconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        tx.send_replace(PeerEvent::Closed);
        assert_eq!(waiter.await.unwrap(), PeerEvent::Closed);
    }

    #[tokio::test]
    async fn answers_a_browser_offer() {
        let browser = offerer().await;
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();

        let (peer, _channels) = AnswerPeer::new(&no_ice()).await.unwrap();
        let answer = peer.answer(offer).await.unwrap();
        assert_eq!(answer.sdp_type, RTCSdpType::Answer);
        assert!(answer.sdp.contains("H264"));

        browser.set_remote_description(answer).await.unwrap();
        peer.close().await.unwrap();
        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn early_candidates_wait_for_the_offer() {
        let browser = offerer().await;
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();

        let (peer, _channels) = AnswerPeer::new(&no_ice()).await.unwrap();
        let candidate = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        peer.add_remote_candidate(candidate).await.unwrap();
        assert_eq!(peer.pending_candidates().await, Some(1));

        peer.answer(offer).await.unwrap();
        assert_eq!(peer.pending_candidates().await, None);
        peer.close().await.unwrap();
        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_published_as_an_event() {
        let (peer, mut channels) = AnswerPeer::new(&no_ice()).await.unwrap();
        peer.close().await.unwrap();
        let ended = tokio::time::timeout(
            Duration::from_secs(5),
            wait_disconnected(&mut channels.events),
        )
        .await
        .unwrap();
        assert_eq!(ended, PeerEvent::Closed);
    }
}
