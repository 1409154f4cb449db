//! Session-description and candidate codecs, and the offer poll.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cloudplay_protocol::SessionId;
use cloudplay_protocol::proto::ReceiveSignalingOfferRequest;
use cloudplay_protocol::proto::signaling_client::SignalingClient;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("session description is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Base64 of the JSON form of a session description, as browsers send it.
pub fn encode_sdp(desc: &RTCSessionDescription) -> Result<String, CodecError> {
    let json = serde_json::to_vec(desc)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_sdp(body: &str) -> Result<RTCSessionDescription, CodecError> {
    let json = STANDARD.decode(body.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

pub fn encode_candidate(candidate: &RTCIceCandidateInit) -> Result<String, CodecError> {
    Ok(serde_json::to_string(candidate)?)
}

/// `None` for the empty end-of-candidates body.
pub fn decode_candidate(body: &str) -> Result<Option<RTCIceCandidateInit>, CodecError> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(body)?))
}

/// Poll `ReceiveSignalingOffer` until the player's offer shows up.
/// Returns `Ok(None)` if `cancel` fires first.
pub async fn wait_for_offer(
    client: &mut SignalingClient<Channel>,
    session_id: SessionId,
    poll: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<RTCSessionDescription>> {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = ticker.tick() => {}
        }
        let resp = client
            .receive_signaling_offer(ReceiveSignalingOfferRequest {
                session_id: session_id.to_string(),
            })
            .await?
            .into_inner();
        let Some(offer) = resp.offer.filter(|_| resp.found) else {
            continue;
        };
        match decode_sdp(&offer.body) {
            Ok(desc) => {
                tracing::info!(%session_id, "Received offer from player");
                return Ok(Some(desc));
            }
            // A garbled offer is the player's fault; keep waiting for a good one.
            Err(e) => tracing::warn!(%session_id, "Discarding undecodable offer: {e}"),
        }
    }
}
