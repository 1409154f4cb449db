//! gRPC messages for the `cloudplay` package.
//!
//! Messages are declared by hand with `prost` derives; the `Broker` and
//! `Signaling` service stubs are generated by `build.rs` and included below.

use prost::Message;

/// Serialized game metadata as carried on the wire (JSON of `GameMetadata`).
#[derive(Clone, PartialEq, Message)]
pub struct GameMetadataBody {
    #[prost(string, tag = "1")]
    pub body: String,
}

/// A session as seen by an allocated host.
#[derive(Clone, PartialEq, Message)]
pub struct Session {
    #[prost(string, tag = "1")]
    pub session_id: String,

    /// Identity of the host the session is bound to.
    #[prost(string, tag = "2")]
    pub allocated_server_id: String,

    #[prost(string, tag = "3")]
    pub game_id: String,

    /// Lifecycle state: `waiting_for_session`, `signaling` or `provisioning`.
    #[prost(string, tag = "4")]
    pub state: String,

    #[prost(message, optional, tag = "5")]
    pub game_metadata: Option<GameMetadataBody>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindSessionRequest {
    #[prost(string, tag = "1")]
    pub allocated_server_id: String,
}

/// `found = false` is a normal polling outcome, not an error.
#[derive(Clone, PartialEq, Message)]
pub struct FindSessionResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,

    #[prost(message, optional, tag = "2")]
    pub session: Option<Session>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WatchSessionRequest {
    #[prost(string, tag = "1")]
    pub allocated_server_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WatchSessionResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,

    #[prost(message, optional, tag = "2")]
    pub session: Option<Session>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteSessionRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,

    /// Caller's host identity; must match the session's bound host.
    #[prost(string, tag = "2")]
    pub allocated_server_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteSessionResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct GetGameMetadataRequest {
    #[prost(string, tag = "1")]
    pub game_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetGameMetadataResponse {
    #[prost(message, optional, tag = "1")]
    pub game_metadata: Option<GameMetadataBody>,
}

/// Base64 of a JSON-encoded session description.
#[derive(Clone, PartialEq, Message)]
pub struct SignalingOffer {
    #[prost(string, tag = "1")]
    pub body: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignalingAnswer {
    #[prost(string, tag = "1")]
    pub body: String,
}

/// JSON-encoded ICE candidate init. An empty body marks end-of-candidates.
#[derive(Clone, PartialEq, Message)]
pub struct IceCandidate {
    #[prost(string, tag = "1")]
    pub body: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiveSignalingOfferRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiveSignalingOfferResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,

    #[prost(message, optional, tag = "2")]
    pub offer: Option<SignalingOffer>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SendSignalingAnswerRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,

    #[prost(message, optional, tag = "2")]
    pub signaling_answer: Option<SignalingAnswer>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SendSignalingAnswerResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct TrickleSignalingRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,

    #[prost(message, optional, tag = "2")]
    pub candidate: Option<IceCandidate>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TrickleSignalingResponse {
    #[prost(string, tag = "1")]
    pub session_id: String,

    #[prost(message, optional, tag = "2")]
    pub candidate: Option<IceCandidate>,
}

impl TrickleSignalingRequest {
    pub fn new(session_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            candidate: Some(IceCandidate { body: body.into() }),
        }
    }

    /// Candidate body, empty when the message carries none.
    pub fn body(&self) -> &str {
        self.candidate.as_ref().map(|c| c.body.as_str()).unwrap_or_default()
    }
}

impl TrickleSignalingResponse {
    pub fn new(session_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            candidate: Some(IceCandidate { body: body.into() }),
        }
    }

    pub fn body(&self) -> &str {
        self.candidate.as_ref().map(|c| c.body.as_str()).unwrap_or_default()
    }
}

include!(concat!(env!("OUT_DIR"), "/cloudplay.Broker.rs"));
include!(concat!(env!("OUT_DIR"), "/cloudplay.Signaling.rs"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_session_response_survives_encoding() {
        let resp = FindSessionResponse {
            found: true,
            session: Some(Session {
                session_id: "5f0c6b0e-5d3c-4c1c-8f5e-3c4c1b2a9d00".into(),
                allocated_server_id: "host-a".into(),
                game_id: "chess".into(),
                state: "signaling".into(),
                game_metadata: Some(GameMetadataBody {
                    body: r#"{"game_id":"chess","command":"chess --fast"}"#.into(),
                }),
            }),
        };
        let bytes = resp.encode_to_vec();
        let decoded = FindSessionResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn missing_candidate_reads_as_empty_body() {
        let req = TrickleSignalingRequest {
            session_id: "s".into(),
            candidate: None,
        };
        assert_eq!(req.body(), "");
        assert_eq!(TrickleSignalingResponse::new("s", "c1").body(), "c1");
    }

    #[test]
    fn default_not_found_response_is_empty_on_the_wire() {
        let resp = ReceiveSignalingOfferResponse::default();
        assert!(!resp.found);
        assert!(resp.offer.is_none());
        assert!(resp.encode_to_vec().is_empty());
    }
}
