use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier, generated once at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

#[derive(Debug, thiserror::Error)]
pub enum SessionIdError {
    #[error("malformed session id '{0}'")]
    Malformed(String),
}

impl SessionId {
    /// Fresh random (v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| SessionIdError::Malformed(s.to_string()))
    }
}

/// Operation carried by a WebSocket signaling envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Player's SDP offer (inbound)
    Offer,
    /// Host's SDP answer (outbound)
    Answer,
    /// Trickle ICE candidate, either direction
    IceCandidate,
    /// Reserved: session creation happens over `POST /newgame/{game_id}`
    NewGame,
}

/// Signaling envelope exchanged between the player's browser and the broker.
///
/// `body` is opaque to the broker: base64 of a JSON session description for
/// offers and answers, JSON of an ICE candidate init for candidates. An empty
/// candidate body marks end-of-candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub body: String,
}

impl SignalingMessage {
    pub fn offer(session_id: SessionId, body: impl Into<String>) -> Self {
        Self {
            operation: Operation::Offer,
            session_id: Some(session_id),
            body: body.into(),
        }
    }

    pub fn answer(session_id: SessionId, body: impl Into<String>) -> Self {
        Self {
            operation: Operation::Answer,
            session_id: Some(session_id),
            body: body.into(),
        }
    }

    pub fn ice_candidate(session_id: SessionId, body: impl Into<String>) -> Self {
        Self {
            operation: Operation::IceCandidate,
            session_id: Some(session_id),
            body: body.into(),
        }
    }
}

/// Response to `POST /newgame/{game_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGameResponse {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataBodyError {
    #[error("game metadata has an empty command")]
    EmptyCommand,
    #[error("malformed game metadata body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Launch information for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMetadata {
    pub game_id: String,
    pub command: String,
}

impl GameMetadata {
    pub fn new(game_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            command: command.into(),
        }
    }

    /// Split the command line into program and arguments on whitespace.
    pub fn parse_command(&self) -> Result<(String, Vec<String>), MetadataBodyError> {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(MetadataBodyError::EmptyCommand)?;
        Ok((program, parts.collect()))
    }

    /// Serialized form carried in gRPC `GameMetadataBody.body`.
    pub fn to_body(&self) -> Result<String, MetadataBodyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_body(body: &str) -> Result<Self, MetadataBodyError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Input events sent by the player over the WebRTC `input` data channel
/// (compact format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum InputEvent {
    /// Key press/release
    #[serde(rename = "k")]
    Key {
        /// Key code
        c: u16,
        /// true = pressed, false = released
        d: bool,
    },
    /// Mouse move: normalized coordinates (0.0 - 1.0) within the capture area
    #[serde(rename = "m")]
    MouseMove { x: f64, y: f64 },
    /// Mouse button press/release
    #[serde(rename = "b")]
    Button {
        /// Button index (0=left, 1=middle, 2=right)
        b: u8,
        d: bool,
    },
    /// Scroll event
    #[serde(rename = "s")]
    Scroll { dx: f64, dy: f64 },
    /// Capture resolution change request
    #[serde(rename = "r")]
    Resize { w: u32, h: u32 },
    /// Player asked to leave the game
    #[serde(rename = "x")]
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_display_parses_back() {
        let id = SessionId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text, text.to_lowercase());
        assert_eq!(text.parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn session_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<SessionId>().unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }

    #[test]
    fn fresh_session_ids_differ() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn offer_envelope_from_browser() {
        let json = r#"{
            "operation": "offer",
            "session_id": "00000000-0000-0000-0000-000000000000",
            "body": "eyJ0eXBlIjoib2ZmZXIifQ=="
        }"#;
        let msg: SignalingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.operation, Operation::Offer);
        assert_eq!(msg.session_id, Some(SessionId::from(Uuid::nil())));
        assert_eq!(msg.body, "eyJ0eXBlIjoib2ZmZXIifQ==");
    }

    #[test]
    fn ice_candidate_operation_is_snake_case() {
        let msg = SignalingMessage::ice_candidate(SessionId::from(Uuid::nil()), "{}");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""operation":"ice_candidate""#));
        assert!(!json.contains("ice-candidate"));
    }

    #[test]
    fn session_id_omitted_when_unknown() {
        let msg = SignalingMessage {
            operation: Operation::Answer,
            session_id: None,
            body: "x".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("session_id"));
    }

    #[test]
    fn missing_body_defaults_to_empty() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"operation":"ice_candidate"}"#).unwrap();
        assert!(msg.body.is_empty());
        assert!(msg.session_id.is_none());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let res = serde_json::from_str::<SignalingMessage>(r#"{"operation":"bogus","body":""}"#);
        assert!(res.is_err());
    }

    #[test]
    fn new_game_response_uses_camel_case_key() {
        let resp = NewGameResponse {
            session_id: SessionId::from(Uuid::nil()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"sessionId":"00000000-0000-0000-0000-000000000000"}"#
        );
    }

    #[test]
    fn parse_command_splits_program_and_args() {
        let md = GameMetadata::new("chess", "/usr/games/chess --depth 3");
        let (program, args) = md.parse_command().unwrap();
        assert_eq!(program, "/usr/games/chess");
        assert_eq!(args, vec!["--depth", "3"]);

        let bare = GameMetadata::new("solo", "solitaire");
        let (program, args) = bare.parse_command().unwrap();
        assert_eq!(program, "solitaire");
        assert!(args.is_empty());
    }

    #[test]
    fn parse_command_rejects_blank() {
        let md = GameMetadata::new("chess", "   ");
        assert!(matches!(
            md.parse_command(),
            Err(MetadataBodyError::EmptyCommand)
        ));
    }

    #[test]
    fn metadata_body_is_json() {
        let md = GameMetadata::new("chess", "chess --fast");
        let body = md.to_body().unwrap();
        assert!(body.contains(r#""game_id":"chess""#));
        assert_eq!(GameMetadata::from_body(&body).unwrap(), md);
        assert!(GameMetadata::from_body("gameId: chess").is_err());
    }

    #[test]
    fn input_event_compact_format() {
        let key = InputEvent::Key { c: 30, d: true };
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains(r#""t":"k""#));
        assert!(json.contains(r#""c":30"#));

        let resize = InputEvent::Resize { w: 1280, h: 720 };
        let json = serde_json::to_string(&resize).unwrap();
        assert!(json.contains(r#""t":"r""#));

        let exit: InputEvent = serde_json::from_str(r#"{"t":"x"}"#).unwrap();
        assert_eq!(exit, InputEvent::Exit);
    }

    #[test]
    fn input_event_from_browser() {
        let event: InputEvent = serde_json::from_str(r#"{"t":"m","x":0.5,"y":0.25}"#).unwrap();
        match event {
            InputEvent::MouseMove { x, y } => {
                assert_eq!(x, 0.5);
                assert_eq!(y, 0.25);
            }
            _ => panic!("Expected MouseMove"),
        }
    }
}
