//! JSON wire protocol for completion sessions.
//!
//! One message per WebSocket text frame. Every message carries an `id`
//! (correlation id) and usually a `session`; the `event` field selects
//! the variant:
//!
//! ```text
//! client → server   {"id","session","event":"predict","prefix","suffix"}
//! server → client   {"id","session","event":"sessionInfo","errorCode":0}        (unsolicited, once)
//! server → client   {"id","session","event":"predictResponse","prediction"?,
//!                    "errorCode","errorMessage"?}
//! server → client   h                                                          (heartbeat, not JSON)
//! ```
//!
//! `errorCode == 0` is the only success value.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Heartbeat sentinel written by the server between messages.
pub const HEARTBEAT_FRAME: &str = "h";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation (unauthorized, session mismatch).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close reason sent with [`CLOSE_POLICY_VIOLATION`] when a request names
/// another session.
pub const CLOSE_REASON_SESSION_MISMATCH: &str = "session mismatch";

/// Success value of `errorCode`.
pub const ERROR_CODE_OK: i32 = 0;
/// `errorCode` used when the connection-service failed a request.
pub const ERROR_CODE_INTERNAL: i32 = 500;

/// Server-issued session binding a socket to one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
}

impl Session {
    pub fn new(sid: impl Into<String>) -> Self {
        Self { sid: sid.into() }
    }

    /// Mint a fresh, short session id.
    pub fn generate() -> Self {
        let mut sid = Uuid::new_v4().simple().to_string();
        sid.truncate(8);
        Self { sid }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sid)
    }
}

/// Completion request for the text around the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictRequest {
    /// Correlation id. Left empty, the connection assigns one on send.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    pub prefix: String,
    pub suffix: String,
}

impl PredictRequest {
    pub fn new(session: Option<Session>, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            session,
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Reply to a [`PredictRequest`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PredictResponse {
    pub fn success(id: impl Into<String>, session: Option<Session>, prediction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session,
            prediction: Some(prediction.into()),
            error_code: ERROR_CODE_OK,
            error_message: None,
        }
    }

    pub fn failure(
        id: impl Into<String>,
        session: Option<Session>,
        error_code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session,
            prediction: None,
            error_code,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ERROR_CODE_OK
    }
}

/// Unsolicited handshake sent right after accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub session: Session,
    pub error_code: i32,
}

impl SessionInfo {
    pub fn new(session: Session) -> Self {
        Self {
            id: format!("server-session-{}", session.sid),
            session,
            error_code: ERROR_CODE_OK,
        }
    }
}

/// Top-level protocol message, discriminated by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Message {
    #[serde(rename = "predict")]
    Predict(PredictRequest),
    #[serde(rename = "predictResponse")]
    PredictResponse(PredictResponse),
    #[serde(rename = "sessionInfo")]
    SessionInfo(SessionInfo),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Self::Predict(m) => &m.id,
            Self::PredictResponse(m) => &m.id,
            Self::SessionInfo(m) => &m.id,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Predict(m) => m.session.as_ref(),
            Self::PredictResponse(m) => m.session.as_ref(),
            Self::SessionInfo(m) => Some(&m.session),
        }
    }

    pub fn event(&self) -> &'static str {
        match self {
            Self::Predict(_) => "predict",
            Self::PredictResponse(_) => "predictResponse",
            Self::SessionInfo(_) => "sessionInfo",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    Message(Message),
}

impl Frame {
    /// Decode one text frame. Heartbeats are recognised before any JSON
    /// parsing happens.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text == HEARTBEAT_FRAME {
            return Ok(Self::Heartbeat);
        }

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let event = value
            .get("event")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingField("event"))?;

        match event {
            "predict" | "predictResponse" | "sessionInfo" => serde_json::from_value(value)
                .map(Self::Message)
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
            other => Err(ProtocolError::UnexpectedEvent(other.to_string())),
        }
    }
}

/// Frame-level errors. Never fatal for a connection: the frame is
/// dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unexpected event `{0}`")]
    UnexpectedEvent(String),
    #[error("encode error: {0}")]
    Encode(String),
}
