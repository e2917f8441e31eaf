//! Wire protocol spoken between rendezvous peers and the relay server.
//!
//! Every frame is one JSON object: an integer `type` tag with the body fields
//! merged at the top level, e.g.
//! `{"type":5,"sd":{..},"from":"c1","to":"c2","authCode":"pw2"}`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Name of the tag field shared by every frame.
pub const TYPE_FIELD: &str = "type";

/// Numeric frame tags. Requests are odd, their responses follow them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegisterRequest = 1,
    RegisterResponse = 2,
    HeartbeatRequest = 3,
    HeartbeatResponse = 4,
    SdpRequest = 5,
    SdpResponse = 6,
    CandidateRequest = 7,
    CandidateResponse = 8,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            1 => Self::RegisterRequest,
            2 => Self::RegisterResponse,
            3 => Self::HeartbeatRequest,
            4 => Self::HeartbeatResponse,
            5 => Self::SdpRequest,
            6 => Self::SdpResponse,
            7 => Self::CandidateRequest,
            8 => Self::CandidateResponse,
            _ => return None,
        })
    }

    pub fn is_response(self) -> bool {
        self.tag() % 2 == 0
    }

    /// Short label used in logs and metric labels.
    pub fn label(self) -> &'static str {
        match self {
            Self::RegisterRequest => "register",
            Self::RegisterResponse => "register_response",
            Self::HeartbeatRequest => "heartbeat",
            Self::HeartbeatResponse => "heartbeat_response",
            Self::SdpRequest => "sdp",
            Self::SdpResponse => "sdp_response",
            Self::CandidateRequest => "candidate",
            Self::CandidateResponse => "candidate_response",
        }
    }
}

/// Opaque session-description blob produced by a transport engine.
///
/// The relay never looks inside it; engines pick their own JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(Value);

impl SessionDescription {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self)
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }
}

impl From<&str> for SessionDescription {
    fn from(blob: &str) -> Self {
        Self(Value::String(blob.to_string()))
    }
}

impl From<String> for SessionDescription {
    fn from(blob: String) -> Self {
        Self(Value::String(blob))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub cid: String,
    pub auth_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpBody {
    pub sd: SessionDescription,
    pub from: String,
    pub to: String,
    /// Shared secret of the *target* identity. Answers leave it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBody {
    pub candidate: String,
    pub from: String,
    pub to: String,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No live connection is registered for the `to` identity.
    TargetUnreachable,
    /// The attached secret does not match the target's.
    Unauthorized,
    /// `from` is not registered on the connection that sent the frame.
    UnknownSender,
}

impl FailureReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::TargetUnreachable => "target_unreachable",
            Self::Unauthorized => "unauthorized",
            Self::UnknownSender => "unknown_sender",
        }
    }
}

/// Response body: the request body echoed back with an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt<B> {
    #[serde(flatten)]
    pub body: B,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl<B> Receipt<B> {
    pub fn ok(body: B) -> Self {
        Self {
            body,
            success: true,
            reason: None,
        }
    }

    pub fn failed(body: B, reason: FailureReason) -> Self {
        Self {
            body,
            success: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegisterRequest(RegisterBody),
    RegisterResponse(Receipt<RegisterBody>),
    HeartbeatRequest,
    HeartbeatResponse,
    SdpRequest(SdpBody),
    SdpResponse(Receipt<SdpBody>),
    CandidateRequest(CandidateBody),
    CandidateResponse(Receipt<CandidateBody>),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no integer type tag")]
    Untyped,
    #[error("unknown message type {0}")]
    UnknownType(u64),
    #[error("invalid {kind:?} body: {source}")]
    InvalidBody {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{0:?} body does not serialize to a json object")]
    BodyNotObject(MessageType),
}

impl ProtocolError {
    /// Whether the connection that produced this frame must be dropped.
    /// Untyped and unknown frames are discarded and the connection lives on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Untyped | Self::UnknownType(_))
    }
}

impl Message {
    pub fn register(cid: impl Into<String>, auth_code: impl Into<String>) -> Self {
        Self::RegisterRequest(RegisterBody {
            cid: cid.into(),
            auth_code: auth_code.into(),
        })
    }

    pub fn sdp(
        sd: SessionDescription,
        from: impl Into<String>,
        to: impl Into<String>,
        auth_code: Option<String>,
    ) -> Self {
        Self::SdpRequest(SdpBody {
            sd,
            from: from.into(),
            to: to.into(),
            auth_code,
        })
    }

    pub fn candidate(
        candidate: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::CandidateRequest(CandidateBody {
            candidate: candidate.into(),
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RegisterRequest(_) => MessageType::RegisterRequest,
            Self::RegisterResponse(_) => MessageType::RegisterResponse,
            Self::HeartbeatRequest => MessageType::HeartbeatRequest,
            Self::HeartbeatResponse => MessageType::HeartbeatResponse,
            Self::SdpRequest(_) => MessageType::SdpRequest,
            Self::SdpResponse(_) => MessageType::SdpResponse,
            Self::CandidateRequest(_) => MessageType::CandidateRequest,
            Self::CandidateResponse(_) => MessageType::CandidateResponse,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.message_type();
        let mut fields = match self {
            Self::RegisterRequest(body) => object(kind, body)?,
            Self::RegisterResponse(receipt) => object(kind, receipt)?,
            Self::HeartbeatRequest | Self::HeartbeatResponse => Map::new(),
            Self::SdpRequest(body) => object(kind, body)?,
            Self::SdpResponse(receipt) => object(kind, receipt)?,
            Self::CandidateRequest(body) => object(kind, body)?,
            Self::CandidateResponse(receipt) => object(kind, receipt)?,
        };
        fields.insert(TYPE_FIELD.to_string(), Value::from(kind.tag()));
        serde_json::to_string(&Value::Object(fields)).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_value(value)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let tag = value
            .get(TYPE_FIELD)
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::Untyped)?;
        let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownType(tag))?;
        Ok(match kind {
            MessageType::RegisterRequest => Self::RegisterRequest(body(kind, value)?),
            MessageType::RegisterResponse => Self::RegisterResponse(body(kind, value)?),
            MessageType::HeartbeatRequest => Self::HeartbeatRequest,
            MessageType::HeartbeatResponse => Self::HeartbeatResponse,
            MessageType::SdpRequest => Self::SdpRequest(body(kind, value)?),
            MessageType::SdpResponse => Self::SdpResponse(body(kind, value)?),
            MessageType::CandidateRequest => Self::CandidateRequest(body(kind, value)?),
            MessageType::CandidateResponse => Self::CandidateResponse(body(kind, value)?),
        })
    }
}

fn object<B: Serialize>(kind: MessageType, body: &B) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(body).map_err(ProtocolError::Encode)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(ProtocolError::BodyNotObject(kind)),
    }
}

fn body<B: DeserializeOwned>(kind: MessageType, value: Value) -> Result<B, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidBody { kind, source })
}
