//! Frame bodies
//!
//! Call arguments, simple results and errors travel as JSON; tunnel payloads
//! travel as raw binary bodies.

use crate::frame::{BodyType, FrameError};
use crate::kind::CallKind;
use crate::method::MethodPath;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Body decoding errors
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid UTF-8 in text body")]
    InvalidText,

    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Decoded frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Binary(Bytes),
    Text(String),
    Json(Value),
}

impl Body {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BodyError> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }

    pub fn body_type(&self) -> BodyType {
        match self {
            Body::Binary(_) => BodyType::Binary,
            Body::Text(_) => BodyType::Text,
            Body::Json(_) => BodyType::Json,
        }
    }

    /// Serialized form of the body for the wire.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Binary(bytes) => bytes.clone(),
            Body::Text(text) => Bytes::from(text.clone()),
            Body::Json(value) => Bytes::from(value.to_string()),
        }
    }

    /// Raw bytes regardless of body type, used by byte-oriented tunnel streams.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Body::Binary(bytes) => bytes,
            Body::Text(text) => Bytes::from(text),
            Body::Json(value) => Bytes::from(value.to_string()),
        }
    }

    pub fn decode(body_type: BodyType, bytes: Bytes) -> Result<Self, BodyError> {
        match body_type {
            BodyType::Binary => Ok(Body::Binary(bytes)),
            BodyType::Text => String::from_utf8(bytes.to_vec())
                .map(Body::Text)
                .map_err(|_| BodyError::InvalidText),
            BodyType::Json => Ok(Body::Json(serde_json::from_slice(&bytes)?)),
        }
    }

    /// Interpret the body as JSON and deserialize it.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, BodyError> {
        let value = match self {
            Body::Json(value) => value,
            Body::Text(text) => serde_json::from_str(&text)?,
            Body::Binary(bytes) => serde_json::from_slice(&bytes)?,
        };
        Ok(serde_json::from_value(value)?)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Binary(bytes)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// A stream element as it travels on the wire: body type bits and bytes
///
/// Relays forward these untouched, so JSON keeps its exact spelling and
/// bodies that would not decode still reach the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    bits: u8,
    bytes: Bytes,
}

impl RawBody {
    pub fn new(body_type: BodyType, bytes: Bytes) -> Self {
        Self {
            bits: body_type as u8,
            bytes,
        }
    }

    pub(crate) fn from_bits(bits: u8, bytes: Bytes) -> Self {
        Self { bits, bytes }
    }

    /// Body type bits of the frame, including values no body type uses
    pub fn body_bits(&self) -> u8 {
        self.bits
    }

    pub fn body_type(&self) -> Result<BodyType, FrameError> {
        BodyType::try_from(self.bits)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn decode(self) -> Result<Body, BodyError> {
        Body::decode(self.body_type()?, self.bytes)
    }
}

impl From<Body> for RawBody {
    fn from(body: Body) -> Self {
        Self::new(body.body_type(), body.to_bytes())
    }
}

/// Body of the opening frame of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub name: MethodPath,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CallKind>,
}

impl RequestBody {
    /// Declared call kind; requests without a type are async.
    pub fn kind(&self) -> CallKind {
        self.kind.unwrap_or(CallKind::Async).wire()
    }
}

/// Structured error carried by an error frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}
