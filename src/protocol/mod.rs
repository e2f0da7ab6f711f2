//! Message envelope and typed payloads exchanged with the delegate child
//! and between dispatcher components.

mod frame;

pub use frame::{encode_frame, encode_frame_into, read_frame, FrameError, MAX_FRAME_LEN};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
}

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Status,
    /// Internal wakeup sentinel. Never written to the child, never dispatched.
    Control,
}

/// Opaque typed payload: declared type name plus serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl Payload {
    /// Serialize a typed value into an opaque payload.
    pub fn encode<T: TypedPayload>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            data: serde_json::to_vec(value)?,
        })
    }

    /// Raw payload from pre-serialized bytes.
    pub fn from_bytes(type_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { type_name: type_name.into(), data }
    }
}

/// A payload type that can cross the wire. `TYPE_NAME` defends against
/// cross-type confusion when decoding.
pub trait TypedPayload: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}

/// The message envelope.
///
/// `response_id` is assigned by the sender in strictly increasing order per
/// logical request, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub response_id: u64,
    #[serde(default)]
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Message {
    /// New request with a generated request id.
    pub fn request(
        name: impl Into<String>,
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            name: name.into(),
            session_id: session_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            response_id: 0,
            task_id: task_id.into(),
            kind: MessageType::Request,
            payload,
        }
    }

    /// Wakeup sentinel used to release blocking dequeues during shutdown.
    pub fn noop() -> Self {
        Self {
            name: String::new(),
            session_id: String::new(),
            request_id: String::new(),
            response_id: 0,
            task_id: String::new(),
            kind: MessageType::Control,
            payload: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == MessageType::Control
    }

    /// Payload byte length as counted against queue byte budgets.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.data.len())
    }
}

/// Status codes carried by `type = status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    GenericError,
}

/// Terminal status reported back to a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub code: StatusCode,
    pub message: String,
}

impl StatusPayload {
    pub fn ok() -> Self {
        Self { code: StatusCode::Ok, message: String::new() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { code: StatusCode::GenericError, message: message.into() }
    }
}

impl TypedPayload for StatusPayload {
    const TYPE_NAME: &'static str = "status";
}
