//! Per-message handler context: typed payload access and response routing.

use thiserror::Error;

use crate::protocol::{
    Message, MessageType, Payload, ProtocolError, StatusPayload, TypedPayload,
};
use crate::queue::MessageQueue;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("message carries no payload")]
    MissingPayload,

    #[error("payload type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Handed to an action handler for the duration of one message.
///
/// Every response sent through the context carries the source message's
/// routing fields and a `response_id` that starts at 0 and increases by one
/// per send, the terminal status included.
pub struct ActionContext<'a> {
    source: &'a Message,
    outbox: &'a MessageQueue,
    next_response_id: u64,
    error: Option<String>,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(source: &'a Message, outbox: &'a MessageQueue) -> Self {
        Self { source, outbox, next_response_id: 0, error: None }
    }

    /// The message being handled.
    pub fn source(&self) -> &Message {
        self.source
    }

    /// Decode the source payload as `T`, verifying the declared type name
    /// before touching the bytes.
    pub fn populate_args<T: TypedPayload>(&self) -> Result<T, ContextError> {
        let payload = self.source.payload.as_ref().ok_or(ContextError::MissingPayload)?;
        if payload.type_name != T::TYPE_NAME {
            return Err(ContextError::TypeMismatch {
                expected: T::TYPE_NAME,
                found: payload.type_name.clone(),
            });
        }
        Ok(serde_json::from_slice(&payload.data)?)
    }

    /// Send an intermediate response carrying `payload`.
    pub fn send_response(&mut self, payload: Option<Payload>) {
        let message = self.response_envelope(MessageType::Response, payload);
        self.outbox.add_message(message);
    }

    /// Serialize `value` and send it as an intermediate response.
    pub fn respond<T: TypedPayload>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let payload = Payload::encode(value)?;
        self.send_response(Some(payload));
        Ok(())
    }

    /// Record a failure to be reported in the terminal status. Later calls
    /// overwrite earlier ones.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Emit the terminal status message: `OK` unless an error was recorded.
    /// Consumes the context so nothing can be sent after the terminal status.
    pub(crate) fn finish(mut self) {
        let status = match self.error.take() {
            Some(message) => StatusPayload::error(message),
            None => StatusPayload::ok(),
        };
        // Status serialization cannot fail for these plain fields.
        let payload = Payload::encode(&status).ok();
        let message = self.response_envelope(MessageType::Status, payload);
        self.outbox.add_message(message);
    }

    fn response_envelope(&mut self, kind: MessageType, payload: Option<Payload>) -> Message {
        let response_id = self.next_response_id;
        self.next_response_id += 1;
        Message {
            name: self.source.name.clone(),
            session_id: self.source.session_id.clone(),
            request_id: self.source.request_id.clone(),
            response_id,
            task_id: self.source.task_id.clone(),
            kind,
            payload,
        }
    }
}
