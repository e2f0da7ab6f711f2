//! Action dispatch: routes inbound messages to registered handlers on a
//! dedicated worker thread.
//!
//! Handlers are registered by action name before processing starts; the
//! worker owns an immutable snapshot of the registry. Every handled message
//! ends with exactly one terminal status message, success or failure alike,
//! and a failing handler never takes the worker down with it.

mod context;

pub use context::{ActionContext, ContextError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{Message, MessageType, ProtocolError};
use crate::queue::MessageQueue;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// An action implementation. Any `Err` is contained: it becomes the
/// message's error status, never a worker crash.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<(), HandlerError>;
}

impl<F> ActionHandler for F
where
    F: Fn(&mut ActionContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<(), HandlerError> {
        self(ctx)
    }
}

const DISPATCH_BATCH: usize = 16;

pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    inbox: Arc<MessageQueue>,
    outbox: Arc<MessageQueue>,
    shutting_down: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ActionDispatcher {
    pub fn new(inbox: Arc<MessageQueue>, outbox: Arc<MessageQueue>) -> Self {
        Self {
            handlers: HashMap::new(),
            inbox,
            outbox,
            shutting_down: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Register `handler` for the action `name`. Registration happens before
    /// processing starts; replacing an existing handler is allowed but logged.
    pub fn add_action(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(action = %name, "replacing previously registered handler");
        }
    }

    /// Whether a handler is registered for this message's action.
    pub fn can_handle(&self, message: &Message) -> bool {
        self.handlers.contains_key(&message.name)
    }

    /// Start the dispatch worker. The handler registry is snapshotted here;
    /// later registrations do not reach a running worker. Call once.
    pub fn start_processing(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let handlers: Arc<HashMap<String, Arc<dyn ActionHandler>>> =
            Arc::new(self.handlers.clone());
        let inbox = Arc::clone(&self.inbox);
        let outbox = Arc::clone(&self.outbox);
        let shutting_down = Arc::clone(&self.shutting_down);

        info!(actions = handlers.len(), "dispatch worker starting");
        let handle = thread::Builder::new()
            .name("relay-dispatch".to_string())
            .spawn(move || {
                while !shutting_down.load(Ordering::Acquire) {
                    let batch = inbox.get_messages(DISPATCH_BATCH, usize::MAX, true);
                    for message in &batch {
                        if shutting_down.load(Ordering::Acquire) {
                            return;
                        }
                        // Only requests are routed to handlers; responses and
                        // statuses addressed to other consumers pass this
                        // worker by, and noop sentinels carry no work at all.
                        if message.kind != MessageType::Request {
                            if !message.is_noop() {
                                debug!(name = %message.name, kind = ?message.kind, "skipping non-request message");
                            }
                            continue;
                        }
                        dispatch_message(&handlers, &outbox, message);
                    }
                }
            })
            .expect("failed to spawn dispatch thread");
        self.worker = Some(handle);
    }

    /// Stop the worker and join it. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        // Release a blocking dequeue even when the inbox is at capacity.
        self.inbox.add_priority_message(Message::noop());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle one message end to end, emitting exactly one terminal status.
fn dispatch_message(
    handlers: &HashMap<String, Arc<dyn ActionHandler>>,
    outbox: &MessageQueue,
    message: &Message,
) {
    let mut ctx = ActionContext::new(message, outbox);
    match handlers.get(&message.name) {
        Some(handler) => {
            debug!(action = %message.name, request_id = %message.request_id, "dispatching");
            if let Err(e) = handler.handle(&mut ctx) {
                warn!(action = %message.name, error = %e, "handler failed");
                ctx.set_error(e.to_string());
            }
        }
        None => {
            warn!(action = %message.name, "no handler registered");
            ctx.set_error(format!("unknown action: {}", message.name));
        }
    }
    ctx.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, StatusCode, StatusPayload};
    use crate::queue::QueueConfig;

    fn queues() -> (Arc<MessageQueue>, Arc<MessageQueue>) {
        (
            Arc::new(MessageQueue::new(QueueConfig::default())),
            Arc::new(MessageQueue::new(QueueConfig::default())),
        )
    }

    fn decode_status(message: &Message) -> StatusPayload {
        let payload = message.payload.as_ref().unwrap();
        serde_json::from_slice(&payload.data).unwrap()
    }

    #[test]
    fn test_can_handle_reflects_registry() {
        let (inbox, outbox) = queues();
        let mut dispatcher = ActionDispatcher::new(inbox, outbox);
        let probe = Message::request("echo", "s", "t", None);
        assert!(!dispatcher.can_handle(&probe));
        dispatcher.add_action("echo", Arc::new(|_: &mut ActionContext<'_>| Ok(())));
        assert!(dispatcher.can_handle(&probe));
    }

    #[test]
    fn test_unknown_action_yields_single_error_status() {
        let (_, outbox) = queues();
        let handlers = HashMap::new();
        let message = Message::request("frobnicate", "s", "t", None);
        dispatch_message(&handlers, &outbox, &message);

        let sent = outbox.get_messages(10, usize::MAX, false);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Status);
        let status = decode_status(&sent[0]);
        assert_eq!(status.code, StatusCode::GenericError);
        assert!(status.message.contains("frobnicate"));
    }

    #[test]
    fn test_handler_error_is_contained_in_status() {
        let (_, outbox) = queues();
        let mut handlers: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
        handlers.insert(
            "explode".to_string(),
            Arc::new(|_: &mut ActionContext<'_>| Err(HandlerError::msg("boom"))),
        );
        let message = Message::request("explode", "s", "t", None);
        dispatch_message(&handlers, &outbox, &message);

        let sent = outbox.get_messages(10, usize::MAX, false);
        assert_eq!(sent.len(), 1);
        let status = decode_status(&sent[0]);
        assert_eq!(status.code, StatusCode::GenericError);
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn test_successful_handler_gets_ok_status_after_responses() {
        let (_, outbox) = queues();
        let mut handlers: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
        handlers.insert(
            "echo".to_string(),
            Arc::new(|ctx: &mut ActionContext<'_>| {
                ctx.send_response(None);
                Ok(())
            }),
        );
        let message = Message::request("echo", "s", "t", None);
        dispatch_message(&handlers, &outbox, &message);

        let sent = outbox.get_messages(10, usize::MAX, false);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageType::Response);
        assert_eq!(sent[0].response_id, 0);
        assert_eq!(sent[1].kind, MessageType::Status);
        assert_eq!(sent[1].response_id, 1);
        assert_eq!(decode_status(&sent[1]).code, StatusCode::Ok);
    }
}
