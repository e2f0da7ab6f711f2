//! gg-relay
//!
//! A subprocess relay: keeps a delegate child process alive, exchanges
//! length-prefixed framed messages with it over stdio pipes, and dispatches
//! inbound messages to registered action handlers.
//!
//! # Architecture
//!
//! - **Queues**: bounded, thread-safe message queues connect the pieces.
//! - **Delegator**: spawns and supervises the child; write/read/stderr loops
//!   run on dedicated OS threads.
//! - **Dispatcher**: routes each inbound message to its handler and always
//!   closes it out with a terminal status.
//!
//! All concurrency is plain OS threads with blocking pipe I/O; there is no
//! async runtime.

pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod protocol;
pub mod queue;
pub mod telemetry;

use std::sync::Arc;

use config::{DelegateConfigSource, EnvConfig};
use delegate::SubprocessDelegator;
use dispatch::ActionDispatcher;
use queue::MessageQueue;

pub use delegate::{DelegateError, DelegatorConfig};
pub use dispatch::{ActionContext, ActionHandler, ContextError, HandlerError};
pub use protocol::{Message, MessageType, Payload, StatusCode, StatusPayload, TypedPayload};
pub use queue::QueueConfig;

/// The assembled relay: two queues, the subprocess supervisor, and the
/// action dispatcher.
///
/// `to_delegate` feeds the child's stdin; `from_delegate` carries the
/// child's stdout frames to the dispatcher's handlers.
pub struct Relay {
    pub to_delegate: Arc<MessageQueue>,
    pub from_delegate: Arc<MessageQueue>,
    pub delegator: SubprocessDelegator,
    pub dispatcher: ActionDispatcher,
}

impl Relay {
    /// Wire up a relay from configuration. Nothing runs until [`start`].
    ///
    /// [`start`]: Relay::start
    pub fn new(config: EnvConfig, source: Arc<dyn DelegateConfigSource>) -> Self {
        let to_delegate = Arc::new(MessageQueue::new(config.queue));
        let from_delegate = Arc::new(MessageQueue::new(config.queue));
        let delegator = SubprocessDelegator::new(
            config.delegator,
            source,
            Arc::clone(&to_delegate),
            Arc::clone(&from_delegate),
        );
        let dispatcher =
            ActionDispatcher::new(Arc::clone(&from_delegate), Arc::clone(&to_delegate));
        Self { to_delegate, from_delegate, delegator, dispatcher }
    }

    /// Start the relay threads. Register handlers on [`Relay::dispatcher`]
    /// before calling this; the dispatcher snapshots its registry here.
    pub fn start(&mut self) {
        self.dispatcher.start_processing();
        self.delegator.start();
    }

    /// Submit a message for delivery to the delegate child.
    pub fn submit(&self, message: Message) {
        self.to_delegate.add_message(message);
    }

    /// Tear everything down: child first, then the worker threads.
    pub fn shutdown(&mut self) {
        self.delegator.shutdown();
        self.dispatcher.shutdown();
    }
}
