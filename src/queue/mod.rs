//! Thread-safe message queue bounded by message count and total payload
//! bytes, with a priority front-insert that bypasses both limits.
//!
//! Implemented as a monitor object: one internal lock plus two condition
//! variables (space-available, data-available). Every instance is
//! independent; producer and consumer sides share it by `Arc`.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::protocol::Message;

/// Capacity limits, immutable per instance.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_count: usize,
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_count: 512, max_bytes: 8 * 1024 * 1024 }
    }
}

struct Inner {
    messages: VecDeque<Message>,
    /// Sum of payload byte lengths of everything in `messages`.
    args_size: usize,
}

impl Inner {
    fn pop_front(&mut self) -> Option<Message> {
        let msg = self.messages.pop_front()?;
        self.args_size -= msg.payload_len();
        Some(msg)
    }
}

pub struct MessageQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    space_available: Condvar,
    data_available: Condvar,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { messages: VecDeque::new(), args_size: 0 }),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
        }
    }

    /// Append a message at the back, blocking until both the count and byte
    /// budgets admit it.
    ///
    /// Exception: an empty queue accepts any message unconditionally, so a
    /// single oversized message can never deadlock the producer.
    pub fn add_message(&self, message: Message) {
        let len = message.payload_len();
        let mut inner = self.inner.lock();
        while !inner.messages.is_empty()
            && !(inner.messages.len() < self.config.max_count
                && inner.args_size + len <= self.config.max_bytes)
        {
            self.space_available.wait(&mut inner);
        }
        inner.args_size += len;
        inner.messages.push_back(message);
        drop(inner);
        self.data_available.notify_one();
    }

    /// Insert a message at the front, bypassing both limits. Always succeeds
    /// immediately. Subsequent normal adds still check the limits against the
    /// now-possibly-over-budget state.
    pub fn add_priority_message(&self, message: Message) {
        let len = message.payload_len();
        let mut inner = self.inner.lock();
        inner.args_size += len;
        inner.messages.push_front(message);
        drop(inner);
        self.data_available.notify_one();
    }

    /// Remove and return up to `max_count` messages from the front, keeping
    /// the accumulated returned-payload bytes within `max_bytes`. At least
    /// one message is returned whenever any are available, even if the byte
    /// cap alone would return zero.
    ///
    /// Empty queue: returns an empty batch immediately when `block` is false,
    /// otherwise suspends until a message arrives.
    pub fn get_messages(&self, max_count: usize, max_bytes: usize, block: bool) -> Vec<Message> {
        let mut inner = self.inner.lock();
        if inner.messages.is_empty() {
            if !block {
                return Vec::new();
            }
            while inner.messages.is_empty() {
                self.data_available.wait(&mut inner);
            }
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;
        while batch.len() < max_count {
            let Some(front_len) = inner.messages.front().map(Message::payload_len) else {
                break;
            };
            if !batch.is_empty() && batch_bytes + front_len > max_bytes {
                break;
            }
            if let Some(msg) = inner.pop_front() {
                batch_bytes += front_len;
                batch.push(msg);
            }
        }
        drop(inner);

        if !batch.is_empty() {
            self.space_available.notify_one();
        }
        batch
    }

    /// Current message count.
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    /// Current sum of payload byte lengths.
    pub fn payload_bytes(&self) -> usize {
        self.inner.lock().args_size
    }
}
