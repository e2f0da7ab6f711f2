//! Integration tests for the bounded message queue: ordering, blocking
//! behavior on both sides, and batch pagination.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gg_relay::protocol::{Message, Payload};
use gg_relay::queue::{MessageQueue, QueueConfig};

fn msg(name: &str, payload_bytes: usize) -> Message {
    let payload =
        (payload_bytes > 0).then(|| Payload::from_bytes("raw", vec![b'x'; payload_bytes]));
    Message::request(name, "session", "task", payload)
}

#[test]
fn test_fifo_order_preserved() {
    let queue = MessageQueue::new(QueueConfig::default());
    for i in 0..10 {
        queue.add_message(msg(&format!("m{i}"), 4));
    }
    let batch = queue.get_messages(10, usize::MAX, false);
    let names: Vec<&str> = batch.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9"]
    );
}

#[test]
fn test_priority_jumps_a_full_queue() {
    // Queue admits one message at most; the priority insert still lands, at
    // the front.
    let queue = MessageQueue::new(QueueConfig { max_count: 1, max_bytes: 100 });
    queue.add_message(msg("stuck", 10));
    queue.add_priority_message(msg("urgent", 10));
    assert_eq!(queue.len(), 2);

    let batch = queue.get_messages(2, usize::MAX, false);
    assert_eq!(batch[0].name, "urgent");
    assert_eq!(batch[1].name, "stuck");
}

#[test]
fn test_blocked_add_resumes_after_drain() {
    let queue = Arc::new(MessageQueue::new(QueueConfig { max_count: 2, max_bytes: 1000 }));
    queue.add_message(msg("a", 1));
    queue.add_message(msg("b", 1));

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            // Blocks: the queue is at its count limit.
            queue.add_message(msg("c", 1));
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.len(), 2, "producer should still be blocked");

    let drained = queue.get_messages(1, usize::MAX, false);
    assert_eq!(drained[0].name, "a");

    producer.join().unwrap();
    let rest = queue.get_messages(10, usize::MAX, false);
    let names: Vec<&str> = rest.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[test]
fn test_blocking_get_wakes_on_add() {
    let queue = Arc::new(MessageQueue::new(QueueConfig::default()));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.get_messages(1, usize::MAX, true))
    };

    thread::sleep(Duration::from_millis(100));
    queue.add_message(msg("wakeup", 1));

    let batch = consumer.join().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name, "wakeup");
}

#[test]
fn test_oversized_message_accepted_only_when_empty() {
    let queue = Arc::new(MessageQueue::new(QueueConfig { max_count: 5, max_bytes: 15 }));
    // Empty queue: a 20-byte message exceeds max_bytes but is accepted.
    queue.add_message(msg("big", 20));
    assert_eq!(queue.len(), 1);

    // Non-empty and over budget: the next add blocks until the queue drains.
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.add_message(msg("small", 10)))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.len(), 1, "second add should be blocked");

    let drained = queue.get_messages(1, usize::MAX, false);
    assert_eq!(drained[0].name, "big");
    producer.join().unwrap();
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_get_paginates_by_count() {
    let queue = MessageQueue::new(QueueConfig::default());
    for i in 0..10 {
        queue.add_message(msg(&format!("m{i}"), 2));
    }
    let first = queue.get_messages(5, usize::MAX, false);
    let second = queue.get_messages(5, usize::MAX, false);
    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    assert_eq!(first[0].name, "m0");
    assert_eq!(second[0].name, "m5");
    assert!(queue.is_empty());
}

#[test]
fn test_get_paginates_by_bytes_with_minimum_of_one() {
    let queue = MessageQueue::new(QueueConfig::default());
    queue.add_message(msg("a", 8));
    queue.add_message(msg("b", 8));
    queue.add_message(msg("c", 8));

    // 10-byte budget fits one 8-byte message; the second would overflow.
    let batch = queue.get_messages(10, 10, false);
    assert_eq!(batch.len(), 1);

    // Budget below the front message's size still yields that one message.
    let batch = queue.get_messages(10, 1, false);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name, "b");
}
