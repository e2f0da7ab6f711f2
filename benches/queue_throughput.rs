//! Queue and framing throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gg_relay::protocol::{encode_frame, read_frame, Message, Payload};
use gg_relay::queue::{MessageQueue, QueueConfig};

fn sample_message(payload_bytes: usize) -> Message {
    Message::request(
        "bench",
        "session",
        "task",
        Some(Payload::from_bytes("raw", vec![b'x'; payload_bytes])),
    )
}

fn bench_queue_add_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_add_get");

    for (name, payload_bytes) in [("small", 64), ("medium", 4096), ("large", 65536)] {
        let message = sample_message(payload_bytes);

        group.throughput(Throughput::Bytes(payload_bytes as u64));
        group.bench_with_input(BenchmarkId::new("payload", name), &message, |b, msg| {
            let queue = MessageQueue::new(QueueConfig { max_count: 1024, max_bytes: usize::MAX });
            b.iter(|| {
                queue.add_message(black_box(msg.clone()));
                black_box(queue.get_messages(1, usize::MAX, false));
            })
        });
    }

    group.finish();
}

fn bench_queue_batched_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_batched_drain");

    for batch_size in [1usize, 16, 64] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                let queue = MessageQueue::new(QueueConfig { max_count: 1024, max_bytes: usize::MAX });
                let message = sample_message(256);
                b.iter(|| {
                    for _ in 0..batch_size {
                        queue.add_message(message.clone());
                    }
                    black_box(queue.get_messages(batch_size, usize::MAX, false));
                })
            },
        );
    }

    group.finish();
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_roundtrip");

    for (name, payload_bytes) in [("small", 64), ("medium", 4096), ("large", 65536)] {
        let message = sample_message(payload_bytes);

        group.throughput(Throughput::Bytes(payload_bytes as u64));
        group.bench_with_input(BenchmarkId::new("payload", name), &message, |b, msg| {
            b.iter(|| {
                let bytes = encode_frame(black_box(msg)).unwrap();
                let mut cursor = std::io::Cursor::new(&bytes);
                black_box(read_frame(&mut cursor).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_add_get,
    bench_queue_batched_drain,
    bench_frame_roundtrip
);
criterion_main!(benches);
