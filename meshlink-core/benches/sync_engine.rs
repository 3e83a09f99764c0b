use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshlink_core::config::SyncConfig;
use meshlink_core::core_sync::{MessageKind, SyncEngine, SyncMessage, VectorClock};
use meshlink_core::{PeerId, RoomId, Timestamp};

// Fixed timestamps keep message ids identical between runs
fn authored(author: &str, count: usize) -> Vec<SyncMessage> {
    let mut engine = SyncEngine::new(PeerId::from(author), SyncConfig::default());
    (0..count)
        .map(|i| {
            engine.create_message_at(
                format!("message {}", i),
                RoomId::from("bench"),
                MessageKind::Text,
                None,
                Timestamp::from_millis(1_700_000_000_000 + i as u64 * 10),
            )
        })
        .collect()
}

fn bench_receive_in_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_receive_in_order");

    for size in [10, 100, 1_000].iter() {
        let messages = authored("author", *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &messages, |b, messages| {
            b.iter(|| {
                let mut engine = SyncEngine::new(PeerId::from("reader"), SyncConfig::default());
                for msg in messages {
                    black_box(engine.receive_message(msg.clone()));
                }
                engine
            });
        });
    }

    group.finish();
}

fn bench_receive_reversed(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_receive_reversed");

    // Every message but the first is buffered until the end
    for size in [10, 100, 500].iter() {
        let mut messages = authored("author", *size);
        messages.reverse();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &messages, |b, messages| {
            b.iter(|| {
                let mut engine = SyncEngine::new(PeerId::from("reader"), SyncConfig::default());
                for msg in messages {
                    black_box(engine.receive_message(msg.clone()));
                }
                engine
            });
        });
    }

    group.finish();
}

fn bench_sync_request(c: &mut Criterion) {
    let mut engine = SyncEngine::new(PeerId::from("reader"), SyncConfig::default());
    for msg in authored("author", 1_000) {
        engine.receive_message(msg);
    }
    let behind = VectorClock::from([("author", 500)]);

    c.bench_function("sync_handle_request_half_behind", |b| {
        b.iter(|| black_box(engine.handle_sync_request(black_box(&behind))));
    });
}

fn bench_room_timeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_room_timeline");

    for size in [100, 1_000].iter() {
        let mut engine = SyncEngine::new(PeerId::from("reader"), SyncConfig::default());
        for msg in authored("a", *size / 2)
            .into_iter()
            .chain(authored("b", *size / 2))
        {
            engine.receive_message(msg);
        }
        let room = RoomId::from("bench");

        group.bench_with_input(BenchmarkId::from_parameter(size), &engine, |b, engine| {
            b.iter(|| black_box(engine.room_timeline(&room)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_receive_in_order,
    bench_receive_reversed,
    bench_sync_request,
    bench_room_timeline
);
criterion_main!(benches);
