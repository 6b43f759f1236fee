use criterion::{black_box, criterion_group, criterion_main, Criterion};
use teamlink_collab::broadcast::BroadcastGroup;
use teamlink_collab::model::{Message, Operation, Position, Presence, PresenceUpdate, Range, User};
use teamlink_collab::protocol::{split_frames, InboundFrame, OutboundFrame};

fn sample_operation() -> Operation {
    let mut op = Operation::insert("file:///src/main.rs", Position::new(42, 8), "let x = 1;", "user_a");
    op.version = 17;
    op
}

fn bench_operation_encode(c: &mut Criterion) {
    let frame = OutboundFrame::DocumentOperation {
        session_id: "session_bench".into(),
        operation: sample_operation(),
    };

    c.bench_function("operation_frame_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let line = InboundFrame::DocumentOperation { operation: sample_operation() }
        .encode()
        .unwrap();

    c.bench_function("operation_frame_decode", |b| {
        b.iter(|| black_box(InboundFrame::decode(black_box(&line)).unwrap()))
    });
}

fn bench_presence_roundtrip(c: &mut Criterion) {
    let presence = Presence::from_update(
        "user_a",
        PresenceUpdate {
            document_uri: Some("file:///src/main.rs".into()),
            cursor_position: Some(Position::new(10, 2)),
            selection: Some(Range::new(10, 0, 12, 4)),
            is_typing: Some(true),
        },
    );
    let frame = InboundFrame::PresenceUpdate { presence };

    c.bench_function("presence_frame_roundtrip", |b| {
        b.iter(|| {
            let line = frame.encode().unwrap();
            black_box(InboundFrame::decode(&line).unwrap())
        })
    });
}

fn bench_batch_decode(c: &mut Criterion) {
    let author = User::with_id("user_a", "Alice");
    let text: String = (0..100)
        .map(|i| {
            let message = Message::new("session_bench", &author, format!("message {i}"), vec![], None);
            InboundFrame::ChatMessage { message }.encode().unwrap() + "\n"
        })
        .collect();

    c.bench_function("decode_100_chat_frames", |b| {
        b.iter(|| {
            let decoded = split_frames(black_box(&text))
                .filter_map(|line| InboundFrame::decode(line).ok())
                .count();
            black_box(decoded)
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..50).map(|_| group.subscribe()).collect();
    let frame = InboundFrame::DocumentOperation { operation: sample_operation() };

    c.bench_function("broadcast_to_50_subscribers", |b| {
        b.iter(|| {
            group.broadcast(0, black_box(&frame)).unwrap();
            for rx in &mut receivers {
                black_box(rx.try_recv().ok());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_presence_roundtrip,
    bench_batch_decode,
    bench_broadcast_fanout,
);
criterion_main!(benches);
