use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use prico_realtime::room::EventFamily;
use prico_realtime::{Command, Connection, HubConfig, MemoryStore, Principal, RoomHub, RoomKey, ServerEvent};
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("broadcast_fanout");

    for peers in [10usize, 100] {
        let config = HubConfig {
            outbound_capacity: 4096,
            ..HubConfig::default()
        };
        let hub = RoomHub::new(config, Arc::new(MemoryStore::new()));
        let key = RoomKey::editor("bench", "main.rs");
        let mut connections: Vec<Connection> = rt.block_on(async {
            let mut connections = Vec::with_capacity(peers);
            for i in 0..peers {
                let principal = Principal::new(format!("user-{i}"), format!("User {i}"));
                connections.push(hub.admit(key.clone(), &principal).await.unwrap());
            }
            connections
        });
        let event = ServerEvent::Change {
            changes: json!([{"from": 10, "to": 12, "insert": "fn"}]),
            origin: json!("input"),
            from: "user-0".into(),
        };

        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, _| {
            b.iter(|| {
                let delivered = rt.block_on(hub.broadcast(&key, black_box(&event), None));
                for conn in connections.iter_mut() {
                    while conn.try_recv().is_some() {}
                }
                black_box(delivered);
            })
        });
    }
    group.finish();
}

fn bench_parse_chat(c: &mut Criterion) {
    let text = json!({
        "type": "new_message",
        "sender_id": "u1",
        "content": "hello there, this is a typical short chat message",
        "channel_id": "general",
        "attachments": [],
    })
    .to_string();

    c.bench_function("parse_new_message", |b| {
        b.iter(|| black_box(Command::parse(EventFamily::Chat, black_box(&text)).unwrap()))
    });
}

fn bench_parse_cursor(c: &mut Criterion) {
    let text = json!({"type": "cursor", "cursor": {"line": 120, "ch": 33}}).to_string();

    c.bench_function("parse_cursor", |b| {
        b.iter(|| black_box(Command::parse(EventFamily::Editor, black_box(&text)).unwrap()))
    });
}

fn bench_encode_event(c: &mut Criterion) {
    let event = ServerEvent::Cursor {
        user_id: "u1".into(),
        username: "Ada".into(),
        cursor: json!({"line": 120, "ch": 33}),
    };

    c.bench_function("encode_cursor", |b| b.iter(|| black_box(event.encode().unwrap())));
}

criterion_group!(
    benches,
    bench_fanout,
    bench_parse_chat,
    bench_parse_cursor,
    bench_encode_event,
);
criterion_main!(benches);
