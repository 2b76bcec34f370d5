//! Performance benchmarks for drift-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use drift_engine::{
    resolve, ChildOrder, Completion, EngineConfig, Event, EventKind, EventSink, Node, Path,
    ServerCache, SyncEngine, WriteKind, WriteOwner, WritePayload, WriteStore,
};
use serde_json::json;
use std::sync::Arc;

fn server_with_users(count: usize) -> ServerCache {
    let users: serde_json::Map<String, serde_json::Value> = (0..count)
        .map(|i| {
            (
                format!("user_{i}"),
                json!({"name": format!("User {i}"), "age": i % 90}),
            )
        })
        .collect();
    let mut cache = ServerCache::new();
    cache.apply_overwrite(
        &Path::parse("users").unwrap(),
        Node::from_json(&serde_json::Value::Object(users)).unwrap(),
    );
    cache
}

fn pending_writes(count: usize) -> WriteStore {
    let mut writes = WriteStore::new();
    for i in 0..count {
        writes
            .add_write(
                WriteKind::Overwrite,
                Path::parse(&format!("users/user_{i}/name")).unwrap(),
                WritePayload::Node(Node::from_json(&json!(format!("Renamed {i}"))).unwrap()),
                true,
                WriteOwner::Plain,
                Completion::none(),
            )
            .unwrap();
    }
    writes
}

fn bench_overlay_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("overlay_resolution");
    let server = server_with_users(1000);

    for count in [0, 10, 100, 1000] {
        let writes = pending_writes(count);
        group.bench_with_input(BenchmarkId::new("users_root", count), &writes, |b, writes| {
            let path = Path::parse("users").unwrap();
            b.iter(|| resolve(black_box(&server), black_box(writes), &path))
        });
        group.bench_with_input(BenchmarkId::new("single_leaf", count), &writes, |b, writes| {
            let path = Path::parse("users/user_5/name").unwrap();
            b.iter(|| resolve(black_box(&server), black_box(writes), &path))
        });
    }

    group.finish();
}

fn bench_tree_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_updates");
    let root = server_with_users(1000).root().clone();

    group.bench_function("update_deep_leaf", |b| {
        let path = Path::parse("users/user_500/age").unwrap();
        let value = Node::from_json(&json!(42)).unwrap();
        b.iter(|| root.update_at(black_box(&path), value.clone()))
    });

    group.bench_function("json_roundtrip", |b| {
        let json = root.to_json();
        b.iter(|| Node::from_json(black_box(&json)))
    });

    group.finish();
}

fn bench_event_raising(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_raising");

    for listeners in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("submit_with_listeners", listeners),
            &listeners,
            |b, &listeners| {
                let mut engine = SyncEngine::new(EngineConfig::default());
                engine
                    .on_server_overwrite(&Path::root(), Node::from_json(&json!({"n": 0})).unwrap())
                    .deliver_now();
                let sink: EventSink = Arc::new(|event: Event| {
                    black_box(event);
                });
                for _ in 0..listeners {
                    engine
                        .attach_listener(
                            Path::parse("n").unwrap(),
                            EventKind::Value,
                            ChildOrder::Key,
                            Arc::clone(&sink),
                        )
                        .1
                        .deliver_now();
                }
                let mut i = 0i64;
                b.iter(|| {
                    i += 1;
                    engine
                        .submit_write(
                            Path::parse("n").unwrap(),
                            Node::from_json(&json!(i)).unwrap(),
                            Completion::none(),
                        )
                        .map(|(_, effects)| effects.deliver_now())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_overlay_resolution,
    bench_tree_updates,
    bench_event_raising
);
criterion_main!(benches);
