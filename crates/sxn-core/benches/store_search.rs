//! Benchmark `SessionStore::search` against a populated in-memory database,
//! since search runs a full table scan plus string-matching rather than an
//! indexed query.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sxn_core::store::session::{CreateSessionInput, SessionFilters};
use sxn_core::store::SessionStore;
use tokio::runtime::Runtime;

async fn seeded_store(n: usize) -> SessionStore {
    let store = SessionStore::open_in_memory().await.expect("open in-memory store");
    for i in 0..n {
        store
            .create(CreateSessionInput {
                name: format!("session-{i}"),
                description: Some(format!("work item number {i} touching billing")),
                tags: vec!["billing".to_string()],
                ..Default::default()
            })
            .await
            .expect("create ok");
    }
    store
}

fn bench_search(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = rt.block_on(seeded_store(500));

    c.bench_function("search_500_sessions", |b| {
        b.iter(|| {
            rt.block_on(store.search(black_box("billing"), &SessionFilters::default(), Some(20)))
        });
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
