//! Throughput benchmarks for the relay.
//!
//! These benchmarks measure how fast the hub fans payloads out and how fast
//! the crawler turns store rows into fan-out requests.

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_bench::{attach_sessions, drain, populated_store, runtime};
use relay_core::{Crawler, CrawlerConfig, FanOutRequest, Hub, HubConfig};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Benchmark one fan-out to many sessions of the same user.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");
    let rt = runtime();

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let user = Uuid::new_v4();
            let (hub, _task) = rt.block_on(async { Hub::spawn(HubConfig::default()) });
            let mut queues = rt.block_on(attach_sessions(&hub, user, size, 16));
            let payload = Bytes::from(vec![b'x'; 256]);

            b.iter_custom(|iters| {
                rt.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let report = hub
                            .broadcast_with_report(FanOutRequest::new(payload.clone(), [user]))
                            .await
                            .unwrap();
                        black_box(report);
                        drain(&mut queues);
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark fan-out where only a few of many sessions are addressed.
fn bench_sparse_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_fanout");
    let rt = runtime();

    group.bench_function("2_of_1000_users", |b| {
        let (hub, _task) = rt.block_on(async { Hub::spawn(HubConfig::default()) });
        let users: Vec<_> = (0..1000).map(|_| Uuid::new_v4()).collect();
        let mut queues = Vec::new();
        for user in &users {
            queues.extend(rt.block_on(attach_sessions(&hub, *user, 1, 16)));
        }
        let payload = Bytes::from(vec![b'x'; 256]);

        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    hub.broadcast_with_report(FanOutRequest::new(
                        payload.clone(),
                        [users[7], users[500]],
                    ))
                    .await
                    .unwrap();
                    drain(&mut queues[7..8]);
                    drain(&mut queues[500..501]);
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark a crawler cycle over a backlog of changed messages.
fn bench_crawl_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("crawl_cycle");
    let rt = runtime();

    for backlog in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            let user = Uuid::new_v4();
            let store = Arc::new(populated_store(&[user], backlog));
            let (hub, _task) = rt.block_on(async {
                Hub::spawn(HubConfig {
                    broadcast_capacity: backlog * 2,
                    ..HubConfig::default()
                })
            });
            let mut queues = rt.block_on(attach_sessions(&hub, user, 1, backlog * 2));
            let since = Utc::now() - ChronoDuration::minutes(1);

            b.iter_custom(|iters| {
                rt.block_on(async {
                    let mut elapsed = std::time::Duration::ZERO;
                    for _ in 0..iters {
                        let mut crawler =
                            Crawler::new(store.clone(), hub.clone(), CrawlerConfig::default())
                                .with_checkpoint(since);
                        let start = Instant::now();
                        let report = crawler.poll_once().await.unwrap();
                        elapsed += start.elapsed();
                        black_box(report);

                        // Let the hub catch up before emptying the queue.
                        hub.broadcast_with_report(FanOutRequest::new(
                            Bytes::new(),
                            Vec::<Uuid>::new(),
                        ))
                        .await
                        .unwrap();
                        drain(&mut queues);
                    }
                    elapsed
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_sparse_fanout, bench_crawl_cycle);
criterion_main!(benches);
