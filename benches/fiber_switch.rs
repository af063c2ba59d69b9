//! Fiber switch latency benchmark using criterion.
//!
//! Measures the round trip of a fiber yielding back to its worker and being
//! resumed, through the full park and promote path of one bucket.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use fiberjobs::{Counter, JobPriority, JobSystem, WorkerRoster};

const YIELDS: u64 = 10_000;

fn bench_yield_round_trip(c: &mut Criterion) {
    let system =
        JobSystem::with_roster(WorkerRoster::single()).expect("Failed to start job system");

    let mut group = c.benchmark_group("fiber_switch");
    group.throughput(Throughput::Elements(YIELDS));
    group.bench_function("yield_now", |b| {
        b.iter(|| {
            let done = system
                .run(JobPriority::High, |ctx| {
                    for _ in 0..YIELDS {
                        ctx.yield_now();
                    }
                })
                .unwrap();
            system.wait_for_counter(&done, 1);
        });
    });

    // Two fibers on different buckets taking turns through one counter.
    group.bench_function("ping_pong", |b| {
        b.iter(|| {
            let turn = Counter::new(0);
            let (ping_turn, pong_turn) = (turn.clone(), turn.clone());
            let ping = system
                .run(JobPriority::High, move |ctx| {
                    for round in 0..YIELDS / 2 {
                        ctx.await_counter(&ping_turn, round * 2);
                        ping_turn.increment();
                    }
                })
                .unwrap();
            let pong = system
                .run(JobPriority::Medium, move |ctx| {
                    for round in 0..YIELDS / 2 {
                        ctx.await_counter(&pong_turn, round * 2 + 1);
                        pong_turn.increment();
                    }
                })
                .unwrap();
            system.wait_for_counter(&ping, 1);
            system.wait_for_counter(&pong, 1);
        });
    });
    group.finish();

    system.shutdown().expect("Shutdown failed");
}

criterion_group!(benches, bench_yield_round_trip);
criterion_main!(benches);
