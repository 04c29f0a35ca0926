use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use veil_core::entry::{Placement, SendEntry};
use veil_core::scheduler::{approximate_knapsack, solve_knapsack};

fn queue(count: usize, seed: u64) -> Vec<SendEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    let now = Instant::now();
    (0..count)
        .map(|_| {
            SendEntry::ready(
                vec![0; rng.gen_range(32..=1400)],
                rng.gen_range(0..=10_000),
                now,
                Placement::None,
            )
        })
        .collect()
}

fn bench_knapsack(c: &mut Criterion) {
    let mut group = c.benchmark_group("knapsack");
    for &count in &[4usize, 16, 64] {
        group.bench_function(format!("exact/{count}"), |b| {
            let mut entries = queue(count, 7);
            b.iter(|| black_box(solve_knapsack(&mut entries, 1424)));
        });
        group.bench_function(format!("greedy/{count}"), |b| {
            let mut entries = queue(count, 7);
            entries.sort_by(|a, b| {
                let wa = a.priority as f64 / a.len as f64;
                let wb = b.priority as f64 / b.len as f64;
                wb.partial_cmp(&wa).unwrap()
            });
            b.iter(|| black_box(approximate_knapsack(&mut entries, 1424)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_knapsack);
criterion_main!(benches);
