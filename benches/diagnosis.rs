//! Parallel against sequential diagnosis on synthetic conflict scenarios.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use paradiag::{Catalog, ConflictOracle, ConstraintSet, DiagnosisConfig, Oracle, ParallelDiagnoser, SequentialDiagnoser};

/// `size` candidates with a pairwise conflict every `stride` constraints
fn scenario(size: usize, stride: usize, latency: Duration) -> (ConstraintSet, ConflictOracle) {
    let mut catalog = Catalog::new();
    let names: Vec<String> = (0..size).map(|i| format!("c{}", i)).collect();
    let candidates = catalog.set(names.iter().map(String::as_str));
    let conflicts: Vec<ConstraintSet> = (0..size.saturating_sub(stride))
        .step_by(stride)
        .map(|i| catalog.set([names[i].as_str(), names[i + stride / 2].as_str()]))
        .collect();
    (candidates, ConflictOracle::new(conflicts).with_latency(latency))
}

fn bench_diagnosis(c: &mut Criterion) {
    let mut group = c.benchmark_group("diagnosis");
    group.sample_size(10);

    for size in [16usize, 32, 64] {
        let (candidates, oracle) = scenario(size, 8, Duration::from_micros(200));
        let background = ConstraintSet::empty();

        group.bench_with_input(BenchmarkId::new("sequential", size), &size, |b, _| {
            let mut diagnoser = SequentialDiagnoser::new(oracle.try_clone().expect("clone oracle"));
            b.iter(|| black_box(diagnoser.find_diagnosis(&candidates, &background)))
        });

        for level in [1usize, 3] {
            let config = DiagnosisConfig::default().with_max_level(level).with_check_pool_size(8);
            let diagnoser = ParallelDiagnoser::new(oracle.try_clone().expect("clone oracle"), config);
            group.bench_with_input(BenchmarkId::new(format!("parallel_level{}", level), size), &size, |b, _| {
                b.iter(|| black_box(diagnoser.find_diagnosis(&candidates, &background)))
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_diagnosis);
criterion_main!(benches);
