//! Dispatch throughput over a synthetic wide DAG (SPEC_FULL.md §10.4).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use frame_scheduler::config::WorkerModel;
use frame_scheduler::work_unit::{WorkUnitKind, WorkUnitOutcome};
use frame_scheduler::{FrameScheduler, SchedulerConfig};

/// Build a scheduler with `width` independent root units, each with a
/// small fan of leaf dependents, and run it once per iteration.
fn build_wide_dag(width: usize, thread_count: usize) -> FrameScheduler {
    let config = SchedulerConfig::new()
        .with_thread_count(thread_count)
        .with_worker_model(WorkerModel::PerFrame)
        .with_frame_length_us(1);
    let scheduler = FrameScheduler::new(config);

    for _ in 0..width {
        let root = scheduler
            .add_work_unit(
                "root",
                WorkUnitKind::Normal,
                vec![],
                Box::new(|| WorkUnitOutcome::Completed),
            )
            .unwrap();
        for _ in 0..4 {
            scheduler
                .add_work_unit(
                    "leaf",
                    WorkUnitKind::Normal,
                    vec![root],
                    Box::new(|| WorkUnitOutcome::Completed),
                )
                .unwrap();
        }
    }
    scheduler.update_dependency_cache();
    scheduler
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_dispatch");
    for width in [64usize, 512, 4096] {
        let scheduler = build_wide_dag(width, 4);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                let report = scheduler.do_one_frame().unwrap();
                black_box(report)
            })
        });
    }
    group.finish();
}

fn bench_cache_rebuild(c: &mut Criterion) {
    let scheduler = build_wide_dag(4096, 4);
    c.bench_function("dependency_cache_rebuild_4096", |b| {
        b.iter(|| scheduler.update_dependency_cache())
    });
}

criterion_group!(benches, bench_dispatch_throughput, bench_cache_rebuild);
criterion_main!(benches);
