//! Scheduler throughput benchmark.
//!
//! Measures schedule + dispatch + complete cycles per algorithm, and raw
//! admission cost at different ready-queue depths, using Criterion.

use agentos_kernel::kernel::clock::KernelContext;
use agentos_kernel::kernel::scheduler::{Scheduler, SchedulerConfig};
use agentos_kernel::kernel::types::{ResourceCost, TaskPriority, TaskSpec};
use agentos_kernel::kernel::SchedulingAlgorithm;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const PRIORITIES: [TaskPriority; 5] = [
    TaskPriority::Critical,
    TaskPriority::High,
    TaskPriority::Normal,
    TaskPriority::Low,
    TaskPriority::Background,
];

fn scheduler(algorithm: SchedulingAlgorithm, depth: usize) -> Scheduler {
    let config = SchedulerConfig {
        algorithm,
        max_concurrent_tasks: depth.max(1),
        max_queue_size: depth + 1,
        starvation_prevention: false,
        ..SchedulerConfig::default()
    };
    let (ctx, _) = KernelContext::deterministic();
    Scheduler::new(config, ctx)
}

fn spec(n: usize) -> TaskSpec {
    TaskSpec::new(format!("owner-{}", n % 8))
        .with_priority(PRIORITIES[n % PRIORITIES.len()])
        .with_cost(ResourceCost::new((n % 97) as u64 * 10, (n % 5) as u64, 0))
}

fn bench_full_cycle(c: &mut Criterion) {
    let algorithms = [
        SchedulingAlgorithm::Priority,
        SchedulingAlgorithm::FairShare,
        SchedulingAlgorithm::Deadline,
        SchedulingAlgorithm::CostAware,
        SchedulingAlgorithm::RoundRobin,
    ];
    let batch = 500;

    let mut group = c.benchmark_group("schedule_dispatch_complete");
    for algorithm in algorithms {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", algorithm)),
            &algorithm,
            |b, &alg| {
                b.iter(|| {
                    let mut s = scheduler(alg, batch);
                    for n in 0..batch {
                        s.schedule(spec(n)).unwrap();
                    }
                    while let Some(task) = s.get_next_task() {
                        s.complete_task(black_box(&task.id), None).unwrap();
                    }
                    s
                })
            },
        );
    }
    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let depths: &[usize] = &[10, 100, 1000];

    let mut group = c.benchmark_group("schedule_into_queue");
    for &depth in depths {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &d| {
            b.iter(|| {
                let mut s = scheduler(SchedulingAlgorithm::Priority, d);
                for n in 0..d {
                    s.schedule(black_box(spec(n))).unwrap();
                }
                s
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_cycle, bench_admission);
criterion_main!(benches);
