use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use chrono::{TimeDelta, TimeZone, Utc};
use jobforge_core::{JobId, ManualClock, SharedClock};
use jobforge_jobs::acquisition::{AcquisitionKind, AcquisitionLoop, AcquisitionSettings};
use jobforge_jobs::dispatch::{DrainReport, JobDispatcher, SubmitError};
use jobforge_jobs::worker::ShutdownSignal;
use jobforge_jobs::{InMemoryJobStore, Job, JobStore, LockManager, Recurrence};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Accepts everything and counts it.
#[derive(Default)]
struct CountingDispatcher {
    accepted: AtomicUsize,
}

impl JobDispatcher for CountingDispatcher {
    fn submit(&self, _job: Job) -> Result<(), SubmitError> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn queued(&self) -> usize {
        0
    }

    fn shutdown(&self, _timeout: Duration) -> DrainReport {
        DrainReport::default()
    }
}

fn seeded_store(jobs: usize) -> (Arc<InMemoryJobStore>, Vec<JobId>) {
    let now = Utc::now();
    let store = InMemoryJobStore::arc();
    let ids = (0..jobs)
        .map(|_| store.insert(Job::executable("bench", "{}", now)).unwrap().id)
        .collect();
    (store, ids)
}

fn bench_lock_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_contention");

    for lockers in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(lockers), &lockers, |b, &lockers| {
            b.iter_batched(
                || seeded_store(256),
                |(store, ids)| {
                    let ids = Arc::new(ids);
                    let handles: Vec<_> = (0..lockers)
                        .map(|n| {
                            let store = store.clone();
                            let ids = ids.clone();
                            thread::spawn(move || {
                                let owner = format!("node-{n}");
                                let now = Utc::now();
                                ids.iter()
                                    .filter(|id| {
                                        store
                                            .try_lock(**id, &owner, TimeDelta::minutes(5), now)
                                            .unwrap()
                                            .acquired
                                    })
                                    .count()
                            })
                        })
                        .collect();
                    let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
                    black_box(won)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_acquisition_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquisition_batch");

    for batch in [32usize, 512] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let (store, _) = seeded_store(batch);
                    let clock: SharedClock = ManualClock::arc(Utc::now());
                    let settings = AcquisitionSettings {
                        kind: AcquisitionKind::Async,
                        max_per_acquisition: batch,
                        default_wait: Duration::from_secs(10),
                        lock_lease: Duration::from_secs(3600),
                        execution_lease: Duration::from_secs(3600),
                        queue_full_wait: Duration::from_secs(1),
                    };
                    let locks = LockManager::new(store.clone(), clock.clone(), "bench-node");
                    AcquisitionLoop::new(
                        settings,
                        store,
                        locks,
                        Arc::new(CountingDispatcher::default()),
                        clock,
                    )
                },
                |acquisition| {
                    let (_tx, signal) = ShutdownSignal::pair();
                    black_box(acquisition.run_cycle(&signal).unwrap())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_recurrence(c: &mut Criterion) {
    let mut group = c.benchmark_group("recurrence");
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    group.bench_function("parse", |b| {
        b.iter(|| Recurrence::parse(black_box("R10/2024-01-01T00:00:00Z/P1DT2H30M")).unwrap())
    });

    let hourly = Recurrence::parse("R/PT1H").unwrap();
    group.bench_function("next_due_on_time", |b| {
        b.iter(|| hourly.next_due_time(black_box(start), start).unwrap())
    });

    // A node that was down for a year has to skip ~8760 missed fires.
    let late = start + TimeDelta::days(365);
    group.bench_function("next_due_catch_up_one_year", |b| {
        b.iter(|| hourly.next_due_time(black_box(start), late).unwrap())
    });

    let monthly = Recurrence::parse("R/P1M").unwrap();
    group.bench_function("next_due_calendar_month", |b| {
        b.iter(|| monthly.next_due_time(black_box(start), late).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_contention,
    bench_acquisition_batch,
    bench_recurrence
);
criterion_main!(benches);
