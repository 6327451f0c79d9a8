//! End-to-end scheduling scenarios.
//!
//! Tests: facade → store → acquisition → pool/broker → runner → store
//!
//! Verifies:
//! - Recurring timers stop after their repetition budget
//! - Failing jobs land in the dead-letter state and can be retried
//! - A saturated pool stalls acquisition without dropping work
//! - Several nodes sharing a store execute every job exactly once

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use jobforge_core::{JobId, ManualClock};

    use crate::broker::InMemoryBroker;
    use crate::calendar::NoVariables;
    use crate::config::{RetryPolicy, SchedulerConfig};
    use crate::handler::ExecutionError;
    use crate::scheduler::{JobScheduler, NewJob, NewTimer};
    use crate::store::{InMemoryJobStore, JobQuery, JobStore};
    use crate::types::{Job, JobCategory};

    const TICK: Duration = Duration::from_millis(10);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// Fast loops, immediate retries.
    fn test_config(owner: &str) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_lock_owner(owner)
            .with_pool_size(2, 4)
            .with_acquire_wait(TICK, TICK)
            .with_queue(16, TICK)
            .with_reset_expired(true, TICK, 3, Duration::from_secs(24 * 3600))
            .with_retry_policy(RetryPolicy::immediate())
            .with_shutdown_wait(Duration::from_secs(5))
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[derive(Clone, Default)]
    struct Executions {
        counts: Arc<Mutex<HashMap<JobId, usize>>>,
    }

    impl Executions {
        fn record(&self, id: JobId) {
            *self.counts.lock().unwrap().entry(id).or_default() += 1;
        }

        fn total(&self) -> usize {
            self.counts.lock().unwrap().values().sum()
        }

        fn of(&self, id: JobId) -> usize {
            self.counts.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        fn distinct(&self) -> usize {
            self.counts.lock().unwrap().len()
        }
    }

    fn timers(store: &InMemoryJobStore) -> Vec<Job> {
        store
            .find(&JobQuery::new().category(JobCategory::Timer), 100)
            .unwrap()
    }

    #[test]
    fn recurring_timer_stops_after_its_repetitions() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(t0());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let scheduler = JobScheduler::builder(test_config("node-a"), store.clone())
            .clock(clock.clone())
            .handler_fn("tick", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        scheduler
            .schedule_timer(NewTimer::new("tick", "{}", "R3/PT1H"), &NoVariables)
            .unwrap();
        scheduler.start().unwrap();

        for cycle in 1..=3 {
            clock.advance(TimeDelta::hours(1));
            assert!(wait_until(|| fired.load(Ordering::SeqCst) == cycle));
            if cycle < 3 {
                let expected_due = t0() + TimeDelta::hours(cycle as i64 + 1);
                assert!(wait_until(|| {
                    timers(&store)
                        .first()
                        .is_some_and(|t| t.due_time == Some(expected_due))
                }));
            }
        }

        assert!(wait_until(|| store.is_empty()));
        clock.advance(TimeDelta::hours(5));
        thread::sleep(TICK * 5);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(timers(&store).is_empty());
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn exhausted_job_is_dead_lettered_and_can_be_retried() {
        let store = InMemoryJobStore::arc();
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let executions = Executions::default();
        let recorder = executions.clone();

        let scheduler = JobScheduler::builder(test_config("node-a"), store.clone())
            .clock(ManualClock::arc(t0()))
            .handler_fn("flaky", move |ctx| {
                recorder.record(ctx.job.id);
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(ExecutionError::failed("downstream unavailable"))
                }
            })
            .build()
            .unwrap();
        scheduler.start().unwrap();

        let job = scheduler
            .create_job(NewJob::new("flaky", "{}").with_retries(1))
            .unwrap();
        assert!(wait_until(|| {
            store
                .get(job.id)
                .unwrap()
                .is_some_and(|j| j.category == JobCategory::DeadLetter)
        }));

        let dead = scheduler.get_job(job.id).unwrap();
        assert_eq!(dead.retries_remaining, 0);
        assert!(dead.exception_info.as_deref().unwrap().contains("downstream unavailable"));
        assert!(dead.lock_owner.is_none());
        assert_eq!(executions.of(job.id), 1);
        assert_eq!(scheduler.list_dead_letters(10).unwrap().len(), 1);

        healthy.store(true, Ordering::SeqCst);
        scheduler.retry_dead_letter(job.id, Some(2)).unwrap();
        assert!(wait_until(|| store.get(job.id).unwrap().is_none()));
        assert_eq!(executions.of(job.id), 2);

        assert!(wait_until(|| scheduler.stats().unwrap().executor.jobs_succeeded == 1));
        assert_eq!(scheduler.stats().unwrap().executor.jobs_dead_lettered, 1);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn retry_ladder_runs_exactly_k_attempts() {
        let store = InMemoryJobStore::arc();
        let executions = Executions::default();
        let recorder = executions.clone();

        let scheduler = JobScheduler::builder(test_config("node-a"), store.clone())
            .clock(ManualClock::arc(t0()))
            .handler_fn("broken", move |ctx| {
                recorder.record(ctx.job.id);
                Err(ExecutionError::failed("always"))
            })
            .build()
            .unwrap();
        scheduler.start().unwrap();

        let job = scheduler
            .create_job(NewJob::new("broken", "").with_retries(4))
            .unwrap();
        assert!(wait_until(|| {
            store
                .get(job.id)
                .unwrap()
                .is_some_and(|j| j.category == JobCategory::DeadLetter)
        }));
        thread::sleep(TICK * 5);
        assert_eq!(executions.of(job.id), 4);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn saturated_pool_stalls_acquisition_without_dropping_jobs() {
        let store = InMemoryJobStore::arc();
        let executions = Executions::default();
        let recorder = executions.clone();
        let config = test_config("node-a")
            .with_pool_size(1, 1)
            .with_queue(1, Duration::from_millis(20));

        let scheduler = JobScheduler::builder(config, store.clone())
            .clock(ManualClock::arc(t0()))
            .handler_fn("slow", move |ctx| {
                thread::sleep(Duration::from_millis(15));
                recorder.record(ctx.job.id);
                Ok(())
            })
            .build()
            .unwrap();

        let ids: Vec<JobId> = (0..8)
            .map(|_| scheduler.create_job(NewJob::new("slow", "")).unwrap().id)
            .collect();
        scheduler.start().unwrap();

        assert!(wait_until(|| executions.total() == ids.len()));
        for id in &ids {
            assert_eq!(executions.of(*id), 1);
        }
        assert!(wait_until(|| store.is_empty()));
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.executor.jobs_dead_lettered, 0);
        assert!(scheduler.shutdown().unwrap().completed_in_time);
    }

    #[test]
    fn nodes_sharing_a_store_run_each_job_once() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(t0());
        let executions = Executions::default();

        let nodes: Vec<JobScheduler> = ["node-a", "node-b", "node-c"]
            .into_iter()
            .map(|owner| {
                let recorder = executions.clone();
                JobScheduler::builder(test_config(owner).with_dispatch_on_create(false), store.clone())
                    .clock(clock.clone())
                    .handler_fn("work", move |ctx| {
                        recorder.record(ctx.job.id);
                        Ok(())
                    })
                    .build()
                    .unwrap()
            })
            .collect();

        for _ in 0..60 {
            nodes[0].create_job(NewJob::new("work", "")).unwrap();
        }
        for node in &nodes {
            node.start().unwrap();
        }

        assert!(wait_until(|| store.is_empty()));
        for node in &nodes {
            node.shutdown().unwrap();
        }
        assert_eq!(executions.distinct(), 60);
        assert_eq!(executions.total(), 60);
    }

    #[test]
    fn expired_lease_of_a_dead_node_is_reclaimed() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(t0());
        let executions = Executions::default();
        let recorder = executions.clone();

        let job = store.insert(Job::executable("work", "", t0())).unwrap();
        store
            .try_lock(job.id, "dead-node", TimeDelta::minutes(10), t0())
            .unwrap();

        let scheduler = JobScheduler::builder(test_config("node-a"), store.clone())
            .clock(clock.clone())
            .handler_fn("work", move |ctx| {
                recorder.record(ctx.job.id);
                Ok(())
            })
            .build()
            .unwrap();
        scheduler.start().unwrap();

        clock.advance(TimeDelta::minutes(9));
        thread::sleep(TICK * 5);
        assert_eq!(executions.of(job.id), 0);

        clock.advance(TimeDelta::minutes(2));
        assert!(wait_until(|| executions.of(job.id) == 1));
        assert!(wait_until(|| store.is_empty()));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn suspended_timer_does_not_fire_until_resumed() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(t0());
        let executions = Executions::default();
        let recorder = executions.clone();

        let scheduler = JobScheduler::builder(test_config("node-a"), store.clone())
            .clock(clock.clone())
            .handler_fn("remind", move |ctx| {
                recorder.record(ctx.job.id);
                Ok(())
            })
            .build()
            .unwrap();
        let timer = scheduler
            .schedule_timer(NewTimer::new("remind", "{}", "PT1H"), &NoVariables)
            .unwrap();
        scheduler.suspend_job(timer.id).unwrap();
        scheduler.start().unwrap();

        clock.advance(TimeDelta::hours(2));
        thread::sleep(TICK * 5);
        assert_eq!(executions.of(timer.id), 0);

        let resumed = scheduler.resume_job(timer.id).unwrap();
        assert_eq!(resumed.category, JobCategory::Timer);
        assert!(wait_until(|| executions.of(timer.id) == 1));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn message_queue_mode_executes_through_the_broker() {
        let store = InMemoryJobStore::arc();
        let executions = Executions::default();
        let recorder = executions.clone();

        let scheduler = JobScheduler::builder(
            test_config("node-a").with_message_queue_mode(true),
            store.clone(),
        )
        .clock(ManualClock::arc(t0()))
        .broker(InMemoryBroker::arc(64))
        .handler_fn("work", move |ctx| {
            recorder.record(ctx.job.id);
            Ok(())
        })
        .build()
        .unwrap();

        for _ in 0..10 {
            scheduler.create_job(NewJob::new("work", "")).unwrap();
        }
        scheduler.start().unwrap();

        assert!(wait_until(|| executions.total() == 10));
        assert!(wait_until(|| store.is_empty()));
        assert_eq!(executions.distinct(), 10);
        let report = scheduler.shutdown().unwrap();
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn direct_dispatch_runs_only_locally_created_jobs() {
        let store = InMemoryJobStore::arc();
        let executions = Executions::default();
        let recorder = executions.clone();

        let scheduler = JobScheduler::builder(
            test_config("node-a")
                .with_async_acquisition(false)
                .with_timer_acquisition(false),
            store.clone(),
        )
        .clock(ManualClock::arc(t0()))
        .handler_fn("work", move |ctx| {
            recorder.record(ctx.job.id);
            Ok(())
        })
        .build()
        .unwrap();
        scheduler.start().unwrap();

        let foreign = store.insert(Job::executable("work", "", t0())).unwrap();
        let local = scheduler.create_job(NewJob::new("work", "")).unwrap();

        assert!(wait_until(|| executions.of(local.id) == 1));
        thread::sleep(TICK * 5);
        assert_eq!(executions.of(foreign.id), 0);
        assert!(store.get(foreign.id).unwrap().is_some());
        scheduler.shutdown().unwrap();
    }
}
