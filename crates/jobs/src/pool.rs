//! Bounded, elastic worker pool.
//!
//! `core_size` threads start with the pool and live until shutdown. When the
//! queue is full, extra threads up to `max_size` are started; they exit after
//! `keep_alive` without work. A full queue with every thread running rejects
//! the submission so the caller can back off.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::dispatch::{DrainReport, JobDispatcher, SubmitError};
use crate::error::SchedulerError;
use crate::handler::panic_message;
use crate::types::Job;

/// Work performed for each job taken off the queue.
pub type JobTask = Arc<dyn Fn(Job) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub keep_alive: Duration,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "jobforge-exec".to_string(),
            core_size: 8,
            max_size: 8,
            keep_alive: Duration::from_secs(5),
            queue_capacity: 2048,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<Job>,
    threads: usize,
    active: usize,
    spawned_total: usize,
    shutting_down: bool,
}

struct Inner {
    config: PoolConfig,
    task: JobTask,
    state: Mutex<PoolState>,
    work_available: Condvar,
    thread_exited: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread pool executing locked jobs.
#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ExecutionPool")
            .field("name", &self.inner.config.name)
            .field("threads", &state.threads)
            .field("active", &state.active)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl ExecutionPool {
    /// Start the pool with its core threads.
    pub fn start(config: PoolConfig, task: JobTask) -> Result<Self, SchedulerError> {
        let core_size = config.core_size.max(1);
        let pool = Self {
            inner: Arc::new(Inner {
                config,
                task,
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                thread_exited: Condvar::new(),
            }),
        };

        for _ in 0..core_size {
            let index = pool.reserve_thread();
            if let Err(err) = spawn_thread(&pool.inner, index) {
                pool.inner.lock().threads -= 1;
                pool.shutdown(Duration::ZERO);
                return Err(err);
            }
        }

        info!(
            pool = %pool.inner.config.name,
            core = core_size,
            max = pool.inner.config.max_size,
            queue_capacity = pool.inner.config.queue_capacity,
            "execution pool started"
        );
        Ok(pool)
    }

    fn reserve_thread(&self) -> usize {
        let mut state = self.inner.lock();
        state.threads += 1;
        state.spawned_total += 1;
        state.spawned_total
    }

    pub fn threads(&self) -> usize {
        self.inner.lock().threads
    }

    /// Threads currently running a job.
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }
}

impl JobDispatcher for ExecutionPool {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        let config = &self.inner.config;
        let mut state = self.inner.lock();

        if state.shutting_down {
            return Err(SubmitError::Closed(Box::new(job)));
        }

        if state.queue.len() < config.queue_capacity {
            state.queue.push_back(job);
            drop(state);
            self.inner.work_available.notify_one();
            return Ok(());
        }

        if state.threads >= config.max_size.max(config.core_size) {
            return Err(SubmitError::QueueFull(Box::new(job)));
        }

        // Queue full but room to grow: park the job and start a thread for it.
        let id = job.id;
        state.queue.push_back(job);
        state.threads += 1;
        state.spawned_total += 1;
        let index = state.spawned_total;
        drop(state);

        match spawn_thread(&self.inner, index) {
            Ok(()) => {
                debug!(pool = %config.name, thread = index, "pool grew above core size");
                Ok(())
            }
            Err(err) => {
                warn!(pool = %config.name, error = %err, "failed to grow pool");
                let mut state = self.inner.lock();
                state.threads -= 1;
                match state.queue.iter().position(|j| j.id == id) {
                    Some(pos) => match state.queue.remove(pos) {
                        Some(job) => Err(SubmitError::QueueFull(Box::new(job))),
                        None => Ok(()),
                    },
                    // Another worker already picked it up.
                    None => Ok(()),
                }
            }
        }
    }

    fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Queued jobs keep running until the deadline; whatever has not started
    /// by then is handed back as abandoned.
    fn shutdown(&self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        state.shutting_down = true;
        self.inner.work_available.notify_all();

        while state.threads > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .thread_exited
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        let abandoned: Vec<Job> = state.queue.drain(..).collect();
        let report = DrainReport {
            completed_in_time: state.threads == 0,
            abandoned,
        };
        info!(
            pool = %self.inner.config.name,
            completed_in_time = report.completed_in_time,
            abandoned = report.abandoned.len(),
            still_running = state.threads,
            "execution pool stopped"
        );
        report
    }
}

fn spawn_thread(inner: &Arc<Inner>, index: usize) -> Result<(), SchedulerError> {
    let name = format!("{}-{index}", inner.config.name);
    let worker = Arc::clone(inner);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(&worker))
        .map(|_| ())
        .map_err(|e| SchedulerError::spawn(name, e))
}

fn worker_loop(inner: &Inner) {
    while let Some(job) = next_job(inner) {
        let job_id = job.id;
        let task = Arc::clone(&inner.task);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task(job))) {
            error!(
                pool = %inner.config.name,
                job_id = %job_id,
                panic = %panic_message(payload.as_ref()),
                "job task panicked"
            );
        }
        inner.lock().active -= 1;
    }
}

/// Block until there is a job or this thread should exit.
fn next_job(inner: &Inner) -> Option<Job> {
    let mut state = inner.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            state.active += 1;
            return Some(job);
        }
        if state.shutting_down {
            break;
        }

        let (guard, timeout) = inner
            .work_available
            .wait_timeout(state, inner.config.keep_alive)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;

        if timeout.timed_out() && state.queue.is_empty() && state.threads > inner.config.core_size {
            break;
        }
    }
    state.threads -= 1;
    drop(state);
    inner.thread_exited.notify_all();
    None
}
