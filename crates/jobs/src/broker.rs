//! Message-queue execution mode.
//!
//! Instead of the local pool, locked jobs are published as small messages
//! (id + version). Consumers re-read the job and run it only if the version is
//! still the one that was published.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use jobforge_core::{JobId, SharedClock};

use crate::dispatch::{DrainReport, JobDispatcher, SubmitError};
use crate::error::SchedulerError;
use crate::handler::panic_message;
use crate::pool::JobTask;
use crate::store::SharedStore;
use crate::types::Job;
use crate::worker::{spawn_worker, ShutdownSignal, WorkerHandle};

/// Reference to a locked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    /// Version at publish time.
    pub version: u64,
    pub published_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn for_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            version: job.version,
            published_at: now,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker queue is full")]
    Full,
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("message codec error: {0}")]
    Codec(String),
}

/// Transport for job messages.
pub trait MessageBroker: Send + Sync {
    fn publish(&self, message: &JobMessage) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> Result<Option<JobMessage>, BrokerError>;

    /// Messages waiting, when the transport can tell.
    fn pending(&self) -> usize {
        0
    }
}

pub type SharedBroker = Arc<dyn MessageBroker>;

impl<T> MessageBroker for Arc<T>
where
    T: MessageBroker + ?Sized,
{
    fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        (**self).publish(message)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<JobMessage>, BrokerError> {
        (**self).receive(timeout)
    }

    fn pending(&self) -> usize {
        (**self).pending()
    }
}

/// Bounded in-process broker for tests/dev.
#[derive(Debug)]
pub struct InMemoryBroker {
    capacity: usize,
    queue: Mutex<VecDeque<JobMessage>>,
    available: Condvar,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn arc(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }
}

impl MessageBroker for InMemoryBroker {
    fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            return Err(BrokerError::Full);
        }
        queue.push_back(message.clone());
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<JobMessage>, BrokerError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut queue, _) = self
            .available
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        Ok(queue.pop_front())
    }

    fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Dispatcher that publishes jobs and runs consumer threads for them.
pub struct MessageQueueDispatcher {
    broker: SharedBroker,
    clock: SharedClock,
    consumers: Mutex<Vec<WorkerHandle>>,
    running: Arc<AtomicUsize>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for MessageQueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueueDispatcher")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("pending", &self.broker.pending())
            .finish_non_exhaustive()
    }
}

impl MessageQueueDispatcher {
    /// Start `consumers` threads pulling from `broker`.
    pub fn start(
        broker: SharedBroker,
        store: SharedStore,
        clock: SharedClock,
        task: JobTask,
        consumers: usize,
        poll: Duration,
    ) -> Result<Self, SchedulerError> {
        let running = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(consumers.max(1));

        for index in 0..consumers.max(1) {
            let consumer = Consumer {
                broker: Arc::clone(&broker),
                store: Arc::clone(&store),
                task: Arc::clone(&task),
                running: Arc::clone(&running),
                poll,
            };
            match spawn_worker(format!("jobforge-mq-{index}"), move |signal| consumer.run(&signal)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    handles.into_iter().for_each(WorkerHandle::shutdown);
                    return Err(err);
                }
            }
        }

        info!(consumers = handles.len(), "message queue consumers started");
        Ok(Self {
            broker,
            clock,
            consumers: Mutex::new(handles),
            running,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

impl JobDispatcher for MessageQueueDispatcher {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed(Box::new(job)));
        }
        match self.broker.publish(&JobMessage::for_job(&job, self.clock.now())) {
            Ok(()) => Ok(()),
            Err(BrokerError::Full) => Err(SubmitError::QueueFull(Box::new(job))),
            Err(err) => Err(SubmitError::Unavailable {
                job: Box::new(job),
                reason: err.to_string(),
            }),
        }
    }

    fn queued(&self) -> usize {
        self.broker.pending()
    }

    /// Published messages stay with the broker; nothing is abandoned locally.
    fn shutdown(&self, timeout: Duration) -> DrainReport {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<WorkerHandle> = std::mem::take(
            &mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        handles.iter().for_each(WorkerHandle::signal);

        let deadline = Instant::now() + timeout;
        while self.running.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let completed_in_time = self.running.load(Ordering::SeqCst) == 0;
        if completed_in_time {
            handles.into_iter().for_each(WorkerHandle::join);
        } else {
            warn!(
                still_running = self.running.load(Ordering::SeqCst),
                "message queue consumers still busy at shutdown deadline"
            );
        }

        DrainReport {
            completed_in_time,
            abandoned: Vec::new(),
        }
    }
}

struct Consumer {
    broker: SharedBroker,
    store: SharedStore,
    task: JobTask,
    running: Arc<AtomicUsize>,
    poll: Duration,
}

impl Consumer {
    fn run(&self, signal: &ShutdownSignal) {
        while !signal.is_requested() {
            match self.broker.receive(self.poll) {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "failed to receive job message");
                    if signal.wait(self.poll) {
                        break;
                    }
                }
            }
        }
    }

    fn handle(&self, message: JobMessage) {
        let job = match self.store.get(message.job_id) {
            Ok(Some(job)) if job.version == message.version => job,
            Ok(Some(job)) => {
                debug!(
                    job_id = %message.job_id,
                    published_version = message.version,
                    current_version = job.version,
                    "skipping stale job message"
                );
                return;
            }
            Ok(None) => {
                debug!(job_id = %message.job_id, "job for message no longer exists");
                return;
            }
            Err(err) => {
                warn!(job_id = %message.job_id, error = %err, "failed to load job for message");
                return;
            }
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let task = Arc::clone(&self.task);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task(job))) {
            error!(
                job_id = %message.job_id,
                panic = %panic_message(payload.as_ref()),
                "job task panicked"
            );
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::TimeZone;
    use jobforge_core::{ManualClock, SystemClock};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn in_memory_broker_is_bounded_fifo() {
        let broker = InMemoryBroker::new(2);
        let now = Utc::now();
        let a = JobMessage::for_job(&Job::executable("a", "", now), now);
        let b = JobMessage::for_job(&Job::executable("b", "", now), now);

        broker.publish(&a).unwrap();
        broker.publish(&b).unwrap();
        assert_eq!(broker.publish(&a), Err(BrokerError::Full));
        assert_eq!(broker.pending(), 2);

        assert_eq!(broker.receive(Duration::ZERO).unwrap(), Some(a));
        assert_eq!(broker.receive(Duration::ZERO).unwrap(), Some(b));
        assert_eq!(broker.receive(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn messages_round_trip_as_json() {
        let now = Utc::now();
        let message = JobMessage::for_job(&Job::executable("a", "", now), now);
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(serde_json::from_str::<JobMessage>(&json).unwrap(), message);
    }

    #[test]
    fn consumers_run_current_jobs_and_skip_stale_messages() {
        let store = InMemoryJobStore::arc();
        let broker = InMemoryBroker::arc(16);
        let (tx, rx) = std::sync::mpsc::channel::<JobId>();
        let tx = Mutex::new(tx);
        let task: JobTask = Arc::new(move |job: Job| {
            let _ = tx.lock().unwrap().send(job.id);
        });

        let dispatcher = MessageQueueDispatcher::start(
            broker.clone(),
            store.clone(),
            Arc::new(SystemClock),
            task,
            2,
            Duration::from_millis(10),
        )
        .unwrap();

        let now = Utc::now();
        let current = store.insert(Job::executable("a", "", now)).unwrap();
        let mut stale = store.insert(Job::executable("b", "", now)).unwrap();
        let stale_copy = stale.clone();
        stale.exception_info = Some("touched".into());
        store.update(&stale, stale.version).unwrap();

        dispatcher.submit(stale_copy).unwrap();
        dispatcher.submit(current.clone()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), current.id);
        assert!(wait_until(|| broker.pending() == 0));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let report = dispatcher.shutdown(Duration::from_secs(1));
        assert!(report.completed_in_time);
        assert!(matches!(
            dispatcher.submit(current),
            Err(SubmitError::Closed(_))
        ));
    }

    /// Keeps every published message for inspection.
    #[derive(Default)]
    struct KeepingBroker {
        published: Mutex<Vec<JobMessage>>,
    }

    impl MessageBroker for KeepingBroker {
        fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn receive(&self, timeout: Duration) -> Result<Option<JobMessage>, BrokerError> {
            thread::sleep(timeout);
            Ok(None)
        }

        fn pending(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    #[test]
    fn published_messages_are_stamped_by_the_scheduler_clock() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let store = InMemoryJobStore::arc();
        let broker = Arc::new(KeepingBroker::default());
        let task: JobTask = Arc::new(|_: Job| {});
        let dispatcher = MessageQueueDispatcher::start(
            broker.clone(),
            store.clone(),
            ManualClock::arc(t0),
            task,
            1,
            Duration::from_millis(5),
        )
        .unwrap();

        let job = store.insert(Job::executable("a", "", t0)).unwrap();
        dispatcher.submit(job.clone()).unwrap();
        assert_eq!(
            broker.published.lock().unwrap().as_slice(),
            &[JobMessage {
                job_id: job.id,
                version: job.version,
                published_at: t0,
            }]
        );
        assert!(dispatcher.shutdown(Duration::from_secs(1)).completed_in_time);
    }
}
