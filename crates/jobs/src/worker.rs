//! Background thread handles with cooperative shutdown.

use std::cell::Cell;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::SchedulerError;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to finish.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) {
        self.signal();
        self.join();
    }
}

/// Worker-side end of the shutdown channel.
///
/// Once a stop request has been seen it stays latched.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: mpsc::Receiver<()>,
    requested: Cell<bool>,
}

impl ShutdownSignal {
    /// A signal plus the sender that trips it.
    pub fn pair() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx,
                requested: Cell::new(false),
            },
        )
    }

    /// Non-blocking check.
    pub fn is_requested(&self) -> bool {
        if self.requested.get() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                self.requested.set(true);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Sleep up to `timeout`, waking early on shutdown. Returns `true` when
    /// shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.requested.get() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.requested.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Spawn a named thread running `body` until it returns.
pub fn spawn_worker<F>(name: impl Into<String>, body: F) -> Result<WorkerHandle, SchedulerError>
where
    F: FnOnce(ShutdownSignal) + Send + 'static,
{
    let name = name.into();
    let (tx, signal) = ShutdownSignal::pair();
    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || body(signal))
        .map_err(|e| SchedulerError::spawn(name.clone(), e))?;

    Ok(WorkerHandle {
        name,
        shutdown: tx,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn worker_stops_on_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let handle = spawn_worker("ticker", move |signal| {
            while !signal.wait(Duration::from_millis(5)) {
                t.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.name(), "ticker");
        handle.shutdown();
        let seen = ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn signal_latches_and_wakes_waiters_early() {
        let (tx, signal) = ShutdownSignal::pair();
        assert!(!signal.is_requested());
        tx.send(()).unwrap();

        let started = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(signal.is_requested());
        assert!(signal.wait(Duration::from_secs(10)));
    }

    #[test]
    fn dropped_handle_counts_as_shutdown() {
        let (tx, signal) = ShutdownSignal::pair();
        drop(tx);
        assert!(signal.is_requested());
    }
}
