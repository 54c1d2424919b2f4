//! Bounded thread pool for CPU-bound request work.
//!
//! Event-loop threads must never block, so decoded requests are handed to
//! this pool and the computed response re-enters the owning loop through its
//! task queue. The work queue is bounded and submission is non-blocking:
//! when the queue is full the submission is rejected, never queued
//! unboundedly and never allowed to stall an event loop.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long idle workers sleep between shutdown-flag checks.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("executor queue is full")]
    QueueFull,
    #[error("executor is shut down")]
    ShutDown,
}

/// Fixed-size worker pool with a bounded job queue.
pub struct BusinessExecutor {
    tx: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BusinessExecutor {
    pub fn new(threads: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Job>(queue_depth.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("business-{i}"))
                .spawn(move || worker_loop(rx, shutdown))?;
            workers.push(handle);
        }

        Ok(Self {
            tx,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job without blocking.
    pub fn try_submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown);
        }
        match self.tx.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown),
        }
    }

    /// Stop accepting work and wait for in-flight jobs.
    ///
    /// Workers drain the remaining queue before exiting; any worker still
    /// busy past the deadline is abandoned.
    pub fn shutdown(&self, timeout: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("business executor shutting down");

        let deadline = Instant::now() + timeout;
        let handles = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("business worker abandoned at shutdown deadline");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>, shutdown: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(job) => job(),
            Err(RecvTimeoutError::Timeout) => {
                // Timeout means the queue is drained; safe to exit.
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_jobs_run_on_pool_threads() {
        let executor = BusinessExecutor::new(2, 16).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            executor
                .try_submit(move || {
                    tx.send(i).unwrap();
                })
                .unwrap();
        }

        let mut seen: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());

        executor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_full_queue_rejects() {
        let executor = BusinessExecutor::new(1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Occupy the single worker
        executor
            .try_submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();

        // Fill the single queue slot, then expect rejection. The busy worker
        // may still be picking up the first job, so allow one settle retry.
        let mut rejected = false;
        for _ in 0..50 {
            match executor.try_submit(|| {}) {
                Err(SubmitError::QueueFull) => {
                    rejected = true;
                    break;
                }
                Ok(()) => {}
                Err(e) => panic!("unexpected submit error: {e}"),
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(rejected);

        release_tx.send(()).unwrap();
        executor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_work() {
        let executor = BusinessExecutor::new(1, 4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            executor
                .try_submit(move || {
                    thread::sleep(Duration::from_millis(30));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        executor.shutdown(Duration::from_secs(2));
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let executor = BusinessExecutor::new(1, 4).unwrap();
        executor.shutdown(Duration::from_secs(1));
        assert_eq!(executor.try_submit(|| {}), Err(SubmitError::ShutDown));
    }
}
