// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Job queues: run loops served by owned worker threads.
//!
//! A [`JobQueue`] is a [`RunLoop`] plus `N ≥ 1` spawned workers with a
//! configurable scheduling priority, CPU affinity and per-worker
//! init/teardown callbacks. Enqueueing wakes a single waiter; the full
//! run-loop surface (waits, cancels, stats) is available through `Deref`.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::Result;
use crate::run_loop::{Order, RunLoop};
use crate::thread::{WorkerOptions, spawn_worker};

mod pool;

pub use pool::{JobQueuePool, PoolBuilder, PooledQueue};

/// Per-worker lifecycle hooks: `initialize` runs on the worker thread
/// before it serves its first job, `teardown` after it served its last.
pub trait WorkerCallback: Send + Sync + 'static {
    fn initialize(&self) {}

    fn teardown(&self) {}
}

/// Configures and creates a [`JobQueue`].
pub struct Builder {
    name: Option<String>,
    order: Order,
    max_pending: Option<usize>,
    workers: usize,
    worker_options: WorkerOptions,
    callback: Option<Arc<dyn WorkerCallback>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            order: Order::Fifo,
            max_pending: None,
            workers: 1,
            worker_options: WorkerOptions::default(),
            callback: None,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    /// Number of worker threads; at least one.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn worker_priority(mut self, priority: i32) -> Self {
        self.worker_options.priority = priority;
        self
    }

    #[must_use]
    pub fn worker_affinity(mut self, affinity: u64) -> Self {
        self.worker_options.affinity = affinity;
        self
    }

    #[must_use]
    pub fn worker_callback(mut self, callback: Arc<dyn WorkerCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Creates the queue and spawns its workers.
    ///
    /// # Errors
    ///
    /// [`Error::Platform`](crate::Error::Platform) if a worker thread
    /// cannot be spawned.
    pub fn build(self) -> Result<JobQueue> {
        let mut run_loop = crate::run_loop::Builder::new().order(self.order);
        if let Some(name) = self.name {
            run_loop = run_loop.name(name);
        }
        if let Some(max_pending) = self.max_pending {
            run_loop = run_loop.max_pending(max_pending);
        }

        let queue = JobQueue {
            run_loop: run_loop.build(),
            workers: self.workers,
            worker_options: self.worker_options,
            callback: self.callback,
            handles: Mutex::new(Vec::new()),
        };
        queue.start()?;
        Ok(queue)
    }
}

/// A run loop served by owned worker threads.
///
/// Dereferences to [`RunLoop`] for the enqueue/wait/cancel surface.
/// Dropping the queue stops it and joins the workers.
pub struct JobQueue {
    run_loop: RunLoop,
    workers: usize,
    worker_options: WorkerOptions,
    callback: Option<Arc<dyn WorkerCallback>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

// === impl JobQueue ===

impl JobQueue {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// (Re)spawns the worker threads. A no-op while the queue is already
    /// running; used to restart a stopped queue.
    ///
    /// # Errors
    ///
    /// [`Error::Platform`](crate::Error::Platform) if a worker thread
    /// cannot be spawned; already-spawned workers keep serving.
    pub fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }

        self.run_loop.prepare_serve();
        for index in 0..self.workers {
            let name = format!("{}-worker-{index}", self.run_loop.name());
            let run_loop = self.run_loop.clone();
            let callback = self.callback.clone();
            let handle = spawn_worker(name, self.worker_options, move || {
                if let Some(callback) = &callback {
                    callback.initialize();
                }
                run_loop.begin_serving();
                while let Some(entry) = run_loop.next_entry() {
                    run_loop.run_entry(entry);
                }
                run_loop.end_serving();
                if let Some(callback) = &callback {
                    callback.teardown();
                }
            })?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Stops the underlying run loop and joins the workers. See
    /// [`RunLoop::stop`] for the job-completion contract.
    pub fn stop(&self, cancel_running: bool) {
        self.run_loop.stop(cancel_running);
        let workers: Vec<_> = self.handles.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    #[must_use]
    pub fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
    }
}

impl Deref for JobQueue {
    type Target = RunLoop;

    fn deref(&self) -> &RunLoop {
        &self.run_loop
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("run_loop", &self.run_loop)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_fn;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn serves_jobs_on_worker_threads() {
        let queue = JobQueue::builder().name("jq").build().unwrap();
        let caller = std::thread::current().id();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            queue
                .enq_job(job_fn(move |_| {
                    assert_ne!(std::thread::current().id(), caller);
                    hits.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }

        assert!(queue.wait_for_idle(Some(Duration::from_secs(5))));
        assert_eq!(hits.load(Ordering::Relaxed), 8);
        queue.stop(false);
    }

    #[test]
    fn multiple_workers_drain_in_parallel() {
        let queue = JobQueue::builder()
            .name("jq-wide")
            .workers(4)
            .build()
            .unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            queue
                .enq_job(job_fn(move |_| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        assert!(queue.wait_for_idle(Some(Duration::from_secs(5))));
        assert!(peak.load(Ordering::SeqCst) > 1);
        queue.stop(false);
    }

    #[test]
    fn worker_callbacks_run_per_worker() {
        struct Counting {
            up: AtomicUsize,
            down: AtomicUsize,
        }

        impl WorkerCallback for Arc<Counting> {
            fn initialize(&self) {
                self.up.fetch_add(1, Ordering::SeqCst);
            }

            fn teardown(&self) {
                self.down.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counters = Arc::new(Counting {
            up: AtomicUsize::new(0),
            down: AtomicUsize::new(0),
        });
        let queue = JobQueue::builder()
            .workers(2)
            .worker_callback(Arc::new(Arc::clone(&counters)))
            .build()
            .unwrap();

        queue.stop(false);
        assert_eq!(counters.up.load(Ordering::SeqCst), 2);
        assert_eq!(counters.down.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn restarts_after_stop() {
        let queue = JobQueue::builder().build().unwrap();
        queue.stop(false);

        queue.start().unwrap();
        let job = queue.enq_job(job_fn(|_| {})).unwrap();
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert!(job.is_succeeded());
        queue.stop(false);
    }
}
