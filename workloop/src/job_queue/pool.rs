// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bag of reusable [`JobQueue`]s.
//!
//! Borrowers take a queue with [`get_queue`](JobQueuePool::get_queue) and
//! return it by dropping the [`PooledQueue`]. The pool creates queues on
//! demand up to `max`, and destroys idle queues above `min` once they have
//! been continuously idle for `idle_timeout` (checked on every pool
//! interaction rather than by a dedicated reaper thread).

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::job_queue::{Builder, JobQueue, WorkerCallback};
use crate::run_loop::Order;
use crate::thread::WorkerOptions;

/// Configures and creates a [`JobQueuePool`].
pub struct PoolBuilder {
    name: String,
    min: usize,
    max: usize,
    idle_timeout: Duration,
    order: Order,
    max_pending: Option<usize>,
    workers_per_queue: usize,
    worker_options: WorkerOptions,
    callback: Option<Arc<dyn WorkerCallback>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: "job-queue-pool".to_owned(),
            min: 1,
            max: 8,
            idle_timeout: Duration::from_secs(30),
            order: Order::Fifo,
            max_pending: None,
            workers_per_queue: 1,
            worker_options: WorkerOptions::default(),
            callback: None,
        }
    }
}

impl PoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Idle queues are kept down to this floor; at least one.
    #[must_use]
    pub fn min_queues(mut self, min: usize) -> Self {
        self.min = min.max(1);
        self
    }

    /// Hard ceiling on live queues, borrowed and idle combined.
    #[must_use]
    pub fn max_queues(mut self, max: usize) -> Self {
        self.max = max.max(1);
        self
    }

    /// How long an excess queue may sit idle before it is destroyed.
    /// Clamped to at least one millisecond.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout.max(Duration::from_millis(1));
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

    #[must_use]
    pub fn workers_per_queue(mut self, workers: usize) -> Self {
        self.workers_per_queue = workers.max(1);
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

    #[must_use]
    pub fn build(self) -> JobQueuePool {
        let max = self.max.max(self.min);
        JobQueuePool {
            inner: Arc::new(PoolInner {
                name: self.name,
                min: self.min,
                max,
                idle_timeout: self.idle_timeout,
                order: self.order,
                max_pending: self.max_pending,
                workers_per_queue: self.workers_per_queue,
                worker_options: self.worker_options,
                callback: self.callback,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    created: 0,
                }),
            }),
        }
    }
}

/// A bag of reusable job queues with min/max sizing and idle reaping.
#[derive(Clone)]
pub struct JobQueuePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    min: usize,
    max: usize,
    idle_timeout: Duration,
    order: Order,
    max_pending: Option<usize>,
    workers_per_queue: usize,
    worker_options: WorkerOptions,
    callback: Option<Arc<dyn WorkerCallback>>,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Returned queues, oldest first. Acquisition pops the newest (still
    /// cache-warm) entry, reaping removes from the front.
    idle: Vec<IdleEntry>,
    /// Queues alive right now, borrowed and idle combined. Never exceeds
    /// `max`.
    total: usize,
    /// Lifetime counter, used to name queues.
    created: usize,
}

struct IdleEntry {
    queue: Arc<JobQueue>,
    since: Instant,
}

/// A queue borrowed from a [`JobQueuePool`]; returns itself on drop.
pub struct PooledQueue {
    pool: Arc<PoolInner>,
    queue: Arc<JobQueue>,
}

// === impl JobQueuePool ===

impl JobQueuePool {
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Borrows an available queue, retrying up to `retry_count` times with
    /// `retry_backoff` sleeps in between. Creates a queue on demand while
    /// fewer than `max` are alive. Returns `None` when the pool stayed
    /// exhausted through every attempt.
    #[must_use]
    pub fn get_queue(&self, retry_count: usize, retry_backoff: Duration) -> Option<PooledQueue> {
        for attempt in 0..=retry_count {
            if let Some(queue) = self.inner.try_acquire() {
                return Some(PooledQueue {
                    pool: Arc::clone(&self.inner),
                    queue,
                });
            }
            if attempt < retry_count {
                std::thread::sleep(retry_backoff);
            }
        }
        None
    }

    /// Queues currently sitting idle in the bag.
    #[must_use]
    pub fn idle_queue_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Queues alive right now, borrowed and idle combined.
    #[must_use]
    pub fn live_queue_count(&self) -> usize {
        self.inner.state.lock().total
    }
}

impl fmt::Debug for JobQueuePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("JobQueuePool")
            .field("name", &self.inner.name)
            .field("min", &self.inner.min)
            .field("max", &self.inner.max)
            .field("idle", &state.idle.len())
            .field("total", &state.total)
            .finish_non_exhaustive()
    }
}

// === impl PoolInner ===

impl PoolInner {
    fn try_acquire(self: &Arc<Self>) -> Option<Arc<JobQueue>> {
        let (acquired, reaped, create) = {
            let mut state = self.state.lock();
            let reaped = Self::take_expired(self.min, self.idle_timeout, &mut state);
            if let Some(entry) = state.idle.pop() {
                (Some(entry.queue), reaped, false)
            } else if state.total < self.max {
                // Reserve the slot before leaving the lock; creation spawns
                // threads and must not hold the pool up.
                state.total += 1;
                state.created += 1;
                (None, reaped, true)
            } else {
                (None, reaped, false)
            }
        };
        Self::retire(reaped);

        if let Some(queue) = acquired {
            return Some(queue);
        }
        if !create {
            return None;
        }

        match self.build_queue() {
            Ok(queue) => Some(Arc::new(queue)),
            Err(err) => {
                tracing::warn!(pool = %self.name, %err, "failed to create job queue");
                self.state.lock().total -= 1;
                None
            }
        }
    }

    fn release(self: &Arc<Self>, queue: Arc<JobQueue>) {
        let reaped = {
            let mut state = self.state.lock();
            state.idle.push(IdleEntry {
                queue,
                since: Instant::now(),
            });
            Self::take_expired(self.min, self.idle_timeout, &mut state)
        };
        Self::retire(reaped);
    }

    /// Removes idle entries beyond `min` that have outlived the idle
    /// timeout, oldest first.
    fn take_expired(min: usize, idle_timeout: Duration, state: &mut PoolState) -> Vec<IdleEntry> {
        let mut expired = Vec::new();
        while state.idle.len() > min && state.idle[0].since.elapsed() >= idle_timeout {
            expired.push(state.idle.remove(0));
            state.total -= 1;
        }
        expired
    }

    /// Stops reaped queues outside the pool lock; stopping joins worker
    /// threads.
    fn retire(reaped: Vec<IdleEntry>) {
        for entry in reaped {
            entry.queue.stop(true);
        }
    }

    fn build_queue(&self) -> crate::error::Result<JobQueue> {
        let index = self.state.lock().created;
        let mut builder = Builder::new()
            .name(format!("{}-queue-{index}", self.name))
            .order(self.order)
            .workers(self.workers_per_queue)
            .worker_priority(self.worker_options.priority)
            .worker_affinity(self.worker_options.affinity);
        if let Some(max_pending) = self.max_pending {
            builder = builder.max_pending(max_pending);
        }
        if let Some(callback) = &self.callback {
            builder = builder.worker_callback(Arc::clone(callback));
        }
        builder.build()
    }
}

// === impl PooledQueue ===

impl PooledQueue {
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

impl Deref for PooledQueue {
    type Target = JobQueue;

    fn deref(&self) -> &JobQueue {
        &self.queue
    }
}

impl Drop for PooledQueue {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.queue));
    }
}

impl fmt::Debug for PooledQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledQueue")
            .field("queue", &*self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_fn;

    #[test]
    fn creates_on_demand_up_to_max() {
        let pool = JobQueuePool::builder()
            .name("pool")
            .min_queues(1)
            .max_queues(2)
            .build();

        let first = pool.get_queue(0, Duration::ZERO).unwrap();
        let second = pool.get_queue(0, Duration::ZERO).unwrap();
        assert_eq!(pool.live_queue_count(), 2);

        // At the ceiling with nothing idle.
        assert!(pool.get_queue(0, Duration::ZERO).is_none());

        drop(first);
        let third = pool.get_queue(0, Duration::ZERO).unwrap();
        assert_eq!(pool.live_queue_count(), 2);
        drop(second);
        drop(third);
    }

    #[test]
    fn borrowed_queue_serves_jobs() {
        let pool = JobQueuePool::builder().name("pool-serve").build();
        let queue = pool.get_queue(0, Duration::ZERO).unwrap();

        let job = queue.enq_job(job_fn(|_| {})).unwrap();
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert!(job.is_succeeded());
    }

    #[test]
    fn retry_loop_waits_for_a_release() {
        let pool = JobQueuePool::builder()
            .name("pool-retry")
            .min_queues(1)
            .max_queues(1)
            .build();

        let held = pool.get_queue(0, Duration::ZERO).unwrap();
        let releaser = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(held);
                let _ = pool;
            })
        };

        let reborrowed = pool.get_queue(20, Duration::from_millis(10));
        assert!(reborrowed.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn excess_idle_queues_are_reaped() {
        let pool = JobQueuePool::builder()
            .name("pool-reap")
            .min_queues(1)
            .max_queues(4)
            .idle_timeout(Duration::from_millis(20))
            .build();

        let a = pool.get_queue(0, Duration::ZERO).unwrap();
        let b = pool.get_queue(0, Duration::ZERO).unwrap();
        let c = pool.get_queue(0, Duration::ZERO).unwrap();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle_queue_count(), 3);

        std::thread::sleep(Duration::from_millis(40));
        // Reaping happens on the next interaction.
        let borrowed = pool.get_queue(0, Duration::ZERO).unwrap();
        assert!(pool.live_queue_count() <= 2);
        drop(borrowed);
    }
}
