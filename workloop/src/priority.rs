// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A priority-based, round-robin, O(1) scheduler.
//!
//! Callers create any number of logical [`Queue`]s and enqueue [`Task`]s on
//! them; the [`Scheduler`] multiplexes the queues over a bounded pool of
//! worker threads. Queues that have work are linked into one of three
//! priority bands. A worker picks the front queue of the highest non-empty
//! band, drains exactly one task, then relinks the queue at the back of its
//! band if it still has work — round-robin within a band, strict preemption
//! across bands. There is deliberately no fairness between bands: as long
//! as the high band has work, normal and low queues starve.
//!
//! A task that panics is trapped and logged; the worker pool survives.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use workloop_spin::SpinLock;

use crate::error::{Error, Result};
use crate::run_loop::Order;
use crate::thread::{WorkerOptions, spawn_worker};

/// The three scheduling bands. Higher strictly preempts lower.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// A unit of work for the priority scheduler.
///
/// `done` is the pool's shutdown flag; long-running tasks are expected to
/// poll it and return promptly once it is set.
pub trait Task: Send + 'static {
    fn run(&mut self, done: &AtomicBool);
}

/// Wraps a closure as a [`Task`].
pub fn task_fn<F>(f: F) -> impl Task
where
    F: FnMut(&AtomicBool) + Send + 'static,
{
    struct TaskFn<F>(F);

    impl<F> Task for TaskFn<F>
    where
        F: FnMut(&AtomicBool) + Send + 'static,
    {
        fn run(&mut self, done: &AtomicBool) {
            (self.0)(done);
        }
    }

    TaskFn(f)
}

/// Configures and creates a [`Scheduler`].
pub struct Builder {
    name: String,
    min_workers: usize,
    max_workers: usize,
    idle_grace: Duration,
    worker_options: WorkerOptions,
}

impl Default for Builder {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            name: "priority-scheduler".to_owned(),
            min_workers: cpus,
            max_workers: cpus * 2,
            idle_grace: Duration::from_secs(1),
            worker_options: WorkerOptions::default(),
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
        self.name = name.into();
        self
    }

    /// Workers kept alive even when idle; at least one.
    #[must_use]
    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers.max(1);
        self
    }

    /// Hard ceiling on concurrently live workers.
    #[must_use]
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// How long a worker above the floor lingers idle before exiting.
    #[must_use]
    pub fn idle_grace(mut self, idle_grace: Duration) -> Self {
        self.idle_grace = idle_grace;
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
    pub fn build(self) -> Scheduler {
        Scheduler {
            core: Arc::new(Core {
                name: self.name.clone(),
                bands: SpinLock::new(Bands {
                    high: VecDeque::new(),
                    normal: VecDeque::new(),
                    low: VecDeque::new(),
                }),
                pool: WorkerPool {
                    name: self.name,
                    min: self.min_workers,
                    max: self.max_workers.max(self.min_workers),
                    idle_grace: self.idle_grace,
                    options: self.worker_options,
                    shutdown: AtomicBool::new(false),
                    ctl: Mutex::new(PoolCtl {
                        total: 0,
                        idle: 0,
                        spawned: 0,
                    }),
                    work_cv: Condvar::new(),
                    handles: Mutex::new(Vec::new()),
                },
            }),
        }
    }
}

/// The priority scheduler. Dropping it shuts the worker pool down; queues
/// outlive it harmlessly (their tasks are simply never drained again).
pub struct Scheduler {
    core: Arc<Core>,
}

struct Core {
    name: String,
    bands: SpinLock<Bands>,
    pool: WorkerPool,
}

struct Bands {
    high: VecDeque<Arc<QueueCore>>,
    normal: VecDeque<Arc<QueueCore>>,
    low: VecDeque<Arc<QueueCore>>,
}

struct WorkerPool {
    name: String,
    min: usize,
    max: usize,
    idle_grace: Duration,
    options: WorkerOptions,
    shutdown: AtomicBool,
    ctl: Mutex<PoolCtl>,
    work_cv: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolCtl {
    /// Workers alive right now. Never exceeds `max`.
    total: usize,
    /// Workers parked waiting for work.
    idle: usize,
    /// Lifetime counter, used to name workers.
    spawned: usize,
}

/// A logical queue of tasks with its own ordering and priority.
#[derive(Clone)]
pub struct Queue {
    core: Arc<QueueCore>,
}

struct QueueCore {
    priority: Priority,
    order: Order,
    scheduler: Weak<Core>,
    state: SpinLock<QueueState>,
}

struct QueueState {
    tasks: VecDeque<Box<dyn Task>>,
    /// Linked into its priority band. A queue is in a band iff
    /// `in_list && !in_flight`.
    in_list: bool,
    /// A worker is currently draining one task from this queue; while set
    /// the queue is in no band.
    in_flight: bool,
}

// === impl Scheduler ===

impl Scheduler {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Creates a logical queue scheduled by this scheduler.
    #[must_use]
    pub fn create_queue(&self, priority: Priority, order: Order) -> Queue {
        Queue {
            core: Arc::new(QueueCore {
                priority,
                order,
                scheduler: Arc::downgrade(&self.core),
                state: SpinLock::new(QueueState {
                    tasks: VecDeque::new(),
                    in_list: false,
                    in_flight: false,
                }),
            }),
        }
    }

    /// Workers alive right now.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.core.pool.ctl.lock().total
    }

    /// Stops the worker pool and joins every worker. Queued tasks that no
    /// worker picked up stay in their queues.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctl = self.core.pool.ctl.lock();
        f.debug_struct("Scheduler")
            .field("name", &self.core.name)
            .field("workers", &ctl.total)
            .field("idle", &ctl.idle)
            .finish_non_exhaustive()
    }
}

// === impl Core ===

impl Core {
    /// Links `queue` into its priority band (if it has work and is neither
    /// linked nor in flight) and optionally wakes a worker for it.
    fn add_queue(self: &Arc<Self>, queue: &Arc<QueueCore>, needs_wake: bool) {
        let linked = {
            let mut bands = self.bands.lock();
            let mut state = queue.state.lock();
            if state.in_list || state.in_flight || state.tasks.is_empty() {
                false
            } else {
                state.in_list = true;
                bands.band_mut(queue.priority).push_back(Arc::clone(queue));
                true
            }
        };
        if linked && needs_wake {
            self.signal_work();
        }
    }

    /// The O(1) policy decision: pop from high, else normal, else low, and
    /// mark the popped queue in flight.
    fn get_next_queue(&self) -> Option<Arc<QueueCore>> {
        let mut guard = self.bands.lock();
        let bands = &mut *guard;
        for band in [&mut bands.high, &mut bands.normal, &mut bands.low] {
            if let Some(queue) = band.pop_front() {
                let mut state = queue.state.lock();
                state.in_list = false;
                state.in_flight = true;
                drop(state);
                return Some(queue);
            }
        }
        None
    }

    /// Called by a worker after draining one task: the queue leaves the
    /// in-flight state and, if it still has work, rejoins the *back* of its
    /// band so its siblings get their turn.
    fn requeue_after_drain(&self, queue: &Arc<QueueCore>) {
        let mut bands = self.bands.lock();
        let mut state = queue.state.lock();
        state.in_flight = false;
        if !state.tasks.is_empty() && !state.in_list {
            state.in_list = true;
            bands.band_mut(queue.priority).push_back(Arc::clone(queue));
        }
    }

    fn has_ready_queue(&self) -> bool {
        let bands = self.bands.lock();
        !(bands.high.is_empty() && bands.normal.is_empty() && bands.low.is_empty())
    }

    /// Wakes an idle worker, or spawns one while below the ceiling.
    fn signal_work(self: &Arc<Self>) {
        let pool = &self.pool;
        let mut ctl = pool.ctl.lock();
        if pool.shutdown.load(Ordering::Acquire) {
            return;
        }
        if ctl.idle > 0 {
            pool.work_cv.notify_one();
            return;
        }
        if ctl.total >= pool.max {
            return;
        }

        ctl.total += 1;
        let index = ctl.spawned;
        ctl.spawned += 1;
        drop(ctl);

        let core = Arc::clone(self);
        let spawned = spawn_worker(
            format!("{}-worker-{index}", pool.name),
            pool.options,
            move || worker_body(&core),
        );
        match spawned {
            Ok(handle) => pool.handles.lock().push(handle),
            Err(err) => {
                tracing::warn!(scheduler = %self.name, %err, "failed to spawn worker");
                pool.ctl.lock().total -= 1;
            }
        }
    }

    /// Parks the calling worker until work arrives. Returns `false` when
    /// the worker should exit: shutdown, or idle past the grace period
    /// while above the worker floor.
    fn park_until_work(&self) -> bool {
        let pool = &self.pool;
        let mut ctl = pool.ctl.lock();
        ctl.idle += 1;
        loop {
            if pool.shutdown.load(Ordering::Acquire) {
                ctl.idle -= 1;
                return false;
            }
            if self.has_ready_queue() {
                ctl.idle -= 1;
                return true;
            }
            let timed_out = pool
                .work_cv
                .wait_for(&mut ctl, pool.idle_grace)
                .timed_out();
            if timed_out && ctl.total > pool.min && !self.has_ready_queue() {
                ctl.idle -= 1;
                return false;
            }
        }
    }

    fn shutdown(&self) {
        self.pool.shutdown.store(true, Ordering::Release);
        self.pool.work_cv.notify_all();
        let workers: Vec<_> = self.pool.handles.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_body(core: &Arc<Core>) {
    let done = &core.pool.shutdown;
    loop {
        if done.load(Ordering::Acquire) {
            break;
        }
        match core.get_next_queue() {
            Some(queue) => {
                if let Some(mut task) = queue.pop_task() {
                    if catch_unwind(AssertUnwindSafe(|| task.run(done))).is_err() {
                        // One bad task must not take the worker pool down.
                        tracing::warn!(scheduler = %core.name, "task panicked, worker continues");
                    }
                }
                core.requeue_after_drain(&queue);
            }
            None => {
                if !core.park_until_work() {
                    break;
                }
            }
        }
    }
    core.pool.ctl.lock().total -= 1;
}

// === impl Bands ===

impl Bands {
    fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<Arc<QueueCore>> {
        match priority {
            Priority::Low => &mut self.low,
            Priority::Normal => &mut self.normal,
            Priority::High => &mut self.high,
        }
    }
}

// === impl Queue ===

impl Queue {
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    #[must_use]
    pub fn order(&self) -> Order {
        self.core.order
    }

    /// Enqueues a task and makes sure a worker will get to this queue.
    pub fn enq(&self, task: impl Task) {
        self.push(Box::new(task), false);
    }

    /// Enqueues a task ahead of any task enqueued later.
    pub fn enq_front(&self, task: impl Task) {
        self.push(Box::new(task), true);
    }

    /// Removes and returns the next task, if any.
    #[must_use]
    pub fn deq(&self) -> Option<Box<dyn Task>> {
        self.core.pop_task()
    }

    /// Drops every queued task and unlinks the queue from its band.
    pub fn flush(&self) {
        match self.core.scheduler.upgrade() {
            Some(scheduler) => {
                let mut bands = scheduler.bands.lock();
                let mut state = self.core.state.lock();
                state.tasks.clear();
                if state.in_list {
                    state.in_list = false;
                    bands
                        .band_mut(self.core.priority)
                        .retain(|queue| !Arc::ptr_eq(queue, &self.core));
                }
            }
            None => self.core.state.lock().tasks.clear(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.core.state.lock().tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, task: Box<dyn Task>, front: bool) {
        {
            let mut state = self.core.state.lock();
            // Workers always pop the front; LIFO queues therefore push new
            // work to the front, which also makes `enq_front` the natural
            // "run next" for both orders.
            match (front, self.core.order) {
                (false, Order::Fifo) => state.tasks.push_back(task),
                (false, Order::Lifo) | (true, _) => state.tasks.push_front(task),
            }
        }
        if let Some(scheduler) = self.core.scheduler.upgrade() {
            scheduler.add_queue(&self.core, true);
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Queue")
            .field("priority", &self.core.priority)
            .field("order", &self.core.order)
            .field("tasks", &state.tasks.len())
            .field("in_list", &state.in_list)
            .field("in_flight", &state.in_flight)
            .finish_non_exhaustive()
    }
}

// === impl QueueCore ===

impl QueueCore {
    fn pop_task(&self) -> Option<Box<dyn Task>> {
        self.state.lock().tasks.pop_front()
    }
}

// === global instance ===

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();
static GLOBAL_CONFIG: Mutex<Option<Builder>> = Mutex::new(None);

/// Configures the process-wide scheduler. One-shot: must be called before
/// the first [`global`] access.
///
/// # Errors
///
/// [`Error::InvalidArgument`] if the global scheduler already exists.
pub fn parameterize_global(builder: Builder) -> Result<()> {
    if GLOBAL.get().is_some() {
        return Err(Error::InvalidArgument(
            "global priority scheduler is already initialized",
        ));
    }
    *GLOBAL_CONFIG.lock() = Some(builder);
    Ok(())
}

/// The process-wide scheduler, created on first use with the configuration
/// left by [`parameterize_global`] (or defaults).
pub fn global() -> &'static Scheduler {
    GLOBAL.get_or_init(|| {
        GLOBAL_CONFIG
            .lock()
            .take()
            .unwrap_or_else(|| Builder::new().name("global-priority-scheduler"))
            .build()
    })
}

/// `true` once [`global`] has been called.
#[must_use]
pub fn is_global_instantiated() -> bool {
    GLOBAL.get().is_some()
}
