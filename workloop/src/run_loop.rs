// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Run loops: owners of a pending job queue drained by serving threads.
//!
//! A [`RunLoop`] by itself brings no threads; [`start`](RunLoop::start)
//! serves jobs on the calling thread until [`stop`](RunLoop::stop) is called
//! from elsewhere. [`JobQueue`](crate::JobQueue) layers owned worker threads
//! on top, and [`system::SystemRunLoop`] interleaves job execution with a
//! platform-native event source.
//!
//! Jobs are dispatched in enqueue order ([`Order::Fifo`]) or reverse enqueue
//! order ([`Order::Lifo`]); [`enq_job_front`](RunLoop::enq_job_front) places
//! a job ahead of any later plain enqueue. The pending queue is bounded by
//! `max_pending`; enqueueing beyond the bound fails with
//! [`Error::Capacity`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::job::{self, Job, JobContext, JobId, RunLoopId, Work};

pub mod system;

/// The order in which pending jobs are served.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Order {
    /// First in, first out.
    #[default]
    Fifo,
    /// Last in, first out.
    Lifo,
}

/// Run loop statistics: a snapshot of retired-job accounting.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Number of retired jobs.
    pub total_jobs: u64,
    /// Time spent executing retired jobs.
    pub total_job_time: Duration,
    /// The most recently retired job.
    pub last_job: Option<JobStats>,
    /// The fastest retired job.
    pub min_job: Option<JobStats>,
    /// The slowest retired job.
    pub max_job: Option<JobStats>,
}

/// Per-job timing record kept by [`Stats`]. Holds the id only, never the
/// job itself.
#[derive(Clone, Debug)]
pub struct JobStats {
    pub id: JobId,
    pub start: Instant,
    pub end: Instant,
    pub elapsed: Duration,
}

// === impl Stats ===

impl Stats {
    fn update(&mut self, id: JobId, start: Instant, end: Instant) {
        let elapsed = end.saturating_duration_since(start);
        let record = JobStats {
            id,
            start,
            end,
            elapsed,
        };

        self.total_jobs += 1;
        self.total_job_time += elapsed;
        if self.min_job.as_ref().is_none_or(|min| elapsed < min.elapsed) {
            self.min_job = Some(record.clone());
        }
        if self.max_job.as_ref().is_none_or(|max| elapsed > max.elapsed) {
            self.max_job = Some(record.clone());
        }
        self.last_job = Some(record);
    }
}

/// A pending unit of work: the job record plus the work it will run.
pub(crate) struct Entry {
    pub(crate) job: Job,
    pub(crate) work: Box<dyn Work>,
}

/// Configures and creates a [`RunLoop`].
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    order: Order,
    max_pending: Option<usize>,
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

    /// Bounds the pending queue. Unbounded by default.
    #[must_use]
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    #[must_use]
    pub fn build(self) -> RunLoop {
        let id = RunLoopId::random();
        RunLoop {
            shared: Arc::new(Shared {
                id,
                name: self.name.unwrap_or_else(|| format!("run-loop-{id}")),
                order: self.order,
                max_pending: self.max_pending.unwrap_or(usize::MAX),
                done: AtomicBool::new(true),
                stopping: AtomicBool::new(false),
                servers: AtomicUsize::new(0),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    running: HashMap::new(),
                    stats: Stats::default(),
                    serving_threads: Vec::new(),
                }),
                not_empty: Condvar::new(),
                idle: Condvar::new(),
                wake_hook: Mutex::new(None),
            }),
        }
    }
}

/// A handle to a run loop. Clones share the loop.
#[derive(Clone)]
pub struct RunLoop {
    shared: Arc<Shared>,
}

struct Shared {
    id: RunLoopId,
    name: String,
    order: Order,
    max_pending: usize,
    /// Serving threads exit when this turns true. High until the first
    /// `start`, so jobs can pile up beforehand.
    done: AtomicBool,
    /// Rejects new enqueues between `stop` and the next `start`.
    stopping: AtomicBool,
    servers: AtomicUsize,
    state: Mutex<State>,
    not_empty: Condvar,
    idle: Condvar,
    /// Invoked after every enqueue; lets a system run loop interrupt its
    /// native event wait.
    wake_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct State {
    pending: VecDeque<Entry>,
    running: HashMap<JobId, Job>,
    stats: Stats,
    serving_threads: Vec<ThreadId>,
}

// === impl RunLoop ===

impl RunLoop {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn id(&self) -> RunLoopId {
        self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn order(&self) -> Order {
        self.shared.order
    }

    /// Serves jobs on the calling thread until [`stop`](RunLoop::stop) is
    /// called from another thread.
    ///
    /// A stopped loop can be started again; jobs enqueued before `start`
    /// are served once it runs.
    pub fn start(&self) {
        self.prepare_serve();
        self.begin_serving();
        loop {
            let Some(entry) = self.shared.next_entry() else {
                break;
            };
            self.run_entry(entry);
        }
        self.end_serving();
    }

    /// Stops the loop: serving threads exit once their current job is done,
    /// and every still-pending job is completed as `Cancelled` without
    /// executing. When `stop` returns, every previously-enqueued job has
    /// reached `Completed`. If `cancel_running` is set, jobs currently
    /// executing are cancelled as well (they still finish on their own
    /// terms by observing [`JobContext::should_stop`]).
    ///
    /// Idempotent; must not be called from a thread serving this loop.
    pub fn stop(&self, cancel_running: bool) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        shared.done.store(true, Ordering::Release);

        let drained: Vec<Entry> = {
            let mut state = shared.state.lock();
            debug_assert!(
                !state.serving_threads.contains(&std::thread::current().id()),
                "stop must not be called from a thread serving this run loop"
            );
            if cancel_running {
                for running in state.running.values() {
                    running.cancel();
                }
            }
            state.pending.drain(..).collect()
        };
        shared.not_empty.notify_all();
        if let Some(hook) = shared.wake_hook.lock().as_ref() {
            hook();
        }

        for entry in drained {
            entry.job.cancel();
            entry.job.finish(None);
        }

        let mut state = shared.state.lock();
        if state.running.is_empty() {
            shared.idle.notify_all();
        }
        while !state.running.is_empty() {
            shared.idle.wait(&mut state);
        }
    }

    /// Enqueues `work`, creating a fresh job record for it.
    ///
    /// Must not be called from a thread serving this loop (waiting on the
    /// returned job there would deadlock).
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if the pending queue is at its bound,
    /// [`Error::ShuttingDown`] if the loop has been stopped.
    pub fn enq_job(&self, work: impl Work) -> Result<Job> {
        self.shared
            .enq(Job::new(None, None), Box::new(work), false)
    }

    /// Like [`enq_job`](RunLoop::enq_job), but the job is served before any
    /// job enqueued later.
    ///
    /// # Errors
    ///
    /// See [`enq_job`](RunLoop::enq_job).
    pub fn enq_job_front(&self, work: impl Work) -> Result<Job> {
        self.shared.enq(Job::new(None, None), Box::new(work), true)
    }

    /// Enqueues `work` and waits for it to complete. Returns `Ok(false)` if
    /// `timeout` elapsed first; the job keeps its place in the queue.
    ///
    /// # Errors
    ///
    /// See [`enq_job`](RunLoop::enq_job).
    pub fn enq_job_wait(&self, work: impl Work, timeout: Option<Duration>) -> Result<bool> {
        let job = self.enq_job(work)?;
        Ok(job.wait_completed(timeout))
    }

    /// Front-enqueues `work` and waits for it to complete.
    ///
    /// # Errors
    ///
    /// See [`enq_job`](RunLoop::enq_job).
    pub fn enq_job_front_wait(&self, work: impl Work, timeout: Option<Duration>) -> Result<bool> {
        let job = self.enq_job_front(work)?;
        Ok(job.wait_completed(timeout))
    }

    /// Returns the pending or running job with the given id, if any.
    #[must_use]
    pub fn get_job_with_id(&self, id: JobId) -> Option<Job> {
        let state = self.shared.state.lock();
        if let Some(job) = state.running.get(&id) {
            return Some(job.clone());
        }
        state
            .pending
            .iter()
            .find(|entry| entry.job.id() == id)
            .map(|entry| entry.job.clone())
    }

    /// Waits for the given job to complete.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the job does not belong to this loop.
    pub fn wait_for_job(&self, job: &Job, timeout: Option<Duration>) -> Result<bool> {
        if job.is_completed() {
            return Ok(true);
        }
        if job.run_loop_id() != Some(self.shared.id) {
            // The job may have completed (clearing its owner) since the
            // check above.
            if job.is_completed() {
                return Ok(true);
            }
            return Err(Error::InvalidArgument("job does not belong to this run loop"));
        }
        Ok(job.wait_completed(timeout))
    }

    /// Waits for the pending or running job with the given id. Returns
    /// `false` if no such job exists or the timeout elapsed.
    #[must_use]
    pub fn wait_for_job_with_id(&self, id: JobId, timeout: Option<Duration>) -> bool {
        match self.get_job_with_id(id) {
            Some(job) => job.wait_completed(timeout),
            None => false,
        }
    }

    /// Waits for every pending or running job matching `predicate` to
    /// complete, sharing one timeout budget across all of them.
    #[must_use]
    pub fn wait_for_jobs(
        &self,
        predicate: impl Fn(&Job) -> bool,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = Deadline::after(timeout);
        for job in self.matching_jobs(&predicate) {
            if !job.wait_completed(deadline.remaining()) {
                return false;
            }
        }
        true
    }

    /// Blocks until the loop has no pending and no running jobs.
    #[must_use]
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        let mut state = self.shared.state.lock();
        while !(state.pending.is_empty() && state.running.is_empty()) {
            match deadline.instant() {
                None => self.shared.idle.wait(&mut state),
                Some(at) => {
                    if self.shared.idle.wait_until(&mut state, at).timed_out() {
                        return state.pending.is_empty() && state.running.is_empty();
                    }
                }
            }
        }
        true
    }

    /// Cancels the pending or running job with the given id. A pending job
    /// will complete without executing. Returns `false` for unknown ids.
    pub fn cancel_job(&self, id: JobId) -> bool {
        match self.get_job_with_id(id) {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending or running job matching `predicate`.
    pub fn cancel_jobs(&self, predicate: impl Fn(&Job) -> bool) {
        for job in self.matching_jobs(&predicate) {
            job.cancel();
        }
    }

    /// Cancels every pending or running job.
    pub fn cancel_all_jobs(&self) {
        self.cancel_jobs(|_| true);
    }

    /// A snapshot of the loop's statistics.
    #[must_use]
    pub fn get_stats(&self) -> Stats {
        self.shared.state.lock().stats.clone()
    }

    /// `true` while at least one thread is serving this loop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.servers.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && state.running.is_empty()
    }

    #[must_use]
    pub fn pending_job_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    #[must_use]
    pub fn running_job_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    /// Polls until `run_loop` is being served, sleeping `sleep` between
    /// polls, for at most `total`. Returns `true` once the loop runs.
    #[must_use]
    pub fn wait_for_start(
        run_loop: &RunLoop,
        sleep: Duration,
        total: Option<Duration>,
    ) -> bool {
        let deadline = Deadline::after(total);
        loop {
            if run_loop.is_running() {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            std::thread::sleep(sleep);
        }
    }

    fn matching_jobs(&self, predicate: &impl Fn(&Job) -> bool) -> Vec<Job> {
        let state = self.shared.state.lock();
        state
            .running
            .values()
            .cloned()
            .chain(state.pending.iter().map(|entry| entry.job.clone()))
            .filter(predicate)
            .collect()
    }

    // --- crate-internal serving machinery, shared with JobQueue and
    // SystemRunLoop ---

    /// Re-arms a (possibly stopped) loop for serving.
    pub(crate) fn prepare_serve(&self) {
        self.shared.stopping.store(false, Ordering::Release);
        self.shared.done.store(false, Ordering::Release);
    }

    pub(crate) fn begin_serving(&self) {
        self.shared
            .state
            .lock()
            .serving_threads
            .push(std::thread::current().id());
        self.shared.servers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_serving(&self) {
        let current = std::thread::current().id();
        let mut state = self.shared.state.lock();
        if let Some(position) = state.serving_threads.iter().position(|id| *id == current) {
            state.serving_threads.swap_remove(position);
        }
        drop(state);
        self.shared.servers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Blocks until a job is available or the loop is stopped. Used by the
    /// serving threads of thread-hosted loops.
    pub(crate) fn next_entry(&self) -> Option<Entry> {
        self.shared.next_entry()
    }

    /// Non-blocking variant for the system run loop.
    pub(crate) fn try_next_entry(&self) -> Option<Entry> {
        let mut state = self.shared.state.lock();
        if self.shared.done.load(Ordering::Acquire) {
            return None;
        }
        self.shared.pop_entry(&mut state)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Executes one dequeued entry on the calling thread: hooks, failure
    /// trapping, disposition, completion signal, stats.
    pub(crate) fn run_entry(&self, entry: Entry) {
        let Entry { job, mut work } = entry;
        let start = Instant::now();
        let ctx = JobContext::new(&self.shared.done, &job);
        let failure = job::run_hooks(work.as_mut(), &ctx);
        let end = Instant::now();

        if let Some(message) = &failure {
            tracing::warn!(
                run_loop = %self.shared.name,
                job = %job.id(),
                failure = %message,
                "job failed",
            );
        }
        job.finish(failure);

        let mut state = self.shared.state.lock();
        state.running.remove(&job.id());
        state.stats.update(job.id(), start, end);
        if state.pending.is_empty() && state.running.is_empty() {
            self.shared.idle.notify_all();
        }
    }

    pub(crate) fn enq_with_job(&self, job: Job, work: Box<dyn Work>, front: bool) -> Result<Job> {
        self.shared.enq(job, work, front)
    }

    pub(crate) fn set_wake_hook(&self, hook: Option<Box<dyn Fn() + Send + Sync>>) {
        *self.shared.wake_hook.lock() = hook;
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("order", &self.shared.order)
            .finish_non_exhaustive()
    }
}

// === impl Shared ===

impl Shared {
    fn enq(&self, job: Job, work: Box<dyn Work>, front: bool) -> Result<Job> {
        {
            let mut state = self.state.lock();
            debug_assert!(
                !state.serving_threads.contains(&std::thread::current().id()),
                "enq_job must not be called from a thread serving this run loop"
            );
            if self.stopping.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            if state.pending.len() >= self.max_pending {
                return Err(Error::Capacity);
            }

            job.attach(self.id);
            let entry = Entry {
                job: job.clone(),
                work,
            };
            // The serving side pops the front for FIFO and the back for
            // LIFO; "front" therefore maps to whichever end is served next.
            match (front, self.order) {
                (false, _) | (true, Order::Lifo) => state.pending.push_back(entry),
                (true, Order::Fifo) => state.pending.push_front(entry),
            }
        }

        self.not_empty.notify_one();
        if let Some(hook) = self.wake_hook.lock().as_ref() {
            hook();
        }
        Ok(job)
    }

    fn next_entry(&self) -> Option<Entry> {
        let mut state = self.state.lock();
        loop {
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            match self.pop_entry(&mut state) {
                Some(entry) => return Some(entry),
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Pops the next entry to serve, retiring cancelled-while-pending jobs
    /// on the way (they complete without executing).
    fn pop_entry(&self, state: &mut State) -> Option<Entry> {
        loop {
            let popped = match self.order {
                Order::Fifo => state.pending.pop_front(),
                Order::Lifo => state.pending.pop_back(),
            };
            let entry = popped?;

            if entry.job.is_cancelled() {
                entry.job.finish(None);
                if state.pending.is_empty() && state.running.is_empty() {
                    self.idle.notify_all();
                }
                continue;
            }

            entry.job.set_running();
            state.running.insert(entry.job.id(), entry.job.clone());
            return Some(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Disposition, job_fn};
    use std::sync::Arc as StdArc;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    fn spawn_server(run_loop: &RunLoop) -> thread::JoinHandle<()> {
        let run_loop = run_loop.clone();
        thread::spawn(move || run_loop.start())
    }

    fn record(order: &StdArc<StdMutex<Vec<&'static str>>>, label: &'static str) -> impl Work {
        let order = StdArc::clone(order);
        job_fn(move |_ctx| order.lock().unwrap().push(label))
    }

    #[test]
    fn fifo_serves_in_enqueue_order() {
        let run_loop = RunLoop::builder().name("fifo").build();
        let order = StdArc::new(StdMutex::new(Vec::new()));

        let a = run_loop.enq_job(record(&order, "a")).unwrap();
        let b = run_loop.enq_job(record(&order, "b")).unwrap();
        let c = run_loop.enq_job(record(&order, "c")).unwrap();

        let server = spawn_server(&run_loop);
        assert!(run_loop.wait_for_idle(Some(Duration::from_secs(5))));
        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
        assert!(a.is_succeeded() && b.is_succeeded() && c.is_succeeded());

        let stats = run_loop.get_stats();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.last_job.as_ref().unwrap().id, c.id());

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn lifo_with_front_push_serves_newest_first() {
        let run_loop = RunLoop::builder().name("lifo").order(Order::Lifo).build();
        let order = StdArc::new(StdMutex::new(Vec::new()));

        run_loop.enq_job(record(&order, "a")).unwrap();
        run_loop.enq_job(record(&order, "b")).unwrap();
        run_loop.enq_job_front(record(&order, "c")).unwrap();

        let server = spawn_server(&run_loop);
        assert!(run_loop.wait_for_idle(Some(Duration::from_secs(5))));
        assert_eq!(*order.lock().unwrap(), ["c", "b", "a"]);

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let run_loop = RunLoop::builder().max_pending(1).build();
        run_loop.enq_job(job_fn(|_| {})).unwrap();
        assert!(matches!(
            run_loop.enq_job(job_fn(|_| {})),
            Err(Error::Capacity)
        ));
    }

    #[test]
    fn stop_completes_every_pending_job() {
        let run_loop = RunLoop::builder().build();
        let jobs: Vec<Job> = (0..4)
            .map(|_| run_loop.enq_job(job_fn(|_| {})).unwrap())
            .collect();

        // Never started; stop must still retire everything.
        run_loop.stop(true);
        for job in &jobs {
            assert!(job.is_completed());
            assert_eq!(job.disposition(), Disposition::Cancelled);
        }

        assert!(matches!(
            run_loop.enq_job(job_fn(|_| {})),
            Err(Error::ShuttingDown)
        ));
    }

    #[test]
    fn cancelled_pending_job_skips_execution() {
        let run_loop = RunLoop::builder().build();
        let ran = StdArc::new(StdMutex::new(false));
        let job = {
            let ran = StdArc::clone(&ran);
            run_loop
                .enq_job(job_fn(move |_| *ran.lock().unwrap() = true))
                .unwrap()
        };

        assert!(run_loop.cancel_job(job.id()));
        let server = spawn_server(&run_loop);
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert_eq!(job.disposition(), Disposition::Cancelled);
        assert!(!*ran.lock().unwrap());

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn failed_job_reaches_completed() {
        crate::test_util::trace_init();
        let run_loop = RunLoop::builder().build();
        let job = run_loop
            .enq_job(job_fn(|_| panic!("deliberate")))
            .unwrap();

        let server = spawn_server(&run_loop);
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert!(job.is_failed());
        assert_eq!(job.failure().as_deref(), Some("deliberate"));

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn wait_for_job_rejects_foreign_jobs() {
        let ours = RunLoop::builder().build();
        let theirs = RunLoop::builder().build();
        let job = theirs.enq_job(job_fn(|_| {})).unwrap();

        assert!(matches!(
            ours.wait_for_job(&job, Some(Duration::ZERO)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn restart_after_stop_serves_again() {
        let run_loop = RunLoop::builder().build();
        let server = spawn_server(&run_loop);
        assert!(RunLoop::wait_for_start(
            &run_loop,
            Duration::from_millis(5),
            Some(Duration::from_secs(3)),
        ));
        run_loop.stop(false);
        server.join().unwrap();

        let server = spawn_server(&run_loop);
        let job = run_loop.enq_job(job_fn(|_| {})).unwrap();
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert!(job.is_succeeded());
        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn wait_for_jobs_matches_by_predicate() {
        let run_loop = RunLoop::builder().build();
        let slow = run_loop
            .enq_job(job_fn(|_| thread::sleep(Duration::from_millis(20))))
            .unwrap();
        let slow_id = slow.id();

        let server = spawn_server(&run_loop);
        assert!(run_loop.wait_for_jobs(
            |job| job.id() == slow_id,
            Some(Duration::from_secs(5)),
        ));
        assert!(slow.is_completed());

        run_loop.stop(false);
        server.join().unwrap();
    }
}
