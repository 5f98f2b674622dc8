// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Jobs: units of work with identity, lifecycle state and disposition.
//!
//! A job is two things at once: the *work* — a [`Work`] implementation whose
//! `prologue`/`execute`/`epilogue` hooks run on a worker thread — and the
//! *record* — a cheaply clonable [`Job`] handle tracking id, owning run
//! loop, state, disposition, failure and the completion event. The record
//! outlives the work: waiters hold the handle long after the worker has
//! consumed the work itself.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::Event;

/// Unique job identity. Random unless explicitly provided.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

/// Unique run loop identity.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RunLoopId(u64);

/// Job lifecycle state. Transitions are monotonic:
/// `Pending → Running → Completed`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Running = 1,
    Completed = 2,
}

/// How a job's execution ended, set at (or before) completion.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Disposition {
    Unknown = 0,
    Cancelled = 1,
    Failed = 2,
    Succeeded = 3,
}

// === impl JobId / RunLoopId ===

impl JobId {
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl RunLoopId {
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({:016x})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for RunLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunLoopId({:016x})", self.0)
    }
}

impl fmt::Display for RunLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The view of the surrounding machinery a running hook gets to see.
///
/// Long-running [`Work::execute`] implementations are expected to poll
/// [`should_stop`](JobContext::should_stop) regularly and return promptly
/// when it turns true; that is the only cancellation mechanism there is.
pub struct JobContext<'a> {
    done: &'a AtomicBool,
    job: &'a Job,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(done: &'a AtomicBool, job: &'a Job) -> Self {
        Self { done, job }
    }

    /// Returns `true` if the hook should stop what it is doing and return:
    /// the owning loop is shutting down, or the job was cancelled, or a
    /// previous hook already failed.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.job.is_cancelled() || self.job.is_failed()
    }

    /// The record of the job being executed.
    #[must_use]
    pub fn job(&self) -> &Job {
        self.job
    }
}

/// A unit of work executed on a worker thread.
///
/// `execute` is the one mandatory hook. The framework guarantees the
/// `prologue → execute → epilogue` order on the worker, and that `epilogue`
/// runs even when an earlier hook panicked or cancellation was already
/// requested on entry, so resources acquired in `prologue` can always be
/// released in `epilogue`. Panics raised in any hook are trapped, recorded
/// as the job's failure and never propagate.
pub trait Work: Send + 'static {
    fn prologue(&mut self, _ctx: &JobContext<'_>) {}

    fn execute(&mut self, ctx: &JobContext<'_>);

    fn epilogue(&mut self, _ctx: &JobContext<'_>) {}
}

/// Wraps a closure as the [`Work::execute`] hook of an otherwise empty job.
pub fn job_fn<F>(f: F) -> impl Work
where
    F: FnMut(&JobContext<'_>) + Send + 'static,
{
    struct JobFn<F>(F);

    impl<F> Work for JobFn<F>
    where
        F: FnMut(&JobContext<'_>) + Send + 'static,
    {
        fn execute(&mut self, ctx: &JobContext<'_>) {
            (self.0)(ctx);
        }
    }

    JobFn(f)
}

/// A handle to a job's record: id, owner, state, disposition, failure and
/// completion event. Clones share the record.
#[derive(Clone)]
pub struct Job {
    inner: Arc<Inner>,
}

struct Inner {
    id: JobId,
    run_loop: Mutex<Option<RunLoopId>>,
    state: AtomicU8,
    disposition: AtomicU8,
    failure: Mutex<Option<String>>,
    completed: Event,
}

// === impl Job ===

impl Job {
    pub(crate) fn new(id: Option<JobId>, run_loop: Option<RunLoopId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.unwrap_or_else(JobId::random),
                run_loop: Mutex::new(run_loop),
                state: AtomicU8::new(JobState::Pending as u8),
                disposition: AtomicU8::new(Disposition::Unknown as u8),
                failure: Mutex::new(None),
                completed: Event::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// The run loop this job is currently enqueued on or running in, if any.
    /// Cleared once the job completes.
    #[must_use]
    pub fn run_loop_id(&self) -> Option<RunLoopId> {
        *self.inner.run_loop.lock()
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => JobState::Pending,
            1 => JobState::Running,
            _ => JobState::Completed,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == JobState::Pending
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == JobState::Running
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self.inner.disposition.load(Ordering::Acquire) {
            1 => Disposition::Cancelled,
            2 => Disposition::Failed,
            3 => Disposition::Succeeded,
            _ => Disposition::Unknown,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.disposition() == Disposition::Cancelled
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.disposition() == Disposition::Failed
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.disposition() == Disposition::Succeeded
    }

    /// The trapped panic message, if execution failed.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Requests cancellation. Idempotent.
    ///
    /// This only latches the disposition; the state machine is untouched. A
    /// still-pending job will complete without executing, a running job is
    /// expected to observe [`JobContext::should_stop`] and return promptly.
    pub fn cancel(&self) {
        self.inner
            .disposition
            .store(Disposition::Cancelled as u8, Ordering::Release);
    }

    /// Waits for the job to complete. `timeout` is relative; `None` waits
    /// forever. Returns `false` on timeout.
    pub fn wait_completed(&self, timeout: Option<Duration>) -> bool {
        self.inner.completed.wait(timeout)
    }

    pub(crate) fn attach(&self, run_loop: RunLoopId) {
        *self.inner.run_loop.lock() = Some(run_loop);
    }

    pub(crate) fn set_running(&self) {
        self.inner
            .state
            .store(JobState::Running as u8, Ordering::Release);
    }

    /// Transitions the job to `Completed`, resolving the disposition: a
    /// prior `Cancelled` is preserved, a trapped failure wins over success.
    pub(crate) fn finish(&self, failure: Option<String>) {
        if !self.is_cancelled() {
            match failure {
                Some(message) => {
                    *self.inner.failure.lock() = Some(message);
                    self.inner
                        .disposition
                        .store(Disposition::Failed as u8, Ordering::Release);
                }
                None => {
                    self.inner
                        .disposition
                        .store(Disposition::Succeeded as u8, Ordering::Release);
                }
            }
        }
        *self.inner.run_loop.lock() = None;
        self.inner
            .state
            .store(JobState::Completed as u8, Ordering::Release);
        self.inner.completed.set();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("disposition", &self.disposition())
            .finish_non_exhaustive()
    }
}

/// Runs the three hooks in order, trapping panics. `epilogue` runs even if
/// `prologue` or `execute` panicked. Returns the first trapped panic
/// message, if any.
pub(crate) fn run_hooks(work: &mut dyn Work, ctx: &JobContext<'_>) -> Option<String> {
    let mut failure: Option<String> = None;

    let mut trap = |outcome: std::thread::Result<()>| {
        if let Err(payload) = outcome {
            if failure.is_none() {
                failure = Some(panic_message(payload.as_ref()));
            }
        }
    };

    trap(catch_unwind(AssertUnwindSafe(|| work.prologue(ctx))));
    trap(catch_unwind(AssertUnwindSafe(|| work.execute(ctx))));
    trap(catch_unwind(AssertUnwindSafe(|| work.epilogue(ctx))));

    failure
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_job() -> Job {
        Job::new(None, None)
    }

    #[test]
    fn fresh_job_is_pending() {
        let job = detached_job();
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.disposition(), Disposition::Unknown);
        assert!(job.run_loop_id().is_none());
        assert!(!job.wait_completed(Some(Duration::ZERO)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let job = detached_job();
        job.cancel();
        job.cancel();
        assert!(job.is_cancelled());
        assert!(job.is_pending());
    }

    #[test]
    fn finish_respects_prior_cancellation() {
        let job = detached_job();
        job.cancel();
        job.finish(None);
        assert!(job.is_completed());
        assert_eq!(job.disposition(), Disposition::Cancelled);
    }

    #[test]
    fn finish_records_failure() {
        let job = detached_job();
        job.finish(Some("boom".to_owned()));
        assert!(job.is_failed());
        assert_eq!(job.failure().as_deref(), Some("boom"));
        assert!(job.wait_completed(Some(Duration::ZERO)));
    }

    #[test]
    fn hooks_run_in_order_and_epilogue_survives_panic() {
        struct Hooked {
            trace: Vec<&'static str>,
        }

        impl Work for Hooked {
            fn prologue(&mut self, _ctx: &JobContext<'_>) {
                self.trace.push("prologue");
            }

            fn execute(&mut self, _ctx: &JobContext<'_>) {
                self.trace.push("execute");
                panic!("boom");
            }

            fn epilogue(&mut self, _ctx: &JobContext<'_>) {
                self.trace.push("epilogue");
            }
        }

        let job = detached_job();
        let done = AtomicBool::new(false);
        let ctx = JobContext::new(&done, &job);
        let mut work = Hooked { trace: Vec::new() };

        let failure = run_hooks(&mut work, &ctx);
        assert_eq!(failure.as_deref(), Some("boom"));
        assert_eq!(work.trace, ["prologue", "execute", "epilogue"]);
    }

    #[test]
    fn should_stop_tracks_done_flag_and_disposition() {
        let job = detached_job();
        let done = AtomicBool::new(false);
        let ctx = JobContext::new(&done, &job);
        assert!(!ctx.should_stop());

        done.store(true, Ordering::Release);
        assert!(ctx.should_stop());

        done.store(false, Ordering::Release);
        job.cancel();
        assert!(ctx.should_stop());
    }
}
