// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline-ordered delivery of jobs onto run loops and job queues.
//!
//! A [`Scheduler`] keeps a min-heap of `{target, job, deadline}` entries
//! under a spin lock and arms a single [`Timer`] for the earliest deadline.
//! When the timer fires, every due entry is enqueued onto its target; the
//! guarantee is one-sided: a job is never delivered *before* its deadline,
//! how soon it runs afterwards depends on target contention.
//!
//! [`RunLoopScheduler`] and [`JobQueueScheduler`] are the two concrete
//! shapes; anything implementing [`ScheduleTarget`] works.

use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use workloop_spin::SpinLock;

use crate::error::Result;
use crate::job::{Job, JobId, RunLoopId, Work};
use crate::job_queue::JobQueue;
use crate::run_loop::RunLoop;
use crate::timer::{Alarm, Timer};

/// A deadline scheduler delivering onto [`RunLoop`]s.
pub type RunLoopScheduler = Scheduler<RunLoop>;

/// A deadline scheduler delivering onto [`JobQueue`]s.
pub type JobQueueScheduler = Scheduler<Arc<JobQueue>>;

/// A sink the scheduler can deliver due jobs to.
///
/// Implemented for [`RunLoop`] and [`Arc<JobQueue>`]; sealed because
/// delivery reuses the job record created at schedule time.
pub trait ScheduleTarget: sealed::Sealed + Clone + Send + Sync + 'static {
    /// The identity used by
    /// [`cancel_target`](Scheduler::cancel_target) matching.
    fn target_id(&self) -> RunLoopId;

    /// # Errors
    ///
    /// Whatever the target's enqueue surfaces, e.g.
    /// [`Error::Capacity`](crate::Error::Capacity) or
    /// [`Error::ShuttingDown`](crate::Error::ShuttingDown).
    #[doc(hidden)]
    fn deliver(&self, job: Job, work: Box<dyn Work>) -> Result<()>;
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::run_loop::RunLoop {}
    impl Sealed for std::sync::Arc<crate::job_queue::JobQueue> {}
}

impl ScheduleTarget for RunLoop {
    fn target_id(&self) -> RunLoopId {
        self.id()
    }

    fn deliver(&self, job: Job, work: Box<dyn Work>) -> Result<()> {
        self.enq_with_job(job, work, false).map(|_| ())
    }
}

impl ScheduleTarget for Arc<JobQueue> {
    fn target_id(&self) -> RunLoopId {
        self.run_loop().id()
    }

    fn deliver(&self, job: Job, work: Box<dyn Work>) -> Result<()> {
        self.run_loop().enq_with_job(job, work, false).map(|_| ())
    }
}

/// Deadline-ordered dispatch of jobs onto schedule targets.
pub struct Scheduler<T: ScheduleTarget> {
    core: Arc<Core<T>>,
}

struct Core<T: ScheduleTarget> {
    heap: SpinLock<Heap<T>>,
    /// Armed for the earliest deadline; initialized once in `new`.
    timer: OnceLock<Timer>,
}

struct Heap<T: ScheduleTarget> {
    entries: BinaryHeap<Entry<T>>,
    seq: u64,
}

struct Entry<T: ScheduleTarget> {
    deadline: Instant,
    /// Insertion order; breaks deadline ties first-come-first-served.
    seq: u64,
    job: Job,
    work: Box<dyn Work>,
    target: T,
}

// === impl Entry ===

impl<T: ScheduleTarget> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T: ScheduleTarget> Eq for Entry<T> {}

impl<T: ScheduleTarget> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ScheduleTarget> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline (then
        // the earliest insertion) must surface first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

// === impl Scheduler ===

impl<T: ScheduleTarget> Scheduler<T> {
    /// Creates a scheduler with its own timer.
    ///
    /// # Errors
    ///
    /// [`Error::Platform`](crate::Error::Platform) if the timer thread
    /// cannot be spawned.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let core = Arc::new(Core {
            heap: SpinLock::new(Heap {
                entries: BinaryHeap::new(),
                seq: 0,
            }),
            timer: OnceLock::new(),
        });

        // Re-entrant: a fire must never be dropped while a previous due
        // sweep is still outstanding, and overlapping sweeps serialize on
        // the heap lock.
        let timer = Timer::new(
            Arc::new(SchedulerAlarm(Arc::downgrade(&core))),
            format!("{name}-timer"),
            true,
        )?;
        let _ = core.timer.set(timer);

        Ok(Self { core })
    }

    /// Schedules `work` for delivery onto `target` no earlier than `delay`
    /// from now. Returns the id of the job that will be enqueued.
    pub fn schedule(&self, target: T, work: impl Work, delay: Duration) -> JobId {
        let job = Job::new(None, None);
        let id = job.id();
        let deadline = Instant::now() + delay;

        let rearm = {
            let mut heap = self.core.heap.lock();
            let rearm = heap
                .entries
                .peek()
                .is_none_or(|head| head.deadline > deadline);
            heap.seq += 1;
            let seq = heap.seq;
            heap.entries.push(Entry {
                deadline,
                seq,
                job,
                work: Box::new(work),
                target,
            });
            rearm
        };

        if rearm {
            let _ = self.core.timer().start(delay, false);
        }
        id
    }

    /// Removes the entry with the given job id, completing its job as
    /// cancelled. Returns `false` for unknown ids.
    pub fn cancel(&self, id: JobId) -> bool {
        self.cancel_matching(|entry| entry.job.id() == id)
    }

    /// Removes every entry destined for `target`, completing their jobs as
    /// cancelled. Returns `true` if anything was removed.
    pub fn cancel_target(&self, target: &T) -> bool {
        let target_id = target.target_id();
        self.cancel_matching(|entry| entry.target.target_id() == target_id)
    }

    /// Stops the timer and drops every entry, completing the jobs as
    /// cancelled.
    pub fn clear(&self) {
        self.core.timer().disarm();
        let removed = {
            let mut heap = self.core.heap.lock();
            std::mem::take(&mut heap.entries).into_vec()
        };
        for entry in removed {
            entry.job.cancel();
            entry.job.finish(None);
        }
    }

    /// Entries currently waiting for their deadline.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.core.heap.lock().entries.len()
    }

    fn cancel_matching(&self, matches: impl Fn(&Entry<T>) -> bool) -> bool {
        let (removed, rearm) = {
            let mut heap = self.core.heap.lock();
            let old_head = heap.entries.peek().map(|head| head.deadline);
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut heap.entries)
                .into_vec()
                .into_iter()
                .partition(|entry| matches(entry));
            heap.entries = kept.into();
            let new_head = heap.entries.peek().map(|head| head.deadline);
            (removed, (old_head != new_head).then_some(new_head))
        };

        let any = !removed.is_empty();
        for entry in removed {
            entry.job.cancel();
            entry.job.finish(None);
        }

        // The head changed: re-arm for the new head, or stop outright.
        if let Some(new_head) = rearm {
            match new_head {
                Some(deadline) => {
                    let _ = self
                        .core
                        .timer()
                        .start(deadline.saturating_duration_since(Instant::now()), false);
                }
                None => self.core.timer().disarm(),
            }
        }
        any
    }
}

impl<T: ScheduleTarget> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// === impl Core ===

impl<T: ScheduleTarget> Core<T> {
    fn timer(&self) -> &Timer {
        self.timer.get().expect("timer is initialized in new")
    }

    /// Pops every due entry, re-arms for the remaining head and delivers
    /// the due jobs in deadline order.
    fn on_alarm(&self) {
        let due = {
            let mut heap = self.heap.lock();
            let now = Instant::now();
            let mut due = Vec::new();
            while heap
                .entries
                .peek()
                .is_some_and(|head| head.deadline <= now)
            {
                if let Some(entry) = heap.entries.pop() {
                    due.push(entry);
                }
            }
            if let Some(head) = heap.entries.peek() {
                let _ = self
                    .timer()
                    .start(head.deadline.saturating_duration_since(now), false);
            }
            due
        };

        for entry in due {
            if let Err(err) = entry.target.deliver(entry.job.clone(), entry.work) {
                tracing::warn!(
                    job = %entry.job.id(),
                    %err,
                    "failed to deliver scheduled job to its target",
                );
                entry.job.cancel();
                entry.job.finish(None);
            }
        }
    }
}

struct SchedulerAlarm<T: ScheduleTarget>(Weak<Core<T>>);

impl<T: ScheduleTarget> Alarm for SchedulerAlarm<T> {
    fn alarm(&self, _timer: &Timer) {
        if let Some(core) = self.0.upgrade() {
            core.on_alarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_fn;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn started_loop() -> (RunLoop, std::thread::JoinHandle<()>) {
        let run_loop = RunLoop::builder().name("sched-target").build();
        let server = {
            let run_loop = run_loop.clone();
            std::thread::spawn(move || run_loop.start())
        };
        (run_loop, server)
    }

    #[test]
    fn delivers_in_deadline_order() {
        let (run_loop, server) = started_loop();
        let scheduler = RunLoopScheduler::new("order").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let order = Arc::clone(&order);
            scheduler.schedule(
                run_loop.clone(),
                job_fn(move |_| order.lock().push("slow")),
                Duration::from_millis(80),
            )
        };
        std::thread::sleep(Duration::from_millis(10));
        let fast = {
            let order = Arc::clone(&order);
            scheduler.schedule(
                run_loop.clone(),
                job_fn(move |_| order.lock().push("fast")),
                Duration::from_millis(10),
            )
        };

        // Generous margin: both deadlines are well past by then.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(*order.lock(), ["fast", "slow"]);
        let _ = (fast, slow);

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn never_delivers_before_the_deadline() {
        let (run_loop, server) = started_loop();
        let scheduler = RunLoopScheduler::new("not-before").unwrap();

        let scheduled_at = Instant::now();
        let delay = Duration::from_millis(50);
        let executed_at = Arc::new(Mutex::new(None));
        {
            let executed_at = Arc::clone(&executed_at);
            scheduler.schedule(
                run_loop.clone(),
                job_fn(move |_| *executed_at.lock() = Some(Instant::now())),
                delay,
            );
        }

        std::thread::sleep(Duration::from_millis(200));
        let executed_at = executed_at.lock().expect("job ran");
        assert!(executed_at.duration_since(scheduled_at) >= delay);

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn cancel_removes_a_scheduled_entry() {
        let (run_loop, server) = started_loop();
        let scheduler = RunLoopScheduler::new("cancel").unwrap();
        let ran = Arc::new(Mutex::new(false));

        let id = {
            let ran = Arc::clone(&ran);
            scheduler.schedule(
                run_loop.clone(),
                job_fn(move |_| *ran.lock() = true),
                Duration::from_millis(50),
            )
        };
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        std::thread::sleep(Duration::from_millis(120));
        assert!(!*ran.lock());
        assert_eq!(scheduler.pending_count(), 0);

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn cancel_target_sweeps_every_entry_for_that_target() {
        let (ours, our_server) = started_loop();
        let (theirs, their_server) = started_loop();
        let scheduler = RunLoopScheduler::new("cancel-target").unwrap();

        for _ in 0..3 {
            scheduler.schedule(ours.clone(), job_fn(|_| {}), Duration::from_secs(60));
        }
        let kept = scheduler.schedule(theirs.clone(), job_fn(|_| {}), Duration::from_secs(60));

        assert!(scheduler.cancel_target(&ours));
        assert_eq!(scheduler.pending_count(), 1);
        assert!(scheduler.cancel(kept));

        ours.stop(false);
        theirs.stop(false);
        our_server.join().unwrap();
        their_server.join().unwrap();
    }

    #[test]
    fn clear_drops_everything() {
        let (run_loop, server) = started_loop();
        let scheduler = RunLoopScheduler::new("clear").unwrap();

        for _ in 0..4 {
            scheduler.schedule(run_loop.clone(), job_fn(|_| {}), Duration::from_secs(60));
        }
        scheduler.clear();
        assert_eq!(scheduler.pending_count(), 0);

        run_loop.stop(false);
        server.join().unwrap();
    }

    #[test]
    fn schedules_onto_job_queues() {
        let queue = Arc::new(JobQueue::builder().name("sched-queue").build().unwrap());
        let scheduler = JobQueueScheduler::new("queue-sched").unwrap();

        let id = scheduler.schedule(
            Arc::clone(&queue),
            job_fn(|_| {}),
            Duration::from_millis(10),
        );

        std::thread::sleep(Duration::from_millis(100));
        assert!(queue.wait_for_idle(Some(Duration::from_secs(5))));
        assert_eq!(scheduler.pending_count(), 0);
        let _ = id;
        queue.stop(false);
    }
}
