// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot and periodic timers.
//!
//! A [`Timer`] owns a firing thread that sleeps until the armed instant.
//! When it fires, the alarm callback is not invoked on the firing thread:
//! a job queue is borrowed from the process-wide timer pool (with a retry
//! count of zero) and an alarm job runs [`Alarm::alarm`] there. Delivering
//! alarms on time is considered more important than delivering them at
//! all: if the pool is exhausted the alarm is dropped with a warning, and
//! a non-reentrant timer whose previous alarm is still outstanding drops
//! the new fire the same way. There are no catch-up events.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use workloop_spin::SpinLock;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::job::{Job, JobContext, Work};
use crate::job_queue::{JobQueuePool, PooledQueue};

/// Default floor of the shared timer pool.
pub const DEFAULT_MIN_POOL_QUEUES: usize = 1;
/// Default ceiling of the shared timer pool.
pub const DEFAULT_MAX_POOL_QUEUES: usize = 100;

static TIMER_POOL: OnceLock<JobQueuePool> = OnceLock::new();
static TIMER_POOL_CONFIG: Mutex<Option<(usize, usize)>> = Mutex::new(None);

/// Sizes the process-wide timer pool. One-shot: must be called before the
/// first timer fires.
///
/// # Errors
///
/// [`Error::InvalidArgument`] if the bounds are zero or inverted, or if the
/// pool already exists.
pub fn parameterize_pool(min_queues: usize, max_queues: usize) -> Result<()> {
    if min_queues == 0 || max_queues == 0 || min_queues > max_queues {
        return Err(Error::InvalidArgument("timer pool bounds"));
    }
    if TIMER_POOL.get().is_some() {
        return Err(Error::InvalidArgument("timer pool is already initialized"));
    }
    *TIMER_POOL_CONFIG.lock() = Some((min_queues, max_queues));
    Ok(())
}

pub(crate) fn timer_pool() -> &'static JobQueuePool {
    TIMER_POOL.get_or_init(|| {
        let (min, max) = TIMER_POOL_CONFIG
            .lock()
            .take()
            .unwrap_or((DEFAULT_MIN_POOL_QUEUES, DEFAULT_MAX_POOL_QUEUES));
        JobQueuePool::builder()
            .name("timer-pool")
            .min_queues(min)
            .max_queues(max)
            .build()
    })
}

/// Receiver of timer fires.
///
/// With a non-reentrant timer, at most one alarm is pending or running at a
/// time. With `reentrant = true` alarms may overlap and the implementation
/// must be thread-safe in the stronger sense of tolerating concurrent
/// invocations.
pub trait Alarm: Send + Sync + 'static {
    fn alarm(&self, timer: &Timer);
}

/// A millisecond-resolution one-shot or periodic timer.
pub struct Timer {
    core: Arc<Core>,
    /// The firing thread; `None` for the borrowed view handed to
    /// [`Alarm::alarm`]. Joined on drop.
    thread: Option<JoinHandle<()>>,
}

struct Core {
    name: String,
    reentrant: bool,
    alarm: Arc<dyn Alarm>,
    arming: Mutex<Arming>,
    fire_cv: Condvar,
    /// Outstanding alarm jobs, pending or running.
    jobs: SpinLock<Vec<Job>>,
}

struct Arming {
    due: Option<Instant>,
    period: Option<Duration>,
    shutdown: bool,
}

// === impl Timer ===

impl Timer {
    /// Creates a timer. `name` identifies it in logs and lets one callback
    /// distinguish several timers; `reentrant` selects the overlap policy
    /// described on [`Alarm`].
    ///
    /// # Errors
    ///
    /// [`Error::Platform`] if the firing thread cannot be spawned.
    pub fn new(alarm: Arc<dyn Alarm>, name: impl Into<String>, reentrant: bool) -> Result<Timer> {
        let name = name.into();
        let core = Arc::new(Core {
            name: name.clone(),
            reentrant,
            alarm,
            arming: Mutex::new(Arming {
                due: None,
                period: None,
                shutdown: false,
            }),
            fire_cv: Condvar::new(),
            jobs: SpinLock::new(Vec::new()),
        });

        let thread = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name(format!("timer-{name}"))
                .spawn(move || fire_loop(&core))
                .map_err(Error::Platform)?
        };

        Ok(Timer {
            core,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Arms the timer to fire after `delay`, periodically so if `periodic`.
    /// An already-running timer is re-armed with the new parameters.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a periodic timer with a zero period.
    pub fn start(&self, delay: Duration, periodic: bool) -> Result<()> {
        if periodic && delay.is_zero() {
            return Err(Error::InvalidArgument("periodic timer with zero period"));
        }
        let mut arming = self.core.arming.lock();
        arming.due = Instant::now().checked_add(delay);
        arming.period = periodic.then_some(delay);
        drop(arming);
        self.core.fire_cv.notify_all();
        Ok(())
    }

    /// Disarms the timer, then blocks until any currently-running alarm
    /// callback has returned. Pending (not yet running) alarm jobs are left
    /// to run; use [`wait_for_callbacks`](Timer::wait_for_callbacks) to
    /// join or cancel those.
    pub fn stop(&self) {
        self.disarm();
        let running: Vec<Job> = self
            .core
            .jobs
            .lock()
            .iter()
            .filter(|job| job.is_running())
            .cloned()
            .collect();
        for job in running {
            job.wait_completed(None);
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.arming.lock().due.is_some()
    }

    /// Joins every outstanding alarm job, cancelling them first if `cancel`
    /// is set (cancelled pending alarms complete without invoking the
    /// callback). Returns `false` if `timeout` elapsed first.
    pub fn wait_for_callbacks(&self, timeout: Option<Duration>, cancel: bool) -> bool {
        let jobs: Vec<Job> = self.core.jobs.lock().clone();
        if cancel {
            for job in &jobs {
                job.cancel();
            }
        }
        let deadline = Deadline::after(timeout);
        for job in jobs {
            if !job.wait_completed(deadline.remaining()) {
                return false;
            }
        }
        true
    }

    pub(crate) fn disarm(&self) {
        let mut arming = self.core.arming.lock();
        arming.due = None;
        arming.period = None;
        drop(arming);
        self.core.fire_cv.notify_all();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            // A borrowed view inside an alarm callback; nothing to tear
            // down.
            return;
        };
        {
            let mut arming = self.core.arming.lock();
            arming.due = None;
            arming.period = None;
            arming.shutdown = true;
        }
        self.core.fire_cv.notify_all();
        let _ = thread.join();
        let _ = self.wait_for_callbacks(None, true);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.core.name)
            .field("reentrant", &self.core.reentrant)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn fire_loop(core: &Arc<Core>) {
    let mut arming = core.arming.lock();
    loop {
        if arming.shutdown {
            return;
        }
        match arming.due {
            None => core.fire_cv.wait(&mut arming),
            Some(at) => {
                let timed_out = core.fire_cv.wait_until(&mut arming, at).timed_out();
                // Only fire if the arming we slept on is still current; a
                // re-arm or stop while sleeping supersedes it.
                if timed_out && !arming.shutdown && arming.due == Some(at) {
                    arming.due = arming.period.and_then(|period| at.checked_add(period));
                    MutexGuard::unlocked(&mut arming, || queue_alarm(core));
                }
            }
        }
    }
}

/// Posts the alarm job onto a queue borrowed from the shared pool. Drops
/// the fire (with a warning) when the previous alarm is still outstanding
/// on a non-reentrant timer, or when the pool is exhausted.
fn queue_alarm(core: &Arc<Core>) {
    if !core.reentrant && !core.jobs.lock().is_empty() {
        tracing::warn!(timer = %core.name, "suppressing non re-entrant alarm");
        return;
    }

    let Some(queue) = timer_pool().get_queue(0, Duration::ZERO) else {
        tracing::warn!(timer = %core.name, "unable to acquire a timer pool worker, skipping alarm");
        return;
    };

    // The job record is registered before the enqueue so the job can never
    // retire ahead of its registration.
    let job = Job::new(None, None);
    core.jobs.lock().push(job.clone());

    let slot = Arc::new(Mutex::new(Some(queue)));
    let work = AlarmWork {
        core: Arc::clone(core),
        queue: Arc::clone(&slot),
    };
    let enqueued = {
        let guard = slot.lock();
        match guard.as_ref() {
            Some(queue) => queue.run_loop().enq_with_job(job.clone(), Box::new(work), false),
            None => unreachable!("queue slot is filled above"),
        }
    };

    if let Err(err) = enqueued {
        tracing::warn!(timer = %core.name, %err, "failed to enqueue alarm job, skipping alarm");
        core.jobs.lock().retain(|outstanding| outstanding.id() != job.id());
        slot.lock().take();
    }
}

/// The job that invokes the alarm callback on a pool worker. Holds the
/// borrowed queue so it returns to the pool only after the callback (and
/// its cleanup) has run.
struct AlarmWork {
    core: Arc<Core>,
    queue: Arc<Mutex<Option<PooledQueue>>>,
}

impl Work for AlarmWork {
    fn execute(&mut self, ctx: &JobContext<'_>) {
        if !ctx.should_stop() {
            let view = Timer {
                core: Arc::clone(&self.core),
                thread: None,
            };
            self.core.alarm.alarm(&view);
        }
    }

    fn epilogue(&mut self, ctx: &JobContext<'_>) {
        let id = ctx.job().id();
        self.core.jobs.lock().retain(|job| job.id() != id);
        self.queue.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAlarm {
        fired: AtomicUsize,
        delay: Duration,
    }

    impl CountingAlarm {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                delay,
            })
        }

        fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    impl Alarm for CountingAlarm {
        fn alarm(&self, timer: &Timer) {
            assert!(!timer.name().is_empty());
            self.fired.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
    }

    #[test]
    fn one_shot_fires_once_and_disarms() {
        let alarm = CountingAlarm::new(Duration::ZERO);
        let timer = Timer::new(alarm.clone(), "one-shot", false).unwrap();

        timer.start(Duration::from_millis(10), false).unwrap();
        assert!(timer.is_running());

        std::thread::sleep(Duration::from_millis(100));
        assert!(timer.wait_for_callbacks(Some(Duration::from_secs(5)), false));
        assert_eq!(alarm.count(), 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn periodic_fires_repeatedly() {
        let alarm = CountingAlarm::new(Duration::ZERO);
        let timer = Timer::new(alarm.clone(), "periodic", false).unwrap();

        timer.start(Duration::from_millis(10), true).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        timer.stop();

        assert!(timer.wait_for_callbacks(Some(Duration::from_secs(5)), false));
        assert!(alarm.count() >= 3, "fired {} times", alarm.count());
        assert!(!timer.is_running());
    }

    #[test]
    fn non_reentrant_overlap_is_dropped() {
        crate::test_util::trace_init();
        let alarm = CountingAlarm::new(Duration::from_millis(25));
        let timer = Timer::new(alarm.clone(), "busy", false).unwrap();

        timer.start(Duration::from_millis(10), true).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        timer.stop();
        assert!(timer.wait_for_callbacks(Some(Duration::from_secs(5)), false));

        // Fifteen fire opportunities, but overlapping alarms are dropped:
        // roughly one callback per 25ms busy window.
        let count = alarm.count();
        assert!(count >= 2, "fired {count} times");
        assert!(count <= 8, "fired {count} times");
    }

    #[test]
    fn restart_rearms_with_new_parameters() {
        let alarm = CountingAlarm::new(Duration::ZERO);
        let timer = Timer::new(alarm.clone(), "rearm", false).unwrap();

        timer.start(Duration::from_secs(60), false).unwrap();
        timer.start(Duration::from_millis(10), false).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(timer.wait_for_callbacks(Some(Duration::from_secs(5)), false));
        assert_eq!(alarm.count(), 1);
    }

    #[test]
    fn stop_prevents_future_fires() {
        let alarm = CountingAlarm::new(Duration::ZERO);
        let timer = Timer::new(alarm.clone(), "stopped", false).unwrap();

        timer.start(Duration::from_millis(50), false).unwrap();
        timer.stop();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(alarm.count(), 0);
    }

    #[test]
    fn zero_periodic_is_rejected() {
        let alarm = CountingAlarm::new(Duration::ZERO);
        let timer = Timer::new(alarm, "invalid", false).unwrap();
        assert!(matches!(
            timer.start(Duration::ZERO, true),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn pool_parameterize_validates_bounds() {
        assert!(matches!(
            parameterize_pool(0, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            parameterize_pool(4, 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
