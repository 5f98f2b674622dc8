// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A concurrent execution substrate for preemptively scheduled threads.
//!
//! The crate is organized around a small set of cooperating components:
//!
//! - [`Job`]: a unit of work with identity, lifecycle state
//!   (`Pending → Running → Completed`) and a disposition recording how it
//!   ended (`Cancelled`, `Failed` or `Succeeded`).
//! - [`RunLoop`]: a FIFO/LIFO queue of pending jobs drained by one or more
//!   serving threads, with wait and cancel primitives.
//! - [`JobQueue`] and [`JobQueuePool`]: run loops backed by owned worker
//!   threads, and a reusable bag of them with min/max sizing and idle
//!   reaping.
//! - [`Scheduler`](scheduler::Scheduler): deadline-ordered delivery of jobs
//!   onto a run loop or job queue, driven by a single [`Timer`].
//! - [`priority::Scheduler`]: many logical queues multiplexed over a bounded
//!   worker pool with a priority-based, round-robin, O(1) policy.
//! - [`Timer`]: one-shot or periodic alarms delivered through a shared job
//!   queue pool, with re-entrancy control.
//! - [`SharedAllocator`]: a first-fit, coalescing allocator over a fixed
//!   byte region guarded by an in-region spin lock, suitable for
//!   memory-mapped sharing between processes.
//!
//! Cancellation everywhere is advisory: long-running job bodies are expected
//! to poll [`JobContext::should_stop`] and return promptly. Every blocking
//! wait takes a relative timeout where `None` means "wait forever" and a
//! `false` return means the timeout elapsed.

mod deadline;
mod error;
mod event;
pub mod global;
mod job;
pub mod job_queue;
pub mod priority;
pub mod run_loop;
pub mod scheduler;
mod shared_alloc;
pub mod thread;
pub mod timer;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use event::Event;
pub use global::MainRunLoop;
pub use job::{Disposition, Job, JobContext, JobId, JobState, RunLoopId, Work, job_fn};
pub use job_queue::{JobQueue, JobQueuePool, PooledQueue, WorkerCallback};
pub use run_loop::{JobStats, Order, RunLoop, Stats};
pub use scheduler::{JobQueueScheduler, RunLoopScheduler, Scheduler};
pub use shared_alloc::SharedAllocator;
pub use timer::{Alarm, Timer};
