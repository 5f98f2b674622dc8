// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spin-based synchronization primitives for use in workloop.
//!
//! These are the building blocks the rest of the workspace reaches for when a
//! critical section is too short to justify putting a thread to sleep: the
//! deadline heap of a scheduler, the band lists of the priority scheduler,
//! the alarm registry of a timer, and the in-region lock word of the shared
//! allocator all hold their locks for a handful of pointer writes.
//!
//! [`Backoff`] implements the exponential back-off both [`SpinLock`] and the
//! shared allocator's region lock spin with; in a heavily contested lock this
//! leads to fewer cache line invalidations and better throughput than naive
//! test-and-set loops.

mod backoff;
mod loom;
mod mutex;

pub use backoff::Backoff;
pub use mutex::{SpinLock, SpinLockGuard};
