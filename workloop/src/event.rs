// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::deadline::Deadline;

/// A one-shot event.
///
/// Starts low; [`set`](Event::set) latches it high forever and wakes every
/// current and future waiter. This is the completion signal a [`Job`] latches
/// when it reaches its terminal state.
///
/// [`Job`]: crate::Job
#[derive(Debug, Default)]
pub struct Event {
    set: Mutex<bool>,
    cv: Condvar,
}

// === impl Event ===

impl Event {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Latches the event high and wakes all waiters. Subsequent calls are
    /// no-ops.
    pub fn set(&self) {
        let mut set = self.set.lock();
        if !*set {
            *set = true;
            self.cv.notify_all();
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Waits for the event to become set.
    ///
    /// `timeout` is relative; `None` waits forever. Returns `true` if the
    /// event was (or became) set within the timeout, `false` otherwise.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        let mut set = self.set.lock();
        while !*set {
            match deadline.instant() {
                None => self.cv.wait(&mut set),
                Some(at) => {
                    if self.cv.wait_until(&mut set, at).timed_out() {
                        return *set;
                    }
                }
            }
        }
        true
    }
}
