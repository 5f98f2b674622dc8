// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A run loop that cooperates with a platform-native event source.
//!
//! [`SystemRunLoop`] interleaves two streams on one thread: native events
//! pulled from an [`EventSource`] and handed to an external processor, and
//! jobs enqueued on the underlying [`RunLoop`]. Job arrival interrupts the
//! native wait through the source's [`EventWaker`]; the windowing (or other
//! platform) glue only has to expose "block for the next event" and "wake
//! that block from another thread".

use std::io;

use crate::error::{Error, Result};
use crate::run_loop::{Builder, RunLoop};

/// What the event processor wants the loop to do next.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Control {
    Continue,
    Stop,
}

/// Interrupts a blocked [`EventSource::next_event`] from another thread.
pub trait EventWaker: Clone + Send + Sync + 'static {
    fn wake(&self);
}

/// A platform-native event supply.
pub trait EventSource {
    type Event;
    type Waker: EventWaker;

    /// A handle that interrupts [`next_event`](EventSource::next_event).
    fn waker(&self) -> Self::Waker;

    /// Blocks until a native event arrives or the waker fires. A wake with
    /// no event pending returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Any `io::Error` of the underlying platform facility.
    fn next_event(&mut self) -> io::Result<Option<Self::Event>>;
}

/// A run loop hosted on the thread that also drains a native event source.
pub struct SystemRunLoop<S: EventSource> {
    run_loop: RunLoop,
    source: S,
    waker: S::Waker,
}

// === impl SystemRunLoop ===

impl<S: EventSource> SystemRunLoop<S> {
    pub fn new(builder: Builder, source: S) -> Self {
        let run_loop = builder.build();
        let waker = source.waker();
        {
            let waker = waker.clone();
            run_loop.set_wake_hook(Some(Box::new(move || waker.wake())));
        }
        Self {
            run_loop,
            source,
            waker,
        }
    }

    /// The underlying run loop; use it to enqueue, wait and cancel.
    #[must_use]
    pub fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }

    /// Serves interleaved native events and jobs on the calling thread.
    ///
    /// Every native event is passed to `processor`; returning
    /// [`Control::Stop`] stops the loop (pending jobs are retired as
    /// cancelled, exactly like [`RunLoop::stop`]). The loop also exits when
    /// [`stop`](SystemRunLoop::stop) is called from another thread.
    ///
    /// # Errors
    ///
    /// [`Error::Platform`] if the event source fails; pending jobs are left
    /// untouched in that case.
    pub fn start<F>(&mut self, mut processor: F) -> Result<()>
    where
        F: FnMut(S::Event) -> Control,
    {
        self.run_loop.prepare_serve();
        self.run_loop.begin_serving();

        let mut stop_requested = false;
        let outcome = loop {
            while let Some(entry) = self.run_loop.try_next_entry() {
                self.run_loop.run_entry(entry);
            }
            if self.run_loop.is_done() {
                break Ok(());
            }

            match self.source.next_event() {
                Err(err) => break Err(Error::Platform(err)),
                Ok(None) => {}
                Ok(Some(event)) => {
                    if processor(event) == Control::Stop {
                        stop_requested = true;
                        break Ok(());
                    }
                }
            }
        };

        self.run_loop.end_serving();
        if stop_requested {
            self.run_loop.stop(true);
        }
        outcome
    }

    /// Stops the loop from another thread and interrupts the native wait.
    pub fn stop(&self, cancel_running: bool) {
        self.run_loop.stop(cancel_running);
        self.waker.wake();
    }
}
