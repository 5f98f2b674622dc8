// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide main run loop.
//!
//! Globals in this crate follow one pattern: a one-shot `parameterize` call
//! captures configuration *before* first use, and the first `instance`
//! access consumes it (or falls back to defaults) inside a `OnceLock`
//! initializer. Reconfiguring after first use is an error; there is no way
//! to tear a global down. The timer pool
//! ([`timer::parameterize_pool`](crate::timer::parameterize_pool)) and the
//! global priority scheduler
//! ([`priority::parameterize_global`](crate::priority::parameterize_global))
//! follow the same shape in their own modules.
//!
//! System-native main loops (interleaving windowing events) are built
//! directly with [`SystemRunLoop`](crate::run_loop::system::SystemRunLoop);
//! their event-source type cannot hide behind a process global.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::run_loop::{Builder, RunLoop};

static MAIN: OnceLock<RunLoop> = OnceLock::new();
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

struct Config {
    builder: Builder,
    started_by_main: bool,
}

/// The process-wide main run loop singleton.
pub struct MainRunLoop;

// === impl MainRunLoop ===

impl MainRunLoop {
    /// Configures the main run loop. One-shot: must be called before the
    /// first [`instance`](MainRunLoop::instance) access.
    ///
    /// With `will_be_started_by_main = true` (the usual arrangement) the
    /// application's main thread is expected to call
    /// [`start`](MainRunLoop::start) itself; otherwise a host thread is
    /// spawned on first use and the loop runs in the background.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the main run loop already exists.
    pub fn parameterize(builder: Builder, will_be_started_by_main: bool) -> Result<()> {
        if MAIN.get().is_some() {
            return Err(Error::InvalidArgument(
                "main run loop is already initialized",
            ));
        }
        *CONFIG.lock() = Some(Config {
            builder,
            started_by_main: will_be_started_by_main,
        });
        Ok(())
    }

    /// The main run loop, created on first use.
    pub fn instance() -> &'static RunLoop {
        MAIN.get_or_init(|| {
            let config = CONFIG.lock().take().unwrap_or_else(|| Config {
                builder: Builder::new().name("main-run-loop"),
                started_by_main: true,
            });

            let run_loop = config.builder.build();
            if !config.started_by_main {
                let host = run_loop.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-host", run_loop.name()))
                    .spawn(move || host.start());
                if let Err(err) = spawned {
                    tracing::warn!(%err, "failed to spawn main run loop host thread");
                }
            }
            run_loop
        })
    }

    /// `true` once [`instance`](MainRunLoop::instance) has been called.
    #[must_use]
    pub fn is_instantiated() -> bool {
        MAIN.get().is_some()
    }

    /// Serves the main run loop on the calling thread; see
    /// [`RunLoop::start`].
    pub fn start() {
        Self::instance().start();
    }

    /// Stops the main run loop; see [`RunLoop::stop`].
    pub fn stop(cancel_running: bool) {
        Self::instance().stop(cancel_running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_fn;
    use std::time::Duration;

    // One test only: the singleton statics are process-wide and tests in
    // this binary run concurrently.
    #[test]
    fn parameterized_background_loop_serves_jobs() {
        MainRunLoop::parameterize(Builder::new().name("test-main"), false).unwrap();

        let run_loop = MainRunLoop::instance();
        assert!(MainRunLoop::is_instantiated());
        assert!(RunLoop::wait_for_start(
            run_loop,
            Duration::from_millis(5),
            Some(Duration::from_secs(3)),
        ));

        let job = run_loop.enq_job(job_fn(|_| {})).unwrap();
        assert!(job.wait_completed(Some(Duration::from_secs(5))));
        assert!(job.is_succeeded());

        // Reconfiguration after first use is rejected.
        assert!(matches!(
            MainRunLoop::parameterize(Builder::new(), true),
            Err(Error::InvalidArgument(_))
        ));

        MainRunLoop::stop(false);
    }
}
