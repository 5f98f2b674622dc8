// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker thread configuration: naming, scheduling priority and CPU
//! affinity.
//!
//! Priorities are nice-style values (lower is more favorable, 0 is the
//! default). Affinity is a bit mask of logical CPUs; [`ANY_CPU`] leaves
//! placement to the OS scheduler. Platforms without an applicable facility
//! accept the settings and ignore them.

use std::io;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

/// The default, unremarkable scheduling priority.
pub const NORMAL_PRIORITY: i32 = 0;

/// An affinity mask that permits every logical CPU.
pub const ANY_CPU: u64 = u64::MAX;

/// Scheduling configuration applied to a worker thread at startup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WorkerOptions {
    /// Nice-style priority; lower runs more eagerly.
    pub priority: i32,
    /// Bit mask of logical CPUs the worker may run on.
    pub affinity: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            priority: NORMAL_PRIORITY,
            affinity: ANY_CPU,
        }
    }
}

/// Spawns a named worker thread and applies `options` on it before running
/// `body`.
///
/// # Errors
///
/// Returns [`Error::Platform`] if the OS refuses to create the thread.
pub fn spawn_worker<F>(name: String, options: WorkerOptions, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            apply_worker_options(&options);
            body();
        })
        .map_err(Error::Platform)
}

/// Applies priority and affinity to the calling thread. Failures are logged
/// and ignored: a worker that runs at the wrong priority is better than a
/// worker that never runs.
pub fn apply_worker_options(options: &WorkerOptions) {
    if options.priority != NORMAL_PRIORITY {
        if let Err(err) = set_current_thread_priority(options.priority) {
            tracing::debug!(priority = options.priority, %err, "failed to set worker priority");
        }
    }
    if options.affinity != ANY_CPU {
        if let Err(err) = set_current_thread_affinity(options.affinity) {
            tracing::debug!(affinity = options.affinity, %err, "failed to set worker affinity");
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn set_current_thread_priority(priority: i32) -> io::Result<()> {
            // Safety: setpriority with PRIO_PROCESS and pid 0 only affects the
            // calling thread's nice value and reads no memory.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        fn set_current_thread_affinity(mask: u64) -> io::Result<()> {
            // Safety: cpu_set_t is plain data; zeroing it is its documented
            // initial state.
            let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            for cpu in 0..64_usize {
                if mask & (1_u64 << cpu) != 0 {
                    // Safety: cpu is below CPU_SETSIZE.
                    unsafe { libc::CPU_SET(cpu, &mut set) };
                }
            }
            // Safety: pid 0 targets the calling thread, the set pointer is a
            // live local of the advertised size.
            let rc = unsafe {
                libc::sched_setaffinity(
                    0,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    std::ptr::from_ref(&set),
                )
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    } else if #[cfg(unix)] {
        fn set_current_thread_priority(priority: i32) -> io::Result<()> {
            // Safety: see the linux variant; identical contract.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        fn set_current_thread_affinity(_mask: u64) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "thread affinity is not supported on this platform",
            ))
        }
    } else {
        fn set_current_thread_priority(_priority: i32) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "thread priority is not supported on this platform",
            ))
        }

        fn set_current_thread_affinity(_mask: u64) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "thread affinity is not supported on this platform",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_runs_body() {
        let handle = spawn_worker(
            "worker-test".to_owned(),
            WorkerOptions::default(),
            || {},
        )
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn default_options_are_neutral() {
        let options = WorkerOptions::default();
        assert_eq!(options.priority, NORMAL_PRIORITY);
        assert_eq!(options.affinity, ANY_CPU);
    }
}
