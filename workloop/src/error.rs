// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the execution substrate.
///
/// Timeouts are deliberately absent: every `wait_*` API reports an elapsed
/// timeout as a `false` return and leaves the waited-on object untouched.
/// Failures raised by user code inside a job are captured in the job's
/// failure slot (see [`Job::failure`](crate::Job::failure)) and never
/// propagate across the worker boundary.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected: an out-of-range value, a
    /// pointer outside an allocator region, a job that belongs to a
    /// different run loop, or reconfiguration of an already-initialized
    /// singleton.
    InvalidArgument(&'static str),
    /// A bounded queue or pool is full.
    Capacity,
    /// The allocator has no free block large enough for the request.
    OutOfMemory,
    /// The target has been stopped and accepts no new work.
    ShuttingDown,
    /// An underlying OS primitive failed; the OS error is attached.
    Platform(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::Capacity => f.write_str("queue or pool is at capacity"),
            Error::OutOfMemory => f.write_str("no suitable free block"),
            Error::ShuttingDown => f.write_str("target is shutting down"),
            Error::Platform(err) => write!(f, "platform error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Platform(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Platform(err)
    }
}
