// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint;

/// An [exponential backoff] for spin loops.
///
/// This is a helper struct for spinning in a busy loop, with an exponentially
/// increasing number of spins up to a maximum value.
///
/// Unlike a bare-metal spin this is meant for preemptively scheduled threads:
/// once the exponent saturates, further calls to [`Backoff::spin`] yield the
/// thread back to the OS scheduler instead of burning the rest of the time
/// slice. A lock holder descheduled mid-critical-section cannot make progress
/// while its waiters spin, so past a point yielding is the only thing that
/// helps.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^6).
    ///
    /// This is the maximum exponent returned by [`Backoff::new()`] and
    /// [`Backoff::default()`]. To override the maximum exponent, use
    /// [`Backoff::with_max_exponent()`].
    pub const DEFAULT_MAX_EXPONENT: u8 = 6;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Returns a new exponential backoff with the provided max exponent.
    ///
    /// # Panics
    ///
    /// Panics if the `max` exponent is larger than [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        assert!(max <= Self::DEFAULT_MAX_EXPONENT);
        Self { exp: 0, max }
    }

    /// Backs off in a spin loop.
    ///
    /// This should be used when an operation needs to be retried because
    /// another thread made progress. Each call issues `2^exp` [spin loop
    /// hints], where `exp` is the current exponent value (starting at 0),
    /// then increments the exponent. Once the exponent has reached the
    /// configured maximum, every subsequent call yields the thread instead.
    ///
    /// [spin loop hints]: hint::spin_loop
    #[inline]
    pub fn spin(&mut self) {
        if self.exp >= self.max {
            crate::loom::thread::yield_now();
            return;
        }

        let spins = 1_u32 << self.exp;
        for _ in 0..spins {
            // In loom tests the runtime has to be given a chance to run the
            // thread holding the lock. See
            // https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(loom)]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        self.exp += 1;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
