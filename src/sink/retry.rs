//! Retry policies for transport lifecycle calls
//!
//! Encoded as a table rather than scattered loops so the timings stay in
//! one place.

use std::time::Duration;

/// One retry policy: how many attempts, and the pause between them
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// `open_session`
pub const OPEN_SESSION: RetryPolicy = RetryPolicy {
    attempts: 3,
    delay: Duration::from_millis(100),
};

/// `set_sink_format` on a first open / full reopen
pub const SET_FORMAT_FULL: RetryPolicy = RetryPolicy {
    attempts: 5,
    delay: Duration::from_millis(300),
};

/// `set_sink_format` on a quick reconfigure
pub const SET_FORMAT_QUICK: RetryPolicy = RetryPolicy {
    attempts: 3,
    delay: Duration::from_millis(200),
};

/// `connect`
pub const CONNECT: RetryPolicy = RetryPolicy {
    attempts: 3,
    delay: Duration::from_millis(200),
};

impl RetryPolicy {
    /// Run `op` until it reports success, an error, or attempts run out.
    /// Sleeps `delay` before every attempt after the first. Returns the
    /// last result; `Ok(false)` after the final attempt means exhaustion.
    pub fn run<E>(
        &self,
        mut op: impl FnMut() -> std::result::Result<bool, E>,
    ) -> std::result::Result<bool, E> {
        let mut last = Ok(false);
        for attempt in 0..self.attempts {
            if attempt > 0 {
                std::thread::sleep(self.delay);
            }
            last = op();
            if matches!(last, Ok(true)) {
                return last;
            }
        }
        last
    }
}
