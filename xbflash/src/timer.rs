//! Wraparound-safe millisecond deadlines.
//!
//! Every engine in this crate waits by arming a deadline against the
//! transport's free-running `u32` millisecond counter and comparing on each
//! tick. The counter wraps roughly every 49.7 days, so a plain `now > deadline`
//! comparison breaks near the wrap point. All comparisons go through
//! [`time_reached`], which looks at the sign of the wrapped difference instead.
//!
//! Deadlines further than `i32::MAX` milliseconds away cannot be represented.

/// Returns `true` once `now` is at or past `deadline`.
///
/// The difference is computed with wrapping arithmetic and reinterpreted as a
/// signed value, so the result is correct as long as the two timestamps are
/// less than 2^31 ms apart.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn time_reached(now: u32, deadline: u32) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// A point in time on the wrapping millisecond counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    start: u32,
    at: u32,
}

impl Deadline {
    /// Arm a deadline `delay_ms` after `now`.
    #[must_use]
    pub fn arm(now: u32, delay_ms: u32) -> Self {
        Self {
            start: now,
            at: now.wrapping_add(delay_ms),
        }
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn elapsed(&self, now: u32) -> bool {
        time_reached(now, self.at)
    }

    /// Milliseconds since the deadline was armed.
    #[must_use]
    pub fn since_armed(&self, now: u32) -> u32 {
        now.wrapping_sub(self.start)
    }
}
