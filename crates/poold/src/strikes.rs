use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Invalid submissions tolerated inside the window before a ban.
pub const STRIKE_LIMIT: usize = 3;

/// Width of the sliding strike window.
pub const STRIKE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding window of consecutive invalid share submissions.
///
/// Unlike a fixed window, individual timestamps are tracked and only
/// strikes inside the sliding window count, so a slow trickle of
/// rejects does not accumulate into a ban. A valid share clears the
/// window: only consecutive failures are held against the miner.
#[derive(Debug)]
pub struct StrikeCounter {
    window: VecDeque<Instant>,
    limit: usize,
    span: Duration,
}

impl StrikeCounter {
    /// Creates a counter with the default limit and window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(STRIKE_LIMIT, STRIKE_WINDOW)
    }

    /// Creates a counter with explicit limits.
    #[must_use]
    pub fn with_limits(limit: usize, span: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(limit),
            limit,
            span,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) >= self.span {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records an invalid submission; returns `true` once the limit is
    /// reached within the window.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        self.expire(now);
        self.window.push_back(now);
        self.window.len() >= self.limit
    }

    /// Clears the window; called on every valid share.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

impl Default for StrikeCounter {
    fn default() -> Self {
        Self::new()
    }
}
