use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Sliding-window per-minute rate limiter (spec §4.8). Tracks accept
/// timestamps in a deque and evicts anything older than the window on each
/// check, rather than resetting on fixed minute boundaries — avoids the
/// burst-at-boundary problem a fixed window has.
pub(crate) struct RateLimiter {
    max_per_minute: u32,
    timestamps: Mutex<VecDeque<Instant>>,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub(crate) fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) > WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as u32 >= self.max_per_minute {
            return false;
        }
        timestamps.push_back(now);
        true
    }
}
