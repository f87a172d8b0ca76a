use std::time::{Duration, Instant};

pub(crate) struct Timer<T> {
    pub interval: Duration,
    pub next_exec: Instant,
    /// `None` means no call limit.
    pub remaining_calls: Option<u32>,
    pub exhausted: bool,
    pub context: T,
}

impl<T: Clone> Timer<T> {
    pub fn new(interval: Duration, max_calls: Option<u32>, context: T) -> Self {
        Timer {
            interval,
            next_exec: Instant::now() + interval,
            remaining_calls: max_calls.map(|n| n.max(1)),
            exhausted: false,
            context,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.exhausted && self.next_exec <= now
    }

    /// Consumes one call and returns the number of calls left after it,
    /// which is what the callback receives (`Some(0)` on the last call).
    pub fn fire(&mut self, now: Instant) -> Option<u32> {
        self.next_exec += self.interval;
        // a long stall must not turn into a burst of catch-up calls
        if self.next_exec < now {
            self.next_exec = now + self.interval;
        }
        let left = self.remaining_calls.map(|n| n.saturating_sub(1));
        self.remaining_calls = left;
        if left == Some(0) {
            self.exhausted = true;
        }
        left
    }
}

/// Interval and call budget of a supervisor timer for a task timeout in
/// milliseconds. A zero timeout polls forever; a timeout up to one tick is
/// a single shot; anything longer gets enough ticks to reach the timeout.
pub fn supervisor_schedule(timeout_ms: u64, tick: Duration) -> (Duration, Option<u32>) {
    let tick_ms = (tick.as_millis() as u64).max(1);
    if timeout_ms == 0 {
        (Duration::from_millis(tick_ms), None)
    } else if timeout_ms <= tick_ms {
        (Duration::from_millis(timeout_ms), Some(1))
    } else {
        let calls = timeout_ms.div_ceil(tick_ms).min(u32::MAX as u64) as u32;
        (Duration::from_millis(tick_ms), Some(calls))
    }
}
