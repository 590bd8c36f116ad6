use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use crate::util::safe_converter::PrecheckedCast;

/// Millisecond clock relative to a service's creation. All protocol timers (handshake retries,
///  accept timeouts, ARQ retransmission) are expressed in this time base.
///
/// NB: The value wraps after ~49 days; all comparisons of two timestamps go through
///      [time_diff] to stay correct across the wrap.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u32;
}

pub struct SystemClock {
    start: Instant,
}
impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { start: Instant::now() }
    }
}
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u32 {
        // truncation is the intended wrap-around
        let millis = self.start.elapsed().as_millis() % (u32::MAX as u128 + 1);
        millis.prechecked_cast()
    }
}

/// A clock that only moves when told to. Used to drive the timer logic deterministically.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU32,
}
impl ManualClock {
    pub fn new(start: u32) -> ManualClock {
        ManualClock { now: AtomicU32::new(start) }
    }

    pub fn advance(&self, millis: u32) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set(&self, millis: u32) {
        self.now.store(millis, Ordering::Release);
    }
}
impl Clock for ManualClock {
    fn now_millis(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}

/// signed difference `later - earlier`, robust against wrap-around of the millisecond counter
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
