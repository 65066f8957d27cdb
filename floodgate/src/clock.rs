use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Clock;
use quanta::Instant;

/// Millisecond wall-clock used by every statistics structure in this crate.
///
/// Window arithmetic works on plain `u64` milliseconds, so the clock samples
/// a monotonic source once at construction and pairs it with the wall time
/// read at the same moment. Later reads are `base + monotonic elapsed`,
/// which keeps timestamps monotonic even if the system clock steps.
#[derive(Debug, Clone)]
pub struct MilliClock {
    clock: Clock,
    /// A fixed point in time (TSC tick) to calculate deltas from.
    anchor: Instant,
    /// Wall milliseconds at the anchor. Zero for mock clocks.
    base_ms: u64,
}

impl MilliClock {
    pub fn new() -> Self {
        let clock = Clock::new();
        let anchor = clock.now();
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            clock,
            anchor,
            base_ms,
        }
    }

    /// A controllable clock for deterministic tests.
    ///
    /// Time starts at zero and only moves when the returned handle is
    /// incremented.
    pub fn mock() -> (Self, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let anchor = clock.now();
        (
            Self {
                clock,
                anchor,
                base_ms: 0,
            },
            mock,
        )
    }

    /// Current time in milliseconds.
    #[inline]
    pub fn now_millis(&self) -> u64 {
        self.base_ms + self.clock.now().duration_since(self.anchor).as_millis() as u64
    }
}

impl Default for MilliClock {
    fn default() -> Self {
        Self::new()
    }
}
