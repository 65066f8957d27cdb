use std::fmt::Debug;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::clock::MilliClock;
use crate::leap_array::WindowShape;
use crate::rolling_counter::RollingCounter;

/// Default timeout for borrowing capacity from future windows.
pub const DEFAULT_OCCUPY_TIMEOUT_MS: u64 = 500;

/// Default ceiling used to initialize per-window minimum response times.
pub const DEFAULT_MAX_RT_MS: u64 = 4900;

/// Statistics layout shared by every node an engine creates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatConfig {
    /// Bucket layout of the second-level counters.
    pub shape: WindowShape,
    /// Longest a prioritized caller may wait for borrowed capacity.
    pub occupy_timeout_ms: u64,
    /// Min-RT ceiling for freshly reset buckets.
    pub max_rt_ms: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            shape: WindowShape::DEFAULT,
            occupy_timeout_ms: DEFAULT_OCCUPY_TIMEOUT_MS,
            max_rt_ms: DEFAULT_MAX_RT_MS,
        }
    }
}

/// Read and write surface of one statistics holder.
///
/// Writers are the admission path; readers are the traffic controllers and
/// whatever exports metrics. Both sides run concurrently with no external
/// locking, so every method takes `&self`.
pub trait Node: Debug + Send + Sync {
    /// One more call is in flight.
    fn inc_concurrency(&self);
    /// One call finished or was abandoned.
    fn dec_concurrency(&self);
    fn add_pass(&self, n: u64);
    fn add_block(&self, n: u64);
    fn add_exception(&self, n: u64);
    /// Records a completion: response time plus `n` successes.
    fn add_rt_and_success(&self, rt_ms: u64, n: u64);
    /// Marks `n` passes as granted early out of a future window.
    fn add_occupied_pass(&self, n: u64);
    /// Books `n` passes into the window containing `future_time_ms`.
    fn add_waiting_request(&self, future_time_ms: u64, n: u64);

    /// Calls currently in flight.
    fn cur_concurrency(&self) -> u32;
    fn pass_qps(&self) -> f64;
    fn block_qps(&self) -> f64;
    fn exception_qps(&self) -> f64;
    fn success_qps(&self) -> f64;
    fn occupied_pass_qps(&self) -> f64;
    fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }
    /// Pass rate of the previous whole second, read from the minute-level
    /// counters. Feeds the warm-up ramp.
    fn previous_pass_qps(&self) -> f64;
    /// Average response time per success inside the interval.
    fn avg_rt(&self) -> f64;
    fn min_rt(&self) -> f64;
    /// Passes currently booked against future windows.
    fn waiting(&self) -> u64;

    /// Scans upcoming windows for room to place `acquire` extra passes
    /// while honoring `threshold` (calls per second) over any interval.
    ///
    /// Returns the wait in milliseconds until the borrowed window opens, or
    /// the occupy timeout when no window inside the timeout has room. The
    /// caller must treat a returned wait equal to the timeout as a refusal.
    fn try_occupy_next(&self, now_ms: u64, acquire: u32, threshold: f64) -> u64;

    /// Minute-level totals. `total_pass` includes occupied passes.
    fn total_pass(&self) -> u64;
    fn total_block(&self) -> u64;
    fn total_exception(&self) -> u64;
    fn total_success(&self) -> u64;
    fn total_request(&self) -> u64 {
        self.total_pass() + self.total_block()
    }
}

/// The concrete statistics holder.
///
/// Two rolling counters cover different horizons: a second-level one (with
/// a future-booking side) drives admission decisions, and a minute-level
/// one of sixty one-second buckets feeds totals and the previous-second
/// rate. A plain signed gauge tracks in-flight calls.
#[derive(Debug)]
pub struct StatNode {
    second: RollingCounter,
    minute: RollingCounter,
    concurrency: AtomicI64,
    occupy_timeout_ms: u64,
    clock: MilliClock,
}

impl StatNode {
    pub fn new(config: &StatConfig, clock: MilliClock) -> Self {
        Self {
            second: RollingCounter::occupiable(config.shape, config.max_rt_ms),
            minute: RollingCounter::new(WindowShape::MINUTE, config.max_rt_ms),
            concurrency: AtomicI64::new(0),
            occupy_timeout_ms: config.occupy_timeout_ms,
            clock,
        }
    }

    #[inline]
    fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

impl Node for StatNode {
    fn inc_concurrency(&self) {
        self.concurrency.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_concurrency(&self) {
        self.concurrency.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_pass(&self, n: u64) {
        let now = self.now();
        self.second.add_pass(now, n);
        self.minute.add_pass(now, n);
    }

    fn add_block(&self, n: u64) {
        let now = self.now();
        self.second.add_block(now, n);
        self.minute.add_block(now, n);
    }

    fn add_exception(&self, n: u64) {
        let now = self.now();
        self.second.add_exception(now, n);
        self.minute.add_exception(now, n);
    }

    fn add_rt_and_success(&self, rt_ms: u64, n: u64) {
        let now = self.now();
        self.second.add_success(now, n);
        self.second.add_rt(now, rt_ms);
        self.minute.add_success(now, n);
        self.minute.add_rt(now, rt_ms);
    }

    fn add_occupied_pass(&self, n: u64) {
        // Early grants only surface in the minute totals here; the
        // second-level counters pick them up when the borrowed window
        // matures and seeds the live bucket.
        let now = self.now();
        self.minute.add_pass(now, n);
        self.minute.add_occupied_pass(now, n);
    }

    fn add_waiting_request(&self, future_time_ms: u64, n: u64) {
        self.second.add_waiting(future_time_ms, n);
    }

    fn cur_concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Relaxed).max(0) as u32
    }

    fn pass_qps(&self) -> f64 {
        self.second.pass(self.now()) as f64 / self.second.interval_sec()
    }

    fn block_qps(&self) -> f64 {
        self.second.block(self.now()) as f64 / self.second.interval_sec()
    }

    fn exception_qps(&self) -> f64 {
        self.second.exception(self.now()) as f64 / self.second.interval_sec()
    }

    fn success_qps(&self) -> f64 {
        self.second.success(self.now()) as f64 / self.second.interval_sec()
    }

    fn occupied_pass_qps(&self) -> f64 {
        self.second.occupied_pass(self.now()) as f64 / self.second.interval_sec()
    }

    fn previous_pass_qps(&self) -> f64 {
        // Minute buckets are one second wide, so the previous bucket's
        // pass count is already a per-second rate.
        self.minute.previous_window_pass(self.now()) as f64
    }

    fn avg_rt(&self) -> f64 {
        let now = self.now();
        let success = self.second.success(now);
        if success == 0 {
            return 0.0;
        }
        self.second.rt(now) as f64 / success as f64
    }

    fn min_rt(&self) -> f64 {
        self.second.min_rt(self.now()) as f64
    }

    fn waiting(&self) -> u64 {
        self.second.waiting(self.now())
    }

    fn try_occupy_next(&self, now_ms: u64, acquire: u32, threshold: f64) -> u64 {
        let max_count = threshold * self.second.interval_ms() as f64 / 1000.0;
        let current_borrow = self.second.waiting(now_ms);
        if current_borrow as f64 >= max_count {
            return self.occupy_timeout_ms;
        }

        let window_length = self.second.window_length_ms();
        let interval = self.second.interval_ms();

        // Walk candidate borrow windows oldest-first. Admitting at window i
        // means the interval ending there no longer contains the windows
        // before `earliest`, so their passes stop counting against us.
        let mut current_pass = self.second.pass(now_ms) as i64;
        let mut earliest =
            (now_ms - now_ms % window_length + window_length) as i64 - interval as i64;
        let mut idx: u64 = 0;

        while earliest < now_ms as i64 {
            let wait = idx * window_length + window_length - now_ms % window_length;
            if wait >= self.occupy_timeout_ms {
                break;
            }
            let window_pass = if earliest >= 0 {
                self.second.window_pass(earliest as u64) as i64
            } else {
                0
            };
            if (current_pass + current_borrow as i64 + acquire as i64 - window_pass) as f64
                <= max_count
            {
                return wait;
            }
            earliest += window_length as i64;
            current_pass -= window_pass;
            idx += 1;
        }

        self.occupy_timeout_ms
    }

    fn total_pass(&self) -> u64 {
        self.minute.pass(self.now())
    }

    fn total_block(&self) -> u64 {
        self.minute.block(self.now())
    }

    fn total_exception(&self) -> u64 {
        self.minute.exception(self.now())
    }

    fn total_success(&self) -> u64 {
        self.minute.success(self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mock_node() -> (StatNode, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = MilliClock::mock();
        // Move off zero so window math has room behind it.
        mock.increment(Duration::from_secs(10));
        (StatNode::new(&StatConfig::default(), clock), mock)
    }

    #[test]
    fn test_pass_qps_reflects_the_last_second() {
        let (node, mock) = mock_node();

        node.add_pass(5);
        assert_eq!(node.pass_qps(), 5.0);
        assert_eq!(node.total_pass(), 5);

        // A second later the rate is gone but the minute total remains.
        mock.increment(Duration::from_millis(1500));
        assert_eq!(node.pass_qps(), 0.0);
        assert_eq!(node.total_pass(), 5);
    }

    #[test]
    fn test_previous_pass_qps_is_the_prior_second() {
        let (node, mock) = mock_node();

        node.add_pass(7);
        mock.increment(Duration::from_secs(1));
        assert_eq!(node.previous_pass_qps(), 7.0);

        // Two seconds out it is no longer "previous".
        mock.increment(Duration::from_secs(1));
        assert_eq!(node.previous_pass_qps(), 0.0);
    }

    #[test]
    fn test_concurrency_gauge_round_trips() {
        let (node, _mock) = mock_node();

        node.inc_concurrency();
        node.inc_concurrency();
        assert_eq!(node.cur_concurrency(), 2);

        node.dec_concurrency();
        node.dec_concurrency();
        assert_eq!(node.cur_concurrency(), 0);

        // A stray extra decrement never shows as a huge unsigned value.
        node.dec_concurrency();
        assert_eq!(node.cur_concurrency(), 0);
    }

    #[test]
    fn test_avg_and_min_rt() {
        let (node, _mock) = mock_node();
        assert_eq!(node.avg_rt(), 0.0);
        assert_eq!(node.min_rt(), DEFAULT_MAX_RT_MS as f64);

        node.add_rt_and_success(30, 1);
        node.add_rt_and_success(90, 1);
        assert_eq!(node.avg_rt(), 60.0);
        assert_eq!(node.min_rt(), 30.0);
        assert_eq!(node.total_success(), 2);
    }

    #[test]
    fn test_occupied_pass_counts_toward_minute_totals_only() {
        let (node, _mock) = mock_node();

        node.add_occupied_pass(2);
        assert_eq!(node.total_pass(), 2);
        // The live second-level rate is untouched until the borrowed
        // window actually arrives.
        assert_eq!(node.pass_qps(), 0.0);
    }

    #[test]
    fn test_try_occupy_next_finds_the_window_that_frees_capacity() {
        let (node, mock) = mock_node();
        // now = 10_000; fill the window [10_000, 10_500).
        node.add_pass(10);

        // Step into the next window so the full load sits in the previous
        // bucket.
        mock.increment(Duration::from_millis(700));
        let now = 10_700;

        // With threshold 10 the interval is saturated, but once the window
        // holding the 10 passes slides out there is room again. That happens
        // at the next boundary: 10 * 500 ties to wait = 300.
        let wait = node.try_occupy_next(now, 1, 10.0);
        assert_eq!(wait, 300);

        // A fatter borrow cannot fit at all inside the occupy timeout.
        let wait = node.try_occupy_next(now, 11, 10.0);
        assert_eq!(wait, DEFAULT_OCCUPY_TIMEOUT_MS);
    }

    #[test]
    fn test_try_occupy_next_respects_existing_bookings() {
        let (node, _mock) = mock_node();
        let now = 10_000;

        // Saturate the borrow budget itself: bookings count against the
        // same per-interval threshold.
        node.add_waiting_request(10_500, 10);
        let wait = node.try_occupy_next(now, 1, 10.0);
        assert_eq!(wait, DEFAULT_OCCUPY_TIMEOUT_MS);
    }

    #[test]
    fn test_matured_booking_feeds_pass_qps() {
        let (node, mock) = mock_node();

        // Book 3 passes for the window starting at 10_500.
        node.add_waiting_request(10_500, 3);
        assert_eq!(node.waiting(), 3);
        assert_eq!(node.pass_qps(), 0.0);

        // Once that window is current, the booking surfaces as real passes.
        mock.increment(Duration::from_millis(600));
        assert_eq!(node.pass_qps(), 3.0);
    }
}
