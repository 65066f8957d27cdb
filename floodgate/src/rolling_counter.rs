use crate::bucket::MetricBucket;
use crate::bucket::MetricEvent;
use crate::leap_array::BucketRef;
use crate::leap_array::Horizon;
use crate::leap_array::LeapArray;
use crate::leap_array::WindowShape;
use crate::leap_array::WindowWrap;

/// Sliding-window metric facade over a [`LeapArray`].
///
/// Reads refresh the current window first, then sum every bucket that is
/// still inside the interval. The occupiable flavor carries a second,
/// future-facing array where admissions borrowed from upcoming windows are
/// parked until real time catches up with them.
#[derive(Debug)]
pub struct RollingCounter {
    data: LeapArray,
    borrow: Option<LeapArray>,
}

impl RollingCounter {
    pub fn new(shape: WindowShape, rt_ceiling_ms: u64) -> Self {
        Self {
            data: LeapArray::new(shape, rt_ceiling_ms),
            borrow: None,
        }
    }

    /// A counter that also accepts bookings against future windows.
    pub fn occupiable(shape: WindowShape, rt_ceiling_ms: u64) -> Self {
        Self {
            data: LeapArray::new(shape, rt_ceiling_ms),
            borrow: Some(LeapArray::with_horizon(shape, Horizon::Future, rt_ceiling_ms)),
        }
    }

    #[inline]
    pub fn shape(&self) -> WindowShape {
        self.data.shape()
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.data.interval_ms()
    }

    #[inline]
    pub fn interval_sec(&self) -> f64 {
        self.data.interval_ms() as f64 / 1000.0
    }

    #[inline]
    pub fn window_length_ms(&self) -> u64 {
        self.data.window_length_ms()
    }

    /// The value [`min_rt`](Self::min_rt) reports for an empty interval.
    #[inline]
    pub fn rt_ceiling(&self) -> u64 {
        self.data.rt_ceiling()
    }

    /// Resolves the live bucket for `now_ms`, seeding it from any matured
    /// booking when the counter is occupiable.
    pub fn current_window(&self, now_ms: u64) -> BucketRef<'_> {
        self.data.current_window_seeded(now_ms, self.borrow.as_ref())
    }

    pub fn add_pass(&self, now_ms: u64, n: u64) {
        self.current_window(now_ms).bucket().add(MetricEvent::Pass, n);
    }

    pub fn add_block(&self, now_ms: u64, n: u64) {
        self.current_window(now_ms).bucket().add(MetricEvent::Block, n);
    }

    pub fn add_exception(&self, now_ms: u64, n: u64) {
        self.current_window(now_ms)
            .bucket()
            .add(MetricEvent::Exception, n);
    }

    pub fn add_success(&self, now_ms: u64, n: u64) {
        self.current_window(now_ms)
            .bucket()
            .add(MetricEvent::Success, n);
    }

    pub fn add_rt(&self, now_ms: u64, rt_ms: u64) {
        self.current_window(now_ms).bucket().add_rt(rt_ms);
    }

    pub fn add_occupied_pass(&self, now_ms: u64, n: u64) {
        self.current_window(now_ms)
            .bucket()
            .add(MetricEvent::OccupiedPass, n);
    }

    pub fn pass(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::Pass)
    }

    pub fn block(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::Block)
    }

    pub fn exception(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::Exception)
    }

    pub fn success(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::Success)
    }

    pub fn rt(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::Rt)
    }

    pub fn occupied_pass(&self, now_ms: u64) -> u64 {
        self.sum(now_ms, MetricEvent::OccupiedPass)
    }

    fn sum(&self, now_ms: u64, event: MetricEvent) -> u64 {
        let _ = self.current_window(now_ms);
        self.data
            .values(now_ms)
            .iter()
            .map(|b| b.get(event))
            .sum()
    }

    /// Smallest response time inside the interval, or the ceiling when the
    /// interval saw no completions.
    pub fn min_rt(&self, now_ms: u64) -> u64 {
        let _ = self.current_window(now_ms);
        self.data
            .values(now_ms)
            .iter()
            .map(|b| b.min_rt())
            .min()
            .unwrap_or(self.data.rt_ceiling())
    }

    /// Pass count of the window immediately before the current one.
    pub fn previous_window_pass(&self, now_ms: u64) -> u64 {
        self.data
            .previous_window(now_ms)
            .map(|w| w.bucket().pass())
            .unwrap_or(0)
    }

    /// Pass count of the single window containing `time_ms`, if live.
    pub fn window_pass(&self, time_ms: u64) -> u64 {
        self.data
            .window_value(time_ms)
            .map(MetricBucket::pass)
            .unwrap_or(0)
    }

    /// Live window wraps inside the interval, the current one included.
    /// Metric exporters walk these to report per-window counts.
    pub fn windows(&self, now_ms: u64) -> Vec<&WindowWrap> {
        let _ = self.current_window(now_ms);
        self.data.list(now_ms)
    }

    /// Every populated window wrap, stale ones included.
    pub fn all_windows(&self) -> Vec<&WindowWrap> {
        self.data.list_all()
    }

    /// Total passes currently booked against future windows.
    pub fn waiting(&self, now_ms: u64) -> u64 {
        let Some(borrow) = &self.borrow else {
            return 0;
        };
        // Touch the slot for "now" so a stale booking from a full cycle ago
        // is recycled away before the sum.
        let _ = borrow.current_window(now_ms);
        borrow.values(now_ms).iter().map(|b| b.pass()).sum()
    }

    /// Books `n` passes into the future window containing `future_time_ms`.
    pub fn add_waiting(&self, future_time_ms: u64, n: u64) {
        if let Some(borrow) = &self.borrow {
            borrow
                .current_window(future_time_ms)
                .bucket()
                .add(MetricEvent::Pass, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leap_array::WindowShape;

    const CEILING: u64 = 4900;

    fn counter() -> RollingCounter {
        RollingCounter::new(WindowShape::DEFAULT, CEILING)
    }

    #[test]
    fn test_sums_cover_the_whole_interval() {
        let c = counter();

        c.add_pass(1_000, 3);
        c.add_pass(1_600, 4);
        c.add_block(1_600, 1);

        assert_eq!(c.pass(1_700), 7);
        assert_eq!(c.block(1_700), 1);

        // Half a window later the first bucket has slid out.
        assert_eq!(c.pass(2_400), 4);
        // And eventually everything does.
        assert_eq!(c.pass(5_000), 0);
    }

    #[test]
    fn test_min_rt_defaults_to_ceiling() {
        let c = counter();
        assert_eq!(c.min_rt(1_000), CEILING);

        c.add_rt(1_000, 70);
        c.add_rt(1_600, 45);
        assert_eq!(c.min_rt(1_700), 45);

        // Only the bucket holding 45 remains, then none.
        assert_eq!(c.min_rt(2_400), 45);
        assert_eq!(c.min_rt(5_000), CEILING);
    }

    #[test]
    fn test_previous_window_pass() {
        let c = counter();
        c.add_pass(1_600, 6);

        assert_eq!(c.previous_window_pass(2_100), 6);
        // Not adjacent anymore.
        assert_eq!(c.previous_window_pass(2_600), 0);
    }

    #[test]
    fn test_window_pass_is_per_bucket() {
        let c = counter();
        c.add_pass(1_000, 3);
        c.add_pass(1_600, 4);

        assert_eq!(c.window_pass(1_200), 3);
        assert_eq!(c.window_pass(1_900), 4);
        assert_eq!(c.window_pass(2_300), 0);
    }

    #[test]
    fn test_window_listing_tracks_liveness() {
        let c = counter();
        c.add_pass(1_000, 3);
        c.add_pass(1_600, 4);

        let live: u64 = c.windows(1_700).iter().map(|w| w.bucket().pass()).sum();
        assert_eq!(live, 7);

        // Listing at 2_400 recycles the oldest slot first, so its 3 passes
        // drop out of the live view while the raw slot count stays at two.
        let live: u64 = c.windows(2_400).iter().map(|w| w.bucket().pass()).sum();
        assert_eq!(live, 4);
        assert_eq!(c.all_windows().len(), 2);
    }

    #[test]
    fn test_plain_counter_has_no_waiting_side() {
        let c = counter();
        c.add_waiting(2_000, 5);
        assert_eq!(c.waiting(1_000), 0);
    }

    #[test]
    fn test_waiting_counts_until_maturity() {
        let c = RollingCounter::occupiable(WindowShape::DEFAULT, CEILING);

        // Book two passes for the window starting at 2000.
        c.add_waiting(2_000, 2);
        assert_eq!(c.waiting(1_700), 2);

        // Reading the live side at 2100 seeds the current bucket from the
        // matured booking.
        assert_eq!(c.pass(2_100), 2);

        // And the booking itself no longer counts as waiting.
        assert_eq!(c.waiting(2_500), 0);
    }

    #[test]
    fn test_occupied_pass_accumulates() {
        let c = counter();
        c.add_occupied_pass(1_000, 2);
        c.add_pass(1_000, 2);
        assert_eq!(c.occupied_pass(1_200), 2);
        assert_eq!(c.pass(1_200), 2);
    }
}
