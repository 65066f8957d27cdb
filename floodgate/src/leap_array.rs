use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::bucket::MetricBucket;
use crate::error::ConfigError;

/// Validated bucket layout for a [`LeapArray`].
///
/// Construction is the only fallible step: once a shape exists, the
/// interval is known to divide evenly into a positive number of buckets,
/// so the arrays built from it never re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    sample_count: usize,
    interval_ms: u64,
}

impl WindowShape {
    /// Two 500ms buckets over a one second interval.
    pub const DEFAULT: WindowShape = WindowShape {
        sample_count: 2,
        interval_ms: 1000,
    };

    /// Sixty one-second buckets. Backs the minute-level counters.
    pub(crate) const MINUTE: WindowShape = WindowShape {
        sample_count: 60,
        interval_ms: 60_000,
    };

    pub fn new(sample_count: usize, interval_ms: u64) -> Result<Self, ConfigError> {
        if sample_count == 0 {
            return Err(ConfigError::ZeroSampleCount);
        }
        if interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if interval_ms % sample_count as u64 != 0 {
            return Err(ConfigError::UnevenWindow {
                interval_ms,
                sample_count,
            });
        }
        Ok(Self {
            sample_count,
            interval_ms,
        })
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    #[inline]
    pub fn window_length_ms(&self) -> u64 {
        self.interval_ms / self.sample_count as u64
    }
}

impl Default for WindowShape {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Which side of "now" an array's buckets describe.
///
/// A `Past` array keeps a bucket alive while it is at most one interval
/// old. A `Future` array holds capacity booked ahead of time, so a bucket
/// there is only meaningful until real time reaches its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Horizon {
    Past,
    Future,
}

/// One bucket slot together with the window start it currently represents.
///
/// The start timestamp is atomic because slots are recycled in place:
/// a writer that finds a stale slot clears the counters and republishes
/// the start, while concurrent readers keep loading whichever start is
/// visible.
#[derive(Debug)]
pub struct WindowWrap {
    window_length_ms: u64,
    window_start: AtomicU64,
    bucket: MetricBucket,
}

impl WindowWrap {
    fn new(window_length_ms: u64, window_start: u64, rt_ceiling: u64) -> Self {
        Self {
            window_length_ms,
            window_start: AtomicU64::new(window_start),
            bucket: MetricBucket::new(rt_ceiling),
        }
    }

    #[inline]
    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    #[inline]
    pub fn window_start(&self) -> u64 {
        self.window_start.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bucket(&self) -> &MetricBucket {
        &self.bucket
    }

    /// True if `time_ms` falls inside `[start, start + length)`.
    #[inline]
    pub fn is_time_in_window(&self, time_ms: u64) -> bool {
        let start = self.window_start();
        start <= time_ms && time_ms < start + self.window_length_ms
    }

    fn publish_start(&self, window_start: u64) {
        self.window_start.store(window_start, Ordering::Release);
    }
}

/// A view of the bucket owning a timestamp.
///
/// Almost always a shared reference into the array. The detached variant
/// appears only when the requested timestamp is older than what the slot
/// currently holds (the clock went backwards): such a bucket is never
/// published, and whatever gets recorded into it vanishes with it.
#[derive(Debug)]
pub enum BucketRef<'a> {
    Shared(&'a WindowWrap),
    Detached(WindowWrap),
}

impl std::ops::Deref for BucketRef<'_> {
    type Target = WindowWrap;

    fn deref(&self) -> &WindowWrap {
        match self {
            BucketRef::Shared(wrap) => wrap,
            BucketRef::Detached(wrap) => wrap,
        }
    }
}

/// A circular array of time-aligned counter buckets.
///
/// The array covers a fixed interval split into `sample_count` buckets of
/// equal length. Bucket lookup is pure arithmetic on the timestamp; slots
/// are created lazily and then recycled in place forever, so a warmed-up
/// array allocates nothing.
#[derive(Debug)]
pub struct LeapArray {
    shape: WindowShape,
    window_length_ms: u64,
    slots: Box<[OnceLock<WindowWrap>]>,
    /// Guards in-place recycling of stale slots. Never held while a bucket
    /// is current, so the hot path stays lock-free.
    update_lock: Mutex<()>,
    horizon: Horizon,
    rt_ceiling: u64,
}

impl LeapArray {
    pub fn new(shape: WindowShape, rt_ceiling_ms: u64) -> Self {
        Self::with_horizon(shape, Horizon::Past, rt_ceiling_ms)
    }

    pub(crate) fn with_horizon(shape: WindowShape, horizon: Horizon, rt_ceiling: u64) -> Self {
        let slots = (0..shape.sample_count())
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shape,
            window_length_ms: shape.window_length_ms(),
            slots,
            update_lock: Mutex::new(()),
            horizon,
            rt_ceiling,
        }
    }

    #[inline]
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    #[inline]
    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.shape.interval_ms()
    }

    #[inline]
    pub(crate) fn rt_ceiling(&self) -> u64 {
        self.rt_ceiling
    }

    #[inline]
    fn index_for(&self, time_ms: u64) -> usize {
        ((time_ms / self.window_length_ms) % self.slots.len() as u64) as usize
    }

    #[inline]
    fn window_start_of(&self, time_ms: u64) -> u64 {
        time_ms - time_ms % self.window_length_ms
    }

    /// Resolves the bucket responsible for `time_ms`, creating or recycling
    /// its slot as needed.
    pub fn current_window(&self, time_ms: u64) -> BucketRef<'_> {
        self.current_window_seeded(time_ms, None)
    }

    /// Like [`current_window`](Self::current_window), but a freshly created
    /// or recycled bucket starts from the matching bucket of `seed_from`
    /// instead of zero. This is how passes booked into a future array
    /// surface in the live one once their window arrives.
    pub(crate) fn current_window_seeded(
        &self,
        time_ms: u64,
        seed_from: Option<&LeapArray>,
    ) -> BucketRef<'_> {
        let idx = self.index_for(time_ms);
        let window_start = self.window_start_of(time_ms);

        loop {
            let Some(wrap) = self.slots[idx].get() else {
                // Empty slot: build a candidate off to the side and try to
                // publish it. Exactly one publisher wins; losers re-read.
                let candidate =
                    WindowWrap::new(self.window_length_ms, window_start, self.rt_ceiling);
                self.seed_bucket(&candidate, window_start, seed_from);
                if self.slots[idx].set(candidate).is_err() {
                    std::thread::yield_now();
                }
                continue;
            };

            let start = wrap.window_start();
            if start == window_start {
                // Hot path: the slot already represents this window.
                return BucketRef::Shared(wrap);
            }

            if window_start > start {
                // The slot holds an old window. One thread recycles it in
                // place; everyone else backs off until the new start shows.
                if let Some(_guard) = self.update_lock.try_lock() {
                    if wrap.window_start() < window_start {
                        self.seed_bucket(wrap, window_start, seed_from);
                        wrap.publish_start(window_start);
                        return BucketRef::Shared(wrap);
                    }
                    // Another thread got here first; re-evaluate.
                } else {
                    std::thread::yield_now();
                }
                continue;
            }

            // The slot has moved past the requested time, which can only
            // happen if the caller's clock ran backwards. Hand out a bucket
            // that belongs to no slot; its counts are deliberately lost.
            return BucketRef::Detached(WindowWrap::new(
                self.window_length_ms,
                window_start,
                self.rt_ceiling,
            ));
        }
    }

    fn seed_bucket(&self, wrap: &WindowWrap, window_start: u64, seed_from: Option<&LeapArray>) {
        match seed_from.and_then(|src| src.window_value(window_start)) {
            Some(seed) => wrap.bucket().reset_from(seed),
            None => wrap.bucket().reset(),
        }
    }

    /// The bucket preceding the one that owns `time_ms`, if it is still
    /// live and actually adjacent.
    pub fn previous_window(&self, time_ms: u64) -> Option<&WindowWrap> {
        if time_ms < self.window_length_ms {
            return None;
        }
        let previous_ms = time_ms - self.window_length_ms;
        let wrap = self.slots[self.index_for(previous_ms)].get()?;
        if self.is_deprecated_at(time_ms, wrap) {
            return None;
        }
        if wrap.window_start() + self.window_length_ms < previous_ms {
            // The slot was never touched during the previous window.
            return None;
        }
        Some(wrap)
    }

    /// The bucket whose window contains `time_ms`, without creating one.
    pub fn window_value(&self, time_ms: u64) -> Option<&MetricBucket> {
        let wrap = self.slots[self.index_for(time_ms)].get()?;
        wrap.is_time_in_window(time_ms).then(|| wrap.bucket())
    }

    /// Whether `wrap` no longer participates in the interval ending at
    /// `time_ms`.
    pub fn is_deprecated_at(&self, time_ms: u64, wrap: &WindowWrap) -> bool {
        match self.horizon {
            Horizon::Past => time_ms.saturating_sub(wrap.window_start()) > self.shape.interval_ms(),
            // A future bucket stops meaning anything once real time has
            // caught up with its end.
            Horizon::Future => time_ms >= wrap.window_start() + self.window_length_ms,
        }
    }

    /// All live buckets as of `time_ms`.
    pub fn values(&self, time_ms: u64) -> Vec<&MetricBucket> {
        self.live_windows(time_ms).map(WindowWrap::bucket).collect()
    }

    /// All live window wraps as of `time_ms`.
    pub fn list(&self, time_ms: u64) -> Vec<&WindowWrap> {
        self.live_windows(time_ms).collect()
    }

    /// Every populated window wrap, deprecated ones included.
    pub fn list_all(&self) -> Vec<&WindowWrap> {
        self.slots.iter().filter_map(OnceLock::get).collect()
    }

    fn live_windows(&self, time_ms: u64) -> impl Iterator<Item = &WindowWrap> {
        self.slots
            .iter()
            .filter_map(OnceLock::get)
            .filter(move |wrap| !self.is_deprecated_at(time_ms, wrap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MetricEvent;
    use std::sync::Arc;
    use std::thread;

    const CEILING: u64 = 4900;

    fn shape(sample_count: usize, interval_ms: u64) -> WindowShape {
        WindowShape::new(sample_count, interval_ms).unwrap()
    }

    #[test]
    fn test_shape_rejects_degenerate_layouts() {
        assert_eq!(
            WindowShape::new(0, 1000).unwrap_err(),
            ConfigError::ZeroSampleCount
        );
        assert_eq!(
            WindowShape::new(2, 0).unwrap_err(),
            ConfigError::ZeroInterval
        );
        assert_eq!(
            WindowShape::new(3, 1000).unwrap_err(),
            ConfigError::UnevenWindow {
                interval_ms: 1000,
                sample_count: 3
            }
        );
        assert!(WindowShape::new(2, 1000).is_ok());
    }

    #[test]
    fn test_window_start_is_aligned() {
        let array = LeapArray::new(shape(2, 1000), CEILING);

        let w = array.current_window(1674);
        assert_eq!(w.window_start(), 1500);
        assert!(w.is_time_in_window(1999));
        assert!(!w.is_time_in_window(2000));

        // Any time inside the same window resolves to the same bucket.
        w.bucket().add(MetricEvent::Pass, 1);
        let again = array.current_window(1999);
        assert_eq!(again.window_start(), 1500);
        assert_eq!(again.bucket().pass(), 1);
    }

    #[test]
    fn test_slot_is_recycled_in_place_with_fresh_counters() {
        let array = LeapArray::new(shape(2, 1000), CEILING);

        let w = array.current_window(600);
        w.bucket().add(MetricEvent::Pass, 5);
        assert_eq!(w.window_start(), 500);

        // One full interval later the same slot index comes around again.
        let recycled = array.current_window(1600);
        assert_eq!(recycled.window_start(), 1500);
        assert_eq!(recycled.bucket().pass(), 0, "recycled slot must be clean");
    }

    #[test]
    fn test_backwards_clock_gets_detached_bucket() {
        let array = LeapArray::new(shape(2, 1000), CEILING);

        array.current_window(2300).bucket().add(MetricEvent::Pass, 2);

        // Asking for a window the slot has already moved past.
        let stale = array.current_window(1300);
        assert!(matches!(stale, BucketRef::Detached(_)));
        stale.bucket().add(MetricEvent::Pass, 99);

        // The published slot is untouched and the stale counts are gone.
        let live = array.current_window(2300);
        assert!(matches!(live, BucketRef::Shared(_)));
        assert_eq!(live.bucket().pass(), 2);
    }

    #[test]
    fn test_previous_window_lookup() {
        let array = LeapArray::new(shape(2, 1000), CEILING);

        // Nothing recorded yet, and small times cannot underflow.
        assert!(array.previous_window(100).is_none());
        assert!(array.previous_window(1600).is_none());

        array.current_window(1600).bucket().add(MetricEvent::Pass, 4);
        let prev = array.previous_window(2100).expect("adjacent live window");
        assert_eq!(prev.window_start(), 1500);
        assert_eq!(prev.bucket().pass(), 4);

        // Two intervals later that bucket is deprecated.
        assert!(array.previous_window(4100).is_none());
    }

    #[test]
    fn test_values_skips_deprecated_buckets() {
        let array = LeapArray::new(shape(2, 1000), CEILING);

        array.current_window(600).bucket().add(MetricEvent::Pass, 1);
        array.current_window(1100).bucket().add(MetricEvent::Pass, 2);

        let total: u64 = array.values(1100).iter().map(|b| b.pass()).sum();
        assert_eq!(total, 3, "both buckets inside the interval count");

        // Far in the future both buckets are deprecated and filtered out.
        let total: u64 = array.values(9600).iter().map(|b| b.pass()).sum();
        assert_eq!(total, 0);

        // The unfiltered listing still sees the stale slots.
        assert_eq!(array.list(9600).len(), 0);
        assert_eq!(array.list_all().len(), 2);
    }

    #[test]
    fn test_window_value_does_not_create() {
        let array = LeapArray::new(shape(2, 1000), CEILING);
        assert!(array.window_value(600).is_none());

        array.current_window(600).bucket().add(MetricEvent::Pass, 1);
        assert_eq!(array.window_value(600).map(MetricBucket::pass), Some(1));
        // Same slot, different window: no match.
        assert!(array.window_value(1600).is_none());
    }

    #[test]
    fn test_future_horizon_buckets_expire_when_time_catches_up() {
        let array = LeapArray::with_horizon(shape(2, 1000), Horizon::Future, CEILING);

        // Book capacity in the window starting at 2000.
        array.current_window(2000).bucket().add(MetricEvent::Pass, 3);

        // Seen from 1800, the booking is still ahead and live.
        let live: u64 = array.values(1800).iter().map(|b| b.pass()).sum();
        assert_eq!(live, 3);

        // Once real time reaches the booking's end it stops counting.
        let expired: u64 = array.values(2500).iter().map(|b| b.pass()).sum();
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_seeded_recycle_inherits_booked_passes() {
        let past = LeapArray::new(shape(2, 1000), CEILING);
        let future = LeapArray::with_horizon(shape(2, 1000), Horizon::Future, CEILING);

        // Populate the slot so the later lookup recycles rather than creates.
        past.current_window(600).bucket().add(MetricEvent::Pass, 8);

        // Book two passes for the window starting at 1500.
        future.current_window(1500).bucket().add(MetricEvent::Pass, 2);

        // When 1500's window becomes current, the recycled bucket starts
        // from the booked count instead of zero.
        let seeded = past.current_window_seeded(1600, Some(&future));
        assert_eq!(seeded.window_start(), 1500);
        assert_eq!(seeded.bucket().pass(), 2);
    }

    #[test]
    fn test_seeded_create_inherits_booked_passes() {
        let past = LeapArray::new(shape(2, 1000), CEILING);
        let future = LeapArray::with_horizon(shape(2, 1000), Horizon::Future, CEILING);

        future.current_window(500).bucket().add(MetricEvent::Pass, 6);

        // First touch of the slot goes through the create path.
        let seeded = past.current_window_seeded(600, Some(&future));
        assert_eq!(seeded.bucket().pass(), 6);
    }

    #[test]
    fn test_concurrent_writers_lose_no_counts() {
        let array = Arc::new(LeapArray::new(shape(4, 2000), CEILING));
        let threads = 8;
        let per_thread = 5_000u64;

        // All threads write into the same fixed window.
        let mut handles = vec![];
        for _ in 0..threads {
            let array = Arc::clone(&array);
            handles.push(thread::spawn(move || {
                for _ in 0..per_thread {
                    array.current_window(1234).bucket().add(MetricEvent::Pass, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(array.current_window(1234).bucket().pass(), threads * per_thread);
    }

    #[test]
    fn test_concurrent_rotation_keeps_one_bucket_per_window() {
        let array = Arc::new(LeapArray::new(shape(2, 10), CEILING));
        let threads = 4;

        // Hammer across real window boundaries; every write must land in a
        // bucket whose start is properly aligned.
        let mut handles = vec![];
        for _ in 0..threads {
            let array = Arc::clone(&array);
            handles.push(thread::spawn(move || {
                let base = std::time::Instant::now();
                while base.elapsed() < std::time::Duration::from_millis(50) {
                    let now = base.elapsed().as_millis() as u64 + 1_000;
                    let w = array.current_window(now);
                    // A faster thread may republish the start before we read
                    // it back, but it only ever moves forward, window-aligned.
                    assert_eq!(w.window_start() % 5, 0);
                    assert!(w.window_start() >= now - now % 5);
                    w.bucket().add(MetricEvent::Pass, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
