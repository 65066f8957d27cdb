use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The outcome kinds counted per time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    /// Admitted calls.
    Pass,
    /// Calls rejected by a flow rule.
    Block,
    /// Completed calls that reported a business error.
    Exception,
    /// Completed calls.
    Success,
    /// Accumulated response time in milliseconds.
    Rt,
    /// Passes granted early out of a future window.
    OccupiedPass,
}

impl MetricEvent {
    pub(crate) const COUNT: usize = 6;

    pub(crate) const ALL: [MetricEvent; Self::COUNT] = [
        MetricEvent::Pass,
        MetricEvent::Block,
        MetricEvent::Exception,
        MetricEvent::Success,
        MetricEvent::Rt,
        MetricEvent::OccupiedPass,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// The atomic counter set backing one window slice.
///
/// All counters are independent and monotonically accumulating between
/// resets; readers sum them without coordination. The one deliberate
/// exception is [`min_rt`](Self::min_rt), see [`add_rt`](Self::add_rt).
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; MetricEvent::COUNT],
    min_rt: AtomicU64,
    /// Initial (and therefore maximum observable) min-RT value.
    rt_ceiling: u64,
}

impl MetricBucket {
    pub fn new(rt_ceiling: u64) -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            min_rt: AtomicU64::new(rt_ceiling),
            rt_ceiling,
        }
    }

    #[inline]
    pub fn add(&self, event: MetricEvent, n: u64) {
        self.counters[event.index()].fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pass(&self) -> u64 {
        self.get(MetricEvent::Pass)
    }

    #[inline]
    pub fn block(&self) -> u64 {
        self.get(MetricEvent::Block)
    }

    #[inline]
    pub fn exception(&self) -> u64 {
        self.get(MetricEvent::Exception)
    }

    #[inline]
    pub fn success(&self) -> u64 {
        self.get(MetricEvent::Success)
    }

    #[inline]
    pub fn rt(&self) -> u64 {
        self.get(MetricEvent::Rt)
    }

    #[inline]
    pub fn occupied_pass(&self) -> u64 {
        self.get(MetricEvent::OccupiedPass)
    }

    /// Records one completed call's response time.
    ///
    /// The running minimum is kept with a plain load/compare/store rather
    /// than a CAS loop. Two racing writers can leave the larger of their
    /// values in place; the window converges to the true minimum as soon
    /// as writers quiesce, which is good enough for a statistics read.
    pub fn add_rt(&self, rt_ms: u64) {
        self.add(MetricEvent::Rt, rt_ms);
        if rt_ms < self.min_rt.load(Ordering::Relaxed) {
            self.min_rt.store(rt_ms, Ordering::Relaxed);
        }
    }

    /// Smallest response time seen this window, or the ceiling if none.
    #[inline]
    pub fn min_rt(&self) -> u64 {
        self.min_rt.load(Ordering::Relaxed)
    }

    /// Clears every counter and restores min-RT to the ceiling.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_rt.store(self.rt_ceiling, Ordering::Relaxed);
    }

    /// Reinitializes this bucket with `other`'s counters as the starting
    /// values. Used when a recycled window inherits passes that were booked
    /// ahead of time into a future slice.
    pub fn reset_from(&self, other: &MetricBucket) {
        for event in MetricEvent::ALL {
            self.counters[event.index()].store(other.get(event), Ordering::Relaxed);
        }
        self.min_rt.store(self.rt_ceiling, Ordering::Relaxed);
    }
}
