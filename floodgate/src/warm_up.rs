use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::Checked;
use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::error::ConfigError;
use crate::node::Node;

/// Token-bucket controller that throttles a cold system and ramps the
/// admissible rate up to `count` over the warm-up period.
///
/// The bucket level measures idleness, not credit: tokens accumulate while
/// recent traffic is light and drain as the previous second's passes are
/// subtracted. While the level sits above `warning_token` the threshold is
/// interpolated along a slope from `count / cold_factor` toward `count`;
/// below it the full stable rate applies.
#[derive(Debug)]
pub struct WarmUpController {
    count: f64,
    cold_factor: u32,
    warning_token: u64,
    max_token: u64,
    slope: f64,
    stored_tokens: AtomicI64,
    /// Second-aligned time of the last refill.
    last_filled_ms: AtomicI64,
    clock: MilliClock,
}

impl WarmUpController {
    pub fn new(
        count: f64,
        warm_up_period_sec: u64,
        cold_factor: u32,
        clock: MilliClock,
    ) -> Result<Self, ConfigError> {
        if cold_factor <= 1 {
            return Err(ConfigError::ColdFactorTooSmall(cold_factor));
        }
        if warm_up_period_sec == 0 {
            return Err(ConfigError::ZeroWarmUpPeriod);
        }

        let warning_token =
            (warm_up_period_sec as f64 * count) as u64 / (cold_factor as u64 - 1);
        let max_token = warning_token
            + (2.0 * warm_up_period_sec as f64 * count / (1.0 + cold_factor as f64)) as u64;
        let slope =
            (cold_factor as f64 - 1.0) / count / (max_token - warning_token) as f64;

        // Anchor the refill schedule at construction so a fresh controller
        // starts with an empty bucket and the full stable rate.
        let now = clock.now_millis();
        let anchored = (now - now % 1000) as i64;

        Ok(Self {
            count,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_ms: AtomicI64::new(anchored),
            clock,
        })
    }

    #[inline]
    pub(crate) fn count(&self) -> f64 {
        self.count
    }

    #[inline]
    pub(crate) fn warning_token(&self) -> u64 {
        self.warning_token
    }

    #[inline]
    pub(crate) fn slope(&self) -> f64 {
        self.slope
    }

    #[inline]
    pub(crate) fn stored_tokens(&self) -> i64 {
        self.stored_tokens.load(Ordering::Acquire)
    }

    /// Refills and drains the bucket, at most once per wall second.
    ///
    /// `previous_pass_qps` is what the prior second actually admitted; it
    /// drains the bucket because traffic keeps the system warm.
    pub(crate) fn sync_token(&self, previous_pass_qps: i64) {
        let now = self.clock.now_millis();
        let now = (now - now % 1000) as i64;

        let last = self.last_filled_ms.load(Ordering::Acquire);
        if now <= last {
            return;
        }

        let old = self.stored_tokens.load(Ordering::Acquire);
        let refilled = self.cool_down_tokens(now, previous_pass_qps);
        if self
            .stored_tokens
            .compare_exchange(old, refilled, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let current = self.stored_tokens.fetch_sub(previous_pass_qps, Ordering::AcqRel)
                - previous_pass_qps;
            if current < 0 {
                self.stored_tokens.store(0, Ordering::Release);
            }
            self.last_filled_ms.store(now, Ordering::Release);
        }
    }

    fn cool_down_tokens(&self, now_ms: i64, previous_pass_qps: i64) -> i64 {
        let old = self.stored_tokens.load(Ordering::Acquire);
        let last = self.last_filled_ms.load(Ordering::Acquire);
        let refilled = old + ((now_ms - last) as f64 * self.count / 1000.0) as i64;

        let updated = if old < self.warning_token as i64 {
            refilled
        } else if old > self.warning_token as i64
            && previous_pass_qps < (self.count as i64) / self.cold_factor as i64
        {
            // Above the warning line the bucket only refills while traffic
            // stays below the cold rate; otherwise the ramp holds.
            refilled
        } else {
            old
        };
        updated.min(self.max_token as i64)
    }
}

impl TrafficShaper for WarmUpController {
    fn check(&self, node: &dyn Node, acquire: u32, _prioritized: bool) -> Checked {
        let pass_qps = node.pass_qps() as i64;
        let previous_qps = node.previous_pass_qps() as i64;
        self.sync_token(previous_qps);

        let rest_token = self.stored_tokens.load(Ordering::Acquire);
        if rest_token >= self.warning_token as i64 {
            let above = (rest_token - self.warning_token as i64) as f64;
            // nextUp keeps a request exactly on the curve admissible.
            let warning_qps = (1.0 / (above * self.slope + 1.0 / self.count)).next_up();
            if (pass_qps + acquire as i64) as f64 <= warning_qps {
                return Checked::Pass;
            }
        } else if (pass_qps + acquire as i64) as f64 <= self.count {
            return Checked::Pass;
        }

        Checked::Block {
            retry_after_ms: None,
        }
    }
}
