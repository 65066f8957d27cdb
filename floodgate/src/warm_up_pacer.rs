use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::Checked;
use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::error::ConfigError;
use crate::node::Node;
use crate::warm_up::WarmUpController;

/// Pacing controller whose spacing interval follows the warm-up ramp.
///
/// The ramp decides the momentarily admissible rate exactly as
/// [`WarmUpController`] does; instead of gating a window count, that rate
/// sets the per-call cost of a virtual queue identical to the plain
/// pacer's. A cold system spaces calls far apart and tightens toward
/// `1000 / count` milliseconds as it warms.
#[derive(Debug)]
pub struct WarmUpPacerController {
    ramp: WarmUpController,
    max_queue_ms: u64,
    latest_passed_ms: AtomicI64,
    clock: MilliClock,
}

impl WarmUpPacerController {
    pub fn new(
        count: f64,
        warm_up_period_sec: u64,
        cold_factor: u32,
        max_queue_ms: u64,
        clock: MilliClock,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            ramp: WarmUpController::new(count, warm_up_period_sec, cold_factor, clock.clone())?,
            max_queue_ms,
            latest_passed_ms: AtomicI64::new(-1),
            clock,
        })
    }

    /// Current per-call cost in milliseconds, after syncing the ramp.
    fn cost_ms(&self, node: &dyn Node, acquire: u32) -> i64 {
        let previous_qps = node.previous_pass_qps() as i64;
        self.ramp.sync_token(previous_qps);

        let rest_token = self.ramp.stored_tokens();
        let rate = if rest_token >= self.ramp.warning_token() as i64 {
            let above = (rest_token - self.ramp.warning_token() as i64) as f64;
            (1.0 / (above * self.ramp.slope() + 1.0 / self.ramp.count())).next_up()
        } else {
            self.ramp.count()
        };
        (1000.0 * acquire as f64 / rate).round() as i64
    }

    fn verdict(&self, cost: i64, reserve: bool) -> Checked {
        let now = self.clock.now_millis() as i64;
        let expected = self.latest_passed_ms.load(Ordering::Acquire) + cost;

        if expected <= now {
            self.latest_passed_ms.store(now, Ordering::Release);
            return Checked::Pass;
        }

        if !reserve {
            return Checked::Block {
                retry_after_ms: Some((expected - now).max(0) as u64),
            };
        }

        let wait = self.latest_passed_ms.load(Ordering::Acquire) + cost
            - self.clock.now_millis() as i64;
        if wait > self.max_queue_ms as i64 {
            return Checked::Block {
                retry_after_ms: Some((wait - self.max_queue_ms as i64).max(0) as u64),
            };
        }

        let scheduled = self.latest_passed_ms.fetch_add(cost, Ordering::AcqRel) + cost;
        let wait = scheduled - self.clock.now_millis() as i64;
        if wait > self.max_queue_ms as i64 {
            self.latest_passed_ms.fetch_sub(cost, Ordering::AcqRel);
            return Checked::Block {
                retry_after_ms: Some((wait - self.max_queue_ms as i64).max(0) as u64),
            };
        }

        if wait > 0 {
            Checked::Queue {
                wait_ms: wait as u64,
            }
        } else {
            Checked::Pass
        }
    }
}

impl TrafficShaper for WarmUpPacerController {
    fn check(&self, node: &dyn Node, acquire: u32, _prioritized: bool) -> Checked {
        if acquire == 0 {
            return Checked::Pass;
        }
        let cost = self.cost_ms(node, acquire);
        self.verdict(cost, true)
    }

    fn check_nowait(&self, node: &dyn Node, acquire: u32) -> Checked {
        if acquire == 0 {
            return Checked::Pass;
        }
        let cost = self.cost_ms(node, acquire);
        self.verdict(cost, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::StatConfig;
    use crate::node::StatNode;
    use std::time::Duration;

    fn setup() -> (
        WarmUpPacerController,
        StatNode,
        std::sync::Arc<quanta::Mock>,
    ) {
        let (clock, mock) = MilliClock::mock();
        mock.increment(Duration::from_secs(10));
        let node = StatNode::new(&StatConfig::default(), clock.clone());
        let controller = WarmUpPacerController::new(10.0, 10, 3, 2_000, clock)
            .expect("valid warm-up parameters");
        (controller, node, mock)
    }

    #[test]
    fn test_warm_system_paces_at_the_stable_interval() {
        let (controller, node, _mock) = setup();

        // Empty bucket: rate 10/sec, so slots are 100ms apart.
        assert_eq!(controller.check(&node, 1, false), Checked::Pass);
        assert_eq!(
            controller.check(&node, 1, false),
            Checked::Queue { wait_ms: 100 }
        );
    }

    #[test]
    fn test_cold_system_paces_at_the_cold_interval() {
        let (controller, node, mock) = setup();

        // Fill the bucket: twenty idle seconds reach max_token, fully cold.
        mock.increment(Duration::from_secs(20));

        // Rate is count / cold_factor = 10/3, so a slot every ~300ms.
        assert_eq!(controller.check(&node, 1, false), Checked::Pass);
        assert_eq!(
            controller.check(&node, 1, false),
            Checked::Queue { wait_ms: 300 }
        );
    }

    #[test]
    fn test_queue_bound_still_applies_while_cold() {
        let (controller, node, mock) = setup();
        mock.increment(Duration::from_secs(20));

        assert_eq!(controller.check(&node, 1, false), Checked::Pass);
        // At 300ms per slot, only six more fit under the 2s bound.
        for i in 1..=6 {
            assert_eq!(
                controller.check(&node, 1, false),
                Checked::Queue {
                    wait_ms: 300 * i as u64
                }
            );
        }
        assert!(matches!(
            controller.check(&node, 1, false),
            Checked::Block { .. }
        ));
    }

    #[test]
    fn test_nowait_probe_reports_the_due_time_without_reserving() {
        let (controller, node, _mock) = setup();

        assert_eq!(controller.check_nowait(&node, 1), Checked::Pass);
        assert_eq!(
            controller.check_nowait(&node, 1),
            Checked::Block {
                retry_after_ms: Some(100)
            }
        );
        // Nothing was reserved by the probe.
        assert_eq!(
            controller.check(&node, 1, false),
            Checked::Queue { wait_ms: 100 }
        );
    }
}
