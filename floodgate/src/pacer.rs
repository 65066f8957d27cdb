use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::Checked;
use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::node::Node;

/// Leaky-bucket pacing controller: spreads admissions evenly at the target
/// rate instead of letting each window fill with a burst.
///
/// The whole state is one timestamp, the virtual tail of the queue. Each
/// call costs `1000 / count` milliseconds; a call whose slot lands within
/// `max_queue_ms` reserves it and waits, anything further out is refused.
/// Idle periods are forgotten, never banked as credit.
#[derive(Debug)]
pub struct PacerController {
    count: f64,
    max_queue_ms: u64,
    /// Time the most recently admitted call is scheduled to pass.
    latest_passed_ms: AtomicI64,
    clock: MilliClock,
}

impl PacerController {
    pub fn new(count: f64, max_queue_ms: u64, clock: MilliClock) -> Self {
        Self {
            count,
            max_queue_ms,
            latest_passed_ms: AtomicI64::new(-1),
            clock,
        }
    }

    #[inline]
    fn cost_ms(&self, acquire: u32) -> i64 {
        (1000.0 * acquire as f64 / self.count).round() as i64
    }
}

impl TrafficShaper for PacerController {
    fn check(&self, _node: &dyn Node, acquire: u32, _prioritized: bool) -> Checked {
        if acquire == 0 {
            return Checked::Pass;
        }
        if self.count <= 0.0 {
            return Checked::Block {
                retry_after_ms: None,
            };
        }

        let now = self.clock.now_millis() as i64;
        let cost = self.cost_ms(acquire);
        let expected = self.latest_passed_ms.load(Ordering::Acquire) + cost;

        if expected <= now {
            // Due already. Two racers can both land here; the later store
            // wins and the schedule self-corrects on the next call.
            self.latest_passed_ms.store(now, Ordering::Release);
            return Checked::Pass;
        }

        // Cheap pre-check before committing a reservation.
        let wait = self.latest_passed_ms.load(Ordering::Acquire) + cost
            - self.clock.now_millis() as i64;
        if wait > self.max_queue_ms as i64 {
            return Checked::Block {
                retry_after_ms: Some((wait - self.max_queue_ms as i64).max(0) as u64),
            };
        }

        // Claim the slot, then re-check: the queue may have grown between
        // the pre-check and the claim.
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

    fn check_nowait(&self, _node: &dyn Node, acquire: u32) -> Checked {
        if acquire == 0 {
            return Checked::Pass;
        }
        if self.count <= 0.0 {
            return Checked::Block {
                retry_after_ms: None,
            };
        }

        let now = self.clock.now_millis() as i64;
        let cost = self.cost_ms(acquire);
        let expected = self.latest_passed_ms.load(Ordering::Acquire) + cost;

        if expected <= now {
            self.latest_passed_ms.store(now, Ordering::Release);
            return Checked::Pass;
        }

        // The slot is in the future and this caller cannot wait for it, so
        // nothing is reserved. Tell the caller when the slot would be due.
        Checked::Block {
            retry_after_ms: Some((expected - now).max(0) as u64),
        }
    }
}
