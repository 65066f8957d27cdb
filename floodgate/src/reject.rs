use crate::Checked;
use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::node::Node;
use crate::rule::Grade;

/// Fixed-threshold controller: admit while usage stays at or under the
/// threshold, refuse the rest.
///
/// For rate rules, a prioritized caller that would be refused may instead
/// borrow capacity from an upcoming window; the verdict then tells the
/// engine how long to hold the call until that window opens.
#[derive(Debug)]
pub struct RejectController {
    count: f64,
    grade: Grade,
    occupy_timeout_ms: u64,
    clock: MilliClock,
}

impl RejectController {
    pub fn new(count: f64, grade: Grade, occupy_timeout_ms: u64, clock: MilliClock) -> Self {
        Self {
            count,
            grade,
            occupy_timeout_ms,
            clock,
        }
    }
}

impl TrafficShaper for RejectController {
    fn check(&self, node: &dyn Node, acquire: u32, prioritized: bool) -> Checked {
        let used = match self.grade {
            Grade::Concurrency => node.cur_concurrency() as u64,
            // Whole calls only; fractional headroom does not admit.
            Grade::Qps => node.pass_qps() as u64,
        };

        if (used + acquire as u64) as f64 <= self.count {
            return Checked::Pass;
        }

        if prioritized && self.grade == Grade::Qps {
            let now = self.clock.now_millis();
            let wait_ms = node.try_occupy_next(now, acquire, self.count);
            if wait_ms < self.occupy_timeout_ms {
                node.add_waiting_request(now + wait_ms, acquire as u64);
                node.add_occupied_pass(acquire as u64);
                return Checked::Occupy { wait_ms };
            }
        }

        Checked::Block {
            retry_after_ms: None,
        }
    }
}
