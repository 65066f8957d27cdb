//! # floodgate
//!
//! `floodgate` provides resource-level admission control backed by
//! sliding-window statistics.
//!
//! ## Core Philosophy
//!
//! Admission decisions are only as good as the numbers behind them, so the
//! statistics engine comes first: lock-free sliding windows whose buckets
//! are recycled in place, with nothing heavier than a short `try_lock` off
//! the hot path. Controllers read those live rates and gauges and answer
//! in constant time; they report how long a call should be held but never
//! sleep themselves.
//!
//! ## Key Concepts
//!
//! * **Resource**: a named operation worth protecting. Statistics and
//!   rules are keyed by the name alone.
//! * **Sliding windows**: a [`RollingCounter`] sums [`MetricBucket`]
//!   counters across time-aligned windows; the raw layer is public for
//!   exporters that want per-window detail.
//! * **Node tree**: one [`ClusterNode`] per resource unions the
//!   per-entry-point [`EntryNode`]s beneath it, with optional per-caller
//!   origin statistics on the side.
//! * **Flow rules**: a [`FlowRule`] binds a threshold to a behavior, from
//!   plain rejection through pacing to a warm-up ramp.
//! * **Call guards**: an admitted call returns a [`CallGuard`]; exiting it
//!   feeds completion and latency back into the statistics the next
//!   decision reads.
//!
//! ## Example
//!
//! ```rust
//! use floodgate::{Context, Floodgate, FlowRule, Grade, StatConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let gate = Floodgate::new(StatConfig::default());
//! gate.load_rules(vec![FlowRule::new("db.select", Grade::Qps, 200.0)])?;
//!
//! let mut ctx = Context::new("web");
//! match gate.enter(&mut ctx, "db.select") {
//!     Ok(guard) => {
//!         // ... call the protected resource ...
//!         guard.exit(&mut ctx)?;
//!     }
//!     Err(_blocked) => {
//!         // shed load, serve a fallback, or retry later
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;

use serde::Deserialize;
use serde::Serialize;

mod bucket;
mod clock;
mod cluster;
mod entry;
mod entry_node;
mod error;
mod gate;
mod leap_array;
mod node;
mod pacer;
mod reject;
mod rolling_counter;
mod rule;
mod warm_up;
mod warm_up_pacer;

pub use bucket::MetricBucket;
pub use bucket::MetricEvent;
pub use clock::MilliClock;
pub use cluster::ClusterNode;
pub use entry::CallGuard;
pub use entry::Context;
pub use entry_node::EntryNode;
pub use error::BlockError;
pub use error::ConfigError;
pub use error::EntryMismatch;
pub use gate::Floodgate;
pub use leap_array::BucketRef;
pub use leap_array::WindowShape;
pub use leap_array::WindowWrap;
pub use node::DEFAULT_MAX_RT_MS;
pub use node::DEFAULT_OCCUPY_TIMEOUT_MS;
pub use node::Node;
pub use node::StatConfig;
pub use node::StatNode;
pub use pacer::PacerController;
pub use reject::RejectController;
pub use rolling_counter::RollingCounter;
pub use rule::Behavior;
pub use rule::DEFAULT_COLD_FACTOR;
pub use rule::DEFAULT_MAX_QUEUE_MS;
pub use rule::FlowRule;
pub use rule::Grade;
pub use warm_up::WarmUpController;
pub use warm_up_pacer::WarmUpPacerController;

/// Rough classification of what a resource is, carried alongside its name
/// for dashboards and rule tooling. It never changes admission behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Common,
    Web,
    Rpc,
    Gateway,
    Sql,
}

/// A named thing worth protecting: an endpoint, a query, a downstream
/// call. Statistics and rules are both keyed by the name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    kind: ResourceKind,
}

impl Resource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

/// Verdict of a traffic controller for one admission attempt.
///
/// Waiting is the caller's job: a controller only ever reports how long a
/// call should be held, it never sleeps itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checked {
    /// Admit immediately.
    Pass,
    /// Admit after waiting; the controller has reserved the slot.
    Queue { wait_ms: u64 },
    /// Admit after waiting on capacity borrowed from an upcoming window;
    /// the controller has already booked the call's passes there.
    Occupy { wait_ms: u64 },
    /// Refuse, optionally hinting when a retry could succeed.
    Block { retry_after_ms: Option<u64> },
}

/// The core trait for all admission policies.
///
/// Controllers must be `Send` and `Sync` so a compiled rule table can be
/// shared across threads via `Arc`.
pub trait TrafficShaper: Debug + Send + Sync {
    /// Decides the fate of `acquire` permits against `node`'s statistics.
    ///
    /// `prioritized` lets the controller offer capacity from an upcoming
    /// window instead of refusing, where it supports that.
    fn check(&self, node: &dyn Node, acquire: u32, prioritized: bool) -> Checked;

    /// Non-waiting probe: resolves to [`Checked::Pass`] or
    /// [`Checked::Block`] without reserving anything. Controllers whose
    /// `check` queues calls override this.
    fn check_nowait(&self, node: &dyn Node, acquire: u32) -> Checked {
        self.check(node, acquire, false)
    }
}
