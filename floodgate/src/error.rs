use std::sync::Arc;
use std::time::Duration;

use crate::rule::FlowRule;

/// Rejected configuration. Raised when rules are loaded or when an engine
/// is built, never on the admission path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("sample count must be positive")]
    ZeroSampleCount,
    #[error("window interval must be positive")]
    ZeroInterval,
    #[error("interval {interval_ms}ms does not divide evenly into {sample_count} buckets")]
    UnevenWindow { interval_ms: u64, sample_count: usize },
    #[error("flow rule needs a resource name")]
    EmptyResource,
    #[error("flow threshold must not be negative (got {0})")]
    NegativeCount(f64),
    #[error("warm-up cold factor must be greater than 1 (got {0})")]
    ColdFactorTooSmall(u32),
    #[error("warm-up period must be positive")]
    ZeroWarmUpPeriod,
}

/// An admission request was refused by a flow rule.
///
/// Carries the offending rule and, when the controller can estimate one,
/// a hint for how long to back off before retrying.
#[derive(Debug, Clone, thiserror::Error)]
#[error("resource '{}' blocked by flow rule", rule.resource)]
pub struct BlockError {
    rule: Arc<FlowRule>,
    retry_after: Option<Duration>,
}

impl BlockError {
    pub(crate) fn new(rule: Arc<FlowRule>, retry_after_ms: Option<u64>) -> Self {
        Self {
            rule,
            retry_after: retry_after_ms.map(Duration::from_millis),
        }
    }

    /// The rule that refused the call.
    pub fn rule(&self) -> &FlowRule {
        &self.rule
    }

    /// The guarded resource name.
    pub fn resource(&self) -> &str {
        &self.rule.resource
    }

    /// Back-off hint, when the refusing controller could compute one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// A call handle was exited while it was not the innermost live handle of
/// its context. The handle's statistics are abandoned rather than recorded
/// out of order; its in-flight count is still released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("call handle is not the innermost live handle of its context")]
pub struct EntryMismatch;
