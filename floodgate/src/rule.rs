use serde::Deserialize;
use serde::Serialize;

use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::error::ConfigError;
use crate::node::StatConfig;
use crate::pacer::PacerController;
use crate::reject::RejectController;
use crate::warm_up::WarmUpController;
use crate::warm_up_pacer::WarmUpPacerController;

/// Default ratio between a cold system's threshold and its stable one.
pub const DEFAULT_COLD_FACTOR: u32 = 3;

/// Default bound on how long a paced call may be held back.
pub const DEFAULT_MAX_QUEUE_MS: u64 = 500;

/// What a rule's `count` measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    /// Bound on calls in flight.
    Concurrency,
    /// Bound on admissions per second.
    #[default]
    Qps,
}

/// How a rule reacts when traffic reaches its threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Refuse immediately, with optional borrowing for prioritized calls.
    #[default]
    Reject,
    /// Ramp the admissible rate up from `count / cold_factor` to `count`
    /// over the warm-up period.
    WarmUp {
        warm_up_period_sec: u64,
        #[serde(default = "default_cold_factor")]
        cold_factor: u32,
    },
    /// Space admissions evenly, queueing each call up to `max_queue_ms`.
    Pace {
        #[serde(default = "default_max_queue_ms")]
        max_queue_ms: u64,
    },
    /// Warm-up ramp feeding the pacer's spacing interval.
    WarmUpPace {
        warm_up_period_sec: u64,
        #[serde(default = "default_cold_factor")]
        cold_factor: u32,
        #[serde(default = "default_max_queue_ms")]
        max_queue_ms: u64,
    },
}

fn default_cold_factor() -> u32 {
    DEFAULT_COLD_FACTOR
}

fn default_max_queue_ms() -> u64 {
    DEFAULT_MAX_QUEUE_MS
}

/// One admission-control rule for one resource.
///
/// Rules are plain data: they arrive from configuration, survive
/// serialization, and are compiled into controllers when loaded into an
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    /// Name of the guarded resource.
    pub resource: String,
    #[serde(default)]
    pub grade: Grade,
    /// Threshold, in the unit chosen by `grade`.
    pub count: f64,
    #[serde(default)]
    pub behavior: Behavior,
}

impl FlowRule {
    pub fn new(resource: impl Into<String>, grade: Grade, count: f64) -> Self {
        Self {
            resource: resource.into(),
            grade,
            count,
            behavior: Behavior::Reject,
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource.is_empty() {
            return Err(ConfigError::EmptyResource);
        }
        if self.count < 0.0 {
            return Err(ConfigError::NegativeCount(self.count));
        }
        match self.behavior {
            Behavior::WarmUp {
                warm_up_period_sec,
                cold_factor,
            }
            | Behavior::WarmUpPace {
                warm_up_period_sec,
                cold_factor,
                ..
            } => {
                if cold_factor <= 1 {
                    return Err(ConfigError::ColdFactorTooSmall(cold_factor));
                }
                if warm_up_period_sec == 0 {
                    return Err(ConfigError::ZeroWarmUpPeriod);
                }
            }
            Behavior::Reject | Behavior::Pace { .. } => {}
        }
        Ok(())
    }
}

/// Compiles a validated rule into its traffic controller.
///
/// Concurrency rules always use the rejecting controller; shaping only
/// makes sense for rates, so any other behavior on a concurrency rule is
/// quietly normalized.
pub(crate) fn build_controller(
    rule: &FlowRule,
    config: &StatConfig,
    clock: MilliClock,
) -> Result<Box<dyn TrafficShaper>, ConfigError> {
    rule.validate()?;

    if rule.grade == Grade::Concurrency {
        if rule.behavior != Behavior::Reject {
            tracing::debug!(
                resource = rule.resource.as_str(),
                "concurrency rules ignore shaping behaviors"
            );
        }
        return Ok(Box::new(RejectController::new(
            rule.count,
            Grade::Concurrency,
            config.occupy_timeout_ms,
            clock,
        )));
    }

    Ok(match rule.behavior {
        Behavior::Reject => Box::new(RejectController::new(
            rule.count,
            Grade::Qps,
            config.occupy_timeout_ms,
            clock,
        )),
        Behavior::WarmUp {
            warm_up_period_sec,
            cold_factor,
        } => Box::new(WarmUpController::new(
            rule.count,
            warm_up_period_sec,
            cold_factor,
            clock,
        )?),
        Behavior::Pace { max_queue_ms } => {
            Box::new(PacerController::new(rule.count, max_queue_ms, clock))
        }
        Behavior::WarmUpPace {
            warm_up_period_sec,
            cold_factor,
            max_queue_ms,
        } => Box::new(WarmUpPacerController::new(
            rule.count,
            warm_up_period_sec,
            cold_factor,
            max_queue_ms,
            clock,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_defaults() {
        let rule: FlowRule = serde_json::from_str(r#"{"resource": "svc.query", "count": 10}"#)
            .expect("minimal rule parses");

        assert_eq!(rule.grade, Grade::Qps);
        assert_eq!(rule.behavior, Behavior::Reject);
        assert_eq!(rule.count, 10.0);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_behavior_parses_with_defaults() {
        let rule: FlowRule = serde_json::from_str(
            r#"{
                "resource": "svc.query",
                "count": 100,
                "behavior": {"kind": "warm_up", "warm_up_period_sec": 10}
            }"#,
        )
        .expect("warm-up rule parses");

        assert_eq!(
            rule.behavior,
            Behavior::WarmUp {
                warm_up_period_sec: 10,
                cold_factor: DEFAULT_COLD_FACTOR,
            }
        );
    }

    #[test]
    fn test_rule_round_trips_through_serde() {
        let rule = FlowRule::new("svc.update", Grade::Qps, 25.0).with_behavior(Behavior::Pace {
            max_queue_ms: 2_000,
        });

        let json = serde_json::to_string(&rule).expect("serializes");
        let back: FlowRule = serde_json::from_str(&json).expect("parses back");
        assert_eq!(rule, back);
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let empty = FlowRule::new("", Grade::Qps, 1.0);
        assert_eq!(empty.validate().unwrap_err(), ConfigError::EmptyResource);

        let negative = FlowRule::new("svc", Grade::Qps, -3.0);
        assert_eq!(
            negative.validate().unwrap_err(),
            ConfigError::NegativeCount(-3.0)
        );

        let cold = FlowRule::new("svc", Grade::Qps, 10.0).with_behavior(Behavior::WarmUp {
            warm_up_period_sec: 10,
            cold_factor: 1,
        });
        assert_eq!(
            cold.validate().unwrap_err(),
            ConfigError::ColdFactorTooSmall(1)
        );

        let period = FlowRule::new("svc", Grade::Qps, 10.0).with_behavior(Behavior::WarmUpPace {
            warm_up_period_sec: 0,
            cold_factor: 3,
            max_queue_ms: 500,
        });
        assert_eq!(
            period.validate().unwrap_err(),
            ConfigError::ZeroWarmUpPeriod
        );
    }

    #[test]
    fn test_concurrency_rules_compile_to_the_rejecting_controller() {
        let (clock, _mock) = MilliClock::mock();
        let rule =
            FlowRule::new("svc", Grade::Concurrency, 8.0).with_behavior(Behavior::Pace {
                max_queue_ms: 500,
            });

        let controller =
            build_controller(&rule, &StatConfig::default(), clock).expect("compiles");
        assert!(format!("{controller:?}").contains("RejectController"));
    }
}
