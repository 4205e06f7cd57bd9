//! Retry policy for failed stage attempts.
//!
//! Transient failures are retried with the same inputs after a backoff
//! delay; validation failures on seeded stages are retried with an adjusted
//! seed; everything else waits for an operator.

use crate::core::{RetryClass, StageId, StimulusUnit};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts allowed per stage before it is skipped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between transient retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Per-stage `max_retries` overrides keyed by stage name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_stage: BTreeMap<String, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
            per_stage: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget for every stage.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Overrides the retry budget for one stage.
    #[must_use]
    pub fn with_stage_retries(mut self, stage: StageId, retries: u32) -> Self {
        self.per_stage.insert(stage.as_str().to_string(), retries);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Retry budget for `stage`.
    #[must_use]
    pub fn max_retries_for(&self, stage: StageId) -> u32 {
        self.per_stage
            .get(stage.as_str())
            .copied()
            .unwrap_or(self.max_retries)
    }
}

/// Per-unit backoff state; remembers previous delays for decorrelated jitter.
#[derive(Debug, Default)]
pub struct RetryState {
    previous_delays: HashMap<StageId, u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn calculate_delay(&mut self, stage: StageId, attempt: u32, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;

        let delay = match config.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delays.get(&stage).copied().unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delays.insert(stage, next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry with the same inputs after the delay.
    Backoff(Duration),
    /// Retry now with an adjusted seed.
    Adjusted,
    /// Budget exhausted; skip the stage and everything downstream.
    GiveUp,
    /// The failure needs an operator; skip without retrying.
    NotRetryable,
}

/// Decides how to continue after `stage` of `unit` was marked `Failed`.
///
/// `retry_count` has already been incremented by the failed transition.
/// Returns `None` if the stage is not currently failed.
pub fn decide(
    unit: &StimulusUnit,
    stage: StageId,
    config: &RetryConfig,
    state: &mut RetryState,
) -> Option<RetryDecision> {
    let record = unit.record(stage);
    let reason = record.status.failure()?;
    let decision = match reason.retry_class() {
        RetryClass::Never => RetryDecision::NotRetryable,
        _ if record.retry_count >= config.max_retries_for(stage) => RetryDecision::GiveUp,
        RetryClass::Backoff => RetryDecision::Backoff(state.calculate_delay(
            stage,
            record.retry_count.saturating_sub(1),
            config,
        )),
        RetryClass::Adjusted => RetryDecision::Adjusted,
    };
    Some(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        ArtifactRef, FailureKind, FailureReason, MaskSource, SourcePair, StageStatus,
    };

    fn failed_unit(stage: StageId, kind: FailureKind, code: &str, failures: u32) -> StimulusUnit {
        let mut unit = StimulusUnit::new(
            "U1",
            SourcePair {
                pain: ArtifactRef::external("p.jpg"),
                control: ArtifactRef::external("c.jpg"),
            },
            MaskSource::Segment {
                prompt: "hand".to_string(),
            },
            1,
        );
        for pred in StageId::ALL.into_iter().take_while(|s| *s != stage) {
            unit.transition(pred, StageStatus::Running).unwrap();
            unit.transition(pred, StageStatus::Done).unwrap();
        }
        for n in 0..failures {
            if n > 0 {
                unit.transition(stage, StageStatus::Pending).unwrap();
            }
            unit.transition(stage, StageStatus::Running).unwrap();
            unit.transition(
                stage,
                StageStatus::Failed(FailureReason::new(kind, code, "x")),
            )
            .unwrap();
        }
        unit
    }

    fn quiet() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 2000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_stage_override() {
        let config = RetryConfig::new()
            .with_max_retries(2)
            .with_stage_retries(StageId::VideoPain, 5);
        assert_eq!(config.max_retries_for(StageId::VideoPain), 5);
        assert_eq!(config.max_retries_for(StageId::Describe), 2);
    }

    #[test]
    fn test_calculate_delay_exponential_no_jitter() {
        let config = quiet();
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(StageId::Describe, 0, &config), Duration::from_millis(100));
        assert_eq!(state.calculate_delay(StageId::Describe, 1, &config), Duration::from_millis(200));
        assert_eq!(state.calculate_delay(StageId::Describe, 2, &config), Duration::from_millis(400));
    }

    #[test]
    fn test_calculate_delay_linear_no_jitter() {
        let config = quiet().with_backoff(BackoffStrategy::Linear);
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(StageId::Describe, 2, &config), Duration::from_millis(300));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = quiet().with_base_delay_ms(1000).with_max_delay_ms(5000);
        let mut state = RetryState::new();

        let delay = state.calculate_delay(StageId::Describe, 10, &config);
        assert_eq!(delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_calculate_delay_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();

        for _ in 0..10 {
            assert!(state.calculate_delay(StageId::Describe, 0, &config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_decorrelated_jitter_within_bounds() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_jitter(JitterStrategy::Decorrelated);
        let mut state = RetryState::new();

        for attempt in 0..5 {
            let delay = state.calculate_delay(StageId::VideoPain, attempt, &config);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_transient_backs_off_until_budget() {
        let config = quiet().with_max_retries(2);
        let mut state = RetryState::new();

        let unit = failed_unit(StageId::Describe, FailureKind::Transient, "timeout", 1);
        assert_eq!(
            decide(&unit, StageId::Describe, &config, &mut state),
            Some(RetryDecision::Backoff(Duration::from_millis(100)))
        );

        let unit = failed_unit(StageId::Describe, FailureKind::Transient, "timeout", 2);
        assert_eq!(
            decide(&unit, StageId::Describe, &config, &mut state),
            Some(RetryDecision::GiveUp)
        );
    }

    #[test]
    fn test_validation_retries_adjusted() {
        let config = quiet();
        let mut state = RetryState::new();
        let unit = failed_unit(StageId::StartVariant, FailureKind::Consistency, "pixel_lock", 1);

        let decision = decide(&unit, StageId::StartVariant, &config, &mut state).unwrap();
        assert_eq!(decision, RetryDecision::Adjusted);
    }

    #[test]
    fn test_derivation_not_retryable() {
        let config = quiet();
        let mut state = RetryState::new();
        let unit = failed_unit(StageId::Describe, FailureKind::Derivation, "empty_output", 1);

        assert_eq!(
            decide(&unit, StageId::Describe, &config, &mut state),
            Some(RetryDecision::NotRetryable)
        );
    }

    #[test]
    fn test_decide_ignores_non_failed() {
        let config = quiet();
        let mut state = RetryState::new();
        let unit = failed_unit(StageId::Describe, FailureKind::Transient, "timeout", 0);

        assert_eq!(decide(&unit, StageId::Describe, &config, &mut state), None);
    }

    #[test]
    fn test_strategies_parse_lowercase() {
        let config: RetryConfig =
            toml::from_str("backoff = \"linear\"\njitter = \"none\"\n[per_stage]\nvideo-pain = 4\n")
                .unwrap();
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(config.jitter, JitterStrategy::None);
        assert_eq!(config.max_retries_for(StageId::VideoPain), 4);
        assert_eq!(config.max_retries, 3);
    }
}
