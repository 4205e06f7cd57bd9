//! The stimulus unit record and its per-stage state machine.

use super::{
    DescriptionSet, FailureReason, Keyframe, MaskSource, RetryClass, RoiMask, SourcePair,
    StageId, StageStatus, VideoClip,
};
use crate::errors::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// UTC timestamp used on records.
pub type Timestamp = DateTime<Utc>;

static PENDING_RECORD: StageRecord = StageRecord {
    status: StageStatus::Pending,
    retry_count: 0,
    attempts: 0,
    last_failure: None,
    started_at: None,
    finished_at: None,
};

/// Persisted state of one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current status.
    pub status: StageStatus,
    /// Failed attempts counted against the retry budget.
    #[serde(default)]
    pub retry_count: u32,
    /// Total attempts started, including operator re-runs.
    #[serde(default)]
    pub attempts: u32,
    /// Most recent failure; kept after the stage is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReason>,
    /// When the current or last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the last attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

/// One Pain/Control pair under generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusUnit {
    /// Unique identifier, e.g. `S11`.
    pub id: String,
    /// Source photographs.
    pub source: SourcePair,
    /// Where the ROI mask comes from.
    pub mask_source: MaskSource,
    /// Base seed for generative stages.
    pub seed: u64,
    /// Per-stage state.
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageRecord>,
    /// Output of `describe`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptions: Option<DescriptionSet>,
    /// Output of `master-anchor`; may be kept after a failed mask resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_anchor: Option<Keyframe>,
    /// ROI mask resolved by `master-anchor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_mask: Option<RoiMask>,
    /// Output of `start-variant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_variant: Option<Keyframe>,
    /// Output of `control-variant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_variant: Option<Keyframe>,
    /// Output of `video-pain`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_pain: Option<VideoClip>,
    /// Output of `video-control`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_control: Option<VideoClip>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl StimulusUnit {
    /// Creates a unit with every stage `Pending`.
    #[must_use]
    pub fn new(id: impl Into<String>, source: SourcePair, mask_source: MaskSource, seed: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source,
            mask_source,
            seed,
            stages: StageId::ALL
                .into_iter()
                .map(|stage| (stage, StageRecord::default()))
                .collect(),
            descriptions: None,
            master_anchor: None,
            roi_mask: None,
            start_variant: None,
            control_variant: None,
            video_pain: None,
            video_control: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the record of a stage.
    #[must_use]
    pub fn record(&self, stage: StageId) -> &StageRecord {
        self.stages.get(&stage).unwrap_or(&PENDING_RECORD)
    }

    fn record_mut(&mut self, stage: StageId) -> &mut StageRecord {
        self.stages.entry(stage).or_default()
    }

    /// Returns the status of a stage.
    #[must_use]
    pub fn status(&self, stage: StageId) -> &StageStatus {
        &self.record(stage).status
    }

    /// Returns true if every declared predecessor of `stage` is `Done`.
    #[must_use]
    pub fn predecessors_done(&self, stage: StageId) -> bool {
        stage
            .predecessors()
            .iter()
            .all(|pred| self.status(*pred).is_done())
    }

    /// Seed of the current attempt of `stage`, or of the next one when the
    /// stage is not running.
    ///
    /// Shifted by the number of earlier attempts, which an operator re-run
    /// does not reset, so no attempt ever repeats the inputs of another.
    #[must_use]
    pub fn stage_seed(&self, stage: StageId) -> u64 {
        let offset = stage.seed_offset().unwrap_or(0);
        let record = self.record(stage);
        let earlier = match record.status {
            StageStatus::Running => record.attempts.saturating_sub(1),
            _ => record.attempts,
        };
        self.seed
            .wrapping_add(offset)
            .wrapping_add(u64::from(earlier))
    }

    /// Moves `stage` to `next`, enforcing the state machine and the rule that
    /// a stage may only run or complete once all its predecessors are done.
    pub fn transition(&mut self, stage: StageId, next: StageStatus) -> Result<(), TransitionError> {
        let current = self.status(stage);
        if !current.can_transition_to(&next) {
            return Err(TransitionError::Illegal {
                stage,
                from: current.to_string(),
                to: next.label().to_string(),
            });
        }

        if matches!(next, StageStatus::Running | StageStatus::Done) {
            for pred in stage.predecessors() {
                let status = self.status(*pred);
                if !status.is_done() {
                    return Err(TransitionError::PredecessorNotDone {
                        stage,
                        to: next.label().to_string(),
                        predecessor: *pred,
                        status: status.label().to_string(),
                    });
                }
            }
        }

        let now = Utc::now();
        let record = self.record_mut(stage);
        match &next {
            StageStatus::Running => {
                record.attempts += 1;
                record.started_at = Some(now);
                record.finished_at = None;
            }
            StageStatus::Failed(reason) => {
                record.retry_count += 1;
                record.last_failure = Some(reason.clone());
                record.finished_at = Some(now);
            }
            StageStatus::Done | StageStatus::Skipped => record.finished_at = Some(now),
            StageStatus::Pending => {}
        }
        record.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Returns true if `stage` failed in a way that may still be retried
    /// automatically within `max_retries`.
    #[must_use]
    pub fn is_retry_eligible(&self, stage: StageId, max_retries: u32) -> bool {
        let record = self.record(stage);
        match &record.status {
            StageStatus::Failed(reason) => {
                reason.retry_class() != RetryClass::Never && record.retry_count < max_retries
            }
            _ => false,
        }
    }

    /// Stages that may start now: `Pending` or retryable `Failed`, with all
    /// predecessors `Done`. Returned in topological order.
    pub fn ready_stages(&self, max_retries: impl Fn(StageId) -> u32) -> Vec<StageId> {
        StageId::ALL
            .into_iter()
            .filter(|stage| self.predecessors_done(*stage))
            .filter(|stage| match self.status(*stage) {
                StageStatus::Pending => true,
                StageStatus::Failed(_) => self.is_retry_eligible(*stage, max_retries(*stage)),
                _ => false,
            })
            .collect()
    }

    /// Marks `stage` and everything downstream of it `Skipped`.
    ///
    /// Returns the stages that changed.
    pub fn skip_from(&mut self, stage: StageId) -> Result<Vec<StageId>, TransitionError> {
        let mut skipped = Vec::new();
        for target in std::iter::once(stage).chain(stage.downstream()) {
            if matches!(
                self.status(target),
                StageStatus::Pending | StageStatus::Failed(_)
            ) {
                self.transition(target, StageStatus::Skipped)?;
                skipped.push(target);
            }
        }
        Ok(skipped)
    }

    /// Returns true if every stage is `Done`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        StageId::ALL
            .into_iter()
            .all(|stage| self.status(stage).is_done())
    }

    /// Returns true if any stage is `Skipped`.
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        StageId::ALL
            .into_iter()
            .any(|stage| matches!(self.status(stage), StageStatus::Skipped))
    }

    /// The first stage that exhausted its budget, with its last failure.
    #[must_use]
    pub fn first_failed_stage(&self) -> Option<(StageId, Option<&FailureReason>)> {
        StageId::ALL
            .into_iter()
            .find(|stage| {
                let record = self.record(*stage);
                matches!(record.status, StageStatus::Skipped) && record.last_failure.is_some()
            })
            .map(|stage| (stage, self.record(stage).last_failure.as_ref()))
    }

    /// Resets stages an interrupted process left `Running` back to `Pending`.
    ///
    /// The call that was in flight was never recorded, so it must run again.
    pub fn recover_interrupted(&mut self) -> Result<Vec<StageId>, TransitionError> {
        let running: Vec<_> = StageId::ALL
            .into_iter()
            .filter(|stage| matches!(self.status(*stage), StageStatus::Running))
            .collect();
        for stage in &running {
            self.transition(*stage, StageStatus::Pending)?;
        }
        Ok(running)
    }

    /// Operator re-run: resets `stage` and everything downstream to `Pending`
    /// with a fresh retry budget.
    ///
    /// A `Done` stage is only reset with `force`, which also discards its
    /// output and the outputs of every reset downstream stage. Returns the
    /// stages that were reset.
    pub fn reset_for_rerun(&mut self, stage: StageId, force: bool) -> Result<Vec<StageId>, String> {
        if let Some(pred) = stage
            .predecessors()
            .iter()
            .find(|pred| !self.status(**pred).is_done())
        {
            return Err(format!(
                "predecessor '{pred}' is {}",
                self.status(*pred).label()
            ));
        }

        let targets: Vec<_> = std::iter::once(stage).chain(stage.downstream()).collect();
        for target in &targets {
            match self.status(*target) {
                StageStatus::Running => {
                    return Err(format!("stage '{target}' is running"));
                }
                StageStatus::Done if !force => {
                    return Err(format!("stage '{target}' is done; pass force to regenerate"));
                }
                _ => {}
            }
        }

        let now = Utc::now();
        for target in &targets {
            if self.status(*target).is_done() {
                self.clear_output(*target);
            }
            let record = self.record_mut(*target);
            record.status = StageStatus::Pending;
            record.retry_count = 0;
            record.last_failure = None;
            record.started_at = None;
            record.finished_at = None;
        }
        self.updated_at = now;
        Ok(targets)
    }

    fn clear_output(&mut self, stage: StageId) {
        match stage {
            StageId::Describe => self.descriptions = None,
            StageId::MasterAnchor => {
                self.master_anchor = None;
                self.roi_mask = None;
            }
            StageId::StartVariant => self.start_variant = None,
            StageId::ControlVariant => self.control_variant = None,
            StageId::VideoPain => self.video_pain = None,
            StageId::VideoControl => self.video_control = None,
        }
    }
}
