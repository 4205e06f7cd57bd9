//! Lifecycle events for observability.
//!
//! The orchestrator reports every stage transition and unit outcome to an
//! [`EventSink`]. The sink is passed in explicitly; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{FailureReason, StageId};
use serde::Serialize;

/// Something that happened to a unit or one of its stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// A stage attempt was admitted.
    #[serde(rename = "stage.started")]
    StageStarted {
        /// Unit id.
        unit: String,
        /// Stage.
        stage: StageId,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// A stage reached `Done`.
    #[serde(rename = "stage.completed")]
    StageCompleted {
        /// Unit id.
        unit: String,
        /// Stage.
        stage: StageId,
        /// Wall time of the attempt.
        duration_ms: u64,
    },
    /// A stage attempt failed.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// Unit id.
        unit: String,
        /// Stage.
        stage: StageId,
        /// Why.
        reason: FailureReason,
        /// Failures so far.
        retry_count: u32,
    },
    /// A failed stage will be attempted again.
    #[serde(rename = "stage.retry_scheduled")]
    StageRetryScheduled {
        /// Unit id.
        unit: String,
        /// Stage.
        stage: StageId,
        /// Backoff before the retry.
        delay_ms: u64,
        /// The retry uses an adjusted seed.
        adjusted: bool,
    },
    /// A stage was excluded.
    #[serde(rename = "stage.skipped")]
    StageSkipped {
        /// Unit id.
        unit: String,
        /// Stage.
        stage: StageId,
    },
    /// Every stage of a unit is done.
    #[serde(rename = "unit.completed")]
    UnitCompleted {
        /// Unit id.
        unit: String,
    },
    /// A unit was excluded from the delivered set.
    #[serde(rename = "unit.skipped")]
    UnitSkipped {
        /// Unit id.
        unit: String,
        /// First stage that exhausted its budget.
        stage: StageId,
        /// Its last failure.
        reason: Option<FailureReason>,
    },
    /// A unit stopped before completing because it was cancelled.
    #[serde(rename = "unit.cancelled")]
    UnitCancelled {
        /// Unit id.
        unit: String,
        /// Cancellation reason.
        reason: Option<String>,
    },
}

impl PipelineEvent {
    /// Dotted event name, e.g. `stage.failed`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageRetryScheduled { .. } => "stage.retry_scheduled",
            Self::StageSkipped { .. } => "stage.skipped",
            Self::UnitCompleted { .. } => "unit.completed",
            Self::UnitSkipped { .. } => "unit.skipped",
            Self::UnitCancelled { .. } => "unit.cancelled",
        }
    }

    /// The unit the event concerns.
    #[must_use]
    pub fn unit(&self) -> &str {
        match self {
            Self::StageStarted { unit, .. }
            | Self::StageCompleted { unit, .. }
            | Self::StageFailed { unit, .. }
            | Self::StageRetryScheduled { unit, .. }
            | Self::StageSkipped { unit, .. }
            | Self::UnitCompleted { unit }
            | Self::UnitSkipped { unit, .. }
            | Self::UnitCancelled { unit, .. } => unit,
        }
    }

    /// The stage the event concerns, if any.
    #[must_use]
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageRetryScheduled { stage, .. }
            | Self::StageSkipped { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
