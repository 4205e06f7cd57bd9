//! Batch outcome reporting.

use crate::core::{FailureReason, StageId, StageStatus, StimulusUnit, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// How a unit ended a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Every stage is done; the unit is delivered.
    Completed,
    /// A stage ran out of retries; the unit is excluded.
    Skipped {
        /// First stage that was given up on.
        stage: StageId,
        /// Its last failure.
        reason: Option<FailureReason>,
    },
    /// The unit was cancelled; its remaining stages are still pending.
    Cancelled {
        /// Cancellation reason.
        reason: Option<String>,
    },
    /// The unit stopped without completing or being excluded.
    Incomplete {
        /// Stages that are not done.
        remaining: Vec<StageId>,
    },
}

impl UnitOutcome {
    /// Classifies a unit after its driver returned.
    #[must_use]
    pub fn of(unit: &StimulusUnit, cancelled: bool, cancel_reason: Option<String>) -> Self {
        if unit.is_complete() {
            return Self::Completed;
        }
        if let Some((stage, reason)) = unit.first_failed_stage() {
            return Self::Skipped {
                stage,
                reason: reason.cloned(),
            };
        }
        if cancelled {
            return Self::Cancelled {
                reason: cancel_reason,
            };
        }
        Self::Incomplete {
            remaining: StageId::ALL
                .into_iter()
                .filter(|stage| !matches!(unit.status(*stage), StageStatus::Done))
                .collect(),
        }
    }

    /// Returns true for delivered units.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the last unit driver returned.
    pub finished_at: Timestamp,
    /// Outcome per unit id.
    pub outcomes: BTreeMap<String, UnitOutcome>,
    /// Ids of the completed units; nothing else is delivered.
    pub delivered: Vec<String>,
    /// Most external calls in flight at once.
    pub peak_in_flight: usize,
    /// External calls admitted during the run.
    pub admitted_calls: usize,
}

impl BatchReport {
    /// Builds a report; `delivered` is derived from `outcomes`.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        started_at: Timestamp,
        finished_at: Timestamp,
        outcomes: BTreeMap<String, UnitOutcome>,
        peak_in_flight: usize,
        admitted_calls: usize,
    ) -> Self {
        let delivered = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_completed())
            .map(|(id, _)| id.clone())
            .collect();
        Self {
            run_id,
            started_at,
            finished_at,
            outcomes,
            delivered,
            peak_in_flight,
            admitted_calls,
        }
    }

    /// Number of units that were not delivered.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.outcomes.len() - self.delivered.len()
    }

    /// The outcome of one unit.
    #[must_use]
    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.outcomes.get(unit)
    }
}
