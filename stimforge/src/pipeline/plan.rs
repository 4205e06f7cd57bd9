//! Estimates of the external calls a batch still needs.

use crate::config::ModelsConfig;
use crate::core::{MaskSource, StageId, StimulusUnit};
use serde::Serialize;

/// Remaining calls of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePlan {
    /// The stage.
    pub stage: StageId,
    /// External calls a successful attempt makes.
    pub calls: u32,
    /// Estimated cost in USD.
    pub cost_usd: f64,
}

/// Remaining calls of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitPlan {
    /// Unit id.
    pub unit: String,
    /// Stages that still have to run.
    pub stages: Vec<StagePlan>,
    /// Sum of stage calls.
    pub calls: u32,
    /// Sum of stage costs.
    pub cost_usd: f64,
}

/// Remaining calls of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchPlan {
    /// Per-unit plans, in input order.
    pub units: Vec<UnitPlan>,
    /// Total calls.
    pub calls: u32,
    /// Total estimated cost in USD.
    pub cost_usd: f64,
}

fn stage_plan(unit: &StimulusUnit, stage: StageId, models: &ModelsConfig) -> StagePlan {
    let priced: Vec<(u32, f64)> = match stage {
        // One image description, two text derivations.
        StageId::Describe => vec![(3, models.vlm.cost_usd)],
        StageId::MasterAnchor => {
            let mut calls = Vec::new();
            if unit.master_anchor.is_none() {
                calls.push((1, models.master.cost_usd));
            }
            if matches!(unit.mask_source, MaskSource::Segment { .. }) {
                calls.push((1, models.segment.cost_usd));
            }
            calls
        }
        StageId::StartVariant | StageId::ControlVariant => vec![(1, models.inpaint.cost_usd)],
        StageId::VideoPain | StageId::VideoControl => vec![(1, models.video.cost_usd)],
    };
    StagePlan {
        stage,
        calls: priced.iter().map(|(n, _)| n).sum(),
        cost_usd: priced.iter().map(|(n, cost)| f64::from(*n) * cost).sum(),
    }
}

/// Plans the calls `unit` still needs. Done and skipped stages need none.
#[must_use]
pub fn plan_unit(unit: &StimulusUnit, models: &ModelsConfig) -> UnitPlan {
    let stages: Vec<StagePlan> = StageId::ALL
        .into_iter()
        .filter(|stage| !unit.status(*stage).is_terminal())
        .map(|stage| stage_plan(unit, stage, models))
        .collect();
    UnitPlan {
        unit: unit.id.clone(),
        calls: stages.iter().map(|s| s.calls).sum(),
        cost_usd: stages.iter().map(|s| s.cost_usd).sum(),
        stages,
    }
}

/// Plans a batch.
#[must_use]
pub fn plan_batch<'a>(units: impl IntoIterator<Item = &'a StimulusUnit>, models: &ModelsConfig) -> BatchPlan {
    let units: Vec<UnitPlan> = units.into_iter().map(|u| plan_unit(u, models)).collect();
    BatchPlan {
        calls: units.iter().map(|u| u.calls).sum(),
        cost_usd: units.iter().map(|u| u.cost_usd).sum(),
        units,
    }
}

impl UnitPlan {
    /// Returns true when nothing is left to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl BatchPlan {
    /// Stages left across the batch.
    #[must_use]
    pub fn pending_stage_count(&self) -> usize {
        self.units.iter().map(|u| u.stages.len()).sum()
    }
}
