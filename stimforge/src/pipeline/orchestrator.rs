//! The per-unit stage state machine and the batch driver.
//!
//! Every unit gets its own driver task. A driver repeatedly collects the
//! unit's ready stages, moves them to `Running`, runs them concurrently and
//! records each outcome, saving the record after every change. The only
//! resource drivers share is the admission gate inside [`PipelineContext`].

use super::report::{BatchReport, UnitOutcome};
use super::retry::{decide, RetryDecision, RetryState};
use crate::cancellation::CancellationToken;
use crate::context::{PipelineContext, StageContext};
use crate::core::{
    Anchor, Condition, DescriptionSet, Keyframe, RoiMask, StageId, StageStatus, StimulusUnit,
    VideoClip,
};
use crate::derivation::DescriptionEngine;
use crate::errors::{StageError, StimforgeError};
use crate::events::PipelineEvent;
use crate::keyframes::KeyframeSynthesizer;
use crate::store::StateStore;
use crate::utils::generate_run_id;
use crate::video::VideoDriver;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a successful stage attempt produced.
#[derive(Debug)]
enum StageOutput {
    Descriptions(DescriptionSet),
    Anchor { master: Keyframe, mask: RoiMask },
    StartVariant(Keyframe),
    ControlVariant(Keyframe),
    Clip(VideoClip),
}

/// One finished attempt.
#[derive(Debug)]
struct StageRun {
    stage: StageId,
    elapsed: Duration,
    output: Result<StageOutput, StageError>,
    /// A master generated by an attempt whose mask step then failed.
    master: Option<Keyframe>,
}

/// A unit as its driver left it.
#[derive(Debug)]
struct DriverResult {
    unit: StimulusUnit,
    cancelled: bool,
    cancel_reason: Option<String>,
}

fn missing(stage: StageId, what: &str) -> StimforgeError {
    StimforgeError::Internal(format!(
        "stage '{stage}' is ready but the unit has no {what}"
    ))
}

/// Drives stimulus units through their stage graphs.
pub struct Orchestrator {
    pipeline: Arc<PipelineContext>,
    state: Arc<dyn StateStore>,
    descriptions: DescriptionEngine,
    keyframes: KeyframeSynthesizer,
    video: VideoDriver,
    cancel: Arc<CancellationToken>,
    unit_tokens: DashMap<String, Arc<CancellationToken>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator writing unit records to `state`.
    pub fn new(pipeline: Arc<PipelineContext>, state: Arc<dyn StateStore>) -> Result<Self, StimforgeError> {
        let descriptions = DescriptionEngine::new(&pipeline.config().description)?;
        Ok(Self {
            pipeline,
            state,
            descriptions,
            keyframes: KeyframeSynthesizer::new(),
            video: VideoDriver::new(),
            cancel: Arc::new(CancellationToken::new()),
            unit_tokens: DashMap::new(),
        })
    }

    /// Uses `token` as the batch-wide cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// The batch-wide cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// The shared pipeline context.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<PipelineContext> {
        &self.pipeline
    }

    fn token_for(&self, unit_id: &str) -> Arc<CancellationToken> {
        self.unit_tokens
            .entry(unit_id.to_string())
            .or_insert_with(|| self.cancel.child())
            .clone()
    }

    /// Stops `unit_id` before its next stage attempt. Calls already in
    /// flight complete and are recorded.
    pub fn cancel_unit(&self, unit_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!(unit = unit_id, reason = %reason, "Cancelling unit");
        self.token_for(unit_id).cancel(reason);
    }

    async fn emit(&self, event: PipelineEvent) {
        self.pipeline.sink().emit(&event).await;
    }

    async fn save(&self, unit: &StimulusUnit) -> Result<(), StimforgeError> {
        self.state.save(unit).await?;
        Ok(())
    }

    /// Loads a unit record.
    pub async fn unit(&self, unit_id: &str) -> Result<Option<StimulusUnit>, StimforgeError> {
        Ok(self.state.load(unit_id).await?)
    }

    /// Loads every unit record.
    pub async fn units(&self) -> Result<Vec<StimulusUnit>, StimforgeError> {
        let mut units = Vec::new();
        for id in self.state.list().await? {
            if let Some(unit) = self.state.load(&id).await? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Returns the persisted record for `fresh.id`, or saves `fresh`.
    ///
    /// Stages an interrupted run left `Running` go back to `Pending`. While
    /// the master-anchor stage is not done, the mask source is refreshed
    /// from `fresh`, so an operator can supply a hand-drawn mask.
    pub async fn load_or_create(&self, fresh: StimulusUnit) -> Result<StimulusUnit, StimforgeError> {
        let Some(mut unit) = self.state.load(&fresh.id).await? else {
            debug!(unit = %fresh.id, "Creating unit record");
            self.save(&fresh).await?;
            return Ok(fresh);
        };

        let mut changed = false;
        let recovered = unit.recover_interrupted()?;
        if !recovered.is_empty() {
            warn!(unit = %unit.id, stages = ?recovered, "Recovered stages left running");
            changed = true;
        }
        if unit.mask_source != fresh.mask_source && !unit.status(StageId::MasterAnchor).is_done() {
            info!(unit = %unit.id, "Mask source changed");
            unit.mask_source = fresh.mask_source;
            changed = true;
        }
        if changed {
            self.save(&unit).await?;
        }
        Ok(unit)
    }

    /// Operator re-run of one stage: resets it and everything downstream to
    /// `Pending` with a fresh retry budget, and returns the saved record.
    ///
    /// Refused while a predecessor is not done, and for done stages unless
    /// `force` is set.
    pub async fn rerun_stage(
        &self,
        unit_id: &str,
        stage: StageId,
        force: bool,
    ) -> Result<StimulusUnit, StimforgeError> {
        let mut unit = self
            .state
            .load(unit_id)
            .await?
            .ok_or_else(|| StimforgeError::UnknownUnit(unit_id.to_string()))?;
        unit.recover_interrupted()?;

        let reset = unit
            .reset_for_rerun(stage, force)
            .map_err(|reason| StimforgeError::RerunRefused {
                unit: unit_id.to_string(),
                stage,
                reason,
            })?;
        info!(unit = unit_id, stage = %stage, reset = ?reset, force, "Stage reset for re-run");
        self.save(&unit).await?;
        Ok(unit)
    }

    /// Runs the earliest ready stage of `unit` once.
    ///
    /// Returns the stage's status after the attempt, or `None` if no stage
    /// is ready. Backoff before a retry is slept here.
    pub async fn advance(&self, unit: &mut StimulusUnit) -> Result<Option<StageStatus>, StimforgeError> {
        let retry = &self.pipeline.config().retry;
        let Some(stage) = unit
            .ready_stages(|s| retry.max_retries_for(s))
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let mut state = RetryState::new();
        let mut statuses = self.step(unit, &[stage], &mut state).await?;
        Ok(statuses.pop().map(|(_, status)| status))
    }

    /// Runs `units` to completion, exclusion or cancellation.
    ///
    /// Units are driven concurrently and independently; external calls
    /// across all of them are bounded by the shared admission gate. A store
    /// failure cancels the batch and is returned once every driver stopped.
    pub async fn run(self: &Arc<Self>, units: Vec<StimulusUnit>) -> Result<BatchReport, StimforgeError> {
        let run_id = generate_run_id();
        let started_at = Utc::now();
        let admitted_before = self.pipeline.gate().admitted();
        info!(
            run_id = %run_id,
            units = units.len(),
            max_in_flight = self.pipeline.gate().capacity(),
            "Starting batch"
        );

        let mut drivers: FuturesUnordered<tokio::task::JoinHandle<Result<DriverResult, StimforgeError>>> =
            FuturesUnordered::new();
        for unit in units {
            let this = Arc::clone(self);
            drivers.push(tokio::spawn(async move { this.drive(unit).await }));
        }

        let mut outcomes = BTreeMap::new();
        let mut fatal = None;
        while let Some(joined) = drivers.next().await {
            match joined {
                Ok(Ok(result)) => {
                    let outcome =
                        UnitOutcome::of(&result.unit, result.cancelled, result.cancel_reason);
                    outcomes.insert(result.unit.id, outcome);
                }
                Ok(Err(e)) => {
                    error!(run_id = %run_id, error = %e, "Unit driver failed; cancelling batch");
                    self.cancel.cancel(format!("fatal error: {e}"));
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Unit driver task failed");
                    self.cancel.cancel("unit driver task failed");
                    fatal.get_or_insert(StimforgeError::Internal(format!("task join error: {e}")));
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let report = BatchReport::new(
            run_id,
            started_at,
            Utc::now(),
            outcomes,
            self.pipeline.gate().peak(),
            self.pipeline.gate().admitted() - admitted_before,
        );
        info!(
            run_id = %run_id,
            delivered = report.delivered.len(),
            undelivered = report.undelivered(),
            peak_in_flight = report.peak_in_flight,
            "Batch finished"
        );
        Ok(report)
    }

    async fn drive(&self, mut unit: StimulusUnit) -> Result<DriverResult, StimforgeError> {
        let token = self.token_for(&unit.id);
        let retry = &self.pipeline.config().retry;
        let mut state = RetryState::new();

        loop {
            if token.is_cancelled() {
                let reason = token.reason();
                info!(unit = %unit.id, reason = ?reason, "Unit cancelled");
                self.emit(PipelineEvent::UnitCancelled {
                    unit: unit.id.clone(),
                    reason: reason.clone(),
                })
                .await;
                return Ok(DriverResult {
                    unit,
                    cancelled: true,
                    cancel_reason: reason,
                });
            }

            let ready = unit.ready_stages(|s| retry.max_retries_for(s));
            if ready.is_empty() {
                break;
            }
            self.step(&mut unit, &ready, &mut state).await?;
        }

        if unit.is_complete() {
            info!(unit = %unit.id, "Unit completed");
            self.emit(PipelineEvent::UnitCompleted {
                unit: unit.id.clone(),
            })
            .await;
        } else if let Some((stage, reason)) = unit.first_failed_stage() {
            warn!(unit = %unit.id, stage = %stage, "Unit excluded from delivery");
            let event = PipelineEvent::UnitSkipped {
                unit: unit.id.clone(),
                stage,
                reason: reason.cloned(),
            };
            self.emit(event).await;
        }
        Ok(DriverResult {
            unit,
            cancelled: false,
            cancel_reason: None,
        })
    }

    /// Starts `stages`, runs them concurrently and records each outcome.
    async fn step(
        &self,
        unit: &mut StimulusUnit,
        stages: &[StageId],
        state: &mut RetryState,
    ) -> Result<Vec<(StageId, StageStatus)>, StimforgeError> {
        for &stage in stages {
            if unit.status(stage).failure().is_some() {
                unit.transition(stage, StageStatus::Pending)?;
            }
            unit.transition(stage, StageStatus::Running)?;
        }
        self.save(unit).await?;
        for &stage in stages {
            let attempt = unit.record(stage).attempts;
            debug!(unit = %unit.id, stage = %stage, attempt, "Stage started");
            self.emit(PipelineEvent::StageStarted {
                unit: unit.id.clone(),
                stage,
                attempt,
            })
            .await;
        }

        let snapshot: &StimulusUnit = unit;
        let runs = join_all(stages.iter().map(|&stage| self.execute(snapshot, stage))).await;

        let mut statuses = Vec::with_capacity(runs.len());
        let mut backoff = Duration::ZERO;
        for run in runs {
            let run = run?;
            let stage = run.stage;
            if let Some(RetryDecision::Backoff(delay)) = self.apply(unit, run, state).await? {
                backoff = backoff.max(delay);
            }
            self.save(unit).await?;
            statuses.push((stage, unit.status(stage).clone()));
        }

        if !backoff.is_zero() {
            debug!(unit = %unit.id, delay = ?backoff, "Backing off");
            tokio::time::sleep(backoff).await;
        }
        Ok(statuses)
    }

    /// Executes one attempt against a read-only view of the unit.
    async fn execute(&self, unit: &StimulusUnit, stage: StageId) -> Result<StageRun, StimforgeError> {
        let ctx = StageContext::new(
            self.pipeline.clone(),
            unit.id.clone(),
            stage,
            unit.stage_seed(stage),
            unit.record(stage).attempts,
        );
        let started = Instant::now();
        let mut generated_master = None;
        let range = {
            let video = &self.pipeline.config().video;
            (video.min_duration_secs, video.max_duration_secs)
        };

        let output = match stage {
            StageId::Describe => self
                .descriptions
                .derive(&ctx, &unit.source)
                .await
                .map(StageOutput::Descriptions),
            StageId::MasterAnchor => {
                let descriptions = unit
                    .descriptions
                    .as_ref()
                    .ok_or_else(|| missing(stage, "descriptions"))?;
                let master = match &unit.master_anchor {
                    Some(existing) => Ok(existing.clone()),
                    None => self.keyframes.generate_master(&ctx, descriptions, &unit.source).await,
                };
                match master {
                    Ok(master) => {
                        let mask = self
                            .keyframes
                            .resolve_mask(&ctx, &master, &unit.mask_source)
                            .await;
                        if unit.master_anchor.is_none() {
                            generated_master = Some(master.clone());
                        }
                        mask.map(|mask| StageOutput::Anchor { master, mask })
                    }
                    Err(e) => Err(e),
                }
            }
            StageId::StartVariant | StageId::ControlVariant => {
                let descriptions = unit
                    .descriptions
                    .as_ref()
                    .ok_or_else(|| missing(stage, "descriptions"))?;
                let master = unit
                    .master_anchor
                    .as_ref()
                    .ok_or_else(|| missing(stage, "master anchor"))?;
                let mask = unit
                    .roi_mask
                    .as_ref()
                    .ok_or_else(|| missing(stage, "ROI mask"))?;
                if stage == StageId::StartVariant {
                    self.keyframes
                        .variant(&ctx, Anchor::Start, master, mask, &descriptions.start)
                        .await
                        .map(StageOutput::StartVariant)
                } else {
                    self.keyframes
                        .variant(&ctx, Anchor::EndControl, master, mask, &descriptions.end_control)
                        .await
                        .map(StageOutput::ControlVariant)
                }
            }
            StageId::VideoPain | StageId::VideoControl => {
                let descriptions = unit
                    .descriptions
                    .as_ref()
                    .ok_or_else(|| missing(stage, "descriptions"))?;
                let start = unit
                    .start_variant
                    .as_ref()
                    .ok_or_else(|| missing(stage, "start keyframe"))?;
                let (condition, end, description) = if stage == StageId::VideoPain {
                    let end = unit
                        .master_anchor
                        .as_ref()
                        .ok_or_else(|| missing(stage, "master anchor"))?;
                    (Condition::Pain, end, &descriptions.end_pain)
                } else {
                    let end = unit
                        .control_variant
                        .as_ref()
                        .ok_or_else(|| missing(stage, "control keyframe"))?;
                    (Condition::Control, end, &descriptions.end_control)
                };
                self.video
                    .interpolate(&ctx, start, end, condition, description, range)
                    .await
                    .map(StageOutput::Clip)
            }
        };

        Ok(StageRun {
            stage,
            elapsed: started.elapsed(),
            output,
            master: generated_master,
        })
    }

    /// Records an attempt's outcome on the unit and decides what follows a
    /// failure.
    async fn apply(
        &self,
        unit: &mut StimulusUnit,
        run: StageRun,
        state: &mut RetryState,
    ) -> Result<Option<RetryDecision>, StimforgeError> {
        let StageRun {
            stage,
            elapsed,
            output,
            master,
        } = run;
        if let Some(master) = master {
            unit.master_anchor = Some(master);
        }

        let error = match output {
            Ok(output) => {
                match output {
                    StageOutput::Descriptions(set) => unit.descriptions = Some(set),
                    StageOutput::Anchor { master, mask } => {
                        unit.master_anchor = Some(master);
                        unit.roi_mask = Some(mask);
                    }
                    StageOutput::StartVariant(keyframe) => unit.start_variant = Some(keyframe),
                    StageOutput::ControlVariant(keyframe) => unit.control_variant = Some(keyframe),
                    StageOutput::Clip(clip) => match clip.condition {
                        Condition::Pain => unit.video_pain = Some(clip),
                        Condition::Control => unit.video_control = Some(clip),
                    },
                }
                unit.transition(stage, StageStatus::Done)?;
                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                info!(unit = %unit.id, stage = %stage, duration_ms, "Stage completed");
                self.emit(PipelineEvent::StageCompleted {
                    unit: unit.id.clone(),
                    stage,
                    duration_ms,
                })
                .await;
                return Ok(None);
            }
            Err(StageError::Store(e)) => {
                error!(unit = %unit.id, stage = %stage, error = %e, "Artifact store failed");
                return Err(e.into());
            }
            Err(e) => e,
        };

        let Some(reason) = error.failure_reason() else {
            return Err(StimforgeError::Internal(format!(
                "stage '{stage}' failed without a reason: {error}"
            )));
        };
        unit.transition(stage, StageStatus::Failed(reason.clone()))?;
        let retry_count = unit.record(stage).retry_count;
        warn!(
            unit = %unit.id,
            stage = %stage,
            retry_count,
            reason = %reason,
            error = %error,
            "Stage failed"
        );
        self.emit(PipelineEvent::StageFailed {
            unit: unit.id.clone(),
            stage,
            reason,
            retry_count,
        })
        .await;

        let decision = decide(unit, stage, &self.pipeline.config().retry, state);
        match &decision {
            Some(RetryDecision::Backoff(delay)) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(unit = %unit.id, stage = %stage, delay_ms, "Retry scheduled");
                self.emit(PipelineEvent::StageRetryScheduled {
                    unit: unit.id.clone(),
                    stage,
                    delay_ms,
                    adjusted: false,
                })
                .await;
            }
            Some(RetryDecision::Adjusted) => {
                info!(
                    unit = %unit.id,
                    stage = %stage,
                    next_seed = unit.stage_seed(stage),
                    "Retry scheduled with adjusted seed"
                );
                self.emit(PipelineEvent::StageRetryScheduled {
                    unit: unit.id.clone(),
                    stage,
                    delay_ms: 0,
                    adjusted: true,
                })
                .await;
            }
            Some(RetryDecision::GiveUp | RetryDecision::NotRetryable) | None => {
                for skipped in unit.skip_from(stage)? {
                    debug!(unit = %unit.id, stage = %skipped, "Stage skipped");
                    self.emit(PipelineEvent::StageSkipped {
                        unit: unit.id.clone(),
                        stage: skipped,
                    })
                    .await;
                }
            }
        }
        Ok(decision)
    }
}
