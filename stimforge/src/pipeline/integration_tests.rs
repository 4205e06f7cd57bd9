//! End-to-end batch runs against scripted services.

use crate::config::PipelineConfig;
use crate::core::{StageId, StageStatus, StimulusUnit};
use crate::keyframes::pixel_lock::{decode_mask, decode_rgb, out_of_mask_difference};
use crate::pipeline::{JitterStrategy, Orchestrator, RetryConfig, UnitOutcome};
use crate::store::{ArtifactStore, FsStateStore, InMemoryStateStore, StateStore};
use crate::testing::{Harness, ImageScript, VideoScript, VlmScript};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_retries(max_retries)
        .with_base_delay_ms(1)
        .with_max_delay_ms(4)
        .with_jitter(JitterStrategy::None)
}

fn config(max_retries: u32) -> PipelineConfig {
    PipelineConfig::default().with_retry(fast_retry(max_retries))
}

fn build(harness: &Harness, state: Arc<dyn StateStore>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(harness.pipeline().clone(), state).unwrap())
}

async fn units(harness: &Harness, ids: &[&str]) -> Vec<StimulusUnit> {
    let mut units = Vec::new();
    for id in ids {
        units.push(harness.segmented_unit(id).await);
    }
    units
}

#[tokio::test]
async fn test_batch_delivers_every_unit() {
    let harness = Harness::new(config(3));
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A", "B", "C"]).await)
        .await
        .unwrap();

    assert_eq!(report.delivered, vec!["A", "B", "C"]);
    assert_eq!(report.undelivered(), 0);
    // per unit: 3 VLM, master, segment, 2 inpaints, 2 videos
    assert_eq!(harness.probe.calls(), 27);
    assert_eq!(report.admitted_calls, 27);
    for id in ["A", "B", "C"] {
        let unit = state.get(id).unwrap();
        assert!(unit.is_complete());
        assert!(unit.video_pain.is_some());
        assert!(unit.video_control.is_some());
    }
    assert_eq!(harness.events.events_of_type("unit.completed").len(), 3);
}

#[tokio::test]
async fn test_no_stage_runs_before_its_predecessors() {
    let harness = Harness::new(config(2));
    harness.images.script("start prompt", [ImageScript::Drift]);
    harness.video.script("slow", [VideoScript::Transient]);
    let state = Arc::new(InMemoryStateStore::with_history());
    let orchestrator = build(&harness, state.clone());

    orchestrator
        .run(units(&harness, &["A", "B"]).await)
        .await
        .unwrap();

    let history = state.history();
    assert!(!history.is_empty());
    for snapshot in history {
        for stage in StageId::ALL {
            if matches!(snapshot.status(stage), StageStatus::Running | StageStatus::Done) {
                assert!(
                    snapshot.predecessors_done(stage),
                    "{} ran '{stage}' early",
                    snapshot.id
                );
            }
        }
    }
}

#[tokio::test]
async fn test_variants_hold_the_pixel_lock() {
    let harness = Harness::new(config(3));
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());
    orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();

    let unit = state.get("A").unwrap();
    let lock = &harness.config.pixel_lock;
    let master = harness
        .artifacts
        .get(&unit.master_anchor.as_ref().unwrap().artifact)
        .await
        .unwrap();
    let master = decode_rgb(&master, "master").unwrap();
    let mask = harness
        .artifacts
        .get(&unit.roi_mask.as_ref().unwrap().artifact)
        .await
        .unwrap();
    let mask = decode_mask(&mask).unwrap();

    for variant in [unit.start_variant.unwrap(), unit.control_variant.unwrap()] {
        let bytes = harness.artifacts.get(&variant.artifact).await.unwrap();
        let image = decode_rgb(&bytes, "variant").unwrap();
        let difference = out_of_mask_difference(&master, &image, &mask, lock.mask_threshold).unwrap();
        assert!(difference <= lock.tolerance);
        assert_eq!(variant.out_of_mask_difference, Some(difference));
        assert_eq!(variant.parent.as_ref(), Some(&unit.master_anchor.as_ref().unwrap().artifact));
    }
}

#[tokio::test]
async fn test_derivations_read_only_the_master_description() {
    let harness = Harness::new(config(3));
    let orchestrator = build(&harness, Arc::new(InMemoryStateStore::new()));
    orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();

    let requests = harness.vlm.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests.iter().filter(|r| r.image.is_some()).count(), 1);
    for derivation in requests.iter().filter(|r| r.image.is_none()) {
        let input = derivation.input_text.as_deref().unwrap();
        assert!(input.contains("hammer strikes thumbnail"));
    }
}

#[tokio::test]
async fn test_second_run_makes_no_calls() {
    let harness = Harness::new(config(3));
    let state = Arc::new(InMemoryStateStore::new());
    let first = build(&harness, state.clone());
    first.run(units(&harness, &["A", "B"]).await).await.unwrap();
    let calls = harness.probe.calls();

    let second = build(&harness, state.clone());
    let mut resumed = Vec::new();
    for unit in units(&harness, &["A", "B"]).await {
        resumed.push(second.load_or_create(unit).await.unwrap());
    }
    let report = second.run(resumed).await.unwrap();

    assert_eq!(harness.probe.calls(), calls);
    assert_eq!(report.delivered, vec!["A", "B"]);
    assert_eq!(report.admitted_calls, 0);
}

#[tokio::test]
async fn test_transient_failures_exhaust_the_budget() {
    let harness = Harness::new(config(2));
    harness
        .vlm
        .script("You describe", [VlmScript::Transient, VlmScript::Transient, VlmScript::Transient]);
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A", "B"]).await)
        .await
        .unwrap();

    // one unit takes two outages and gives up, the other recovers
    let outcomes: Vec<_> = ["A", "B"]
        .iter()
        .map(|id| report.outcome(id).unwrap().clone())
        .collect();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, UnitOutcome::Skipped { stage: StageId::Describe, .. }))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(report.delivered.len(), 1);

    let excluded = ["A", "B"]
        .iter()
        .map(|id| state.get(id).unwrap())
        .find(StimulusUnit::is_excluded)
        .unwrap();
    let describe = excluded.record(StageId::Describe);
    assert_eq!(describe.status, StageStatus::Skipped);
    assert_eq!(describe.retry_count, 2);
    assert_eq!(describe.last_failure.as_ref().unwrap().code, "unavailable");
    assert!(StageId::Describe
        .downstream()
        .into_iter()
        .all(|s| excluded.status(s) == &StageStatus::Skipped));
}

#[tokio::test]
async fn test_pixel_lock_violation_retries_with_new_seed() {
    let harness = Harness::new(config(2));
    harness.images.script("start prompt", [ImageScript::Drift]);
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();

    assert_eq!(report.outcome("A"), Some(&UnitOutcome::Completed));
    let unit = state.get("A").unwrap();
    let record = unit.record(StageId::StartVariant);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.last_failure.as_ref().unwrap().code, "pixel_lock");

    let seeds: Vec<u64> = harness
        .images
        .requests()
        .iter()
        .filter(|r| r.is_inpainting() && r.prompt.contains("start prompt"))
        .map(|r| r.seed)
        .collect();
    assert_eq!(seeds.len(), 2);
    assert_ne!(seeds[0], seeds[1]);
    assert_eq!(unit.start_variant.unwrap().seed, seeds[1]);
    assert_eq!(harness.events.events_of_type("stage.retry_scheduled").len(), 1);
}

#[tokio::test]
async fn test_long_pain_video_is_excluded() {
    let harness = Harness::new(config(2));
    harness.video.script(
        "sudden",
        [VideoScript::Duration(12.0), VideoScript::Duration(12.0)],
    );
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();

    match report.outcome("A").unwrap() {
        UnitOutcome::Skipped { stage, reason } => {
            assert_eq!(*stage, StageId::VideoPain);
            assert_eq!(reason.as_ref().unwrap().code, "duration_out_of_range");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let unit = state.get("A").unwrap();
    assert!(unit.video_pain.is_none());
    assert!(unit.status(StageId::VideoControl).is_done());
    assert!(unit.video_control.is_some());
    assert!(report.delivered.is_empty());
}

#[tokio::test]
async fn test_calls_never_exceed_the_budget() {
    let harness = Harness::with_latency(
        config(3).with_max_in_flight(2),
        Duration::from_millis(5),
    );
    let orchestrator = build(&harness, Arc::new(InMemoryStateStore::new()));

    let report = orchestrator
        .run(units(&harness, &["A", "B", "C", "D"]).await)
        .await
        .unwrap();

    assert_eq!(report.delivered.len(), 4);
    assert!(report.peak_in_flight <= 2);
    assert!(harness.probe.peak() <= 2);
    assert_eq!(harness.pipeline().gate().in_flight(), 0);
}

#[tokio::test]
async fn test_batch_cancellation_stops_every_unit() {
    let harness = Harness::new(config(3));
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());
    orchestrator.cancellation().cancel("shutdown");

    let report = orchestrator
        .run(units(&harness, &["A", "B"]).await)
        .await
        .unwrap();

    assert!(report.delivered.is_empty());
    assert_eq!(harness.probe.calls(), 0);
    assert!(matches!(
        report.outcome("A"),
        Some(UnitOutcome::Cancelled { .. })
    ));
    assert_eq!(harness.events.events_of_type("unit.cancelled").len(), 2);
}

#[tokio::test]
async fn test_supplied_mask_skips_segmentation() {
    let harness = Harness::new(config(3));
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());
    let unit = harness.supplied_unit("A").await;

    let report = orchestrator.run(vec![unit]).await.unwrap();

    assert_eq!(report.outcome("A"), Some(&UnitOutcome::Completed));
    assert_eq!(harness.images.segment_calls(), 0);
    assert!(state.get("A").unwrap().roi_mask.unwrap().supplied);
}

#[tokio::test]
async fn test_file_store_resumes_interrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(3));

    let mut interrupted = harness.segmented_unit("A").await;
    interrupted
        .transition(StageId::Describe, StageStatus::Running)
        .unwrap();
    FsStateStore::new(dir.path()).save(&interrupted).await.unwrap();

    let orchestrator = build(&harness, Arc::new(FsStateStore::new(dir.path())));
    let unit = orchestrator
        .load_or_create(harness.segmented_unit("A").await)
        .await
        .unwrap();
    assert_eq!(unit.status(StageId::Describe), &StageStatus::Pending);
    let report = orchestrator.run(vec![unit]).await.unwrap();
    assert_eq!(report.delivered, vec!["A"]);
    let calls = harness.probe.calls();

    let reopened = build(&harness, Arc::new(FsStateStore::new(dir.path())));
    let unit = reopened
        .load_or_create(harness.segmented_unit("A").await)
        .await
        .unwrap();
    assert!(unit.is_complete());
    assert_eq!(unit.record(StageId::Describe).attempts, 2);
    reopened.run(vec![unit]).await.unwrap();
    assert_eq!(harness.probe.calls(), calls);
}

#[tokio::test]
async fn test_failed_control_variant_blocks_both_videos() {
    let harness = Harness::new(config(2));
    harness
        .images
        .script("control prompt", [ImageScript::Drift, ImageScript::Drift]);
    let state = Arc::new(InMemoryStateStore::with_history());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();

    match report.outcome("A").unwrap() {
        UnitOutcome::Skipped { stage, reason } => {
            assert_eq!(*stage, StageId::ControlVariant);
            assert_eq!(reason.as_ref().unwrap().code, "pixel_lock");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(harness.video.requests().is_empty());
    for snapshot in state.history() {
        for video in [StageId::VideoPain, StageId::VideoControl] {
            if matches!(snapshot.status(video), StageStatus::Running | StageStatus::Done) {
                assert!(snapshot.status(StageId::StartVariant).is_done());
                assert!(snapshot.status(StageId::ControlVariant).is_done());
            }
        }
    }
    let unit = state.get("A").unwrap();
    assert_eq!(unit.status(StageId::VideoPain), &StageStatus::Skipped);
    assert_eq!(unit.status(StageId::VideoControl), &StageStatus::Skipped);
}

#[tokio::test]
async fn test_rerun_after_exhausted_retries_uses_fresh_seeds() {
    let harness = Harness::new(config(2));
    harness
        .images
        .script("start prompt", [ImageScript::Drift, ImageScript::Drift]);
    let state = Arc::new(InMemoryStateStore::new());
    let orchestrator = build(&harness, state.clone());

    let report = orchestrator
        .run(units(&harness, &["A"]).await)
        .await
        .unwrap();
    assert!(matches!(
        report.outcome("A"),
        Some(UnitOutcome::Skipped { stage: StageId::StartVariant, .. })
    ));

    let reset = orchestrator
        .rerun_stage("A", StageId::StartVariant, false)
        .await
        .unwrap();
    let report = orchestrator.run(vec![reset]).await.unwrap();
    assert_eq!(report.outcome("A"), Some(&UnitOutcome::Completed));

    let seeds: Vec<u64> = harness
        .images
        .requests()
        .iter()
        .filter(|r| r.is_inpainting() && r.prompt.contains("start prompt"))
        .map(|r| r.seed)
        .collect();
    assert_eq!(seeds.len(), 3);
    let mut distinct = seeds.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 3, "seeds repeated: {seeds:?}");
    assert_eq!(state.get("A").unwrap().start_variant.unwrap().seed, seeds[2]);
}
