//! Fixtures wiring the fakes into pipeline contexts.

use super::fakes::{FakeImages, FakeVideo, FakeVlm, Probe, FRAME_HEIGHT, FRAME_ROI, FRAME_WIDTH};
use super::images::{gradient_png, mask_png};
use crate::config::PipelineConfig;
use crate::context::{PipelineContext, StageContext};
use crate::core::{Anchor, Description, DescriptionSet, MaskSource, SourcePair, StageId, StimulusUnit};
use crate::events::CollectingEventSink;
use crate::providers::{Services, VisionLanguageModel};
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use std::sync::Arc;
use std::time::Duration;

fn description(anchor: Anchor, action: &str, prompt: &str, derived_from: Option<Anchor>) -> Description {
    Description {
        anchor,
        action: action.to_string(),
        anatomy: "left thumb".to_string(),
        object: "claw hammer".to_string(),
        scene: "workbench under an overhead lamp".to_string(),
        prompt: prompt.to_string(),
        derived_from,
    }
}

/// The descriptions the fake VLM produces.
pub fn descriptions() -> DescriptionSet {
    DescriptionSet {
        start: description(
            Anchor::Start,
            "hammer raised above thumbnail",
            "start prompt",
            Some(Anchor::EndPain),
        ),
        end_pain: description(Anchor::EndPain, "hammer strikes thumbnail", "master prompt", None),
        end_control: description(
            Anchor::EndControl,
            "hammer rests beside thumbnail",
            "control prompt",
            Some(Anchor::EndPain),
        ),
    }
}

/// A batch context built from fakes.
pub struct Harness {
    /// Configuration shared by the pipeline.
    pub config: Arc<PipelineConfig>,
    /// Call counter shared by the fakes.
    pub probe: Arc<Probe>,
    /// VLM fake.
    pub vlm: Arc<FakeVlm>,
    /// Image fake.
    pub images: Arc<FakeImages>,
    /// Video fake.
    pub video: Arc<FakeVideo>,
    /// Artifact bytes.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// Lifecycle events.
    pub events: Arc<CollectingEventSink>,
    pipeline: Arc<PipelineContext>,
}

impl Harness {
    /// Fakes answer after 1ms.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_latency(config, Duration::from_millis(1))
    }

    /// Fakes answer after `latency`.
    pub fn with_latency(config: PipelineConfig, latency: Duration) -> Self {
        let config = Arc::new(config);
        let probe = Arc::new(Probe::default());
        let vlm = Arc::new(FakeVlm::new(probe.clone(), latency));
        let images = Arc::new(FakeImages::new(probe.clone(), latency));
        let video = Arc::new(FakeVideo::new(probe.clone(), latency));
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let events = Arc::new(CollectingEventSink::new());

        let services = Services::new(vlm.clone(), images.clone(), video.clone());
        let pipeline = Arc::new(
            PipelineContext::new(config.clone(), services, artifacts.clone()).with_sink(events.clone()),
        );
        Self {
            config,
            probe,
            vlm,
            images,
            video,
            artifacts,
            events,
            pipeline,
        }
    }

    /// The shared pipeline context.
    pub fn pipeline(&self) -> &Arc<PipelineContext> {
        &self.pipeline
    }

    /// A context for one attempt.
    pub fn stage_context(&self, unit_id: &str, stage: StageId, seed: u64) -> StageContext {
        StageContext::new(self.pipeline.clone(), unit_id, stage, seed, 1)
    }

    async fn sources(&self, id: &str) -> SourcePair {
        SourcePair {
            pain: self
                .artifacts
                .put(id, "source_pain.png", &gradient_png(FRAME_WIDTH, FRAME_HEIGHT, 7))
                .await
                .unwrap(),
            control: self
                .artifacts
                .put(id, "source_control.png", &gradient_png(FRAME_WIDTH, FRAME_HEIGHT, 9))
                .await
                .unwrap(),
        }
    }

    /// A new unit whose mask comes from segmentation.
    pub async fn segmented_unit(&self, id: &str) -> StimulusUnit {
        let source = self.sources(id).await;
        StimulusUnit::new(
            id,
            source,
            MaskSource::Segment {
                prompt: "hammer head and thumb".to_string(),
            },
            self.config.default_seed,
        )
    }

    /// A new unit with a hand-drawn mask.
    pub async fn supplied_unit(&self, id: &str) -> StimulusUnit {
        let source = self.sources(id).await;
        let mask = self
            .artifacts
            .put(id, "drawn_mask.png", &mask_png(FRAME_WIDTH, FRAME_HEIGHT, FRAME_ROI))
            .await
            .unwrap();
        StimulusUnit::new(id, source, MaskSource::Supplied { mask }, self.config.default_seed)
    }
}

/// A describe-stage context whose VLM is `vlm`; images and video are fakes.
pub fn stage_context_with_vlm(
    config: PipelineConfig,
    vlm: Arc<dyn VisionLanguageModel>,
) -> (StageContext, Arc<InMemoryArtifactStore>) {
    let probe = Arc::new(Probe::default());
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let services = Services::new(
        vlm,
        Arc::new(FakeImages::new(probe.clone(), Duration::ZERO)),
        Arc::new(FakeVideo::new(probe, Duration::ZERO)),
    );
    let pipeline = Arc::new(PipelineContext::new(Arc::new(config), services, artifacts.clone()));
    (StageContext::new(pipeline, "U1", StageId::Describe, 1001, 1), artifacts)
}

/// Stores a source pair through `ctx`.
pub async fn source_pair(ctx: &StageContext, pain: Vec<u8>, control: Vec<u8>) -> SourcePair {
    SourcePair {
        pain: ctx.put("source", "png", &pain).await.unwrap(),
        control: ctx.put("source_control", "png", &control).await.unwrap(),
    }
}
