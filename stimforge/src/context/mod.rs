//! Execution context threaded into every component call.
//!
//! [`PipelineContext`] holds what a batch shares: the read-only
//! configuration, the external services, the artifact store, the admission
//! gate and the event sink. [`StageContext`] narrows it to one attempt of
//! one stage of one unit.

use crate::config::PipelineConfig;
use crate::core::{ArtifactRef, StageId};
use crate::errors::{StoreError, TransientError};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::AdmissionGate;
use crate::providers::Services;
use crate::store::ArtifactStore;
use std::future::Future;
use std::sync::Arc;

/// State shared by every unit of a batch.
pub struct PipelineContext {
    config: Arc<PipelineConfig>,
    services: Services,
    artifacts: Arc<dyn ArtifactStore>,
    gate: Arc<AdmissionGate>,
    sink: Arc<dyn EventSink>,
}

impl PipelineContext {
    /// Creates a context; the gate is sized from the configuration.
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        services: Services,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let gate = Arc::new(AdmissionGate::new(
            config.concurrency.max_in_flight,
            config.concurrency.call_timeout(),
        ));
        Self {
            config,
            services,
            artifacts,
            gate,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The batch configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The external services.
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }

    /// The shared admission gate.
    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// The event sink.
    #[must_use]
    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Context of a single stage attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pipeline: Arc<PipelineContext>,
    unit_id: String,
    stage: StageId,
    seed: u64,
    attempt: u32,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        pipeline: Arc<PipelineContext>,
        unit_id: impl Into<String>,
        stage: StageId,
        seed: u64,
        attempt: u32,
    ) -> Self {
        Self {
            pipeline,
            unit_id: unit_id.into(),
            stage,
            seed,
            attempt,
        }
    }

    /// The unit id.
    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// The stage being attempted.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Seed for this attempt.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The batch configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    /// The external services.
    #[must_use]
    pub fn services(&self) -> &Services {
        self.pipeline.services()
    }

    /// Runs an external call through the shared admission gate.
    pub async fn admit<T, E, F>(&self, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<TransientError>,
    {
        tracing::debug!(
            unit = %self.unit_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Waiting for admission"
        );
        self.pipeline.gate().admit(call).await
    }

    /// Stores bytes produced by this attempt.
    ///
    /// The name carries the stage and seed so that a retry never overwrites
    /// an artifact an earlier attempt recorded.
    pub async fn put(&self, label: &str, extension: &str, bytes: &[u8]) -> Result<ArtifactRef, StoreError> {
        let name = format!("{}_{label}_s{}.{extension}", self.stage, self.seed);
        self.pipeline.artifacts().put(&self.unit_id, &name, bytes).await
    }

    /// Reads an artifact.
    pub async fn fetch(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        self.pipeline.artifacts().get(artifact).await
    }
}
