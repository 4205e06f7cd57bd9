//! # Stimforge
//!
//! Orchestrates the generation of paired Pain/Control stimulus videos.
//!
//! Every stimulus unit moves through a fixed graph of stages:
//!
//! - **describe**: extract the End-Pain description from the source image and
//!   derive the Start and End-Control descriptions from it
//! - **master-anchor**: generate the Master Anchor keyframe and resolve its
//!   ROI mask
//! - **start-variant** / **control-variant**: inpaint inside the mask only,
//!   enforcing the pixel lock outside it
//! - **video-pain** / **video-control**: interpolate the Start keyframe to
//!   each end keyframe and check the clip duration
//!
//! Stage outcomes are persisted after every transition, so an interrupted
//! batch resumes without repeating completed work.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stimforge::prelude::*;
//!
//! let config = Arc::new(PipelineConfig::load(path)?);
//! let pipeline = Arc::new(PipelineContext::new(config, services, artifacts));
//! let orchestrator = Arc::new(Orchestrator::new(pipeline, state)?);
//!
//! let report = orchestrator.run(units).await?;
//! println!("{} units delivered", report.delivered.len());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod derivation;
pub mod errors;
pub mod events;
pub mod keyframes;
pub mod pipeline;
pub mod providers;
pub mod store;
pub mod utils;
pub mod video;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{PipelineConfig, PromptRegistry, UnitManifest, UnitSpec};
    pub use crate::context::{PipelineContext, StageContext};
    pub use crate::core::{
        Anchor, ArtifactRef, Condition, DescriptionSet, FailureReason, Keyframe, MaskSource,
        StageId, StageStatus, StimulusUnit, VideoClip,
    };
    pub use crate::errors::{StageError, StimforgeError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::pipeline::{
        plan_batch, BatchPlan, BatchReport, Orchestrator, RetryConfig, UnitOutcome,
    };
    pub use crate::providers::Services;
    pub use crate::store::{
        ArtifactStore, FsArtifactStore, FsStateStore, InMemoryArtifactStore,
        InMemoryStateStore, StateStore,
    };
    pub use std::sync::Arc;
}
