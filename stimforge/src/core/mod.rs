//! Core domain model types for stimforge.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The fixed stage graph and per-stage status enum
//! - Failure reasons and their retry classification
//! - Descriptions, keyframes, masks and clips
//! - The persisted stimulus unit record and its state machine

mod artifact;
mod stage;
mod status;
mod unit;

pub use artifact::{
    Anchor, ArtifactRef, Condition, Description, DescriptionSet, Keyframe, MaskSource, RoiMask,
    SourcePair, VideoClip,
};
pub use stage::StageId;
pub use status::{FailureKind, FailureReason, RetryClass, StageStatus};
pub use unit::{StageRecord, StimulusUnit, Timestamp};
