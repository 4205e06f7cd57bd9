//! Descriptions, keyframes, masks and clips produced for a unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to bytes held by an artifact store or on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path or URI of the artifact.
    pub location: String,
    /// Hex SHA-256 of the bytes, when the store wrote them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ArtifactRef {
    /// References a file this crate did not write (e.g. a source image).
    #[must_use]
    pub fn external(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            sha256: None,
        }
    }

    /// References bytes with a known digest.
    #[must_use]
    pub fn stored(location: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            sha256: Some(sha256.into()),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// Temporal anchor of a keyframe or description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Pre-interaction state.
    #[serde(rename = "t_start")]
    Start,
    /// Pain end-state; the master.
    #[serde(rename = "t_end_p")]
    EndPain,
    /// Control end-state.
    #[serde(rename = "t_end_c")]
    EndControl,
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "t_start"),
            Self::EndPain => write!(f, "t_end_P"),
            Self::EndControl => write!(f, "t_end_C"),
        }
    }
}

/// Experimental condition of a video clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Painful interaction.
    Pain,
    /// Non-painful control.
    Control,
}

impl Condition {
    /// The end-state anchor of this condition's transition.
    #[must_use]
    pub fn end_anchor(self) -> Anchor {
        match self {
            Self::Pain => Anchor::EndPain,
            Self::Control => Anchor::EndControl,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pain => write!(f, "pain"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// The Pain and Control source photographs of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePair {
    /// Source image of the painful interaction.
    pub pain: ArtifactRef,
    /// Source image of the control interaction.
    pub control: ArtifactRef,
}

/// Where a unit's ROI mask comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MaskSource {
    /// A mask drawn by hand over the Master Anchor (white = editable).
    Supplied {
        /// Mask image location.
        mask: ArtifactRef,
    },
    /// Automated segmentation of the causal object and anatomy.
    Segment {
        /// Text describing the region to segment.
        prompt: String,
    },
}

/// Semantic description of one temporal anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Which anchor this describes.
    pub anchor: Anchor,
    /// The action taking place.
    pub action: String,
    /// The affected anatomy.
    #[serde(default)]
    pub anatomy: String,
    /// The causal object.
    #[serde(default)]
    pub object: String,
    /// Scene and framing.
    #[serde(default)]
    pub scene: String,
    /// Dense generation prompt.
    pub prompt: String,
    /// The anchor whose text this was derived from; `None` for the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Anchor>,
}

/// The three descriptions of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionSet {
    /// `t_start`, derived from `t_end_P`.
    pub start: Description,
    /// `t_end_P`, the master description.
    pub end_pain: Description,
    /// `t_end_C`, derived from `t_end_P`.
    pub end_control: Description,
}

impl DescriptionSet {
    /// Returns the description for an anchor.
    #[must_use]
    pub fn get(&self, anchor: Anchor) -> &Description {
        match anchor {
            Anchor::Start => &self.start,
            Anchor::EndPain => &self.end_pain,
            Anchor::EndControl => &self.end_control,
        }
    }
}

/// A generated keyframe image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Temporal anchor.
    pub anchor: Anchor,
    /// The image.
    pub artifact: ArtifactRef,
    /// Image this one was inpainted from; `None` only for the Master Anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ArtifactRef>,
    /// Mask used for inpainting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<ArtifactRef>,
    /// Seed passed to the generator.
    pub seed: u64,
    /// Model that produced the image.
    pub model: String,
    /// Measured out-of-mask difference against the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_of_mask_difference: Option<f64>,
}

impl Keyframe {
    /// Creates the Master Anchor keyframe.
    #[must_use]
    pub fn master(artifact: ArtifactRef, seed: u64, model: impl Into<String>) -> Self {
        Self {
            anchor: Anchor::EndPain,
            artifact,
            parent: None,
            mask: None,
            seed,
            model: model.into(),
            out_of_mask_difference: None,
        }
    }

    /// Creates a variant inpainted from `master` through `mask`.
    #[must_use]
    pub fn variant(
        anchor: Anchor,
        artifact: ArtifactRef,
        master: &Self,
        mask: &RoiMask,
        seed: u64,
        model: impl Into<String>,
        difference: f64,
    ) -> Self {
        Self {
            anchor,
            artifact,
            parent: Some(master.artifact.clone()),
            mask: Some(mask.artifact.clone()),
            seed,
            model: model.into(),
            out_of_mask_difference: Some(difference),
        }
    }

    /// Returns true if this is a Master Anchor (no parent).
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.parent.is_none()
    }
}

/// Binary mask over the Master Anchor locating the causal region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiMask {
    /// Mask image.
    pub artifact: ArtifactRef,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Fraction of pixels inside the ROI.
    pub coverage: f64,
    /// True when drawn by hand rather than segmented.
    pub supplied: bool,
}

/// An interpolated clip between two keyframes of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoClip {
    /// Condition label.
    pub condition: Condition,
    /// The video.
    pub artifact: ArtifactRef,
    /// Start keyframe (`t_start`).
    pub start: ArtifactRef,
    /// End keyframe (`t_end_P` or `t_end_C`).
    pub end: ArtifactRef,
    /// Duration reported by the service.
    pub duration_secs: f64,
    /// Motion-style hint that was sent.
    pub style_hint: String,
    /// Seed passed to the generator.
    pub seed: u64,
    /// Model that produced the clip.
    pub model: String,
}
