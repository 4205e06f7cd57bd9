//! The fixed per-unit stage graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of a stimulus unit's pipeline.
///
/// Declaration order is a valid topological order of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Derive `t_start`, `t_end_P` and `t_end_C` descriptions.
    Describe,
    /// Generate the Master Anchor and resolve the ROI mask.
    MasterAnchor,
    /// Inpaint the `t_start` keyframe from the Master Anchor.
    StartVariant,
    /// Inpaint the `t_end_C` keyframe from the Master Anchor.
    ControlVariant,
    /// Interpolate `t_start -> t_end_P`.
    VideoPain,
    /// Interpolate `t_start -> t_end_C`.
    VideoControl,
}

impl StageId {
    /// All stages in topological order.
    pub const ALL: [Self; 6] = [
        Self::Describe,
        Self::MasterAnchor,
        Self::StartVariant,
        Self::ControlVariant,
        Self::VideoPain,
        Self::VideoControl,
    ];

    /// Declared direct predecessors.
    #[must_use]
    pub fn predecessors(self) -> &'static [Self] {
        match self {
            Self::Describe => &[],
            Self::MasterAnchor => &[Self::Describe],
            Self::StartVariant | Self::ControlVariant => &[Self::MasterAnchor],
            Self::VideoPain | Self::VideoControl => &[Self::StartVariant, Self::ControlVariant],
        }
    }

    /// Every stage that transitively depends on this one, in topological order.
    #[must_use]
    pub fn downstream(self) -> Vec<Self> {
        let mut reached = vec![self];
        for stage in Self::ALL {
            if stage.predecessors().iter().any(|p| reached.contains(p)) {
                reached.push(stage);
            }
        }
        reached.remove(0);
        reached
    }

    /// Offset added to the unit seed for this stage, if it is seeded.
    ///
    /// Descriptions come from a VLM with no seed; every generative stage
    /// gets its own offset so the two variants never share a seed.
    #[must_use]
    pub fn seed_offset(self) -> Option<u64> {
        match self {
            Self::Describe => None,
            Self::MasterAnchor => Some(0),
            Self::StartVariant => Some(1000),
            Self::ControlVariant => Some(2000),
            Self::VideoPain => Some(3000),
            Self::VideoControl => Some(4000),
        }
    }

    /// Stable name used in records, logs and the CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Describe => "describe",
            Self::MasterAnchor => "master-anchor",
            Self::StartVariant => "start-variant",
            Self::ControlVariant => "control-variant",
            Self::VideoPain => "video-pain",
            Self::VideoControl => "video-control",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|st| st.as_str()).collect();
                format!("unknown stage '{s}' (expected one of: {})", names.join(", "))
            })
    }
}
