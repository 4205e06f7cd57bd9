//! Batch manifest: the stimulus units to generate.
//!
//! ```toml
//! [[unit]]
//! id = "S11"
//! pain_image = "sources/S11_pain.jpg"
//! control_image = "sources/S11_control.jpg"
//! roi_prompt = "hammer and left thumb"
//!
//! [[unit]]
//! id = "S12"
//! pain_image = "sources/S12_pain.jpg"
//! control_image = "sources/S12_control.jpg"
//! mask = "masks/S12_mask.png"
//! seed = 4242
//! ```

use crate::core::{ArtifactRef, MaskSource, SourcePair, StimulusUnit};
use crate::errors::StimforgeError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One `[[unit]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Unique unit identifier.
    pub id: String,
    /// Pain source photograph.
    pub pain_image: PathBuf,
    /// Control source photograph.
    pub control_image: PathBuf,
    /// Hand-drawn ROI mask (white = inpaint, black = keep).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    /// Segmentation prompt used when no mask is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_prompt: Option<String>,
    /// Base seed; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl UnitSpec {
    /// Mask source: a supplied mask wins over segmentation.
    pub fn mask_source(&self) -> Result<MaskSource, StimforgeError> {
        match (&self.mask, &self.roi_prompt) {
            (Some(mask), _) => Ok(MaskSource::Supplied {
                mask: ArtifactRef::external(mask.to_string_lossy()),
            }),
            (None, Some(prompt)) if !prompt.trim().is_empty() => Ok(MaskSource::Segment {
                prompt: prompt.clone(),
            }),
            _ => Err(StimforgeError::Config(format!(
                "unit '{}' needs either a mask or a roi_prompt",
                self.id
            ))),
        }
    }

    /// Builds a fresh unit record with every stage pending.
    pub fn to_unit(&self, default_seed: u64) -> Result<StimulusUnit, StimforgeError> {
        Ok(StimulusUnit::new(
            self.id.clone(),
            SourcePair {
                pain: ArtifactRef::external(self.pain_image.to_string_lossy()),
                control: ArtifactRef::external(self.control_image.to_string_lossy()),
            },
            self.mask_source()?,
            self.seed.unwrap_or(default_seed),
        ))
    }
}

/// The set of units in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitManifest {
    /// Units in manifest order.
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitSpec>,
}

impl UnitManifest {
    /// Parses and validates a manifest. Relative image paths are resolved
    /// against `base_dir` when given.
    pub fn from_toml_str(content: &str, base_dir: Option<&Path>) -> Result<Self, StimforgeError> {
        let mut manifest: Self = toml::from_str(content)
            .map_err(|e| StimforgeError::Config(format!("manifest: {e}")))?;
        if let Some(base) = base_dir {
            for spec in &mut manifest.units {
                resolve(&mut spec.pain_image, base);
                resolve(&mut spec.control_image, base);
                if let Some(mask) = spec.mask.as_mut() {
                    resolve(mask, base);
                }
            }
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads a manifest file.
    pub fn load(path: &Path) -> Result<Self, StimforgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StimforgeError::Config(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content, path.parent())
    }

    /// Checks ids and mask sources.
    pub fn validate(&self) -> Result<(), StimforgeError> {
        let id_pattern = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$")
            .map_err(|e| StimforgeError::Config(e.to_string()))?;
        let mut seen = HashSet::new();
        for spec in &self.units {
            if !id_pattern.is_match(&spec.id) {
                return Err(StimforgeError::Config(format!(
                    "invalid unit id '{}': use letters, digits, '.', '_' or '-', not starting with '.' or '-'",
                    spec.id
                )));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(StimforgeError::Config(format!(
                    "duplicate unit id '{}'",
                    spec.id
                )));
            }
            spec.mask_source()?;
        }
        Ok(())
    }

    /// Returns the entry for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&UnitSpec> {
        self.units.iter().find(|spec| spec.id == id)
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}
