//! Batch configuration.
//!
//! [`PipelineConfig`] is loaded once when a batch starts, validated, and then
//! passed read-only to every component through the stage context. Secrets
//! are never read from the file; providers take them from the environment.

mod manifest;
mod prompts;

pub use manifest::{UnitManifest, UnitSpec};
pub use prompts::{render_template, PromptKey, PromptRegistry};

use crate::core::StageId;
use crate::errors::StimforgeError;
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shared outbound concurrency budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Simultaneous external calls across the whole batch.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Timeout applied to each external call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_call_timeout_secs() -> u64 {
    600
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl ConcurrencyConfig {
    /// Per-call timeout as a duration.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Pixel-lock acceptance parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelLockConfig {
    /// Maximum mean absolute out-of-mask difference, in `[0, 1]`.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Mask luminance above which a pixel is inside the ROI.
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: u8,
    /// Smallest accepted ROI fraction.
    #[serde(default = "default_min_mask_coverage")]
    pub min_mask_coverage: f64,
    /// Largest accepted ROI fraction.
    #[serde(default = "default_max_mask_coverage")]
    pub max_mask_coverage: f64,
}

fn default_tolerance() -> f64 {
    0.02
}

fn default_mask_threshold() -> u8 {
    128
}

fn default_min_mask_coverage() -> f64 {
    0.0005
}

fn default_max_mask_coverage() -> f64 {
    0.5
}

impl Default for PixelLockConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            mask_threshold: default_mask_threshold(),
            min_mask_coverage: default_min_mask_coverage(),
            max_mask_coverage: default_max_mask_coverage(),
        }
    }
}

/// Interpolation acceptance bounds and motion hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Shortest accepted clip.
    #[serde(default = "default_min_duration")]
    pub min_duration_secs: f64,
    /// Longest accepted clip.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: f64,
    /// Duration requested from the service.
    #[serde(default = "default_target_duration")]
    pub target_duration_secs: f64,
    /// Output aspect ratio.
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    /// Negative prompt sent with every request.
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    /// Motion-style hint for the Pain transition.
    #[serde(default = "default_pain_hint")]
    pub pain_style_hint: String,
    /// Motion-style hint for the Control transition.
    #[serde(default = "default_control_hint")]
    pub control_style_hint: String,
}

fn default_min_duration() -> f64 {
    5.0
}

fn default_max_duration() -> f64 {
    10.0
}

fn default_target_duration() -> f64 {
    5.0
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_negative_prompt() -> String {
    "blur, distort, low quality, warped, deformed".to_string()
}

fn default_pain_hint() -> String {
    "sudden, visceral impact".to_string()
}

fn default_control_hint() -> String {
    "slow, controlled movement".to_string()
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration(),
            max_duration_secs: default_max_duration(),
            target_duration_secs: default_target_duration(),
            aspect_ratio: default_aspect_ratio(),
            negative_prompt: default_negative_prompt(),
            pain_style_hint: default_pain_hint(),
            control_style_hint: default_control_hint(),
        }
    }
}

/// Identifier, parameters and cost of one external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Provider model identifier.
    pub id: String,
    /// Inference steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    /// Guidance scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f64>,
    /// Provider safety tolerance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<String>,
    /// Output size preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    /// Weight of the Pain source photo as image prompt for the master.
    /// Unset means text-only generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt_strength: Option<f64>,
    /// Estimated cost per call in USD.
    #[serde(default)]
    pub cost_usd: f64,
}

impl ModelSettings {
    fn new(id: &str, cost_usd: f64) -> Self {
        Self {
            id: id.to_string(),
            steps: None,
            guidance: None,
            safety_tolerance: None,
            image_size: None,
            image_prompt_strength: None,
            cost_usd,
        }
    }
}

/// The external models used per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Master Anchor text-to-image model.
    pub master: ModelSettings,
    /// Inpainting model for the variants.
    pub inpaint: ModelSettings,
    /// Segmentation model for the ROI mask.
    pub segment: ModelSettings,
    /// Image-to-video interpolation model.
    pub video: ModelSettings,
    /// Vision-language model for descriptions.
    pub vlm: ModelSettings,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            master: ModelSettings {
                steps: Some(28),
                guidance: Some(3.5),
                safety_tolerance: Some("6".to_string()),
                image_size: Some("landscape_16_9".to_string()),
                ..ModelSettings::new("fal-ai/flux-pro/v1.1-ultra", 0.06)
            },
            inpaint: ModelSettings {
                steps: Some(50),
                guidance: Some(20.0),
                safety_tolerance: Some("6".to_string()),
                ..ModelSettings::new("fal-ai/flux-pro/v1/fill", 0.05)
            },
            segment: ModelSettings::new("fal-ai/evf-sam", 0.01),
            video: ModelSettings {
                guidance: Some(0.5),
                ..ModelSettings::new("fal-ai/kling-video/v3/pro/image-to-video", 0.56)
            },
            vlm: ModelSettings::new("gpt-4o", 0.01),
        }
    }
}

/// Settings for the description schema check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionConfig {
    /// Case-insensitive regexes that flag identity-revealing text.
    #[serde(default = "default_identity_markers")]
    pub identity_markers: Vec<String>,
}

fn default_identity_markers() -> Vec<String> {
    [
        r"\b(man|woman|boy|girl|male|female)\b",
        r"\b(caucasian|asian|african|hispanic|latino|latina)\b",
        r"\b\d{1,2}[- ]year[- ]old\b",
        r"\btattoo(ed|s)?\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for DescriptionConfig {
    fn default() -> Self {
        Self {
            identity_markers: default_identity_markers(),
        }
    }
}

fn default_seed() -> u64 {
    1001
}

/// Complete read-only configuration for a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry budget and backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Outbound call budget.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Pixel-lock tolerance and mask bounds.
    #[serde(default)]
    pub pixel_lock: PixelLockConfig,
    /// Clip bounds and hints.
    #[serde(default)]
    pub video: VideoConfig,
    /// External models.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Description checks.
    #[serde(default)]
    pub description: DescriptionConfig,
    /// Path of the prompt registry file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PathBuf>,
    /// Seed for units that do not set one.
    #[serde(default = "default_seed")]
    pub default_seed: u64,
    /// Templates loaded from `prompts`.
    #[serde(skip)]
    pub registry: PromptRegistry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            pixel_lock: PixelLockConfig::default(),
            video: VideoConfig::default(),
            models: ModelsConfig::default(),
            description: DescriptionConfig::default(),
            prompts: None,
            default_seed: default_seed(),
            registry: PromptRegistry::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses TOML content without touching the filesystem.
    pub fn from_toml_str(content: &str) -> Result<Self, StimforgeError> {
        let config: Self =
            toml::from_str(content).map_err(|e| StimforgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file and the prompt registry it points to.
    ///
    /// A relative registry path is resolved against the config file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self, StimforgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StimforgeError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(prompts) = config.prompts.as_ref() {
            let resolved = match path.parent() {
                Some(dir) if prompts.is_relative() => dir.join(prompts),
                _ => prompts.clone(),
            };
            config.registry = PromptRegistry::load(&resolved)?;
        }
        Ok(config)
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the outbound concurrency budget.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.concurrency.max_in_flight = max_in_flight;
        self
    }

    /// Sets the prompt registry.
    #[must_use]
    pub fn with_registry(mut self, registry: PromptRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Checks value ranges and names.
    pub fn validate(&self) -> Result<(), StimforgeError> {
        let fail = |msg: String| Err(StimforgeError::Config(msg));

        if self.concurrency.max_in_flight == 0 {
            return fail("concurrency.max_in_flight must be at least 1".to_string());
        }
        if self.concurrency.call_timeout_secs == 0 {
            return fail("concurrency.call_timeout_secs must be at least 1".to_string());
        }
        for name in self.retry.per_stage.keys() {
            if name.parse::<StageId>().is_err() {
                return fail(format!("retry.per_stage: unknown stage '{name}'"));
            }
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return fail("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }

        let lock = &self.pixel_lock;
        if !(0.0..=1.0).contains(&lock.tolerance) {
            return fail(format!("pixel_lock.tolerance {} outside [0, 1]", lock.tolerance));
        }
        if !(0.0..=1.0).contains(&lock.min_mask_coverage)
            || !(0.0..=1.0).contains(&lock.max_mask_coverage)
            || lock.min_mask_coverage > lock.max_mask_coverage
        {
            return fail("pixel_lock mask coverage bounds must satisfy 0 <= min <= max <= 1".to_string());
        }

        if let Some(strength) = self.models.master.image_prompt_strength {
            if !(0.0..=1.0).contains(&strength) {
                return fail(format!("models.master.image_prompt_strength {strength} outside [0, 1]"));
            }
        }

        let video = &self.video;
        if video.min_duration_secs <= 0.0 || video.min_duration_secs > video.max_duration_secs {
            return fail("video duration bounds must satisfy 0 < min <= max".to_string());
        }
        if !(video.min_duration_secs..=video.max_duration_secs)
            .contains(&video.target_duration_secs)
        {
            return fail(format!(
                "video.target_duration_secs {} outside [{}, {}]",
                video.target_duration_secs, video.min_duration_secs, video.max_duration_secs
            ));
        }

        for pattern in &self.description.identity_markers {
            if let Err(e) = regex::Regex::new(pattern) {
                return fail(format!("description.identity_markers: {e}"));
            }
        }
        Ok(())
    }
}
