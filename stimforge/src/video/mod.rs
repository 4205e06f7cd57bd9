//! Keyframe-to-video interpolation.

use crate::config::PromptKey;
use crate::context::StageContext;
use crate::core::{Condition, Description, Keyframe, VideoClip};
use crate::errors::{GenerationError, StageError};
use crate::providers::VideoRequest;

/// Drives one interpolation call per condition and enforces the duration
/// bound on the returned clip.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoDriver;

impl VideoDriver {
    /// Creates a driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Interpolates `start -> end` for `condition`.
    ///
    /// `description` is the end-state description whose action drives the
    /// motion prompt. A clip whose reported duration falls outside
    /// `duration_range` is rejected with
    /// [`GenerationError::DurationOutOfRange`] and never stored.
    pub async fn interpolate(
        &self,
        ctx: &StageContext,
        start: &Keyframe,
        end: &Keyframe,
        condition: Condition,
        description: &Description,
        duration_range: (f64, f64),
    ) -> Result<VideoClip, StageError> {
        let video = &ctx.config().video;
        let (key, style_hint) = match condition {
            Condition::Pain => (PromptKey::VideoPain, video.pain_style_hint.clone()),
            Condition::Control => (PromptKey::VideoControl, video.control_style_hint.clone()),
        };
        let (min, max) = duration_range;
        let target = video.target_duration_secs.clamp(min, max);
        let rendered = ctx.config().registry.render(ctx.unit_id(), key, description);

        let model = ctx.config().models.video.clone();
        let request = VideoRequest {
            prompt: format!("{rendered} Motion: {style_hint}."),
            negative_prompt: video.negative_prompt.clone(),
            start_image: ctx.fetch(&start.artifact).await?,
            end_image: ctx.fetch(&end.artifact).await?,
            style_hint: style_hint.clone(),
            target_duration_secs: target,
            duration_range,
            aspect_ratio: video.aspect_ratio.clone(),
            seed: ctx.seed(),
            model: model.clone(),
        };

        let clip = ctx
            .admit(ctx.services().video.interpolate(request))
            .await
            .map_err(|e| e.into_generation())?;

        if !(min..=max).contains(&clip.duration_secs) {
            tracing::warn!(
                unit = ctx.unit_id(),
                condition = %condition,
                duration = clip.duration_secs,
                "Clip duration outside accepted range"
            );
            return Err(GenerationError::DurationOutOfRange {
                actual: clip.duration_secs,
                min,
                max,
            }
            .into());
        }
        if clip.bytes.is_empty() {
            return Err(GenerationError::InvalidResponse("empty video".to_string()).into());
        }

        let artifact = ctx.put(&condition.to_string(), "mp4", &clip.bytes).await?;
        Ok(VideoClip {
            condition,
            artifact,
            start: start.artifact.clone(),
            end: end.artifact.clone(),
            duration_secs: clip.duration_secs,
            style_hint,
            seed: ctx.seed(),
            model: model.id,
        })
    }
}
