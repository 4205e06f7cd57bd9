//! Anchored keyframe synthesis.
//!
//! The Master Anchor (`t_end_P`) is generated first and fixes background,
//! lighting and subject. The `t_start` and `t_end_C` keyframes are inpainted
//! from it through the ROI mask, and each is rejected unless the pixels
//! outside the mask still match the master within tolerance.

pub mod pixel_lock;

use crate::config::PromptKey;
use crate::context::StageContext;
use crate::core::{Anchor, Description, DescriptionSet, Keyframe, MaskSource, RoiMask, SourcePair};
use crate::errors::{ConsistencyError, DerivationError, StageError};
use crate::providers::{ImageRequest, SegmentRequest};
use pixel_lock::{check_pixel_lock, decode_mask, decode_rgb, validate_mask};

/// Generates the Master Anchor and its inpainted variants.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyframeSynthesizer;

impl KeyframeSynthesizer {
    /// Creates a synthesizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generates the Master Anchor from the `t_end_P` description.
    ///
    /// With `image_prompt_strength` set on the master model, the Pain source
    /// photo conditions the generation as an image prompt.
    pub async fn generate_master(
        &self,
        ctx: &StageContext,
        descriptions: &DescriptionSet,
        source: &SourcePair,
    ) -> Result<Keyframe, StageError> {
        let model = ctx.config().models.master.clone();
        let image_prompt = match model.image_prompt_strength {
            Some(_) => Some(
                ctx.fetch(&source.pain)
                    .await
                    .map_err(|e| DerivationError::SourceUnavailable(format!("{}: {e}", source.pain)))?,
            ),
            None => None,
        };
        let request = ImageRequest {
            prompt: ctx
                .config()
                .registry
                .render(ctx.unit_id(), PromptKey::MasterAnchor, &descriptions.end_pain),
            seed: ctx.seed(),
            image_prompt,
            base_image: None,
            mask: None,
            model: model.clone(),
        };
        let image = ctx
            .admit(ctx.services().images.generate(request))
            .await
            .map_err(|e| e.into_generation())?;
        decode_rgb(&image.bytes, "master anchor")?;

        let artifact = ctx.put("master", "png", &image.bytes).await?;
        tracing::info!(unit = ctx.unit_id(), seed = ctx.seed(), artifact = %artifact, "Master anchor generated");
        Ok(Keyframe::master(artifact, ctx.seed(), model.id))
    }

    /// Obtains the ROI mask over `master` and checks its size and coverage.
    pub async fn resolve_mask(
        &self,
        ctx: &StageContext,
        master: &Keyframe,
        source: &MaskSource,
    ) -> Result<RoiMask, StageError> {
        let master_bytes = ctx.fetch(&master.artifact).await?;
        let master_dimensions = decode_rgb(&master_bytes, "master anchor")?.dimensions();

        let (bytes, supplied) = match source {
            MaskSource::Supplied { mask } => {
                let bytes = ctx
                    .fetch(mask)
                    .await
                    .map_err(|e| ConsistencyError::MaskUnavailable(format!("{mask}: {e}")))?;
                (bytes, true)
            }
            MaskSource::Segment { prompt } => {
                let request = SegmentRequest {
                    model: ctx.config().models.segment.clone(),
                    image: master_bytes,
                    prompt: prompt.clone(),
                };
                let image = ctx
                    .admit(ctx.services().images.segment(request))
                    .await
                    .map_err(|e| e.into_generation())?;
                (image.bytes, false)
            }
        };

        let mask = decode_mask(&bytes)?;
        let coverage = validate_mask(&mask, master_dimensions, &ctx.config().pixel_lock)?;
        let artifact = ctx.put("mask", "png", &bytes).await?;
        tracing::debug!(unit = ctx.unit_id(), coverage, supplied, "ROI mask resolved");

        Ok(RoiMask {
            artifact,
            width: mask.width(),
            height: mask.height(),
            coverage,
            supplied,
        })
    }

    /// Inpaints the `anchor` keyframe from the master and enforces the
    /// pixel lock. Nothing is stored for a rejected variant.
    pub async fn variant(
        &self,
        ctx: &StageContext,
        anchor: Anchor,
        master: &Keyframe,
        mask: &RoiMask,
        description: &Description,
    ) -> Result<Keyframe, StageError> {
        let key = match anchor {
            Anchor::Start => PromptKey::StartVariant,
            _ => PromptKey::ControlVariant,
        };
        let master_bytes = ctx.fetch(&master.artifact).await?;
        let mask_bytes = ctx.fetch(&mask.artifact).await?;
        let master_image = decode_rgb(&master_bytes, "master anchor")?;
        let mask_image = decode_mask(&mask_bytes)?;

        let model = ctx.config().models.inpaint.clone();
        let request = ImageRequest {
            prompt: ctx.config().registry.render(ctx.unit_id(), key, description),
            seed: ctx.seed(),
            image_prompt: None,
            base_image: Some(master_bytes),
            mask: Some(mask_bytes),
            model: model.clone(),
        };
        let image = ctx
            .admit(ctx.services().images.generate(request))
            .await
            .map_err(|e| e.into_generation())?;

        let difference = check_pixel_lock(
            anchor,
            &master_image,
            &image.bytes,
            &mask_image,
            &ctx.config().pixel_lock,
        )?;

        let label = match anchor {
            Anchor::Start => "start",
            _ => "control",
        };
        let artifact = ctx.put(label, "png", &image.bytes).await?;
        tracing::info!(
            unit = ctx.unit_id(),
            anchor = %anchor,
            difference,
            "Variant passed pixel lock"
        );
        Ok(Keyframe::variant(
            anchor,
            artifact,
            master,
            mask,
            ctx.seed(),
            model.id,
            difference,
        ))
    }
}
