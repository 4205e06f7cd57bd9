//! Description derivation.
//!
//! The Pain source image is described once to obtain the master description
//! (`t_end_P`). The `t_start` and `t_end_C` descriptions are subtractive
//! rewrites of that text: the VLM receives the master description as input
//! and never sees the Control source image.

use crate::config::{DescriptionConfig, PromptKey};
use crate::context::StageContext;
use crate::core::{Anchor, Description, DescriptionSet, SourcePair};
use crate::errors::{DerivationError, StageError, StimforgeError};
use crate::providers::{VlmRequest, VlmResponse};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Wire shape of a description exchanged with the VLM.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DescriptionPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    anatomy: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    scene: String,
    #[serde(default)]
    prompt: String,
}

impl From<&Description> for DescriptionPayload {
    fn from(d: &Description) -> Self {
        Self {
            action: d.action.clone(),
            anatomy: d.anatomy.clone(),
            object: d.object.clone(),
            scene: d.scene.clone(),
            prompt: d.prompt.clone(),
        }
    }
}

/// Turns a source pair into the three descriptions of a unit.
#[derive(Debug, Clone)]
pub struct DescriptionEngine {
    identity_markers: Vec<Regex>,
}

impl DescriptionEngine {
    /// Compiles the identity-marker patterns (case-insensitive).
    pub fn new(config: &DescriptionConfig) -> Result<Self, StimforgeError> {
        let identity_markers = config
            .identity_markers
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){pattern}")).map_err(|e| {
                    StimforgeError::Config(format!("invalid identity marker '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { identity_markers })
    }

    /// Derives `(t_start, t_end_P, t_end_C)` for a unit.
    ///
    /// Exactly one call sees an image (the Pain source). The two derivation
    /// calls run concurrently once the master description is accepted.
    pub async fn derive(&self, ctx: &StageContext, source: &SourcePair) -> Result<DescriptionSet, StageError> {
        let pain_image = ctx
            .fetch(&source.pain)
            .await
            .map_err(|e| DerivationError::SourceUnavailable(format!("{}: {e}", source.pain)))?;

        let model = ctx.config().models.vlm.id.clone();
        let request = VlmRequest {
            model: model.clone(),
            system_prompt: ctx
                .config()
                .registry
                .template(ctx.unit_id(), PromptKey::DescribeMaster)
                .to_string(),
            image: Some(pain_image),
            input_text: None,
        };
        let response = ctx
            .admit(ctx.services().vlm.describe(request))
            .await
            .map_err(|e| e.into_derivation(Anchor::EndPain))?;
        let end_pain = self.accept(Anchor::EndPain, &response, None)?;
        tracing::debug!(unit = ctx.unit_id(), action = %end_pain.action, "Master description accepted");

        let master_json = serde_json::to_string(&DescriptionPayload::from(&end_pain))
            .map_err(|e| DerivationError::Schema {
                anchor: Anchor::EndPain,
                message: e.to_string(),
            })?;

        let (start, end_control) = futures::try_join!(
            self.derive_from_master(ctx, &model, &end_pain, &master_json, Anchor::Start),
            self.derive_from_master(ctx, &model, &end_pain, &master_json, Anchor::EndControl),
        )?;

        Ok(DescriptionSet {
            start,
            end_pain,
            end_control,
        })
    }

    async fn derive_from_master(
        &self,
        ctx: &StageContext,
        model: &str,
        master: &Description,
        master_json: &str,
        anchor: Anchor,
    ) -> Result<Description, StageError> {
        let key = match anchor {
            Anchor::Start => PromptKey::DeriveStart,
            _ => PromptKey::DeriveControl,
        };
        let request = VlmRequest {
            model: model.to_string(),
            system_prompt: ctx.config().registry.render(ctx.unit_id(), key, master),
            image: None,
            input_text: Some(master_json.to_string()),
        };
        let response = ctx
            .admit(ctx.services().vlm.describe(request))
            .await
            .map_err(|e| e.into_derivation(anchor))?;
        self.accept(anchor, &response, Some(Anchor::EndPain))
            .map_err(StageError::from)
    }

    /// Parses and checks one VLM response.
    fn accept(
        &self,
        anchor: Anchor,
        response: &VlmResponse,
        derived_from: Option<Anchor>,
    ) -> Result<Description, DerivationError> {
        if response.refused {
            return Err(DerivationError::Refused {
                anchor,
                message: response.text.clone(),
            });
        }
        let body = strip_code_fence(&response.text);
        if body.is_empty() {
            return Err(DerivationError::EmptyOutput { anchor });
        }

        let payload: DescriptionPayload =
            serde_json::from_str(body).map_err(|e| DerivationError::Schema {
                anchor,
                message: format!("not a description object: {e}"),
            })?;
        let description = Description {
            anchor,
            action: payload.action.trim().to_string(),
            anatomy: payload.anatomy.trim().to_string(),
            object: payload.object.trim().to_string(),
            scene: payload.scene.trim().to_string(),
            prompt: payload.prompt.trim().to_string(),
            derived_from,
        };
        self.check(&description)?;
        Ok(description)
    }

    /// Schema check: non-empty action and prompt, no identity markers.
    fn check(&self, description: &Description) -> Result<(), DerivationError> {
        let anchor = description.anchor;
        if description.action.is_empty() {
            return Err(DerivationError::Schema {
                anchor,
                message: "empty action field".to_string(),
            });
        }
        if description.prompt.is_empty() {
            return Err(DerivationError::Schema {
                anchor,
                message: "empty prompt field".to_string(),
            });
        }

        let fields = [
            &description.action,
            &description.anatomy,
            &description.object,
            &description.scene,
            &description.prompt,
        ];
        for field in fields {
            for marker in &self.identity_markers {
                if let Some(found) = marker.find(field) {
                    return Err(DerivationError::IdentityMarker {
                        anchor,
                        marker: found.as_str().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Removes a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
