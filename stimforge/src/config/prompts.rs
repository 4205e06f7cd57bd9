//! Read-only prompt template registry.
//!
//! Templates are keyed by stage purpose, with optional per-unit overrides:
//!
//! ```toml
//! [defaults]
//! master_anchor = "{description}, photorealistic"
//!
//! [units.S11]
//! video_pain = "The hammer strikes the thumb: {action}"
//! ```

use crate::core::Description;
use crate::errors::StimforgeError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Identifies a prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    /// System prompt for describing the Pain source image.
    DescribeMaster,
    /// Subtractive derivation of the Control end-state.
    DeriveControl,
    /// Subtractive derivation of the pre-interaction state.
    DeriveStart,
    /// Master Anchor generation prompt.
    MasterAnchor,
    /// Inpainting prompt for the start variant.
    StartVariant,
    /// Inpainting prompt for the control variant.
    ControlVariant,
    /// Pain interpolation prompt.
    VideoPain,
    /// Control interpolation prompt.
    VideoControl,
}

impl PromptKey {
    /// All keys.
    pub const ALL: [Self; 8] = [
        Self::DescribeMaster,
        Self::DeriveControl,
        Self::DeriveStart,
        Self::MasterAnchor,
        Self::StartVariant,
        Self::ControlVariant,
        Self::VideoPain,
        Self::VideoControl,
    ];

    /// Name used in the registry file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DescribeMaster => "describe_master",
            Self::DeriveControl => "derive_control",
            Self::DeriveStart => "derive_start",
            Self::MasterAnchor => "master_anchor",
            Self::StartVariant => "start_variant",
            Self::ControlVariant => "control_variant",
            Self::VideoPain => "video_pain",
            Self::VideoControl => "video_control",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Self::DescribeMaster => {
                "You describe experimental stimulus photographs. Isolate the action taking \
                 place, the affected anatomy and the causal object. Do not mention identity, \
                 age, gender, ethnicity, tattoos, jewellery, brands or any visible text. \
                 Respond with a JSON object with the string fields action, anatomy, object, \
                 scene and prompt, where prompt is a dense photographic description of the \
                 whole frame."
            }
            Self::DeriveControl => {
                "Rewrite the description you are given into its control state: remove the \
                 painful contact and its consequences, keep the scene, the subject's pose \
                 family and every object, and change as few words as possible. Respond with \
                 a JSON object with the same fields."
            }
            Self::DeriveStart => {
                "Rewrite the description you are given into its pre-interaction state: the \
                 object is prepared and in position but the action has not begun. Keep the \
                 scene and every object, and change as few words as possible. Respond with a \
                 JSON object with the same fields."
            }
            Self::MasterAnchor | Self::StartVariant | Self::ControlVariant => "{description}",
            Self::VideoPain | Self::VideoControl => {
                "{action}. Static camera, identical lighting and background throughout."
            }
        }
    }
}

impl fmt::Display for PromptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt templates loaded once at batch start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PromptRegistry {
    #[serde(default)]
    defaults: HashMap<String, String>,
    #[serde(default)]
    units: HashMap<String, HashMap<String, String>>,
}

impl PromptRegistry {
    /// Parses a registry and rejects unknown template keys.
    pub fn from_toml_str(content: &str) -> Result<Self, StimforgeError> {
        let registry: Self = toml::from_str(content)
            .map_err(|e| StimforgeError::Config(format!("prompt registry: {e}")))?;
        let known = |name: &String| PromptKey::ALL.iter().any(|k| k.as_str() == name);
        let keys = registry
            .defaults
            .keys()
            .chain(registry.units.values().flat_map(HashMap::keys));
        for key in keys {
            if !known(key) {
                return Err(StimforgeError::Config(format!(
                    "prompt registry: unknown template key '{key}'"
                )));
            }
        }
        Ok(registry)
    }

    /// Loads a registry file.
    pub fn load(path: &Path) -> Result<Self, StimforgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StimforgeError::Config(format!("cannot read prompt registry {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Sets a default template.
    #[must_use]
    pub fn with_default(mut self, key: PromptKey, template: impl Into<String>) -> Self {
        self.defaults.insert(key.as_str().to_string(), template.into());
        self
    }

    /// Sets a per-unit override.
    #[must_use]
    pub fn with_override(
        mut self,
        unit_id: impl Into<String>,
        key: PromptKey,
        template: impl Into<String>,
    ) -> Self {
        self.units
            .entry(unit_id.into())
            .or_default()
            .insert(key.as_str().to_string(), template.into());
        self
    }

    /// Resolves a template: unit override, then default, then built-in.
    #[must_use]
    pub fn template(&self, unit_id: &str, key: PromptKey) -> &str {
        self.units
            .get(unit_id)
            .and_then(|overrides| overrides.get(key.as_str()))
            .or_else(|| self.defaults.get(key.as_str()))
            .map_or_else(|| key.builtin(), String::as_str)
    }

    /// Resolves and renders a template against a description.
    #[must_use]
    pub fn render(&self, unit_id: &str, key: PromptKey, description: &Description) -> String {
        render_template(self.template(unit_id, key), description)
    }
}

fn placeholder<'a>(description: &'a Description, name: &str) -> Option<&'a str> {
    match name {
        "description" => Some(&description.prompt),
        "action" => Some(&description.action),
        "anatomy" => Some(&description.anatomy),
        "object" => Some(&description.object),
        "scene" => Some(&description.scene),
        _ => None,
    }
}

/// Substitutes `{name}` placeholders in one pass; unknown ones stay verbatim.
#[must_use]
pub fn render_template(template: &str, description: &Description) -> String {
    let mut out = String::with_capacity(template.len() + description.prompt.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('}') {
            Some(close) => {
                let name = &tail[1..close];
                match placeholder(description, name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..=close]),
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
