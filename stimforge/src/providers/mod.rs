//! External service boundaries.
//!
//! Every generative service is a stateless request/response function behind
//! one of these traits. Implementations never retry, sleep or throttle;
//! admission, timeouts and retries belong to the orchestrator.

#[cfg(feature = "http")]
mod chat;
#[cfg(feature = "http")]
mod fal;

#[cfg(feature = "http")]
pub use chat::ChatVlmClient;
#[cfg(feature = "http")]
pub use fal::FalClient;

use crate::config::ModelSettings;
use crate::errors::ServiceError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A vision-language model call.
#[derive(Debug, Clone, PartialEq)]
pub struct VlmRequest {
    /// Model identifier.
    pub model: String,
    /// System prompt rendered from the registry.
    pub system_prompt: String,
    /// Image to describe, if any.
    pub image: Option<Vec<u8>>,
    /// Text to transform, if any.
    pub input_text: Option<String>,
}

/// What the VLM returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VlmResponse {
    /// Structured description text.
    pub text: String,
    /// The provider refused the content.
    pub refused: bool,
}

/// An image generation or inpainting call.
///
/// With `base_image` and `mask` set this is an inpainting call that may only
/// modify masked pixels; without them it is text-to-image, optionally
/// conditioned on `image_prompt`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    /// Model and parameters.
    pub model: ModelSettings,
    /// Generation prompt.
    pub prompt: String,
    /// Seed.
    pub seed: u64,
    /// Reference image conditioning a text-to-image call.
    pub image_prompt: Option<Vec<u8>>,
    /// Image to inpaint.
    pub base_image: Option<Vec<u8>>,
    /// Mask over `base_image`; white pixels are regenerated.
    pub mask: Option<Vec<u8>>,
}

impl ImageRequest {
    /// Returns true for inpainting requests.
    #[must_use]
    pub fn is_inpainting(&self) -> bool {
        self.base_image.is_some() && self.mask.is_some()
    }
}

/// A segmentation call producing an ROI mask.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    /// Model and parameters.
    pub model: ModelSettings,
    /// Image to segment.
    pub image: Vec<u8>,
    /// Text naming the region.
    pub prompt: String,
}

/// Image bytes returned by a service.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct GeneratedImage {
    /// Encoded image.
    pub bytes: Vec<u8>,
    /// Where the service published the result, if anywhere.
    pub source_url: Option<String>,
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("bytes", &self.bytes.len())
            .field("source_url", &self.source_url)
            .finish()
    }
}

/// An image-to-video interpolation call.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRequest {
    /// Model and parameters.
    pub model: ModelSettings,
    /// Motion prompt, including the style hint.
    pub prompt: String,
    /// Negative prompt.
    pub negative_prompt: String,
    /// First frame.
    pub start_image: Vec<u8>,
    /// Last frame.
    pub end_image: Vec<u8>,
    /// Motion-style hint.
    pub style_hint: String,
    /// Requested duration.
    pub target_duration_secs: f64,
    /// Accepted duration range.
    pub duration_range: (f64, f64),
    /// Output aspect ratio.
    pub aspect_ratio: String,
    /// Seed.
    pub seed: u64,
}

/// Video bytes returned by a service.
#[derive(Clone, PartialEq, Default)]
pub struct GeneratedVideo {
    /// Encoded video.
    pub bytes: Vec<u8>,
    /// Duration reported by the service.
    pub duration_secs: f64,
    /// Where the service published the result, if anywhere.
    pub source_url: Option<String>,
}

impl fmt::Debug for GeneratedVideo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedVideo")
            .field("bytes", &self.bytes.len())
            .field("duration_secs", &self.duration_secs)
            .field("source_url", &self.source_url)
            .finish()
    }
}

/// Vision-language model used for description extraction and derivation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionLanguageModel: Send + Sync {
    /// Runs one VLM call.
    async fn describe(&self, request: VlmRequest) -> Result<VlmResponse, ServiceError>;
}

/// Text-to-image, inpainting and segmentation backend.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Generates or inpaints one image.
    async fn generate(&self, request: ImageRequest) -> Result<GeneratedImage, ServiceError>;

    /// Produces a binary mask for the region named in the request.
    async fn segment(&self, request: SegmentRequest) -> Result<GeneratedImage, ServiceError>;
}

/// Keyframe-to-video interpolation backend.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    /// Interpolates between two keyframes.
    async fn interpolate(&self, request: VideoRequest) -> Result<GeneratedVideo, ServiceError>;
}

/// The external collaborators of a batch.
#[derive(Clone)]
pub struct Services {
    /// Description model.
    pub vlm: Arc<dyn VisionLanguageModel>,
    /// Image backend.
    pub images: Arc<dyn ImageBackend>,
    /// Video backend.
    pub video: Arc<dyn VideoBackend>,
}

impl Services {
    /// Bundles the three backends.
    pub fn new(
        vlm: Arc<dyn VisionLanguageModel>,
        images: Arc<dyn ImageBackend>,
        video: Arc<dyn VideoBackend>,
    ) -> Self {
        Self { vlm, images, video }
    }

    /// Builds the HTTP clients from environment credentials.
    #[cfg(feature = "http")]
    pub fn from_env(call_timeout: std::time::Duration) -> Result<Self, crate::errors::StimforgeError> {
        let fal = Arc::new(FalClient::from_env(call_timeout)?);
        let vlm = Arc::new(ChatVlmClient::from_env(call_timeout)?);
        Ok(Self::new(vlm, fal.clone(), fal))
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
