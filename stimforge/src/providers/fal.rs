//! fal.ai client for image generation, inpainting, segmentation and video.

use super::{
    GeneratedImage, GeneratedVideo, ImageBackend, ImageRequest, SegmentRequest, VideoBackend,
    VideoRequest,
};
use crate::errors::{ServiceError, StimforgeError, TransientError};
use crate::utils::{decode_data_uri, image_data_uri};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const FAL_BASE_URL: &str = "https://fal.run";
const USER_AGENT: &str = concat!("stimforge/", env!("CARGO_PKG_VERSION"));

/// Synchronous fal.ai endpoint client.
#[derive(Debug, Clone)]
pub struct FalClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl FalClient {
    /// Creates a client with an explicit key.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, StimforgeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StimforgeError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: FAL_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    /// Creates a client from `FAL_KEY`.
    pub fn from_env(timeout: Duration) -> Result<Self, StimforgeError> {
        let key = std::env::var("FAL_KEY")
            .map_err(|_| StimforgeError::Config("FAL_KEY is not set".to_string()))?;
        Self::new(key, timeout)
    }

    /// Points the client at another endpoint root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn run(&self, model_id: &str, body: Value) -> Result<Value, ServiceError> {
        let url = format!("{}/{}", self.base_url, model_id);
        tracing::debug!(model = model_id, "Calling fal endpoint");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(&e))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), text));
        }
        serde_json::from_str(&text)
            .map_err(|e| ServiceError::InvalidResponse(format!("{model_id}: {e}")))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        if let Some(bytes) = decode_data_uri(url) {
            return Ok(bytes);
        }
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), format!("download {url}")));
        }
        let bytes = response.bytes().await.map_err(|e| self.transport_error(&e))?;
        Ok(bytes.to_vec())
    }

    fn transport_error(&self, error: &reqwest::Error) -> ServiceError {
        if error.is_timeout() {
            TransientError::Timeout(self.timeout).into()
        } else {
            TransientError::Unavailable(error.to_string()).into()
        }
    }
}

/// Maps an HTTP failure status onto the service error kinds.
pub(crate) fn classify_status(status: u16, message: String) -> ServiceError {
    match status {
        408 => TransientError::Unavailable(format!("408: {message}")).into(),
        429 => TransientError::RateLimited(message).into(),
        500..=599 => TransientError::Unavailable(format!("{status}: {message}")).into(),
        _ => ServiceError::Rejected { status, message },
    }
}

fn result_url<'a>(value: &'a Value, pointer: &str) -> Result<&'a str, ServiceError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::InvalidResponse(format!("missing {pointer}")))
}

fn nsfw_flagged(value: &Value) -> bool {
    value
        .pointer("/has_nsfw_concepts/0")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Clip length from the response, falling back to the requested length.
///
/// The fallback always lies inside the accepted range, so the duration
/// check cannot reject such a clip; that is logged.
fn reported_duration(value: &Value, requested: f64) -> f64 {
    let reported = match value.pointer("/video/duration").or_else(|| value.get("duration")) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    reported.unwrap_or_else(|| {
        tracing::warn!(
            requested,
            "Response carries no usable duration, assuming the requested one; duration check not enforced"
        );
        requested
    })
}

fn image_body(request: &ImageRequest) -> Value {
    let model = &request.model;
    let mut body = json!({
        "prompt": request.prompt,
        "seed": request.seed,
        "num_images": 1,
        "output_format": "png",
    });
    if let (Some(base), Some(mask)) = (&request.base_image, &request.mask) {
        body["image_url"] = json!(image_data_uri(base));
        body["mask_url"] = json!(image_data_uri(mask));
    } else {
        if let Some(size) = &model.image_size {
            body["image_size"] = json!(size);
        }
        if let Some(reference) = &request.image_prompt {
            body["image_url"] = json!(image_data_uri(reference));
            if let Some(strength) = model.image_prompt_strength {
                body["image_prompt_strength"] = json!(strength);
            }
        }
    }
    if let Some(steps) = model.steps {
        body["num_inference_steps"] = json!(steps);
    }
    if let Some(guidance) = model.guidance {
        body["guidance_scale"] = json!(guidance);
    }
    if let Some(tolerance) = &model.safety_tolerance {
        body["safety_tolerance"] = json!(tolerance);
    }
    body
}

fn video_body(request: &VideoRequest) -> Value {
    // Whole seconds, as a string.
    let duration = format!("{:.0}", request.target_duration_secs.round());
    let mut body = json!({
        "prompt": request.prompt,
        "start_image_url": image_data_uri(&request.start_image),
        "end_image_url": image_data_uri(&request.end_image),
        "duration": duration,
        "generate_audio": false,
        "aspect_ratio": request.aspect_ratio,
        "negative_prompt": request.negative_prompt,
        "seed": request.seed,
    });
    if let Some(cfg) = request.model.guidance {
        body["cfg_scale"] = json!(cfg);
    }
    body
}

#[async_trait]
impl ImageBackend for FalClient {
    async fn generate(&self, request: ImageRequest) -> Result<GeneratedImage, ServiceError> {
        let result = self.run(&request.model.id, image_body(&request)).await?;
        if nsfw_flagged(&result) {
            return Err(ServiceError::Refused("output flagged by safety checker".to_string()));
        }
        let url = result_url(&result, "/images/0/url")?;
        let bytes = self.download(url).await?;
        Ok(GeneratedImage {
            bytes,
            source_url: Some(url.to_string()),
        })
    }

    async fn segment(&self, request: SegmentRequest) -> Result<GeneratedImage, ServiceError> {
        let body = json!({
            "prompt": request.prompt,
            "image_url": image_data_uri(&request.image),
            "mask_only": true,
        });
        let result = self.run(&request.model.id, body).await?;
        let url = result_url(&result, "/image/url")?;
        let bytes = self.download(url).await?;
        Ok(GeneratedImage {
            bytes,
            source_url: Some(url.to_string()),
        })
    }
}

#[async_trait]
impl VideoBackend for FalClient {
    async fn interpolate(&self, request: VideoRequest) -> Result<GeneratedVideo, ServiceError> {
        let result = self.run(&request.model.id, video_body(&request)).await?;
        let url = result_url(&result, "/video/url")?;
        let duration_secs = reported_duration(&result, request.target_duration_secs);
        let bytes = self.download(url).await?;
        Ok(GeneratedVideo {
            bytes,
            duration_secs,
            source_url: Some(url.to_string()),
        })
    }
}
