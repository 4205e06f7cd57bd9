//! Scripted service fakes.
//!
//! Each fake succeeds by default. Tests queue outcomes against a key; a
//! call consumes the first queued outcome whose key occurs in the request
//! (system prompt, image prompt or style hint).

use super::fixtures::descriptions;
use super::images::{drift_png, gradient_png, mask_png, paint_roi};
use crate::core::Description;
use crate::errors::{ServiceError, TransientError};
use crate::providers::{
    GeneratedImage, GeneratedVideo, ImageBackend, ImageRequest, SegmentRequest, VideoBackend,
    VideoRequest, VisionLanguageModel, VlmRequest, VlmResponse,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Width of every generated image.
pub const FRAME_WIDTH: u32 = 32;
/// Height of every generated image.
pub const FRAME_HEIGHT: u32 = 18;
/// ROI returned by segmentation.
pub const FRAME_ROI: (u32, u32, u32, u32) = (8, 4, 16, 10);

/// Counts calls across every fake and tracks how many overlap.
#[derive(Debug, Default)]
pub struct Probe {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Probe {
    async fn observe(&self, latency: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Total external calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Scripts<T> {
    queues: Mutex<Vec<(String, VecDeque<T>)>>,
}

impl<T> Default for Scripts<T> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Scripts<T> {
    fn push(&self, key: &str, outcomes: impl IntoIterator<Item = T>) {
        self.queues
            .lock()
            .push((key.to_string(), outcomes.into_iter().collect()));
    }

    fn next(&self, haystack: &str) -> Option<T> {
        self.queues
            .lock()
            .iter_mut()
            .filter(|(key, queue)| haystack.contains(key.as_str()) && !queue.is_empty())
            .find_map(|(_, queue)| queue.pop_front())
    }
}

fn outage() -> ServiceError {
    TransientError::Unavailable("scripted outage".to_string()).into()
}

fn rejection() -> ServiceError {
    ServiceError::Rejected {
        status: 422,
        message: "scripted rejection".to_string(),
    }
}

/// Scripted VLM outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlmScript {
    /// Transient failure.
    Transient,
    /// Content refusal.
    Refuse,
    /// Empty text.
    Empty,
}

/// A VLM that answers with [`descriptions`], picking the anchor from the
/// system prompt.
#[derive(Debug)]
pub struct FakeVlm {
    probe: Arc<Probe>,
    latency: Duration,
    scripts: Scripts<VlmScript>,
    requests: Mutex<Vec<VlmRequest>>,
}

impl FakeVlm {
    /// Creates a fake reporting to `probe`.
    pub fn new(probe: Arc<Probe>, latency: Duration) -> Self {
        Self {
            probe,
            latency,
            scripts: Scripts::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues outcomes for calls whose system prompt contains `key`.
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = VlmScript>) {
        self.scripts.push(key, outcomes);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<VlmRequest> {
        self.requests.lock().clone()
    }
}

fn payload(description: &Description) -> String {
    serde_json::json!({
        "action": description.action,
        "anatomy": description.anatomy,
        "object": description.object,
        "scene": description.scene,
        "prompt": description.prompt,
    })
    .to_string()
}

#[async_trait]
impl VisionLanguageModel for FakeVlm {
    async fn describe(&self, request: VlmRequest) -> Result<VlmResponse, ServiceError> {
        self.requests.lock().push(request.clone());
        self.probe.observe(self.latency).await;

        match self.scripts.next(&request.system_prompt) {
            Some(VlmScript::Transient) => return Err(outage()),
            Some(VlmScript::Refuse) => {
                return Ok(VlmResponse {
                    text: "refused".to_string(),
                    refused: true,
                })
            }
            Some(VlmScript::Empty) => return Ok(VlmResponse::default()),
            None => {}
        }

        let set = descriptions();
        let text = if request.system_prompt.contains("pre-interaction") {
            payload(&set.start)
        } else if request.system_prompt.contains("control state") {
            payload(&set.end_control)
        } else {
            payload(&set.end_pain)
        };
        Ok(VlmResponse {
            text,
            refused: false,
        })
    }
}

/// Scripted image outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageScript {
    /// Inpaint only the masked pixels.
    Clean,
    /// Inpaint, then disturb every pixel.
    Drift,
    /// Transient failure.
    Transient,
    /// Non-retryable rejection.
    Rejected,
}

/// Image backend producing deterministic frames of a fixed size.
#[derive(Debug)]
pub struct FakeImages {
    probe: Arc<Probe>,
    latency: Duration,
    scripts: Scripts<ImageScript>,
    requests: Mutex<Vec<ImageRequest>>,
    segments: AtomicUsize,
}

impl FakeImages {
    /// Creates a fake reporting to `probe`.
    pub fn new(probe: Arc<Probe>, latency: Duration) -> Self {
        Self {
            probe,
            latency,
            scripts: Scripts::default(),
            requests: Mutex::new(Vec::new()),
            segments: AtomicUsize::new(0),
        }
    }

    /// Queues outcomes for calls whose prompt contains `key`.
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = ImageScript>) {
        self.scripts.push(key, outcomes);
    }

    /// Generation and inpainting requests received so far.
    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().clone()
    }

    /// Segmentation calls made.
    pub fn segment_calls(&self) -> usize {
        self.segments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBackend for FakeImages {
    async fn generate(&self, request: ImageRequest) -> Result<GeneratedImage, ServiceError> {
        self.requests.lock().push(request.clone());
        self.probe.observe(self.latency).await;

        let script = self.scripts.next(&request.prompt).unwrap_or(ImageScript::Clean);
        let bytes = match (script, &request.base_image, &request.mask) {
            (ImageScript::Transient, _, _) => return Err(outage()),
            (ImageScript::Rejected, _, _) => return Err(rejection()),
            (_, Some(base), Some(mask)) => {
                let colour = [(request.seed % 251) as u8, 40, 200];
                let painted = paint_roi(base, mask, colour);
                if script == ImageScript::Drift {
                    drift_png(&painted, 60)
                } else {
                    painted
                }
            }
            _ => gradient_png(FRAME_WIDTH, FRAME_HEIGHT, request.seed),
        };
        Ok(GeneratedImage {
            bytes,
            source_url: None,
        })
    }

    async fn segment(&self, request: SegmentRequest) -> Result<GeneratedImage, ServiceError> {
        self.segments.fetch_add(1, Ordering::SeqCst);
        self.probe.observe(self.latency).await;

        match self.scripts.next(&request.prompt) {
            Some(ImageScript::Transient) => Err(outage()),
            Some(ImageScript::Rejected) => Err(rejection()),
            _ => Ok(GeneratedImage {
                bytes: mask_png(FRAME_WIDTH, FRAME_HEIGHT, FRAME_ROI),
                source_url: None,
            }),
        }
    }
}

/// Scripted video outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VideoScript {
    /// Succeed with this reported duration.
    Duration(f64),
    /// Transient failure.
    Transient,
}

/// Video backend returning placeholder bytes.
#[derive(Debug)]
pub struct FakeVideo {
    probe: Arc<Probe>,
    latency: Duration,
    scripts: Scripts<VideoScript>,
    requests: Mutex<Vec<VideoRequest>>,
}

impl FakeVideo {
    /// Creates a fake reporting to `probe`.
    pub fn new(probe: Arc<Probe>, latency: Duration) -> Self {
        Self {
            probe,
            latency,
            scripts: Scripts::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues outcomes for calls whose style hint contains `key`.
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = VideoScript>) {
        self.scripts.push(key, outcomes);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<VideoRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl VideoBackend for FakeVideo {
    async fn interpolate(&self, request: VideoRequest) -> Result<GeneratedVideo, ServiceError> {
        self.requests.lock().push(request.clone());
        self.probe.observe(self.latency).await;

        let duration_secs = match self.scripts.next(&request.style_hint) {
            Some(VideoScript::Transient) => return Err(outage()),
            Some(VideoScript::Duration(d)) => d,
            None => request.target_duration_secs,
        };
        Ok(GeneratedVideo {
            bytes: format!("mp4:{}:{}", request.style_hint, request.seed).into_bytes(),
            duration_secs,
            source_url: None,
        })
    }
}
