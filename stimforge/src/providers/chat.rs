//! OpenAI-compatible chat completions client used as the VLM.

use super::fal::classify_status;
use super::{VisionLanguageModel, VlmRequest, VlmResponse};
use crate::errors::{ServiceError, StimforgeError, TransientError};
use crate::utils::image_data_uri;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Chat-completions VLM client.
#[derive(Debug, Clone)]
pub struct ChatVlmClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ChatVlmClient {
    /// Creates a client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StimforgeError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StimforgeError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    /// Creates a client from `VLM_API_KEY` and optional `VLM_BASE_URL`.
    pub fn from_env(timeout: Duration) -> Result<Self, StimforgeError> {
        let key = std::env::var("VLM_API_KEY")
            .map_err(|_| StimforgeError::Config("VLM_API_KEY is not set".to_string()))?;
        let base = std::env::var("VLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base, key, timeout)
    }
}

fn chat_body(request: &VlmRequest) -> Value {
    let mut content = Vec::new();
    if let Some(text) = &request.input_text {
        content.push(json!({ "type": "text", "text": text }));
    }
    if let Some(image) = &request.image {
        content.push(json!({
            "type": "image_url",
            "image_url": { "url": image_data_uri(image) },
        }));
    }
    json!({
        "model": request.model,
        "messages": [
            { "role": "system", "content": request.system_prompt },
            { "role": "user", "content": content },
        ],
        "response_format": { "type": "json_object" },
    })
}

fn parse_response(body: &str) -> Result<VlmResponse, ServiceError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::InvalidResponse("no choices".to_string()))?;

    let filtered = choice.finish_reason.as_deref() == Some("content_filter");
    match choice.message.refusal {
        Some(refusal) => Ok(VlmResponse {
            text: refusal,
            refused: true,
        }),
        None => Ok(VlmResponse {
            text: choice.message.content.unwrap_or_default(),
            refused: filtered,
        }),
    }
}

#[async_trait]
impl VisionLanguageModel for ChatVlmClient {
    async fn describe(&self, request: VlmRequest) -> Result<VlmResponse, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(model = %request.model, has_image = request.image.is_some(), "Calling VLM");

        let transport = |e: reqwest::Error| -> ServiceError {
            if e.is_timeout() {
                TransientError::Timeout(self.timeout).into()
            } else {
                TransientError::Unavailable(e.to_string()).into()
            }
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&chat_body(&request))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), text));
        }
        parse_response(&text)
    }
}
