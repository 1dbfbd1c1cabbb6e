use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;

use super::cameras::PickedCamera;
use super::snapshot::SnapshotSource;
use crate::config::VisionConfig;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::retry::BackoffPolicy;

pub const FLOODING_OBJECT: &str = "alagamento";
pub const CONFIDENCE: f64 = 0.7;

#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Whether the image shows flooding.
    async fn detect_flooding(&self, image_base64: &str) -> FlowResult<bool>;
}

/// A picked camera with its frame and raw classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedCamera {
    pub camera: PickedCamera,
    pub image_base64: Option<String>,
    /// `None` when the camera should have been classified but no frame was
    /// available or the model could not answer.
    pub label: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiClassification {
    pub object: String,
    pub label: bool,
    pub confidence: f64,
}

impl AiClassification {
    pub fn flooding(label: bool) -> Self {
        Self {
            object: FLOODING_OBJECT.to_string(),
            label,
            confidence: CONFIDENCE,
        }
    }
}

/// Extracts `flooding_detected` from a model reply, which may be wrapped in a
/// ```` ```json ```` fence.
pub fn parse_flooding_reply(reply: &str) -> FlowResult<bool> {
    let body = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value = serde_json::from_str(body).map_err(|err| {
        FlowError::payload("vision model", format!("reply is not JSON ({err}): {reply}"))
    })?;
    value
        .get("flooding_detected")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            FlowError::payload("vision model", format!("no `flooding_detected` in {body}"))
        })
}

/// Gemini `generateContent` over REST.
#[derive(Debug, Clone)]
pub struct GeminiVisionClient {
    http: reqwest::Client,
    api_key: String,
    config: VisionConfig,
}

impl GeminiVisionClient {
    pub fn new(http: reqwest::Client, api_key: String, config: VisionConfig) -> Self {
        Self {
            http,
            api_key,
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.api_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn request_body(&self, image_base64: &str) -> Value {
        json!({
            "contents": [{
                "parts": [
                    {"text": self.config.prompt},
                    {"inline_data": {"mime_type": "image/jpeg", "data": image_base64}}
                ]
            }],
            "generationConfig": {
                "maxOutputTokens": self.config.max_output_tokens,
                "temperature": self.config.temperature,
                "topP": self.config.top_p,
                "topK": self.config.top_k
            }
        })
    }
}

/// Concatenated text parts of the first candidate.
fn reply_text(response: &Value) -> Option<String> {
    let parts = response
        .pointer("/candidates/0/content/parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl VisionClient for GeminiVisionClient {
    async fn detect_flooding(&self, image_base64: &str) -> FlowResult<bool> {
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&self.request_body(image_base64))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FlowError::Api {
                service: "gemini",
                status: status.as_u16(),
                message: body,
            });
        }
        let value: Value = serde_json::from_str(&body)?;
        let text = reply_text(&value).ok_or_else(|| {
            FlowError::payload("vision model", format!("no text in reply: {body}"))
        })?;
        parse_flooding_reply(&text)
    }
}

/// Default retry for one classification call: three attempts one second apart.
pub fn default_classification_retry() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), 1.0, 3)
}

/// Takes a frame and classifies one camera.
///
/// Cameras not worth classifying get `false` without a model call. A camera
/// whose frame could not be taken, or whose classification kept failing, gets
/// no label.
pub async fn classify_camera(
    camera: PickedCamera,
    snapshots: &dyn SnapshotSource,
    vision: &dyn VisionClient,
    retry: &BackoffPolicy,
) -> ClassifiedCamera {
    let image_base64 = snapshots.snapshot(&camera.url_camera).await;
    if !camera.attempt_classification {
        return ClassifiedCamera {
            camera,
            image_base64,
            label: Some(false),
        };
    }
    let Some(image) = image_base64.as_deref() else {
        return ClassifiedCamera {
            camera,
            image_base64,
            label: None,
        };
    };

    let attempts = retry.max_retries.max(1);
    let mut label = None;
    for attempt in 0..attempts {
        match vision.detect_flooding(image).await {
            Ok(detected) => {
                info!("Successfully got prediction for camera {}: {detected}", camera.id_camera);
                label = Some(detected);
                break;
            }
            Err(err) => {
                warn!(
                    "Prediction for camera {} failed (attempt {}/{attempts}): {err}",
                    camera.id_camera,
                    attempt + 1
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
            }
        }
    }

    ClassifiedCamera {
        camera,
        image_base64,
        label,
    }
}
