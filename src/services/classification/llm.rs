// Banner text classifier served by a fine-tuned LLM behind an
// OpenAI-compatible chat completions endpoint, using Structured Outputs

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::labels::LabelSet;
use super::TextClassifier;
use crate::core::config::ClassifierConfig;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::core::types::Classification;
use crate::middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

const MAX_RETRIES: u32 = 1;
const RETRY_DELAY_MS: u64 = 250;
const MAX_COMPLETION_TOKENS: u32 = 64;

pub struct LlmBannerClassifier {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    labels: LabelSet,
    breaker: CircuitBreaker,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct JsonSchema {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchema,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_completion_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Structured output schema for one classification
#[derive(Debug, Deserialize)]
struct LabelResponse {
    label: String,
    confidence: f32,
}

impl LlmBannerClassifier {
    pub fn new(config: &ClassifierConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(8)
            .build()
            .context("Failed to create classifier HTTP client")?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            labels: LabelSet::from_config(config),
            breaker: CircuitBreaker::with_config(CircuitBreakerConfig::from(config)),
        })
    }

    fn build_label_schema(labels: &LabelSet) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "enum": labels.names(),
                    "description": "Category of the banner text"
                },
                "confidence": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0
                }
            },
            "required": ["label", "confidence"],
            "additionalProperties": false
        })
    }

    fn build_request(&self, text: &str) -> ChatCompletionRequest {
        let system_prompt = format!(
            "You classify text found on street banners and signs. \
             Answer with exactly one of these labels: {}. \
             Return the label and your confidence in the JSON format specified.",
            self.labels.names().join(", ")
        );

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text.to_string(),
                },
            ],
            stream: false,
            max_completion_tokens: MAX_COMPLETION_TOKENS,
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchema {
                    name: "banner_label",
                    strict: true,
                    schema: Self::build_label_schema(&self.labels),
                },
            },
        }
    }

    async fn send(&self, request: &ChatCompletionRequest) -> ClassificationResult<ChatCompletionResponse> {
        let mut attempt = 0;
        loop {
            let mut builder = self.http_client.post(&self.endpoint).json(request);
            if let Some(ref key) = self.api_key {
                builder = builder.bearer_auth(key);
            }

            let error = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<ChatCompletionResponse>()
                            .await
                            .map_err(|e| ClassificationError::InvalidResponse(e.to_string()));
                    }
                    let body = response.text().await.unwrap_or_default();
                    ClassificationError::HttpStatus {
                        status: status.as_u16(),
                        body,
                    }
                }
                Err(e) => ClassificationError::RequestFailed(e),
            };

            let retryable = match &error {
                ClassificationError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
                ClassificationError::RequestFailed(e) => e.is_timeout() || e.is_connect(),
                _ => false,
            };
            if !retryable || attempt >= MAX_RETRIES {
                return Err(error);
            }

            attempt += 1;
            warn!("Classifier: retry {} after error: {}", attempt, error);
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
        }
    }
}

/// Parse the structured content of a completion and check the label
fn parse_classification(content: &str, labels: &LabelSet) -> ClassificationResult<Classification> {
    let parsed: LabelResponse = serde_json::from_str(content.trim())
        .map_err(|e| ClassificationError::InvalidResponse(format!("{}: {}", e, content)))?;

    let label = parsed.label.trim();
    if !labels.contains(label) {
        return Err(ClassificationError::UnknownLabel(label.to_string()));
    }
    if !parsed.confidence.is_finite() {
        return Err(ClassificationError::InvalidResponse(format!(
            "confidence is not a number: {}",
            parsed.confidence
        )));
    }

    Ok(Classification::new(label, parsed.confidence))
}

#[async_trait]
impl TextClassifier for LlmBannerClassifier {
    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.breaker.stats())
    }

    async fn classify_text(&self, text: &str) -> ClassificationResult<Classification> {
        // Dropping this future before an outcome releases the half-open probe slot
        let Some(permit) = self.breaker.allow_request() else {
            return Err(ClassificationError::CircuitOpen);
        };

        let start = Instant::now();
        let request = self.build_request(text);

        let outcome = self.send(&request).await.and_then(|response| {
            let content = response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ClassificationError::InvalidResponse("no message content".to_string()))?;
            parse_classification(&content, &self.labels)
        });

        // Transport and protocol failures count against the endpoint; a bad label does not
        match &outcome {
            Ok(_) | Err(ClassificationError::UnknownLabel(_)) => permit.record_success(),
            Err(_) => permit.record_failure(),
        }

        if let Ok(ref classification) = outcome {
            debug!(
                "Classifier: '{}' → {} ({:.2}) in {:.0}ms",
                text,
                classification.label,
                classification.confidence,
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        outcome
    }
}
