//! Upstream model backends

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::core::config::OrchestratorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{UpstreamRequest, UpstreamResponse};

/// Lazily produced text chunks from a streaming call
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// The hosted language-model service
#[async_trait]
pub trait TranslationBackend: Send + Sync + Debug {
    /// One complete generation
    async fn generate(&self, request: &UpstreamRequest) -> Result<UpstreamResponse>;

    /// Streamed generation; errors may arrive before or during the stream
    async fn generate_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream>;
}

/// Gemini `generateContent` REST backend
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(TranslationError::ConfigError {
                message: "API key is required".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn body(request: &UpstreamRequest) -> Value {
        let mut generation = json!({
            "temperature": request.config.temperature,
            "maxOutputTokens": request.config.max_output_tokens,
        });
        if request.config.high_reasoning {
            generation["thinkingConfig"] = json!({ "thinkingLevel": "HIGH" });
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation,
            "safetySettings": request.config.safety_settings,
        });
        if let Some(system) = &request.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    async fn post(&self, url: String, request: &UpstreamRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| {
                TranslationError::upstream(e.status().map(|s| s.as_u16()), format!("network error: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_code = status.as_u16();
        let error_text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&error_text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(error_text);

        Err(TranslationError::upstream(Some(status_code), message))
    }
}

/// Concatenated text of the first candidate
fn candidate_text(json: &Value) -> String {
    json["candidates"]
        .get(0)
        .and_then(|c| c["content"]["parts"].as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Pull complete `data:` payloads out of an SSE byte buffer, leaving any partial line.
///
/// Only whole lines are decoded, so a character split across network chunks
/// stays in the buffer until its remaining bytes arrive.
fn drain_sse_events(buffer: &mut Vec<u8>) -> Result<Vec<String>> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = std::str::from_utf8(&line).map_err(|e| TranslationError::InvalidResponseError {
            message: format!("stream is not valid UTF-8: {e}"),
        })?;
        if let Some(data) = line.trim().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                events.push(data.to_string());
            }
        }
    }
    Ok(events)
}

#[async_trait]
impl TranslationBackend for GeminiBackend {
    async fn generate(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, request.model);
        let response = self.post(url, request).await?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponseError {
                message: e.to_string(),
            })?;

        let total_tokens = json["usageMetadata"]["totalTokenCount"].as_u64();
        debug!("Model {} replied, usage {:?}", request.model, total_tokens);

        Ok(UpstreamResponse {
            text: candidate_text(&json),
            total_tokens,
        })
    }

    async fn generate_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.endpoint, request.model
        );
        let response = self.post(url, request).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    TranslationError::upstream(None, format!("network error: {e}"))
                })?;
                buffer.extend_from_slice(&chunk);

                for event in drain_sse_events(&mut buffer)? {
                    let json: Value = serde_json::from_str(&event)?;
                    let text = candidate_text(&json);
                    if !text.is_empty() {
                        yield text;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
