use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vigil_core::config::ModelConfig;
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::Reasoner;
use vigil_core::types::Correlation;

use crate::sse::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Streaming reasoner over any OpenAI-compatible chat completions endpoint.
pub struct OpenAiReasoner {
    http: Client,
    config: ModelConfig,
    system_prompt: Option<String>,
}

impl OpenAiReasoner {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            system_prompt: None,
        }
    }

    /// Send `prompt` as a system message ahead of every request.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn request_body(&self, prompt: String, correlation: &Correlation) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        ChatRequest {
            model: self.config.model_id.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
            stream: true,
            user: (!correlation.thread_id.is_empty())
                .then(|| format!("{}:{}", correlation.resource_id, correlation.thread_id)),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the text fragment carried by one SSE event, if any.
pub(crate) fn parse_fragment(event: &SseEvent) -> Option<String> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty()),
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
            None
        }
    }
}

impl Reasoner for OpenAiReasoner {
    fn generate_stream(
        &self,
        prompt: String,
        correlation: Correlation,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = self.request_body(prompt, &correlation);

            let mut req = self.http.post(url).json(&body);
            if let Some(ref api_key) = self.config.api_key {
                req = req.bearer_auth(api_key);
            }

            debug!(model = %self.config.model_id, "Sending reasoner request");
            let response = req
                .send()
                .await
                .map_err(|e| VigilError::Reasoner(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(VigilError::Reasoner(format!("HTTP {}: {}", status, body)));
            }

            let fragments = SseStream::new(response.bytes_stream()).filter_map(|event| async move {
                match event {
                    Ok(event) => parse_fragment(&event).map(Ok),
                    Err(e) => Some(Err(e)),
                }
            });

            Ok(fragments.boxed())
        })
    }
}
