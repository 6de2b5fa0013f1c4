use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Completion, CompletionBackend, CompletionRequest, TokenUsage};

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Chat-completions client for any OpenAI-compatible gateway (Portkey by default)
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    endpoint: String,
    model: String,
    api_key: String,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiCompatibleBackend {
    #[inline]
    pub fn new(base_url: &str, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
            .build()
            .into();

        Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: api_key.into(),
            agent,
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CompletionBackend for OpenAiCompatibleBackend {
    #[inline]
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: request.user_prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let request_json =
            serde_json::to_string(&body).context("Failed to serialize completion request")?;

        debug!("Posting chat completion to {}", self.endpoint);

        let response_text = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key).as_str())
            .header("x-portkey-api-key", self.api_key.as_str())
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .with_context(|| format!("Chat completion request to {} failed", self.endpoint))?;

        let response: ChatResponse = serde_json::from_str(&response_text)
            .context("Failed to parse chat completion response")?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No choices in response"))?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            usage: response.usage,
        })
    }
}
