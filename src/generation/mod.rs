// Answer generation module
// Boundary to the language model: prompts, rate limiting, retries and structured failures

#[cfg(test)]
mod tests;

pub mod openai;
pub mod rate_limit;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use openai::OpenAiCompatibleBackend;
pub use rate_limit::RateLimiter;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful research assistant for studying documents.
You help users understand and analyze the content of their uploaded documents.

When answering:
1. Use ONLY the provided CONTEXT to answer
2. Cite specific documents and quote relevant passages
3. If context is insufficient, clearly state what's missing
4. Be precise and avoid speculation
5. If the documents don't contain relevant information, say so";

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the key information from the provided context.
Focus on main themes, important details, and relevant patterns.
Cite specific documents when possible.";

const ANALYSIS_SYSTEM_PROMPT: &str = "Provide a detailed analysis of the information in the context.
Look for patterns, connections, and significant insights.
Support your analysis with specific references to the documents.";

/// Settings for the language model behind answer generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// OpenAI-compatible API root; `/chat/completions` is appended
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: u32,
    pub rate_limit_calls: u32,
    pub rate_limit_period_secs: u64,
    /// Environment variable holding the API key
    pub api_key_env: String,
}

impl Default for GenerationConfig {
    #[inline]
    fn default() -> Self {
        Self {
            base_url: "https://api.portkey.ai/v1".to_string(),
            model: "gemini-2.5-flash-lite".to_string(),
            max_tokens: 512,
            temperature: 0.7,
            max_retries: 3,
            rate_limit_calls: 10,
            rate_limit_period_secs: 60,
            api_key_env: "PORTKEY_API_KEY".to_string(),
        }
    }
}

impl GenerationConfig {
    /// API key from the configured environment variable, if set and non-empty
    #[inline]
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Which system prompt frames the answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    #[default]
    Default,
    Summary,
    Analysis,
}

impl PromptStyle {
    #[inline]
    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Default => DEFAULT_SYSTEM_PROMPT,
            Self::Summary => SUMMARY_SYSTEM_PROMPT,
            Self::Analysis => ANALYSIS_SYSTEM_PROMPT,
        }
    }
}

impl fmt::Display for PromptStyle {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Summary => write!(f, "summary"),
            Self::Analysis => write!(f, "analysis"),
        }
    }
}

impl FromStr for PromptStyle {
    type Err = String;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "summary" => Ok(Self::Summary),
            "analysis" => Ok(Self::Analysis),
            other => Err(format!(
                "Unknown prompt style '{}' (expected default, summary or analysis)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chat completion request
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// External capability that turns a prompt pair into generated text
pub trait CompletionBackend: Send + Sync {
    fn complete(&self, request: &CompletionRequest<'_>) -> anyhow::Result<Completion>;
}

/// Outcome of a generation call. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub latency_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl LlmResponse {
    fn failure(model: &str, error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            model: model.to_string(),
            usage: None,
            latency_ms: 0.0,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Rate-limited, retrying front end to a [`CompletionBackend`]
pub struct AnswerGenerator {
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    retry_delay: Duration,
    backend: Option<Arc<dyn CompletionBackend>>,
    rate_limiter: Mutex<RateLimiter>,
}

impl fmt::Debug for AnswerGenerator {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerGenerator")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl AnswerGenerator {
    /// Create a generator around `backend`. Without a backend every call
    /// fails with a "not initialized" response.
    #[inline]
    pub fn new(config: &GenerationConfig, backend: Option<Arc<dyn CompletionBackend>>) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
            backend,
            rate_limiter: Mutex::new(RateLimiter::new(
                config.rate_limit_calls as usize,
                Duration::from_secs(config.rate_limit_period_secs),
            )),
        }
    }

    /// Create a generator talking to the configured OpenAI-compatible gateway,
    /// using the API key from the environment
    #[inline]
    pub fn from_config(config: &GenerationConfig) -> Self {
        let backend = config.api_key().map_or_else(
            || {
                warn!(
                    "No {} found in environment. LLM calls will fail.",
                    config.api_key_env
                );
                None
            },
            |api_key| {
                info!("Loaded API key from {}", config.api_key_env);
                Some(Arc::new(OpenAiCompatibleBackend::new(
                    &config.base_url,
                    config.model.clone(),
                    api_key,
                )) as Arc<dyn CompletionBackend>)
            },
        );

        Self::new(config, backend)
    }

    /// Delay before the first retry; later retries double it
    #[inline]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a backend is configured
    #[inline]
    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Generate with the configured token limit and temperature
    #[inline]
    pub fn generate(&self, system_prompt: &str, user_prompt: &str) -> LlmResponse {
        self.generate_with(system_prompt, user_prompt, None, None)
    }

    /// Generate a response, retrying failed attempts with exponential backoff
    #[inline]
    pub fn generate_with(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> LlmResponse {
        let Some(backend) = self.backend.as_ref() else {
            return LlmResponse::failure(&self.model, "LLM client not initialized. Check API key.");
        };

        let request = CompletionRequest {
            system_prompt,
            user_prompt,
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            temperature: temperature.unwrap_or(self.temperature),
        };

        for attempt in 1..=self.max_retries {
            self.wait_for_rate_limit();
            let start_time = Instant::now();

            match backend.complete(&request) {
                Ok(completion) => {
                    let latency_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                    info!(
                        "LLM response: {:.0}ms ({} chars)",
                        latency_ms,
                        completion.content.chars().count()
                    );
                    return LlmResponse {
                        content: completion.content,
                        model: self.model.clone(),
                        usage: completion.usage,
                        latency_ms,
                        success: true,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(
                        "LLM call failed (attempt {}/{}): {:#}",
                        attempt, self.max_retries, e
                    );
                    if attempt == self.max_retries {
                        return LlmResponse::failure(
                            &self.model,
                            format!(
                                "LLM call failed after {} attempts: {:#}",
                                self.max_retries, e
                            ),
                        );
                    }
                    std::thread::sleep(
                        self.retry_delay
                            .saturating_mul(2_u32.saturating_pow(attempt - 1)),
                    );
                }
            }
        }

        LlmResponse::failure(&self.model, "No retry attempts configured")
    }

    fn wait_for_rate_limit(&self) {
        // A poisoned limiter only loses its call history
        let mut limiter = self
            .rate_limiter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        limiter.wait_if_needed();
    }
}
