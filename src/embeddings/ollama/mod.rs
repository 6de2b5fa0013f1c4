#[cfg(test)]
mod tests;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::EmbeddingModel;
use crate::config::EmbeddingConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ATTEMPTS: u32 = 3;
const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Blocking client for the `/api/embed` endpoint of an Ollama server
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TaggedModel>,
}

#[derive(Debug, Deserialize)]
struct TaggedModel {
    name: String,
}

/// What to do after a failed HTTP call
enum Failure {
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .context("Invalid Ollama address in embedding config")?;

        Ok(Self {
            base_url,
            model: config.model.clone(),
            agent: ureq::Agent::config_builder()
                .timeout_global(Some(REQUEST_TIMEOUT))
                .build()
                .into(),
            retry_delay: FIRST_RETRY_DELAY,
        })
    }

    /// Delay before the first retry; the second waits twice as long
    #[inline]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Confirm the server answers and has the configured model pulled.
    ///
    /// A bare model name also matches its `:latest` tag.
    #[inline]
    pub fn ensure_model_available(&self) -> Result<()> {
        let body = self
            .call_with_retry("/api/tags", |url| {
                self.agent
                    .get(url)
                    .call()
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .with_context(|| format!("Ollama server at {} is not reachable", self.base_url))?;
        let tags: TagsResponse =
            serde_json::from_str(&body).context("Unreadable /api/tags response")?;

        let tagged = format!("{}:latest", self.model);
        if tags
            .models
            .iter()
            .any(|m| m.name == self.model || m.name == tagged)
        {
            info!("Ollama model {} is available at {}", self.model, self.base_url);
            return Ok(());
        }

        let pulled: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();
        Err(anyhow!(
            "Embedding model '{}' is not pulled on {} (have: {})",
            self.model,
            self.base_url,
            pulled.join(", ")
        ))
    }

    /// Embed `texts` in one request, one vector per input
    #[inline]
    pub fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::to_string(&EmbedRequest {
            model: &self.model,
            input: texts,
        })
        .context("Failed to encode embedding request")?;

        let body = self
            .call_with_retry("/api/embed", |url| {
                self.agent
                    .post(url)
                    .header("Content-Type", "application/json")
                    .send(&payload)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to generate embeddings")?;
        let response: EmbedResponse =
            serde_json::from_str(&body).context("Unreadable /api/embed response")?;

        if response.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            ));
        }

        debug!("Ollama returned {} embeddings", response.embeddings.len());
        Ok(response.embeddings)
    }

    /// Call `endpoint`, retrying server and transport failures with a
    /// doubling delay. Client errors fail immediately.
    fn call_with_retry<F>(&self, endpoint: &str, mut call: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<String, ureq::Error>,
    {
        let url = self
            .base_url
            .join(endpoint)
            .with_context(|| format!("Failed to build URL for {}", endpoint))?;

        let mut delay = self.retry_delay;
        let mut attempt = 1;
        loop {
            let error = match call(url.as_str()).map_err(classify) {
                Ok(body) => return Ok(body),
                Err(Failure::Fatal(error)) => return Err(error),
                Err(Failure::Retry(error)) => error,
            };

            if attempt >= ATTEMPTS {
                return Err(error.context(format!("{} failed after {} attempts", endpoint, attempt)));
            }
            warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                endpoint, attempt, ATTEMPTS, error, delay
            );
            std::thread::sleep(delay);
            delay *= 2;
            attempt += 1;
        }
    }
}

fn classify(error: ureq::Error) -> Failure {
    match error {
        ureq::Error::StatusCode(status) if status >= 500 => {
            Failure::Retry(anyhow!("Server error: HTTP {}", status))
        }
        ureq::Error::StatusCode(status) => Failure::Fatal(anyhow!("Client error: HTTP {}", status)),
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => Failure::Retry(anyhow!("Transport error: {}", error)),
        other => Failure::Fatal(anyhow!("Request error: {}", other)),
    }
}

impl EmbeddingModel for OllamaClient {
    #[inline]
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.generate_embeddings(texts)
    }

    #[inline]
    fn name(&self) -> &str {
        &self.model
    }
}
