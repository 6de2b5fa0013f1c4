use super::*;
use serde_json::json;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Fails the first `failures` calls, then answers with the prompt it saw
#[derive(Debug, Default)]
struct ScriptedBackend {
    failures: usize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete(&self, request: &CompletionRequest<'_>) -> anyhow::Result<Completion> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(anyhow::anyhow!("upstream unavailable"));
        }

        Ok(Completion {
            content: format!("answer to: {}", request.user_prompt),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }
}

fn test_config() -> GenerationConfig {
    GenerationConfig {
        model: "test-model".to_string(),
        rate_limit_calls: 100,
        ..GenerationConfig::default()
    }
}

fn generator_with(backend: Arc<ScriptedBackend>, config: &GenerationConfig) -> AnswerGenerator {
    AnswerGenerator::new(config, Some(backend as Arc<dyn CompletionBackend>))
        .with_retry_delay(Duration::from_millis(1))
}

#[test]
fn missing_backend_reports_not_initialized() {
    let generator = AnswerGenerator::new(&test_config(), None);
    assert!(!generator.is_available());

    let response = generator.generate("system", "user");

    assert!(!response.success);
    assert!(response.content.is_empty());
    assert_eq!(response.model, "test-model");
    assert_eq!(
        response.error.as_deref(),
        Some("LLM client not initialized. Check API key.")
    );
}

#[test]
fn successful_call_returns_content_and_usage() {
    let backend = ScriptedBackend::failing(0);
    let generator = generator_with(Arc::clone(&backend), &test_config());

    let response = generator.generate("system", "What is Rust?");

    assert!(response.success);
    assert_eq!(response.content, "answer to: What is Rust?");
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(15));
    assert_eq!(response.error, None);
    assert_eq!(backend.calls(), 1);
}

#[test]
fn transient_failures_are_retried() {
    let backend = ScriptedBackend::failing(2);
    let generator = generator_with(Arc::clone(&backend), &test_config());

    let response = generator.generate("system", "retry");

    assert!(response.success);
    assert_eq!(backend.calls(), 3);
}

#[test]
fn exhausted_retries_name_the_attempt_count() {
    let backend = ScriptedBackend::failing(usize::MAX);
    let generator = generator_with(Arc::clone(&backend), &test_config());

    let response = generator.generate("system", "never works");

    assert!(!response.success);
    assert_eq!(backend.calls(), 3);
    let error = response.error.unwrap_or_default();
    assert!(
        error.starts_with("LLM call failed after 3 attempts"),
        "unexpected error: {}",
        error
    );
    assert!(error.contains("upstream unavailable"));
}

#[test]
fn zero_retries_never_calls_backend() {
    let backend = ScriptedBackend::failing(0);
    let config = GenerationConfig {
        max_retries: 0,
        ..test_config()
    };
    let generator = generator_with(Arc::clone(&backend), &config);

    let response = generator.generate("system", "user");

    assert!(!response.success);
    assert_eq!(
        response.error.as_deref(),
        Some("No retry attempts configured")
    );
    assert_eq!(backend.calls(), 0);
}

#[test]
fn overrides_reach_the_backend() {
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Option<(u32, f32)>>,
    }

    impl CompletionBackend for Recording {
        fn complete(&self, request: &CompletionRequest<'_>) -> anyhow::Result<Completion> {
            if let Ok(mut seen) = self.seen.lock() {
                *seen = Some((request.max_tokens, request.temperature));
            }
            Ok(Completion {
                content: String::new(),
                usage: None,
            })
        }
    }

    let backend = Arc::new(Recording::default());
    let generator = AnswerGenerator::new(
        &test_config(),
        Some(Arc::clone(&backend) as Arc<dyn CompletionBackend>),
    );

    generator.generate("system", "user");
    assert_eq!(*backend.seen.lock().expect("lock"), Some((512, 0.7)));

    generator.generate_with("system", "user", Some(64), Some(0.1));
    assert_eq!(*backend.seen.lock().expect("lock"), Some((64, 0.1)));
}

#[test]
fn prompt_styles() {
    assert_eq!("summary".parse::<PromptStyle>(), Ok(PromptStyle::Summary));
    assert_eq!("ANALYSIS".parse::<PromptStyle>(), Ok(PromptStyle::Analysis));
    assert!("poem".parse::<PromptStyle>().is_err());

    assert_eq!(PromptStyle::default(), PromptStyle::Default);
    assert!(PromptStyle::Default.system_prompt().contains("Use ONLY the provided CONTEXT"));
    assert!(PromptStyle::Summary.system_prompt().starts_with("Summarize"));
    assert_eq!(PromptStyle::Analysis.to_string(), "analysis");
}

#[test]
#[serial]
fn api_key_comes_from_environment() {
    let config = GenerationConfig {
        api_key_env: "DOCS_RAG_TEST_API_KEY".to_string(),
        ..GenerationConfig::default()
    };

    // SAFETY: env-mutating tests are serialized
    unsafe { std::env::set_var("DOCS_RAG_TEST_API_KEY", "secret") };
    assert_eq!(config.api_key(), Some("secret".to_string()));
    assert!(AnswerGenerator::from_config(&config).is_available());

    // SAFETY: env-mutating tests are serialized
    unsafe { std::env::set_var("DOCS_RAG_TEST_API_KEY", "  ") };
    assert_eq!(config.api_key(), None);

    // SAFETY: env-mutating tests are serialized
    unsafe { std::env::remove_var("DOCS_RAG_TEST_API_KEY") };
    assert_eq!(config.api_key(), None);
    assert!(!AnswerGenerator::from_config(&config).is_available());
}

#[tokio::test]
async fn openai_backend_posts_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "max_tokens": 128,
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hello" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "hi there" } }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend =
        OpenAiCompatibleBackend::new(&format!("{}/v1/", server.uri()), "test-model", "test-key");
    let completion = tokio::task::spawn_blocking(move || {
        backend.complete(&CompletionRequest {
            system_prompt: "be brief",
            user_prompt: "hello",
            max_tokens: 128,
            temperature: 0.2,
        })
    })
    .await
    .expect("task should complete")
    .expect("completion should succeed");

    assert_eq!(completion.content, "hi there");
    assert_eq!(
        completion.usage,
        Some(TokenUsage {
            prompt_tokens: 7,
            completion_tokens: 2,
            total_tokens: 9,
        })
    );
}

#[tokio::test]
async fn openai_backend_rejects_empty_choices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let backend = OpenAiCompatibleBackend::new(&server.uri(), "test-model", "test-key");
    let result = tokio::task::spawn_blocking(move || {
        backend.complete(&CompletionRequest {
            system_prompt: "system",
            user_prompt: "user",
            max_tokens: 16,
            temperature: 0.0,
        })
    })
    .await
    .expect("task should complete");

    let message = format!("{:#}", result.expect_err("empty choices should fail"));
    assert!(message.contains("No choices"), "unexpected error: {}", message);
}

#[tokio::test]
async fn gateway_retries_http_failures_then_reports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let backend = OpenAiCompatibleBackend::new(&server.uri(), "test-model", "test-key");
    let generator = AnswerGenerator::new(
        &test_config(),
        Some(Arc::new(backend) as Arc<dyn CompletionBackend>),
    )
    .with_retry_delay(Duration::from_millis(5));

    let response = tokio::task::spawn_blocking(move || generator.generate("system", "user"))
        .await
        .expect("task should complete");

    assert!(!response.success);
    assert!(
        response
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("LLM call failed after 3 attempts")),
        "unexpected error: {:?}",
        response.error
    );
}
