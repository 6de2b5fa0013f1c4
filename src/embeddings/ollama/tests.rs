use super::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_config(server: &MockServer) -> EmbeddingConfig {
    EmbeddingConfig {
        host: server.address().ip().to_string(),
        port: server.address().port(),
        ..EmbeddingConfig::default()
    }
}

fn mock_client(server: &MockServer) -> OllamaClient {
    OllamaClient::new(&mock_config(server))
        .expect("Failed to create client")
        .with_retry_delay(Duration::from_millis(10))
}

fn texts(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn client_configuration() {
    let config = EmbeddingConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        ..EmbeddingConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model(), "test-model");
    assert_eq!(client.base_url.as_str(), "http://test-host:1234/");
    assert_eq!(client.retry_delay, FIRST_RETRY_DELAY);

    let client = client.with_retry_delay(Duration::from_millis(250));
    assert_eq!(client.retry_delay, Duration::from_millis(250));
}

#[test]
fn empty_input_skips_request() {
    // Nothing listens on port 9; an empty batch must not touch the network
    let config = EmbeddingConfig {
        host: "127.0.0.1".to_string(),
        port: 9,
        ..EmbeddingConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    let embeddings = client
        .generate_embeddings(&[])
        .expect("empty input should succeed");
    assert!(embeddings.is_empty());
}

#[tokio::test]
async fn batch_embedding_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({
            "model": "nomic-embed-text:latest",
            "input": ["first", "second"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2], [0.3, 0.4]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let embeddings = tokio::task::spawn_blocking(move || {
        client.generate_embeddings(&texts(&["first", "second"]))
    })
    .await
    .expect("task should complete")
    .expect("embedding should succeed");

    assert_eq!(embeddings, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
}

#[tokio::test]
async fn count_mismatch_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2]]
        })))
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let result = tokio::task::spawn_blocking(move || {
        client.generate_embeddings(&texts(&["first", "second"]))
    })
    .await
    .expect("task should complete");

    let message = format!("{:#}", result.expect_err("mismatch should fail"));
    assert!(message.contains("Mismatch"), "unexpected error: {}", message);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let embeddings =
        tokio::task::spawn_blocking(move || client.generate_embeddings(&texts(&["retry me"])))
            .await
            .expect("task should complete")
            .expect("third attempt should succeed");

    assert_eq!(embeddings, vec![vec![1.0, 0.0]]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let result =
        tokio::task::spawn_blocking(move || client.generate_embeddings(&texts(&["bad request"])))
            .await
            .expect("task should complete");

    let message = format!("{:#}", result.expect_err("client error should fail"));
    assert!(message.contains("HTTP 400"), "unexpected error: {}", message);
}

#[tokio::test]
async fn persistent_server_errors_give_up_after_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let result =
        tokio::task::spawn_blocking(move || client.generate_embeddings(&texts(&["doomed"])))
            .await
            .expect("task should complete");

    let message = format!("{:#}", result.expect_err("server errors should fail"));
    assert!(message.contains("after 3 attempts"), "unexpected error: {}", message);
}

#[tokio::test]
async fn model_check_requires_configured_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "nomic-embed-text:latest", "size": 274302450 }]
        })))
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let untagged = OllamaClient::new(&EmbeddingConfig {
        model: "nomic-embed-text".to_string(),
        ..mock_config(&server)
    })
    .expect("Failed to create client");
    let missing = OllamaClient::new(&EmbeddingConfig {
        model: "missing-model".to_string(),
        ..mock_config(&server)
    })
    .expect("Failed to create client");

    let (available, bare_name, unavailable) = tokio::task::spawn_blocking(move || {
        (
            client.ensure_model_available(),
            untagged.ensure_model_available(),
            missing.ensure_model_available(),
        )
    })
    .await
    .expect("task should complete");

    assert!(available.is_ok(), "model check failed: {:?}", available);
    assert!(bare_name.is_ok(), "bare name should match :latest: {:?}", bare_name);
    let message = format!("{:#}", unavailable.expect_err("missing model should fail"));
    assert!(message.contains("missing-model"), "unexpected error: {}", message);
}

#[tokio::test]
async fn implements_embedding_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[3.0, 4.0]]
        })))
        .mount(&server)
        .await;

    let model: std::sync::Arc<dyn EmbeddingModel> = std::sync::Arc::new(mock_client(&server));
    assert_eq!(model.name(), "nomic-embed-text:latest");

    let embedder = crate::embeddings::Embedder::from_model(model, 16);
    let vector = tokio::task::spawn_blocking(move || embedder.embed_one("normalise me"))
        .await
        .expect("task should complete")
        .expect("embedding should succeed");

    assert!((vector[0] - 0.6).abs() < 1e-6);
    assert!((vector[1] - 0.8).abs() < 1e-6);
}
