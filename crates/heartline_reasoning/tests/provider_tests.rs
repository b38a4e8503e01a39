//! OpenAI-compatible provider against a local mock server.

use heartline_core::config::LlmConfig;
use heartline_reasoning::api_types::ChatMessage;
use heartline_reasoning::providers::OpenAiClient;
use heartline_reasoning::retry::RetryConfig;
use heartline_reasoning::{CompletionParams, LlmClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> OpenAiClient {
    let cfg = LlmConfig {
        provider: "openai".into(),
        model: "test-model".into(),
        base_url: Some(format!("{}/v1/", server.uri())),
        api_key: Some("sk-test".into()),
        ..LlmConfig::default()
    };
    OpenAiClient::new(&cfg).unwrap().with_retry_config(RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_factor: 1.0,
    })
}

fn completion(text: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]
    })
}

#[tokio::test]
async fn test_completion_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "messages": [{"role": "system", "content": "be kind"}, {"role": "user", "content": "hi"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"reply\": \"hello\"}")))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client_for(&server)
        .complete("be kind", vec![ChatMessage::user("hi")], CompletionParams::default())
        .await
        .unwrap();
    assert_eq!(resp.text, "{\"reply\": \"hello\"}");
    assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("second time lucky")))
        .mount(&server)
        .await;

    let resp = client_for(&server)
        .complete("sys", vec![ChatMessage::user("hi")], CompletionParams::default())
        .await
        .unwrap();
    assert_eq!(resp.text, "second time lucky");
}

#[tokio::test]
async fn test_auth_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .complete("sys", vec![ChatMessage::user("hi")], CompletionParams::default())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("401"));
}

#[tokio::test]
async fn test_empty_choices_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .complete("sys", vec![ChatMessage::user("hi")], CompletionParams::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no choices"));
}
