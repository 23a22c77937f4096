//! Integration tests for `HttpGetTask` against a real (mocked) HTTP server,
//! mirroring the teacher's `integration_test.rs` wiremock setup but for the
//! engine's reference task plugin instead of the teacher's own worker loop.

use std::collections::HashMap;

use loadgen_engine::registry::TaskRegistry;
use loadgen_engine::task::Task;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn params(url: String) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("url".to_string(), url);
    params
}

#[tokio::test]
async fn successful_get_produces_a_successful_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_defaults();
    let task = registry
        .build("http_get", &params(format!("{}/ok", server.uri())))
        .unwrap();

    let result = task.execute().await;
    assert!(result.success);
    assert!(result.error_message.is_empty());
}

#[tokio::test]
async fn server_error_produces_a_failed_result_with_category() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_defaults();
    let task = registry
        .build("http_get", &params(format!("{}/broken", server.uri())))
        .unwrap();

    let result = task.execute().await;
    assert!(!result.success);
    assert!(result.error_message.contains("server_error"));
    assert!(result.error_message.contains("503"));
}

#[tokio::test]
async fn client_error_produces_a_failed_result_with_category() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_defaults();
    let task = registry
        .build("http_get", &params(format!("{}/missing", server.uri())))
        .unwrap();

    let result = task.execute().await;
    assert!(!result.success);
    assert!(result.error_message.contains("client_error"));
}

#[tokio::test]
async fn connection_failure_is_a_failed_result_not_a_panic() {
    let registry = TaskRegistry::with_defaults();
    // Port 1 is reserved and nothing will ever answer on it, so the
    // connection attempt fails fast without relying on a real remote host.
    let task = registry
        .build("http_get", &params("http://127.0.0.1:1/".to_string()))
        .unwrap();

    let result = task.execute().await;
    assert!(!result.success);
    assert!(!result.error_message.is_empty());
}

#[tokio::test]
async fn many_concurrent_requests_against_the_same_mock_all_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/load"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_defaults();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let task = registry
            .build("http_get", &params(format!("{}/load", server.uri())))
            .unwrap();
        handles.push(tokio::spawn(async move { task.execute().await }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
    }
}
