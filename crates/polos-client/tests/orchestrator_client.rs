use polos_client::{ClientConfig, OrchestratorClient, RetryPolicy};
use polos_contracts::RunOptions;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(api_url: String) -> ClientConfig {
    ClientConfig {
        api_url,
        api_key: "test-key".into(),
        project_id: "proj-1".into(),
        deployment_id: "dep-1".into(),
    }
}

#[tokio::test]
async fn invoke_returns_execution_id_on_success() {
    let server = MockServer::start().await;
    let execution_id = uuid::Uuid::now_v7();
    Mock::given(method("POST"))
        .and(path("/api/v1/workflows/my_workflow/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "execution_id": execution_id,
            "workflow_id": "my_workflow",
            "created_at": chrono::Utc::now(),
        })))
        .mount(&server)
        .await;

    let client = OrchestratorClient::new(config(server.uri()));
    let resp = client
        .invoke("my_workflow", json!({"x": 1}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.execution_id, execution_id);
}

#[tokio::test]
async fn retries_on_503_then_succeeds() {
    let server = MockServer::start().await;
    let execution_id = uuid::Uuid::now_v7();

    Mock::given(method("POST"))
        .and(path("/api/v1/workflows/flaky/run"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/workflows/flaky/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "execution_id": execution_id,
            "workflow_id": "flaky",
            "created_at": chrono::Utc::now(),
        })))
        .mount(&server)
        .await;

    let client = OrchestratorClient::with_retry_policy(
        config(server.uri()),
        RetryPolicy::exponential()
            .with_initial_interval(std::time::Duration::from_millis(1))
            .with_max_interval(std::time::Duration::from_millis(5)),
    );
    let resp = client
        .invoke("flaky", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.execution_id, execution_id);
}

#[tokio::test]
async fn list_active_workers_returns_worker_ids() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/workers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"worker_id": "w1"},
            {"worker_id": "w2"},
        ])))
        .mount(&server)
        .await;

    let client = OrchestratorClient::new(config(server.uri()));
    let workers = client.list_active_workers().await.unwrap();
    assert_eq!(workers, vec!["w1".to_string(), "w2".to_string()]);
}

#[tokio::test]
async fn deregister_worker_posts_to_deregister_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/workers/w1/deregister"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = OrchestratorClient::new(config(server.uri()));
    client.deregister_worker("w1").await.unwrap();
}

#[tokio::test]
async fn non_retryable_4xx_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/workflows/bad/run"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OrchestratorClient::new(config(server.uri()));
    let err = client
        .invoke("bad", json!({}), RunOptions::default())
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}
