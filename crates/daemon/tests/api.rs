//! HTTP API against a loopback server with a scripted executor

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testrunner_daemon::config::WebhookConfig;
use testrunner_daemon::{ApiServer, NoopNotifier, Orchestrator, RunRegistry, ServiceConfig};
use testrunner_executor::{
    Executor, ExecutorFactory, ExecutorResult, RunOptions, RunOutcome, Runner,
};

const KEY: &str = "secret";

/// Reports `failures` failed tests, after an optional delay
struct ScriptedFactory {
    failures: u32,
    delay: Duration,
}

struct ScriptedExecutor {
    failures: u32,
    delay: Duration,
}

#[async_trait]
impl ExecutorFactory for ScriptedFactory {
    async fn launch(&self) -> ExecutorResult<Box<dyn Executor>> {
        Ok(Box::new(ScriptedExecutor {
            failures: self.failures,
            delay: self.delay,
        }))
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, _runner: &Runner, _options: &RunOptions) -> ExecutorResult<RunOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(RunOutcome {
            failed_count: self.failures,
            report: None,
        })
    }

    async fn close(&self) -> ExecutorResult<()> {
        Ok(())
    }
}

struct TestServer {
    base: String,
    http: reqwest::Client,
    _tmp: TempDir,
}

impl TestServer {
    async fn start(failures: u32, delay: Duration) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = ServiceConfig::default();
        config.executor.work_dir = tmp.path().join("temp-tests");
        config.webhook = WebhookConfig {
            enabled: false,
            ..Default::default()
        };

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            RunRegistry::new(),
            Arc::new(NoopNotifier),
            Arc::new(ScriptedFactory { failures, delay }),
        ));
        let app = ApiServer::new(orchestrator, KEY).router();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
            _tmp: tmp,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .header("x-api-key", KEY)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }
}

fn login_request(run_id: &str) -> Value {
    json!({
        "runId": run_id,
        "testCases": [{
            "id": "t1",
            "name": "Login",
            "steps": [
                {"action": "navigate", "value": "https://x"},
                {"action": "click", "target": "#submit"}
            ]
        }],
        "browser": "chrome"
    })
}

#[tokio::test]
async fn test_health_needs_no_key() {
    let server = TestServer::start(0, Duration::ZERO).await;
    let response = server
        .http
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok", "service": "TestRunner"}));
}

#[tokio::test]
async fn test_missing_or_wrong_key_is_unauthorized() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let missing = server
        .http
        .get(format!("{}/status/anything", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 401);
    assert_eq!(missing.json::<Value>().await.unwrap(), json!({"error": "Unauthorized"}));

    let wrong = server
        .http
        .post(format!("{}/run-tests", server.base))
        .header("x-api-key", "nope")
        .json(&login_request("r"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status().as_u16(), 401);
}

#[tokio::test]
async fn test_run_tests_returns_terminal_status() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server.post("/run-tests", login_request("run-1")).await;
    assert_eq!(code, 200);
    assert_eq!(body["runId"], "run-1");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["totalTests"], 1);
    assert_eq!(body["passedTests"], 1);

    let (code, status) = server.get("/status/run-1").await;
    assert_eq!(code, 200);
    assert_eq!(status, body);
}

#[tokio::test]
async fn test_failed_tests_map_to_failed_status() {
    let server = TestServer::start(1, Duration::ZERO).await;

    let (code, body) = server.post("/run-tests", login_request("run-2")).await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["failedTests"], 1);
    assert_eq!(body["passedTests"], 0);
}

#[tokio::test]
async fn test_empty_request_is_rejected() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server.post("/run-tests", json!({"runId": "empty"})).await;
    assert_eq!(code, 400);
    assert!(body["error"].as_str().unwrap().contains("No test"));

    let (code, _) = server.get("/status/empty").await;
    assert_eq!(code, 404);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server.post("/run-tests", json!({"testCases": "nope"})).await;
    assert_eq!(code, 400);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_unknown_run_status_and_cancel() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server.get("/status/missing").await;
    assert_eq!(code, 404);
    assert_eq!(body["error"], "Run not found");

    let (code, _) = server.post("/cancel/missing", Value::Null).await;
    assert_eq!(code, 404);
}

#[tokio::test]
async fn test_background_run_can_be_cancelled() {
    let server = TestServer::start(0, Duration::from_millis(300)).await;

    let (code, body) = server
        .post("/run-tests?wait=false", login_request("bg-1"))
        .await;
    assert_eq!(code, 200);
    assert_eq!(body["runId"], "bg-1");
    assert_eq!(body["status"], "started");

    let (code, body) = server.post("/cancel/bg-1", Value::Null).await;
    assert_eq!(code, 200);
    assert_eq!(body, json!({"success": true}));

    // Cancelled runs stay cancelled once the executor finishes
    tokio::time::sleep(Duration::from_millis(600)).await;
    let (_, status) = server.get("/status/bg-1").await;
    assert_eq!(status["status"], "cancelled");

    let (code, _) = server.post("/cancel/bg-1", Value::Null).await;
    assert_eq!(code, 409);
}

#[tokio::test]
async fn test_legacy_run_trigger() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server.post("/run", json!({"testSuiteId": "suite-1"})).await;
    assert_eq!(code, 200);
    let run_id = body["runId"].as_str().unwrap().to_string();

    let (code, status) = server.get(&format!("/status/{}", run_id)).await;
    assert_eq!(code, 200);
    assert_eq!(status["status"], "running");
    assert_eq!(status["totalTests"], 0);
}

#[tokio::test]
async fn test_run_generated_file() {
    let server = TestServer::start(0, Duration::ZERO).await;

    let (code, body) = server
        .post("/run-generated-file", json!({"testSuiteId": "s1"}))
        .await;
    assert_eq!(code, 400);
    assert_eq!(body["error"], "testSuiteId and fileContent are required");

    let (code, body) = server
        .post(
            "/run-generated-file",
            json!({
                "testSuiteId": "s1",
                "fileContent": "fixture('F');\ntest('T', async t => {});\n",
                "runId": "gen-1"
            }),
        )
        .await;
    assert_eq!(code, 200);
    assert_eq!(body, json!({"runId": "gen-1", "status": "completed", "failedCount": 0}));
}
