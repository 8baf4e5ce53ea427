//! Outbound webhooks to the test automation API

use serde_json::{json, Value};
use std::time::Duration;
use testrunner_common::TestRunStatus;
use testrunner_executor::TestResult;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;

pub const STATUS_PATH: &str = "/api/runner-webhook/status";
pub const RESULT_PATH: &str = "/api/runner-webhook/result";

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned {0}")]
    Status(reqwest::StatusCode),
}

/// Posts run status and per-test results with bounded, linearly backed-off retries
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    config: WebhookConfig,
    http: reqwest::Client,
}

impl WebhookReporter {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Post the run's counters; returns whether any attempt succeeded
    pub async fn post_status(&self, status: &TestRunStatus) -> bool {
        let body = json!({
            "runId": status.run_id,
            "status": status.status,
            "totalTests": status.total_tests,
            "completedTests": status.completed_tests,
            "passedTests": status.passed_tests,
            "failedTests": status.failed_tests,
            "skippedTests": status.skipped_tests,
            "progress": status.progress,
        });
        self.post(&status.run_id, STATUS_PATH, body, self.config.status_backoff_ms)
            .await
    }

    /// Post one test's outcome
    pub async fn post_result(&self, run_id: &str, result: &TestResult) -> bool {
        let mut body = match serde_json::to_value(result) {
            Ok(body) => body,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not encode test result");
                return false;
            }
        };
        body["runId"] = json!(run_id);
        self.post(run_id, RESULT_PATH, body, self.config.result_backoff_ms)
            .await
    }

    /// Terminal status followed by every per-test result
    pub async fn report_run(&self, status: &TestRunStatus, results: &[TestResult]) {
        if !self.config.enabled {
            return;
        }
        self.post_status(status).await;
        for result in results {
            self.post_result(&status.run_id, result).await;
        }
    }

    async fn post(&self, run_id: &str, path: &str, body: Value, backoff_ms: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            debug!(run_id = %run_id, url = %url, attempt, attempts, "Sending webhook");
            match self.send_once(&url, &body).await {
                Ok(()) => {
                    info!(run_id = %run_id, path, attempt, "Webhook delivered");
                    return true;
                }
                Err(e) => {
                    warn!(run_id = %run_id, path, attempt, attempts, error = %e, "Webhook attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(backoff_ms * u64::from(attempt))).await;
                    }
                }
            }
        }

        error!(run_id = %run_id, path, attempts, "All webhook attempts failed");
        false
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<(), WebhookError> {
        let response = self
            .http
            .post(url)
            .header("X-API-Key", &self.config.api_key)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status(response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use testrunner_common::RunState;
    use testrunner_executor::TestOutcome;

    #[derive(Default)]
    struct Received {
        calls: AtomicU32,
        fail_first: u32,
        bodies: Mutex<Vec<(String, Option<String>, Value)>>,
    }

    async fn spawn_api(received: Arc<Received>) -> String {
        async fn record(
            State(received): State<Arc<Received>>,
            uri: axum::http::Uri,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> StatusCode {
            let n = received.calls.fetch_add(1, Ordering::SeqCst);
            if n < received.fail_first {
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            let key = headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            received.bodies.lock().push((uri.path().to_string(), key, body));
            StatusCode::OK
        }

        let app = Router::new()
            .route(STATUS_PATH, post(record))
            .route(RESULT_PATH, post(record))
            .with_state(received);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(api_url: String) -> WebhookConfig {
        WebhookConfig {
            api_url,
            api_key: "k".to_string(),
            status_backoff_ms: 1,
            result_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn finished_status() -> TestRunStatus {
        let mut status = TestRunStatus::started("r1");
        status.total_tests = 2;
        status.passed_tests = 1;
        status.failed_tests = 1;
        status.transition(RunState::Failed).unwrap();
        status
    }

    #[tokio::test]
    async fn test_report_run_posts_status_then_results() {
        let received = Arc::new(Received::default());
        let reporter = WebhookReporter::new(config(spawn_api(received.clone()).await));

        let results = vec![TestResult {
            test_case_id: Some("t2".to_string()),
            test_case_name: "Logout".to_string(),
            status: TestOutcome::Failed,
            duration_ms: 800,
            error_message: Some("boom".to_string()),
            stack_trace: None,
        }];
        reporter.report_run(&finished_status(), &results).await;

        let bodies = received.bodies.lock();
        assert_eq!(bodies.len(), 2);

        let (path, key, status) = &bodies[0];
        assert_eq!(path, STATUS_PATH);
        assert_eq!(key.as_deref(), Some("k"));
        assert_eq!(status["runId"], "r1");
        assert_eq!(status["status"], "failed");
        assert_eq!(status["failedTests"], 1);

        let (path, _, result) = &bodies[1];
        assert_eq!(path, RESULT_PATH);
        assert_eq!(result["runId"], "r1");
        assert_eq!(result["testCaseId"], "t2");
        assert_eq!(result["errorMessage"], "boom");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let received = Arc::new(Received {
            fail_first: 2,
            ..Default::default()
        });
        let reporter = WebhookReporter::new(config(spawn_api(received.clone()).await));

        assert!(reporter.post_status(&finished_status()).await);
        assert_eq!(received.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let received = Arc::new(Received {
            fail_first: 10,
            ..Default::default()
        });
        let reporter = WebhookReporter::new(config(spawn_api(received.clone()).await));

        assert!(!reporter.post_status(&finished_status()).await);
        assert_eq!(received.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_reporter_sends_nothing() {
        let received = Arc::new(Received::default());
        let mut cfg = config(spawn_api(received.clone()).await);
        cfg.enabled = false;
        let reporter = WebhookReporter::new(cfg);

        reporter.report_run(&finished_status(), &[]).await;
        assert!(!reporter.post_status(&finished_status()).await);
        assert_eq!(received.calls.load(Ordering::SeqCst), 0);
    }
}
