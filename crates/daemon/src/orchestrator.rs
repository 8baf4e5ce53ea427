//! Run orchestration: the lifecycle and error boundary of one test run

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use testrunner_common::{
    file_stem, new_run_id, Error, RunState, TestCase, TestRunRequest, TestRunStatus,
};
use testrunner_executor::{
    extract_test_case_ids, BrowserPolicy, ExecutorError, ExecutorFactory, RunOptions, RunOutcome,
    Runner, ScriptMaterializer, TestResult,
};
use tracing::{debug, error, info, warn};

use crate::config::{ExecutorConfig, ServiceConfig};
use crate::error::RunError;
use crate::notifier::{NotifyError, RunNotifier};
use crate::state::RunRegistry;
use crate::webhook::WebhookReporter;

/// Share of the progress bar spent writing scripts
const MATERIALIZE_PROGRESS: usize = 30;

/// Body of `POST /run-generated-file`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFileRequest {
    #[serde(default)]
    pub test_suite_id: Option<String>,
    #[serde(default)]
    pub file_content: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFileResponse {
    pub run_id: String,
    pub status: RunState,
    pub failed_count: u32,
}

/// Coordinates materialization, execution, status tracking and notifications
pub struct Orchestrator {
    registry: RunRegistry,
    notifier: Arc<dyn RunNotifier>,
    executors: Arc<dyn ExecutorFactory>,
    materializer: ScriptMaterializer,
    browsers: BrowserPolicy,
    options: RunOptions,
    executor_config: ExecutorConfig,
    webhooks: WebhookReporter,
}

impl Orchestrator {
    pub fn new(
        config: &ServiceConfig,
        registry: RunRegistry,
        notifier: Arc<dyn RunNotifier>,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            registry,
            notifier,
            executors,
            materializer: ScriptMaterializer::new(config.executor.work_dir.clone()),
            browsers: config.executor.browser_policy(),
            options: RunOptions::standard(config.executor.force_headless),
            executor_config: config.executor.clone(),
            webhooks: WebhookReporter::new(config.webhook.clone()),
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Validate `request`, then run it to completion
    pub async fn submit(&self, request: TestRunRequest) -> Result<TestRunStatus, RunError> {
        request.validate()?;
        Ok(self.run_tests(request).await)
    }

    /// Run every test case in `request` and return the terminal record.
    ///
    /// Never fails: materialization and execution errors end up as a
    /// `failed` record with `error` set.
    pub async fn run_tests(&self, request: TestRunRequest) -> TestRunStatus {
        let run_id = resolve_run_id(request.run_id.as_deref());
        self.registry.create(&run_id, TestRunStatus::started(&run_id));
        self.run_recorded(run_id, request).await
    }

    /// Validate and record `request`, then run it on a background task.
    ///
    /// The record exists before this returns, so the id can be polled or
    /// cancelled right away.
    pub fn spawn_run(self: &Arc<Self>, mut request: TestRunRequest) -> Result<String, RunError> {
        request.validate()?;
        let run_id = resolve_run_id(request.run_id.as_deref());
        request.run_id = Some(run_id.clone());
        self.registry.create(&run_id, TestRunStatus::started(&run_id));

        let orchestrator = Arc::clone(self);
        let id = run_id.clone();
        tokio::spawn(async move {
            orchestrator.run_recorded(id, request).await;
        });
        Ok(run_id)
    }

    async fn run_recorded(&self, run_id: String, request: TestRunRequest) -> TestRunStatus {
        self.announce_running(&run_id).await;

        let cases: Vec<&TestCase> = request.flattened();
        let total = cases.len();
        self.registry.update(&run_id, |s| s.total_tests = total as u32);
        info!(run_id = %run_id, total_tests = total, "Starting test run");

        let materializer = self.scripts_for(&run_id);
        let mut files: Vec<PathBuf> = Vec::with_capacity(total);
        let mut test_case_ids = HashMap::new();

        for (index, case) in cases.iter().enumerate() {
            let progress = (index * MATERIALIZE_PROGRESS / total.max(1)) as u8;
            self.registry.update(&run_id, |s| {
                s.current_test = Some(case.name.clone());
                s.set_progress(progress);
            });
            self.notify_best_effort(
                &run_id,
                "progress",
                self.notifier.send_progress(
                    &run_id,
                    json!({
                        "testRunId": run_id,
                        "status": RunState::Running,
                        "progress": progress,
                        "currentTest": case.name,
                        "totalTests": total,
                    }),
                ),
            )
            .await;

            match materializer.materialize(case).await {
                Ok(path) if files.contains(&path) => {
                    let err = RunError::validation(format!(
                        "Test case {} would overwrite the script at {}",
                        case.id,
                        path.display()
                    ));
                    return self.finish_failed(&run_id, err).await;
                }
                Ok(path) => {
                    debug!(run_id = %run_id, test_case = %case.id, path = %path.display(), "Materialized test case");
                    files.push(path);
                }
                Err(source) => {
                    let err = RunError::Materialization {
                        test_case: case.id.clone(),
                        source,
                    };
                    return self.finish_failed(&run_id, err).await;
                }
            }

            test_case_ids.insert(case.name.clone(), case.id.clone());
            if let Some(script) = case.raw_script() {
                test_case_ids.extend(extract_test_case_ids(script));
            }
        }

        self.execute(&run_id, files, request.browser.as_deref(), test_case_ids)
            .await
    }

    /// Record a run for the legacy trigger; nothing is executed
    pub fn register_run(&self, test_suite_id: &str) -> String {
        let run_id = new_run_id();
        self.registry.create(&run_id, TestRunStatus::started(&run_id));
        info!(run_id = %run_id, test_suite_id = %test_suite_id, "Registered run");
        run_id
    }

    /// Run a script supplied verbatim, bypassing materialization
    pub async fn run_generated_file(
        &self,
        request: GeneratedFileRequest,
    ) -> Result<GeneratedFileResponse, RunError> {
        let (suite_id, content) = match (
            non_blank(request.test_suite_id.as_deref()),
            non_blank(request.file_content.as_deref()),
        ) {
            (Some(suite_id), Some(content)) => (suite_id, content),
            _ => {
                return Err(RunError::validation(
                    "testSuiteId and fileContent are required",
                ))
            }
        };

        let run_id = resolve_run_id(request.run_id.as_deref());
        self.registry.create(&run_id, TestRunStatus::started(&run_id));
        self.announce_running(&run_id).await;
        info!(run_id = %run_id, test_suite_id = %suite_id, bytes = content.len(), "Running generated file");

        let status = match self.scripts_for(&run_id).write_raw(suite_id, content).await {
            Ok(path) => {
                self.registry.update(&run_id, |s| s.set_progress(MATERIALIZE_PROGRESS as u8));
                let ids = extract_test_case_ids(content);
                self.execute(&run_id, vec![path], request.browser.as_deref(), ids)
                    .await
            }
            Err(source) => {
                let err = RunError::Materialization {
                    test_case: stem,
                    source,
                };
                self.finish_failed(&run_id, err).await
            }
        };

        Ok(GeneratedFileResponse {
            run_id,
            status: status.status,
            failed_count: status.failed_tests,
        })
    }

    /// Scripts of one run live in their own directory below the work dir
    fn scripts_for(&self, run_id: &str) -> ScriptMaterializer {
        ScriptMaterializer::new(self.materializer.work_dir().join(file_stem(run_id)))
    }

    pub fn get_status(&self, run_id: &str) -> Option<TestRunStatus> {
        self.registry.get(run_id)
    }

    /// Mark a running run cancelled.
    ///
    /// Cooperative only: an executor invocation already in flight runs to
    /// completion, its counters are still recorded but the status stays
    /// `cancelled`.
    pub fn try_cancel(&self, run_id: &str) -> testrunner_common::Result<TestRunStatus> {
        self.registry
            .update(run_id, |s| -> testrunner_common::Result<TestRunStatus> {
                s.transition(RunState::Cancelled)?;
                Ok(s.clone())
            })
            .unwrap_or_else(|| {
                Err(Error::NotFound {
                    kind: "run".to_string(),
                    id: run_id.to_string(),
                })
            })
            .inspect(|_| info!(run_id = %run_id, "Run cancelled"))
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.try_cancel(run_id).is_ok()
    }

    async fn announce_running(&self, run_id: &str) {
        self.notify_best_effort(run_id, "join", self.notifier.join_run(run_id))
            .await;
        self.notify_best_effort(
            run_id,
            "update",
            self.notifier.send_update(
                run_id,
                json!({ "testRunId": run_id, "status": RunState::Running, "progress": 0 }),
            ),
        )
        .await;
    }

    async fn execute(
        &self,
        run_id: &str,
        files: Vec<PathBuf>,
        browser: Option<&str>,
        test_case_ids: HashMap<String, String>,
    ) -> TestRunStatus {
        self.registry.update(run_id, |s| {
            s.current_test = None;
            s.set_progress(MATERIALIZE_PROGRESS as u8);
        });

        let started = Instant::now();
        let result = self.run_executor(run_id, files, browser).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((outcome, browser)) => {
                self.finish_success(run_id, outcome, browser, elapsed_ms, &test_case_ids)
                    .await
            }
            Err(err) => {
                self.registry.update(run_id, |s| s.duration_ms = Some(elapsed_ms));
                self.finish_failed(run_id, err).await
            }
        }
    }

    /// Provision an executor for this run and try browser candidates in order
    async fn run_executor(
        &self,
        run_id: &str,
        files: Vec<PathBuf>,
        browser: Option<&str>,
    ) -> Result<(RunOutcome, String), RunError> {
        let executor = self
            .executors
            .launch()
            .await
            .map_err(|source| RunError::Execution { source })?;

        let runner = Runner::new()
            .src(files)
            .reporter(self.executor_config.report_path(run_id));

        let mut last_error = None;
        let mut result = None;
        for candidate in self.browsers.candidates(browser) {
            info!(run_id = %run_id, browser = %candidate, "Running tests");
            match executor.run(&runner.clone().browsers(candidate.clone()), &self.options).await {
                Ok(outcome) => {
                    result = Some(Ok((outcome, candidate)));
                    break;
                }
                Err(e @ ExecutorError::BrowserFailed { .. }) => {
                    warn!(run_id = %run_id, browser = %candidate, error = %e, "Browser failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => {
                    result = Some(Err(RunError::Execution { source: e }));
                    break;
                }
            }
        }

        if let Err(e) = executor.close().await {
            warn!(run_id = %run_id, error = %e, "Failed to close executor");
        }

        result.unwrap_or_else(|| {
            Err(RunError::Execution {
                source: last_error
                    .unwrap_or_else(|| ExecutorError::Spawn("no browser candidates".to_string())),
            })
        })
    }

    async fn finish_success(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        browser: String,
        elapsed_ms: u64,
        test_case_ids: &HashMap<String, String>,
    ) -> TestRunStatus {
        let next = if outcome.failed_count > 0 {
            RunState::Failed
        } else {
            RunState::Completed
        };
        let summary = outcome.report.as_ref().map(|r| r.summary());
        let results: Vec<TestResult> = outcome
            .report
            .as_ref()
            .map(|r| r.test_results(test_case_ids))
            .unwrap_or_default();

        let record = self.registry.update(run_id, |s| {
            match summary {
                Some(summary) if summary.total > 0 => {
                    s.total_tests = s.total_tests.max(summary.total);
                    s.completed_tests = summary.total;
                    s.passed_tests = summary.passed;
                    s.failed_tests = summary.failed;
                    s.skipped_tests = summary.skipped;
                }
                _ => {
                    s.failed_tests = outcome.failed_count;
                    s.passed_tests = s.total_tests.saturating_sub(outcome.failed_count);
                    s.completed_tests = s.total_tests;
                }
            }
            s.set_progress(100);
            s.current_test = None;
            s.duration_ms = Some(elapsed_ms);
            s.browser = Some(browser.clone());
            settle(s, next);
            s.clone()
        });

        let Some(record) = record else {
            return self.lost_record(run_id);
        };

        info!(
            run_id = %run_id,
            status = %record.status,
            passed = record.passed_tests,
            failed = record.failed_tests,
            duration_ms = elapsed_ms,
            "Test run finished"
        );

        self.notify_best_effort(
            run_id,
            "update",
            self.notifier.send_update(
                run_id,
                json!({
                    "testRunId": run_id,
                    "status": record.status,
                    "progress": 100,
                    "totalTests": record.total_tests,
                    "passedTests": record.passed_tests,
                    "failedTests": record.failed_tests,
                    "durationMs": elapsed_ms,
                }),
            ),
        )
        .await;
        self.finalize(record, results).await
    }

    async fn finish_failed(&self, run_id: &str, err: RunError) -> TestRunStatus {
        error!(run_id = %run_id, kind = err.kind(), error = %err, "Test run failed");
        let detail = err.to_detail();

        let record = self.registry.update(run_id, |s| {
            s.error = Some(detail.clone());
            s.current_test = None;
            settle(s, RunState::Failed);
            s.clone()
        });
        let Some(record) = record else {
            return self.lost_record(run_id);
        };

        self.notify_best_effort(
            run_id,
            "update",
            self.notifier.send_update(
                run_id,
                json!({
                    "testRunId": run_id,
                    "status": record.status,
                    "error": detail,
                    "timestamp": chrono::Utc::now(),
                }),
            ),
        )
        .await;
        self.finalize(record, Vec::new()).await
    }

    /// Terminal notification and webhooks
    async fn finalize(&self, record: TestRunStatus, results: Vec<TestResult>) -> TestRunStatus {
        self.notify_best_effort(
            &record.run_id,
            "completed",
            self.notifier.send_completed(&record.run_id, &record),
        )
        .await;
        self.notify_best_effort(&record.run_id, "leave", self.notifier.leave_run(&record.run_id))
            .await;

        if self.webhooks.is_enabled() {
            let webhooks = self.webhooks.clone();
            let status = record.clone();
            tokio::spawn(async move {
                webhooks.report_run(&status, &results).await;
            });
        }

        record
    }

    /// The record vanished mid-run (evicted or overwritten); report what we can
    fn lost_record(&self, run_id: &str) -> TestRunStatus {
        warn!(run_id = %run_id, "Run record disappeared before completion");
        let mut status = TestRunStatus::started(run_id);
        settle(&mut status, RunState::Failed);
        status
    }

    /// Await a notifier call, logging and discarding any failure
    async fn notify_best_effort<F>(&self, run_id: &str, event: &'static str, call: F)
    where
        F: Future<Output = Result<(), NotifyError>>,
    {
        if let Err(e) = call.await {
            warn!(run_id = %run_id, event, error = %e, "Realtime notification failed");
        }
    }
}

/// Move to a terminal state unless the run already reached one (e.g. cancelled)
fn settle(status: &mut TestRunStatus, next: RunState) {
    if status.status.is_terminal() {
        debug!(run_id = %status.run_id, status = %status.status, "Keeping terminal status");
        return;
    }
    if let Err(e) = status.transition(next) {
        warn!(run_id = %status.run_id, error = %e, "Unexpected status transition");
    }
}

fn resolve_run_id(requested: Option<&str>) -> String {
    non_blank(requested)
        .map(String::from)
        .unwrap_or_else(new_run_id)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
