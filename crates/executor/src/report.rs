//! TestCafe JSON reporter output

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ExecutorError, ExecutorResult};

/// Top-level document written by `--reporter json:<path>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub passed: Option<u32>,
    #[serde(default)]
    pub skipped: Option<u32>,
    #[serde(default)]
    pub fixtures: Vec<FixtureReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureReport {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub name: String,
    /// Either formatted strings or objects with `errMsg`/`stack`
    #[serde(default)]
    pub errs: Vec<serde_json::Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub skipped: bool,
}

/// Outcome of one test in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl TestReport {
    pub fn outcome(&self) -> TestOutcome {
        if !self.errs.is_empty() {
            TestOutcome::Failed
        } else if self.skipped {
            TestOutcome::Skipped
        } else {
            TestOutcome::Passed
        }
    }

    /// Message of the first error, if the test failed
    pub fn error_message(&self) -> Option<String> {
        let first = self.errs.first()?;
        Some(match first {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("errMsg")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| "Test failed".to_string()),
            other => other.to_string(),
        })
    }

    /// Stack of the first error, falling back to its formatted text
    pub fn stack_trace(&self) -> Option<String> {
        let first = self.errs.first()?;
        match first {
            serde_json::Value::Object(map) => map
                .get("stack")
                .and_then(|s| s.as_str())
                .map(String::from)
                .or_else(|| self.error_message()),
            _ => self.error_message(),
        }
    }
}

/// Counters derived from a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Per-test result forwarded to the automation API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_case_id: Option<String>,
    pub test_case_name: String,
    pub status: TestOutcome,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl RunReport {
    pub fn from_json(json: &str) -> ExecutorResult<Self> {
        serde_json::from_str(json).map_err(ExecutorError::from)
    }

    pub async fn from_file(path: &Path) -> ExecutorResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
            .map_err(|e| ExecutorError::Report(format!("{}: {}", path.display(), e)))
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestReport> {
        self.fixtures.iter().flat_map(|f| f.tests.iter())
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for test in self.tests() {
            summary.total += 1;
            match test.outcome() {
                TestOutcome::Passed => summary.passed += 1,
                TestOutcome::Failed => summary.failed += 1,
                TestOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn failed_count(&self) -> u32 {
        self.summary().failed
    }

    /// Results for every test, with ids resolved through `ids` (test name -> test case id)
    pub fn test_results(&self, ids: &HashMap<String, String>) -> Vec<TestResult> {
        self.tests()
            .map(|test| TestResult {
                test_case_id: ids.get(&test.name).cloned(),
                test_case_name: test.name.clone(),
                status: test.outcome(),
                duration_ms: test.duration_ms,
                error_message: test.error_message(),
                stack_trace: test.stack_trace(),
            })
            .collect()
    }
}

/// `test('<name>', ... { // TEST_CASE_ID: <id>` with any quote style
static TEST_CASE_ID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"(?s)test(?:\.skip|\.only)?\s*\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)[^{]*\{[^}]*?//\s*TEST_CASE_ID:\s*(\S+)"#,
    )
    .ok()
});

/// Extract `test name -> test case id` pairs from a script carrying
/// `// TEST_CASE_ID: <id>` markers right after each `test(` opening brace.
pub fn extract_test_case_ids(script: &str) -> HashMap<String, String> {
    let Some(pattern) = TEST_CASE_ID_PATTERN.as_ref() else {
        return HashMap::new();
    };
    pattern
        .captures_iter(script)
        .filter_map(|caps| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))?
                .as_str()
                .to_string();
            let id = caps.get(4)?.as_str().to_string();
            Some((name, id))
        })
        .collect()
}
