//! Core types for TestRunner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// Wait applied when a `wait` step carries no usable duration
pub const DEFAULT_WAIT_MS: u64 = 1000;

/// Treat an explicit JSON `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Browser action performed by a declarative step.
///
/// Unknown actions are kept verbatim in `Other` so that a request carrying a
/// newer action kind still parses; script generation degrades them to a
/// placeholder comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepAction {
    Navigate,
    Click,
    Type,
    Select,
    Wait,
    Assert,
    Screenshot,
    Other(String),
}

impl StepAction {
    pub fn as_str(&self) -> &str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::Click => "click",
            StepAction::Type => "type",
            StepAction::Select => "select",
            StepAction::Wait => "wait",
            StepAction::Assert => "assert",
            StepAction::Screenshot => "screenshot",
            StepAction::Other(name) => name,
        }
    }

    /// Whether the action operates on an element and needs a selector
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            StepAction::Click | StepAction::Type | StepAction::Select | StepAction::Assert
        )
    }
}

impl From<String> for StepAction {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => StepAction::Navigate,
            "click" => StepAction::Click,
            "type" => StepAction::Type,
            "select" => StepAction::Select,
            "wait" => StepAction::Wait,
            "assert" => StepAction::Assert,
            "screenshot" => StepAction::Screenshot,
            _ => StepAction::Other(value),
        }
    }
}

impl From<StepAction> for String {
    fn from(action: StepAction) -> Self {
        action.as_str().to_string()
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declarative browser action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    pub action: StepAction,
    #[serde(default)]
    pub target: Option<String>,
    /// URL, text, duration in ms or expected substring depending on `action`
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl TestStep {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            target: None,
            value: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Selector, if present and not blank
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// The value rendered as text; numbers and booleans are stringified
    pub fn value_text(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Duration for a `wait` step. Missing, negative or non-numeric values
    /// fall back to [`DEFAULT_WAIT_MS`].
    pub fn wait_ms(&self) -> u64 {
        let parsed = match self.value.as_ref() {
            Some(serde_json::Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().and_then(whole_ms)),
            Some(serde_json::Value::String(s)) => {
                let s = s.trim();
                s.parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_ms))
            }
            _ => None,
        };
        parsed.unwrap_or(DEFAULT_WAIT_MS)
    }
}

fn whole_ms(ms: f64) -> Option<u64> {
    if ms.is_finite() && ms >= 0.0 {
        Some(ms.floor() as u64)
    } else {
        None
    }
}

/// How a test case is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Steps,
    Script,
}

impl Default for TestType {
    fn default() -> Self {
        Self::Steps
    }
}

/// One executable test unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub test_type: TestType,
    #[serde(default)]
    pub script_text: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub steps: Vec<TestStep>,
    /// Accepted for forward compatibility; not enforced
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Accepted for forward compatibility; not enforced
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl TestCase {
    pub fn from_steps(id: impl Into<String>, name: impl Into<String>, steps: Vec<TestStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            test_type: TestType::Steps,
            script_text: None,
            steps,
            timeout: None,
            retry_count: None,
        }
    }

    pub fn from_script(id: impl Into<String>, name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            test_type: TestType::Script,
            script_text: Some(script.into()),
            steps: Vec::new(),
            timeout: None,
            retry_count: None,
        }
    }

    /// Ready-to-run script text, when this case is in script mode and has one
    pub fn raw_script(&self) -> Option<&str> {
        match self.test_type {
            TestType::Script => self.script_text.as_deref().filter(|s| !s.trim().is_empty()),
            TestType::Steps => None,
        }
    }
}

/// Named grouping of test cases sharing a fixture context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fixture: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub test_cases: Vec<TestCase>,
}

/// Top-level input of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub test_cases: Vec<TestCase>,
    #[serde(default, deserialize_with = "nullable")]
    pub test_suites: Vec<TestSuite>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

impl TestRunRequest {
    /// All test cases in execution order: the flat list first, then every
    /// suite in array order.
    pub fn flattened(&self) -> Vec<&TestCase> {
        self.test_cases
            .iter()
            .chain(self.test_suites.iter().flat_map(|s| s.test_cases.iter()))
            .collect()
    }

    pub fn total_tests(&self) -> usize {
        self.test_cases.len() + self.test_suites.iter().map(|s| s.test_cases.len()).sum::<usize>()
    }

    /// Reject requests that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        let cases = self.flattened();
        if cases.is_empty() {
            return Err(Error::InvalidRequest(
                "No test suites or test cases provided".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        // Script files are named after the id, so ids must stay distinct once
        // sanitized (and on case-insensitive filesystems)
        let mut stems: HashMap<String, &str> = HashMap::new();
        for case in cases {
            if case.id.trim().is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "Test case '{}' has no id",
                    case.name
                )));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(Error::InvalidRequest(format!(
                    "Duplicate test case id: {}",
                    case.id
                )));
            }
            if let Some(other) = stems.insert(crate::file_stem(&case.id).to_ascii_lowercase(), &case.id) {
                return Err(Error::InvalidRequest(format!(
                    "Test case ids '{}' and '{}' map to the same script file",
                    other, case.id
                )));
            }
        }

        Ok(())
    }
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Edges of the run state machine:
    /// pending -> running -> completed | failed | cancelled
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match (self, next) {
            (RunState::Pending, RunState::Running) => true,
            (RunState::Running, RunState::Completed)
            | (RunState::Running, RunState::Failed)
            | (RunState::Running, RunState::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured error attached to a failed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorDetail {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Mutable record of one run, keyed by `run_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    pub run_id: String,
    pub status: RunState,
    pub total_tests: u32,
    pub completed_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    /// 0-100
    pub progress: u8,
    #[serde(default)]
    pub current_test: Option<String>,
    #[serde(default)]
    pub error: Option<RunErrorDetail>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time spent inside the executor
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Browser configuration the executor actually ran with
    #[serde(default)]
    pub browser: Option<String>,
}

impl TestRunStatus {
    /// A fresh record for a run that has just been accepted
    pub fn started(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunState::Running,
            total_tests: 0,
            completed_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            progress: 0,
            current_test: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            browser: None,
        }
    }

    /// Move to `next`, rejecting edges outside the state machine
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: &str) -> TestCase {
        TestCase::from_steps(id, format!("case {}", id), vec![])
    }

    #[test]
    fn test_flatten_order() {
        let request = TestRunRequest {
            test_cases: vec![case("C")],
            test_suites: vec![TestSuite {
                test_cases: vec![case("A"), case("B")],
                ..Default::default()
            }],
            ..Default::default()
        };

        let ids: Vec<&str> = request.flattened().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(request.total_tests(), 3);
    }

    #[test]
    fn test_total_matches_flattened_len() {
        let request = TestRunRequest {
            test_cases: vec![case("1"), case("2")],
            test_suites: vec![
                TestSuite { test_cases: vec![case("3")], ..Default::default() },
                TestSuite::default(),
                TestSuite { test_cases: vec![case("4"), case("5"), case("6")], ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(request.total_tests(), 6);
        assert_eq!(request.flattened().len(), request.total_tests());
    }

    #[test]
    fn test_parse_request_camel_case() {
        let json = r##"{
            "runId": "run-1",
            "browser": "chrome",
            "testCases": [{
                "id": "t1",
                "name": "Login",
                "testType": "steps",
                "retryCount": 2,
                "steps": [
                    {"action": "navigate", "value": "https://x"},
                    {"action": "click", "target": "#submit"},
                    {"action": "hover", "target": "#menu"}
                ]
            }],
            "testSuites": null
        }"##;
        let request: TestRunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.run_id.as_deref(), Some("run-1"));
        assert!(request.test_suites.is_empty());

        let steps = &request.test_cases[0].steps;
        assert_eq!(steps[0].action, StepAction::Navigate);
        assert_eq!(steps[1].target(), Some("#submit"));
        assert_eq!(steps[2].action, StepAction::Other("hover".to_string()));
        assert_eq!(request.test_cases[0].retry_count, Some(2));
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let empty = TestRunRequest::default();
        assert!(matches!(empty.validate(), Err(Error::InvalidRequest(_))));

        let dup = TestRunRequest {
            test_cases: vec![case("a")],
            test_suites: vec![TestSuite { test_cases: vec![case("a")], ..Default::default() }],
            ..Default::default()
        };
        let err = dup.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate test case id"));
    }

    #[test]
    fn test_validate_rejects_ids_sharing_a_script_file() {
        let clash = TestRunRequest {
            test_cases: vec![case("a/b"), case("a_b")],
            ..Default::default()
        };
        let err = clash.validate().unwrap_err();
        assert!(err.to_string().contains("same script file"));

        let case_only = TestRunRequest {
            test_cases: vec![case("Login"), case("login")],
            ..Default::default()
        };
        assert!(case_only.validate().is_err());

        let distinct = TestRunRequest {
            test_cases: vec![case("a/b"), case("a-b")],
            ..Default::default()
        };
        assert!(distinct.validate().is_ok());
    }

    #[test]
    fn test_wait_ms_defaults() {
        let step = TestStep::new(StepAction::Wait);
        assert_eq!(step.wait_ms(), DEFAULT_WAIT_MS);
        assert_eq!(step.clone().with_value("soon").wait_ms(), DEFAULT_WAIT_MS);
        assert_eq!(step.clone().with_value(-5).wait_ms(), DEFAULT_WAIT_MS);
        assert_eq!(step.clone().with_value(250).wait_ms(), 250);
        assert_eq!(step.clone().with_value("750").wait_ms(), 750);
        assert_eq!(step.with_value(1.5).wait_ms(), 1);
    }

    #[test]
    fn test_raw_script_requires_script_mode() {
        let script = TestCase::from_script("s", "S", "test('x', async t => {});");
        assert!(script.raw_script().is_some());

        let blank = TestCase::from_script("s", "S", "   ");
        assert!(blank.raw_script().is_none());

        let mut steps = case("x");
        steps.script_text = Some("ignored".to_string());
        assert!(steps.raw_script().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let mut status = TestRunStatus::started("r");
        assert_eq!(status.status, RunState::Running);

        status.transition(RunState::Completed).unwrap();
        assert!(status.end_time.is_some());

        for next in [RunState::Running, RunState::Failed, RunState::Cancelled, RunState::Pending] {
            assert!(status.transition(next).is_err());
        }
        assert_eq!(status.status, RunState::Completed);
        assert!(RunState::Pending.can_transition_to(RunState::Running));
        assert!(!RunState::Pending.can_transition_to(RunState::Completed));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = TestRunStatus::started("abc");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["runId"], "abc");
        assert_eq!(value["status"], "running");
        assert_eq!(value["totalTests"], 0);
    }
}
