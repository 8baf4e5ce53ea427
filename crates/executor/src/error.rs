//! Error types for test execution

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("TestCafe not found. Install with: npm install -g testcafe")]
    TestCafeNotFound,

    #[error("No test files to run")]
    NoSources,

    #[error("Failed to start executor: {0}")]
    Spawn(String),

    #[error("Browser {browser} failed: {reason}")]
    BrowserFailed { browser: String, reason: String },

    #[error("Executor already closed")]
    Closed,

    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Short machine-readable code, surfaced in run error details
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::TestCafeNotFound => "EXECUTOR_NOT_FOUND",
            ExecutorError::NoSources => "NO_SOURCES",
            ExecutorError::Spawn(_) => "SPAWN_FAILED",
            ExecutorError::BrowserFailed { .. } => "BROWSER_FAILED",
            ExecutorError::Closed => "EXECUTOR_CLOSED",
            ExecutorError::Report(_) => "REPORT_INVALID",
            ExecutorError::Io(_) => "IO",
            ExecutorError::Json(_) => "JSON",
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
