//! Run error taxonomy

use testrunner_common::RunErrorDetail;
use testrunner_executor::ExecutorError;
use thiserror::Error;

/// Why a run could not produce a normal result
#[derive(Error, Debug)]
pub enum RunError {
    /// Request rejected before any record exists
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// A script could not be written
    #[error("Failed to materialize test case {test_case}: {source}")]
    Materialization {
        test_case: String,
        #[source]
        source: std::io::Error,
    },

    /// The executor could not run the scripts
    #[error("Test execution failed: {source}")]
    Execution {
        #[source]
        source: ExecutorError,
    },
}

impl RunError {
    pub fn validation(message: impl Into<String>) -> Self {
        RunError::Validation {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Validation { .. } => "ValidationError",
            RunError::Materialization { .. } => "MaterializationError",
            RunError::Execution { .. } => "ExecutionError",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunError::Validation { .. } => "INVALID_REQUEST",
            RunError::Materialization { .. } => "MATERIALIZATION_FAILED",
            RunError::Execution { source } => source.code(),
        }
    }

    /// Structured form stored on the run record
    pub fn to_detail(&self) -> RunErrorDetail {
        let stack = std::error::Error::source(self).map(|cause| cause.to_string());
        let details = match self {
            RunError::Materialization { test_case, .. } => {
                Some(serde_json::json!({ "testCase": test_case }))
            }
            RunError::Execution {
                source: ExecutorError::BrowserFailed { browser, .. },
            } => Some(serde_json::json!({ "browser": browser })),
            _ => None,
        };

        RunErrorDetail {
            message: self.to_string(),
            stack,
            name: Some(self.kind().to_string()),
            code: Some(self.code().to_string()),
            details,
        }
    }
}

impl From<testrunner_common::Error> for RunError {
    fn from(e: testrunner_common::Error) -> Self {
        match e {
            testrunner_common::Error::InvalidRequest(message) => RunError::Validation { message },
            other => RunError::Validation {
                message: other.to_string(),
            },
        }
    }
}
