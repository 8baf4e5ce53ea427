//! Realtime run notifications
//!
//! The orchestrator talks to a [`RunNotifier`]; production wires in the
//! SignalR [`HubClient`], deployments without a hub use [`NoopNotifier`].

pub mod hub;
pub mod protocol;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use testrunner_common::TestRunStatus;
use thiserror::Error;

pub use hub::{env_token_factory, ConnectionState, HubClient, TokenFactory};

/// Hub method names
pub mod methods {
    pub const JOIN_TEST_RUN: &str = "JoinTestRun";
    pub const SEND_TEST_UPDATE: &str = "SendTestUpdate";
    pub const SEND_TEST_RUN_COMPLETED: &str = "SendTestRunCompleted";
    pub const SEND_TEST_RUN_UPDATED: &str = "SendTestRunUpdated";
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Not connected to the realtime hub")]
    NotConnected,

    #[error("Negotiation failed: {0}")]
    Negotiate(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Hub method {method} failed: {message}")]
    Invocation { method: String, message: String },

    #[error("Hub method {0} timed out")]
    Timeout(String),

    #[error("Connection closed")]
    Closed,
}

/// Sink for run lifecycle events
#[async_trait]
pub trait RunNotifier: Send + Sync {
    /// Subscribe to the run's group; safe to call repeatedly
    async fn join_run(&self, run_id: &str) -> Result<(), NotifyError>;

    /// Free-form update (log line, step, running/failed notice)
    async fn send_update(&self, run_id: &str, message: Value) -> Result<(), NotifyError>;

    /// Terminal record of the run
    async fn send_completed(&self, run_id: &str, result: &TestRunStatus) -> Result<(), NotifyError>;

    /// Progress counters
    async fn send_progress(&self, run_id: &str, update: Value) -> Result<(), NotifyError>;

    /// The run is over; stop tracking its group
    async fn leave_run(&self, _run_id: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Accepts every event and does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl RunNotifier for NoopNotifier {
    async fn join_run(&self, _run_id: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send_update(&self, _run_id: &str, _message: Value) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send_completed(&self, _run_id: &str, _result: &TestRunStatus) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send_progress(&self, _run_id: &str, _update: Value) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// `min(base * 2^attempt, max)`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
