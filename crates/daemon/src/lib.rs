//! TestRunner daemon
//!
//! Accepts test-run requests over HTTP, turns them into TestCafe scripts,
//! runs them, and reports status while they execute:
//!
//! ```text
//!   POST /run-tests ──► Orchestrator ──► ScriptMaterializer ──► temp-tests/*.test.js
//!                           │      └───► TestCafe (one instance per run)
//!                           ├──► RunRegistry (GET /status, POST /cancel)
//!                           ├──► HubClient (SignalR test-run hub)
//!                           └──► WebhookReporter (runner-webhook endpoints)
//! ```

pub mod config;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod server;
pub mod state;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;
use testrunner_executor::{ExecutorFactory, TestCafeFactory};
use tokio::task::JoinHandle;
use tracing::info;

pub use config::ServiceConfig;
pub use error::RunError;
pub use notifier::{HubClient, NoopNotifier, RunNotifier};
pub use orchestrator::Orchestrator;
pub use server::ApiServer;
pub use state::RunRegistry;

/// Orchestrator backed by the real TestCafe executor
pub fn build_orchestrator(
    config: &ServiceConfig,
    registry: RunRegistry,
    notifier: Arc<dyn RunNotifier>,
) -> Arc<Orchestrator> {
    let executors: Arc<dyn ExecutorFactory> =
        Arc::new(TestCafeFactory::new(config.executor.testcafe()));
    Arc::new(Orchestrator::new(config, registry, notifier, executors))
}

/// Periodically evict finished runs older than `retention`
pub fn spawn_retention_sweep(
    registry: RunRegistry,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Run retention enabled"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Ok(retention) = chrono::Duration::from_std(retention) else {
                continue;
            };
            registry.evict_finished_before(chrono::Utc::now() - retention);
        }
    })
}
