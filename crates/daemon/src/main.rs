//! TestRunner daemon
//!
//! Serves the test-run HTTP API and keeps the realtime hub connection alive.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use testrunner_daemon::{
    build_orchestrator, spawn_retention_sweep, ApiServer, HubClient, NoopNotifier, RunNotifier,
    RunRegistry, ServiceConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "testrunnerd")]
#[command(about = "TestRunner daemon - runs TestCafe suites on request and streams their status")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testrunner.toml")]
    config: PathBuf,

    /// HTTP listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Key expected in the x-api-key header and sent with webhooks
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Automation API base URL (hub and webhooks)
    #[arg(long, env = "API_URL")]
    api_url: Option<String>,

    /// Directory generated scripts are written to
    #[arg(long, env = "TEMP_TESTS_DIR")]
    temp_tests_dir: Option<PathBuf>,

    /// Only launch headless browsers and use production timeouts
    #[arg(long, env = "FORCE_HEADLESS")]
    force_headless: Option<bool>,

    /// Browser used when a request does not name one
    #[arg(long, env = "BROWSER")]
    browser: Option<String>,

    /// Do not connect to the realtime hub
    #[arg(long)]
    no_hub: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Layer flags and environment over the file configuration
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(key) = &self.api_key {
            config.server.api_key = key.clone();
            config.webhook.api_key = key.clone();
        }
        if let Some(url) = &self.api_url {
            config.set_api_url(url);
        }
        if let Some(dir) = &self.temp_tests_dir {
            config.executor.work_dir = dir.clone();
        }
        if let Some(headless) = self.force_headless {
            config.executor.force_headless = headless;
        }
        if let Some(browser) = &self.browser {
            config.executor.default_browser = browser.clone();
        }
        if self.no_hub {
            config.hub.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("TestRunner daemon v{}", testrunner_common::VERSION);

    let mut config = ServiceConfig::load(&cli.config)?;
    cli.apply(&mut config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let hub = config
        .hub
        .enabled
        .then(|| HubClient::from_config(config.hub.clone()));
    let notifier: Arc<dyn RunNotifier> = match &hub {
        Some(hub) => {
            info!(url = %config.hub.hub_url(), "Connecting to realtime hub");
            hub.connect().await?;
            Arc::new(hub.clone())
        }
        None => {
            warn!("Realtime hub disabled, run updates are only available via /status");
            Arc::new(NoopNotifier)
        }
    };

    let runs = RunRegistry::new();
    let sweeper = config
        .registry
        .retention()
        .map(|retention| spawn_retention_sweep(runs.clone(), retention, config.registry.sweep_interval()));

    let orchestrator = build_orchestrator(&config, runs, notifier);
    let server = ApiServer::new(orchestrator, config.server.api_key.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };
    server.serve(addr, shutdown).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    if let Some(hub) = hub {
        hub.stop().await;
    }

    info!("TestRunner daemon shutdown complete");
    Ok(())
}
