//! Service configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use testrunner_executor::{file_stem, BrowserPolicy, TestCafeConfig, DEFAULT_BROWSER};

/// Automation API the hub and webhooks talk to
pub const DEFAULT_API_URL: &str = "http://localhost:5106";

/// Shared key for inbound requests and outbound webhooks
pub const DEFAULT_API_KEY: &str = "test-runner-api-key-2024";

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub executor: ExecutorConfig,
    pub webhook: WebhookConfig,
    pub registry: RegistryConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Value every protected request must carry in `x-api-key`
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            api_key: DEFAULT_API_KEY.to_string(),
        }
    }
}

/// Realtime hub (SignalR) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Disable to run without live updates
    pub enabled: bool,

    /// Base URL of the automation API hosting the hub
    pub api_url: String,

    /// Hub path below `api_url`
    pub hub_path: String,

    /// Environment variable the access token is read from at connect time
    pub access_token_env: String,

    /// Delay before the single retry after a failed initial connect
    pub initial_retry_delay_ms: u64,

    /// Reconnect backoff base
    pub reconnect_base_delay_ms: u64,

    /// Reconnect backoff cap
    pub reconnect_max_delay_ms: u64,

    /// Give up reconnecting after this many attempts; retry forever when unset
    pub max_reconnect_attempts: Option<u32>,

    /// How long an invocation waits for its completion
    pub invocation_timeout_ms: u64,

    /// Interval between keep-alive pings
    pub keep_alive_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: DEFAULT_API_URL.to_string(),
            hub_path: "/hubs/testrun".to_string(),
            access_token_env: "HUB_ACCESS_TOKEN".to_string(),
            initial_retry_delay_ms: 5000,
            reconnect_base_delay_ms: 2000,
            reconnect_max_delay_ms: 15000,
            max_reconnect_attempts: None,
            invocation_timeout_ms: 10_000,
            keep_alive_interval_ms: 15_000,
        }
    }
}

impl HubConfig {
    /// Absolute hub URL, e.g. `http://localhost:5106/hubs/testrun`
    pub fn hub_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            self.hub_path.trim_start_matches('/')
        )
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

/// Script materialization and TestCafe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Directory generated scripts and reports are written to
    pub work_dir: PathBuf,

    /// Browser used when a request does not name one
    pub default_browser: String,

    /// Headless-only browsers and production timeouts
    pub force_headless: bool,

    /// Try further browsers when the requested one cannot start
    pub browser_fallback: bool,

    /// Program that runs TestCafe
    pub command: String,

    /// Arguments placed before the browser and sources
    pub args: Vec<String>,

    /// Hostname the TestCafe proxy binds to
    pub hostname: String,

    /// Probe for TestCafe before each run
    pub check_installed: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("temp-tests"),
            default_browser: DEFAULT_BROWSER.to_string(),
            force_headless: false,
            browser_fallback: true,
            command: "npx".to_string(),
            args: vec!["testcafe".to_string()],
            hostname: "127.0.0.1".to_string(),
            check_installed: true,
        }
    }
}

impl ExecutorConfig {
    pub fn browser_policy(&self) -> BrowserPolicy {
        BrowserPolicy {
            default_browser: self.default_browser.clone(),
            force_headless: self.force_headless,
            fallback: self.browser_fallback,
        }
    }

    pub fn testcafe(&self) -> TestCafeConfig {
        TestCafeConfig {
            command: self.command.clone(),
            base_args: self.args.clone(),
            hostname: self.hostname.clone(),
            ports: None,
            check_installed: self.check_installed,
        }
    }

    /// Where the JSON report of `run_id` is written; always inside `work_dir/runs`
    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.work_dir
            .join("runs")
            .join(format!("{}.report.json", file_stem(run_id)))
    }
}

/// Outbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,

    /// Base URL of the automation API
    pub api_url: String,

    /// Sent as `X-API-Key`
    pub api_key: String,

    /// Per-request timeout
    pub timeout_ms: u64,

    /// Attempts per webhook, including the first
    pub max_attempts: u32,

    /// Linear backoff step between status webhook attempts
    pub status_backoff_ms: u64,

    /// Linear backoff step between result webhook attempts
    pub result_backoff_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: DEFAULT_API_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            timeout_ms: 10_000,
            max_attempts: 3,
            status_backoff_ms: 1000,
            result_backoff_ms: 500,
        }
    }
}

/// Run registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Evict finished runs older than this; keep everything when unset
    pub retention_secs: Option<u64>,

    /// How often the retention sweep runs
    pub sweep_interval_secs: Option<u64>,
}

impl RegistryConfig {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(300))
    }
}

impl ServiceConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Point both the hub and the webhooks at `api_url`
    pub fn set_api_url(&mut self, api_url: &str) {
        self.hub.api_url = api_url.to_string();
        self.webhook.api_url = api_url.to_string();
    }
}
