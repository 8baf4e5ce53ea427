//! TestCafe executor - drives the `testcafe` CLI as a child process

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::report::RunReport;

/// Lines of process output kept in error messages
const OUTPUT_TAIL_LINES: usize = 20;

/// Per-run TestCafe timeouts, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub page_load_ms: u64,
    pub browser_init_ms: u64,
    pub selector_ms: u64,
    pub assertion_ms: u64,
}

impl Timeouts {
    /// Production (headless server) runs get roughly twice the headroom
    pub fn standard(production: bool) -> Self {
        if production {
            Self {
                page_load_ms: 120_000,
                browser_init_ms: 300_000,
                selector_ms: 30_000,
                assertion_ms: 30_000,
            }
        } else {
            Self {
                page_load_ms: 60_000,
                browser_init_ms: 180_000,
                selector_ms: 15_000,
                assertion_ms: 15_000,
            }
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::standard(false)
    }
}

/// Options applied to a single `run`
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub skip_js_errors: bool,
    pub quarantine_mode: bool,
    pub stop_on_first_fail: bool,
    pub speed: f32,
    pub timeouts: Timeouts,
}

impl RunOptions {
    pub fn standard(production: bool) -> Self {
        Self {
            skip_js_errors: true,
            quarantine_mode: false,
            stop_on_first_fail: false,
            speed: 1.0,
            timeouts: Timeouts::standard(production),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::standard(false)
    }
}

/// What the executor is asked to run: sources, a browser and a report target
#[derive(Debug, Clone, Default)]
pub struct Runner {
    sources: Vec<PathBuf>,
    browser: Option<String>,
    report_path: Option<PathBuf>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn browsers(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    /// Write the JSON report to `path`
    pub fn reporter(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn browser(&self) -> Option<&str> {
        self.browser.as_deref()
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }
}

/// Result of one executor invocation
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Number of failed tests; zero means the whole run passed
    pub failed_count: u32,

    /// Parsed JSON report, when the executor produced one
    pub report: Option<RunReport>,
}

/// A provisioned browser-automation engine
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the given sources and report how many tests failed.
    ///
    /// An `Err` means the run could not happen at all (browser did not
    /// start, executor missing); failing tests are an `Ok` with a non-zero
    /// count.
    async fn run(&self, runner: &Runner, options: &RunOptions) -> ExecutorResult<RunOutcome>;

    /// Release the instance; further runs fail with `ExecutorError::Closed`
    async fn close(&self) -> ExecutorResult<()>;
}

/// Provisions executor instances, one per run
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn launch(&self) -> ExecutorResult<Box<dyn Executor>>;
}

/// How the TestCafe CLI is invoked
#[derive(Debug, Clone)]
pub struct TestCafeConfig {
    /// Program to spawn
    pub command: String,

    /// Arguments placed before the browser and sources
    pub base_args: Vec<String>,

    /// Hostname the TestCafe proxy binds to
    pub hostname: String,

    /// Fixed proxy ports; a free pair is picked per instance when unset
    pub ports: Option<(u16, u16)>,

    /// Probe `<command> <base_args> --version` before launching
    pub check_installed: bool,
}

impl Default for TestCafeConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            base_args: vec!["testcafe".to_string()],
            hostname: "127.0.0.1".to_string(),
            ports: None,
            check_installed: true,
        }
    }
}

/// One TestCafe instance: a proxy port pair and at most one live process
pub struct TestCafe {
    config: TestCafeConfig,
    ports: (u16, u16),
    child_pid: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl TestCafe {
    pub async fn launch(config: TestCafeConfig) -> ExecutorResult<Self> {
        if config.check_installed {
            Self::check_testcafe_installed(&config).await?;
        }

        let ports = match config.ports {
            Some(ports) => ports,
            None => find_free_port_pair()?,
        };
        debug!(ports = ?ports, "Provisioned TestCafe instance");

        Ok(Self {
            config,
            ports,
            child_pid: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    async fn check_testcafe_installed(config: &TestCafeConfig) -> ExecutorResult<()> {
        let status = Command::new(&config.command)
            .args(&config.base_args)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(ExecutorError::TestCafeNotFound),
        }
    }

    pub fn ports(&self) -> (u16, u16) {
        self.ports
    }

    /// Full argument list passed to `config.command`
    pub fn command_args(&self, runner: &Runner, options: &RunOptions) -> ExecutorResult<Vec<String>> {
        if runner.sources().is_empty() {
            return Err(ExecutorError::NoSources);
        }
        let browser = runner.browser().unwrap_or(crate::browser::DEFAULT_BROWSER);

        let mut args = self.config.base_args.clone();
        args.push(browser.to_string());
        args.extend(runner.sources().iter().map(|p| p.display().to_string()));

        args.push("--hostname".to_string());
        args.push(self.config.hostname.clone());
        args.push("--ports".to_string());
        args.push(format!("{},{}", self.ports.0, self.ports.1));

        if options.skip_js_errors {
            args.push("--skip-js-errors".to_string());
        }
        if options.quarantine_mode {
            args.push("--quarantine-mode".to_string());
        }
        if options.stop_on_first_fail {
            args.push("--stop-on-first-fail".to_string());
        }
        if let Some(report) = runner.report_path() {
            args.push("--reporter".to_string());
            args.push(format!("json:{}", report.display()));
        }

        let t = &options.timeouts;
        for (flag, value) in [
            ("--page-load-timeout", t.page_load_ms),
            ("--browser-init-timeout", t.browser_init_ms),
            ("--selector-timeout", t.selector_ms),
            ("--assertion-timeout", t.assertion_ms),
        ] {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
        args.push("--speed".to_string());
        args.push(options.speed.to_string());

        Ok(args)
    }

    async fn read_report(path: &Path) -> Option<RunReport> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return None;
        }
        match RunReport::from_file(path).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable TestCafe report");
                None
            }
        }
    }
}

#[async_trait]
impl Executor for TestCafe {
    async fn run(&self, runner: &Runner, options: &RunOptions) -> ExecutorResult<RunOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }
        let args = self.command_args(runner, options)?;
        let browser = runner
            .browser()
            .unwrap_or(crate::browser::DEFAULT_BROWSER)
            .to_string();

        if let Some(parent) = runner.report_path().and_then(Path::parent) {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            browser = %browser,
            sources = runner.sources().len(),
            ports = ?self.ports,
            "Starting TestCafe"
        );

        let child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExecutorError::TestCafeNotFound,
                _ => ExecutorError::Spawn(format!("{}: {}", self.config.command, e)),
            })?;

        *self.child_pid.lock() = child.id();
        let output = child.wait_with_output().await;
        *self.child_pid.lock() = None;
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, stdout = %tail(&stdout), "TestCafe exited");

        let report = match runner.report_path() {
            Some(path) => Self::read_report(path).await,
            None => None,
        };

        match report {
            Some(report) if report.tests().next().is_some() => Ok(RunOutcome {
                failed_count: report.failed_count(),
                report: Some(report),
            }),
            _ if output.status.success() => Ok(RunOutcome {
                failed_count: 0,
                report: None,
            }),
            _ => {
                let reason = match tail(&stderr) {
                    s if s.is_empty() => format!("exited with {}", output.status),
                    s => s,
                };
                Err(ExecutorError::BrowserFailed { browser, reason })
            }
        }
    }

    /// Refuse further runs. A process still running (close racing an
    /// in-flight `run`) gets SIGTERM; finished processes were already reaped.
    async fn close(&self) -> ExecutorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pid = self.child_pid.lock().take();
        if let Some(pid) = pid {
            info!(pid, "Stopping TestCafe");

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %e, "Failed to signal TestCafe");
                }
            }
        }

        Ok(())
    }
}

/// Launches a fresh `TestCafe` per call
#[derive(Debug, Clone, Default)]
pub struct TestCafeFactory {
    config: TestCafeConfig,
}

impl TestCafeFactory {
    pub fn new(config: TestCafeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutorFactory for TestCafeFactory {
    async fn launch(&self) -> ExecutorResult<Box<dyn Executor>> {
        let testcafe = TestCafe::launch(self.config.clone()).await?;
        Ok(Box::new(testcafe))
    }
}

/// Two distinct free loopback ports, both held open while picking
fn find_free_port_pair() -> std::io::Result<(u16, u16)> {
    let first = TcpListener::bind("127.0.0.1:0")?;
    let second = TcpListener::bind("127.0.0.1:0")?;
    Ok((first.local_addr()?.port(), second.local_addr()?.port()))
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(command: &str, base_args: &[&str]) -> TestCafe {
        TestCafe {
            config: TestCafeConfig {
                command: command.to_string(),
                base_args: base_args.iter().map(|s| s.to_string()).collect(),
                ports: Some((1337, 1338)),
                check_installed: false,
                ..Default::default()
            },
            ports: (1337, 1338),
            child_pid: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_command_args() {
        let testcafe = instance("npx", &["testcafe"]);
        let runner = Runner::new()
            .src(["/w/t1.test.js", "/w/t2.test.js"])
            .browsers("chrome:headless")
            .reporter("/w/runs/r1.report.json");

        let args = testcafe.command_args(&runner, &RunOptions::standard(false)).unwrap();
        assert_eq!(
            args,
            vec![
                "testcafe",
                "chrome:headless",
                "/w/t1.test.js",
                "/w/t2.test.js",
                "--hostname",
                "127.0.0.1",
                "--ports",
                "1337,1338",
                "--skip-js-errors",
                "--reporter",
                "json:/w/runs/r1.report.json",
                "--page-load-timeout",
                "60000",
                "--browser-init-timeout",
                "180000",
                "--selector-timeout",
                "15000",
                "--assertion-timeout",
                "15000",
                "--speed",
                "1",
            ]
        );
    }

    #[test]
    fn test_production_timeouts_and_flags() {
        let testcafe = instance("npx", &["testcafe"]);
        let runner = Runner::new().src(["a.test.js"]);
        let options = RunOptions {
            quarantine_mode: true,
            stop_on_first_fail: true,
            ..RunOptions::standard(true)
        };

        let args = testcafe.command_args(&runner, &options).unwrap();
        assert_eq!(args[1], crate::browser::DEFAULT_BROWSER);
        assert!(args.contains(&"--quarantine-mode".to_string()));
        assert!(args.contains(&"--stop-on-first-fail".to_string()));
        assert!(!args.contains(&"--reporter".to_string()));

        let idx = args.iter().position(|a| a == "--page-load-timeout").unwrap();
        assert_eq!(args[idx + 1], "120000");
    }

    #[test]
    fn test_no_sources() {
        let testcafe = instance("npx", &["testcafe"]);
        let err = testcafe
            .command_args(&Runner::new(), &RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NoSources));
    }

    #[test]
    fn test_free_port_pair_distinct() {
        let (a, b) = find_free_port_pair().unwrap();
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let output: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let t = tail(&output);
        assert_eq!(t.lines().count(), OUTPUT_TAIL_LINES);
        assert!(t.ends_with("line 49"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success_without_report() {
        let testcafe = instance("sh", &["-c", "exit 0", "testcafe"]);
        let runner = Runner::new().src(["a.test.js"]).browsers("chrome:headless");

        let outcome = testcafe.run(&runner, &RunOptions::default()).await.unwrap();
        assert_eq!(outcome.failed_count, 0);
        assert!(outcome.report.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_counts_failures_from_report() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("fixture.json");
        std::fs::write(
            &source,
            r#"{"fixtures":[{"name":"F","tests":[
                {"name":"a","errs":[],"durationMs":5},
                {"name":"b","errs":["boom"],"durationMs":7}
            ]}]}"#,
        )
        .unwrap();
        let report = tmp.path().join("runs").join("r1.report.json");

        let script = format!("cp '{}' '{}'; exit 1", source.display(), report.display());
        let testcafe = instance("sh", &["-c", &script, "testcafe"]);
        let runner = Runner::new()
            .src(["a.test.js"])
            .browsers("chrome:headless")
            .reporter(&report);

        let outcome = testcafe.run(&runner, &RunOptions::default()).await.unwrap();
        assert_eq!(outcome.failed_count, 1);
        assert_eq!(outcome.report.unwrap().summary().total, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_browser_failure() {
        let testcafe = instance("sh", &["-c", "echo 'Unable to open the browser' >&2; exit 1", "testcafe"]);
        let runner = Runner::new().src(["a.test.js"]).browsers("firefox");

        let err = testcafe.run(&runner, &RunOptions::default()).await.unwrap_err();
        match err {
            ExecutorError::BrowserFailed { browser, reason } => {
                assert_eq!(browser, "firefox");
                assert!(reason.contains("Unable to open the browser"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_command() {
        let testcafe = instance("definitely-not-a-testcafe-binary", &[]);
        let runner = Runner::new().src(["a.test.js"]);
        let err = testcafe.run(&runner, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::TestCafeNotFound));
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_runs() {
        let testcafe = instance("sh", &["-c", "exit 0", "testcafe"]);
        testcafe.close().await.unwrap();
        testcafe.close().await.unwrap();

        let runner = Runner::new().src(["a.test.js"]);
        let err = testcafe.run(&runner, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_terminates_running_process() {
        let testcafe = instance("sh", &["-c", "exec sleep 30", "testcafe"]);
        let runner = Runner::new().src(["a.test.js"]).browsers("chrome:headless");

        let closing = async {
            while testcafe.child_pid.lock().is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            testcafe.close().await
        };
        let options = RunOptions::default();
        let (outcome, closed) = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            async { tokio::join!(testcafe.run(&runner, &options), closing) },
        )
        .await
        .unwrap();

        closed.unwrap();
        assert!(matches!(outcome, Err(ExecutorError::BrowserFailed { .. })));
        assert!(testcafe.child_pid.lock().is_none());
    }
}
