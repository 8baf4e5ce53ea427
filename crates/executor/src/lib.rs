//! TestRunner Executor
//!
//! Turns test cases into TestCafe scripts and runs them:
//! - Materializes each test case as a `<id>.test.js` file
//! - Picks browser candidates for a run
//! - Drives the `testcafe` CLI as a child process, one instance per run
//! - Parses the JSON report back into counters and per-test results
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ScriptMaterializer                                      │
//! │    └── materialize(case) -> <work_dir>/<id>.test.js      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ExecutorFactory::launch() -> Box<dyn Executor>          │
//! │    ├── run(Runner { src, browsers, reporter }, options)  │
//! │    │     -> RunOutcome { failed_count, report }          │
//! │    └── close()                                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  RunReport (json reporter)                               │
//! │    ├── summary() -> total / passed / failed / skipped    │
//! │    └── test_results(ids) -> [TestResult]                 │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod error;
pub mod report;
pub mod script;
pub mod testcafe;

pub use browser::{BrowserPolicy, DEFAULT_BROWSER};
pub use error::{ExecutorError, ExecutorResult};
pub use report::{extract_test_case_ids, ReportSummary, RunReport, TestOutcome, TestResult};
pub use script::{file_stem, render_steps, ScriptMaterializer};
pub use testcafe::{
    Executor, ExecutorFactory, RunOptions, RunOutcome, Runner, TestCafe, TestCafeConfig,
    TestCafeFactory, Timeouts,
};
