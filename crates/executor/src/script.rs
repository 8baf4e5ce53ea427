//! Script materialization: test cases to TestCafe files on disk

use std::path::{Path, PathBuf};
use tracing::debug;

pub use testrunner_common::file_stem;
use testrunner_common::{StepAction, TestCase, TestStep};

/// Suffix of every generated script file
pub const SCRIPT_EXTENSION: &str = "test.js";

/// Page every generated fixture starts from
const BLANK_PAGE: &str = "about:blank";

/// Marker linking a generated `test()` back to its test case
pub const TEST_CASE_ID_MARKER: &str = "TEST_CASE_ID:";

/// Writes one executable script per test case under a working directory
#[derive(Debug, Clone)]
pub struct ScriptMaterializer {
    work_dir: PathBuf,
}

impl ScriptMaterializer {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path the script for test case `id` is written to
    pub fn script_path(&self, id: &str) -> PathBuf {
        self.work_dir
            .join(format!("{}.{}", file_stem(id), SCRIPT_EXTENSION))
    }

    /// Write the script for `case` and return its path.
    ///
    /// Script-mode cases with text are written verbatim; everything else is
    /// rendered from its steps.
    pub async fn materialize(&self, case: &TestCase) -> std::io::Result<PathBuf> {
        let script = match case.raw_script() {
            Some(raw) => raw.to_string(),
            None => render_steps(case),
        };
        self.write_raw(&case.id, &script).await
    }

    /// Write `content` as the script for `id`, bypassing generation
    pub async fn write_raw(&self, id: &str, content: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let path = self.script_path(id);
        tokio::fs::write(&path, content).await?;

        debug!(path = %path.display(), bytes = content.len(), "Wrote test script");
        Ok(path)
    }
}

/// Render a steps-mode test case as a TestCafe script.
///
/// Pure function of its input: the same case always yields the same bytes.
pub fn render_steps(case: &TestCase) -> String {
    let name = js_string(&case.name);
    let mut script = String::new();

    script.push_str("import { Selector } from 'testcafe';\n\n");
    script.push_str(&format!("fixture({})\n    .page({});\n\n", name, js_string(BLANK_PAGE)));
    script.push_str(&format!("test({}, async t => {{\n", name));
    script.push_str(&format!(
        "    // {} {}\n",
        TEST_CASE_ID_MARKER,
        comment_text(&case.id)
    ));

    for step in &case.steps {
        for line in step_to_js(step).lines() {
            script.push_str("    ");
            script.push_str(line);
            script.push('\n');
        }
    }

    script.push_str("});\n");
    script
}

/// Convert a step to TestCafe statements
fn step_to_js(step: &TestStep) -> String {
    if step.action.requires_target() && step.target().is_none() {
        return format!("// Skipped {}: missing target", comment_text(step.action.as_str()));
    }
    let target = step.target().unwrap_or_default();
    let value = step.value_text().unwrap_or_default();

    match &step.action {
        StepAction::Navigate => format!("await t.navigateTo({});", js_string(&value)),
        StepAction::Click => format!("await t.click(Selector({}));", js_string(target)),
        StepAction::Type => format!(
            "await t.typeText(Selector({}), {});",
            js_string(target),
            js_string(&value)
        ),
        StepAction::Select => format!(
            "// select {}: choosing an option value is not implemented, clicking the target only\nawait t.click(Selector({}));",
            comment_text(&value),
            js_string(target)
        ),
        StepAction::Wait => format!("await t.wait({});", step.wait_ms()),
        StepAction::Assert => format!(
            "await t.expect(Selector({}).innerText).contains({});",
            js_string(target),
            js_string(&value)
        ),
        StepAction::Screenshot => "await t.takeScreenshot();".to_string(),
        StepAction::Other(action) => format!("// Unsupported action: {}", comment_text(action)),
    }
}

/// Quote `s` as a single-quoted JavaScript string literal
pub fn js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Text safe to place inside a `//` comment
fn comment_text(s: &str) -> String {
    s.replace(['\r', '\n', '\u{2028}', '\u{2029}'], " ")
}
