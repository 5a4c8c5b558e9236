//! Test runner
//!
//! Runs script files against a subject command: discovers the files, runs
//! them concurrently, and reports a result table with timings. The actual
//! conversation of every failed test is written next to it as
//! `<name>.failed.log`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::engine::{run_expect, ExpectConfig};
use crate::error::Result;
use crate::parser::{split_arguments, Script};
use crate::process::ProcessHandle;
use crate::tools::{self, DEFAULT_EXTENSION};
use crate::transcript::Transcript;

/// Minimum width of the name column in the result table
const TABLE_WIDTH: usize = 30;

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Script file, or directory of scripts when `dir` is set
    pub path: PathBuf,
    /// Command line of the program under test
    pub subject: String,
    /// Run every script in `path` instead of `path` itself
    pub dir: bool,
    /// Extension that marks script files in a directory
    pub extension: String,
    /// Interpreter settings for every script
    pub expect: ExpectConfig,
    /// Include the full conversation of every test in the report
    pub verbose: bool,
    /// Write `<name>.failed.log` for failed tests
    pub write_logs: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            subject: String::new(),
            dir: false,
            extension: DEFAULT_EXTENSION.to_string(),
            expect: ExpectConfig::default(),
            verbose: false,
            write_logs: true,
        }
    }
}

/// Result of running all tests
#[derive(Debug)]
pub struct TestResult {
    /// Individual test case results, in file order
    pub cases: Vec<TestCaseResult>,
    /// Wall-clock time of the whole run
    pub duration: Duration,
}

impl TestResult {
    /// Check if all tests passed
    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|c| c.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed).count()
    }

    /// Mean duration of a single test
    pub fn average(&self) -> Duration {
        if self.cases.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.cases.iter().map(|c| c.duration).sum();
        total / self.cases.len() as u32
    }

    /// Format a summary line
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed ({}ms)",
            self.passed_count(),
            self.failed_count(),
            self.duration.as_millis(),
        )
    }

    /// Write the result table, failure details and timings
    pub fn write_report(&self, out: &mut impl Write, verbose: bool) -> std::io::Result<()> {
        let width = self
            .cases
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0)
            .max(TABLE_WIDTH);

        writeln!(out, "{:<width$} result", "test", width = width)?;
        writeln!(out, "{} -------", "-".repeat(width))?;

        for case in &self.cases {
            if case.passed {
                writeln!(out, "{:<width$} success", case.name, width = width)?;
            } else if let Some(log) = case.log_file.as_deref().and_then(Path::file_name) {
                let log = log.to_string_lossy();
                writeln!(out, "{:<width$} fail (see {})", case.name, log, width = width)?;
                writeln!(out, "\twrote a log of the actual output to {}", log)?;
            } else {
                writeln!(out, "{:<width$} fail", case.name, width = width)?;
            }

            if let Some(ref error) = case.error {
                writeln!(out, "\t{}", error)?;
            }
            if !case.passed {
                write_indented(out, &case.notes)?;
                write_indented(out, &case.diff)?;
            }
            if verbose && !case.conversation.is_empty() {
                writeln!(out, "\t--- conversation ---")?;
                for line in &case.conversation {
                    writeln!(out, "\t{}", line)?;
                }
            }
        }

        writeln!(out)?;
        writeln!(out, "total time: {}ms", self.duration.as_millis())?;
        writeln!(out, "average time per test: {}ms", self.average().as_millis())?;
        Ok(())
    }
}

fn write_indented(out: &mut impl Write, text: &str) -> std::io::Result<()> {
    for line in text.lines() {
        writeln!(out, "\t{}", line)?;
    }
    Ok(())
}

/// Result of a single test case
#[derive(Debug, Clone)]
pub struct TestCaseResult {
    /// File name of the script
    pub name: String,
    /// Source file path
    pub file: PathBuf,
    /// Whether every expectation matched
    pub passed: bool,
    /// Set when the test could not run at all
    pub error: Option<String>,
    /// Interpreter diagnostics
    pub notes: String,
    /// Unified diff of expected against actual conversation
    pub diff: String,
    /// The conversation as it happened
    pub conversation: Vec<String>,
    pub duration: Duration,
    /// The failure log written for this test
    pub log_file: Option<PathBuf>,
}

impl TestCaseResult {
    fn errored(file: &Path, name: String, error: String, duration: Duration) -> Self {
        Self {
            name,
            file: file.to_path_buf(),
            passed: false,
            error: Some(error),
            notes: String::new(),
            diff: String::new(),
            conversation: Vec::new(),
            duration,
            log_file: None,
        }
    }
}

/// The test runner
pub struct TestRunner {
    config: RunConfig,
}

impl TestRunner {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Script files this runner would run
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        tools::discover(&self.config.path, self.config.dir, &self.config.extension)
    }

    /// Run all discovered tests concurrently
    pub async fn run_all(&self) -> Result<TestResult> {
        let start = Instant::now();
        let files = self.discover()?;
        tracing::debug!(count = files.len(), subject = %self.config.subject, "running scripts");

        let cases = futures::future::join_all(files.iter().map(|f| self.run_one(f))).await;

        Ok(TestResult {
            cases,
            duration: start.elapsed(),
        })
    }

    /// Run a single script file against a fresh subject
    pub async fn run_one(&self, file: &Path) -> TestCaseResult {
        let start = Instant::now();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        let (script, subject) = match self.prepare(file) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::info!(test = %name, error = %e, "test could not start");
                return TestCaseResult::errored(file, name, e.to_string(), start.elapsed());
            }
        };

        let transcript = Transcript::default();
        let report = match run_expect(subject, &script, &self.config.expect, &transcript).await {
            Ok(report) => report,
            Err(e) => {
                return TestCaseResult::errored(file, name, e.to_string(), start.elapsed());
            }
        };

        let passed = report.passed();
        let conversation = transcript.conversation();
        let log_file = if !passed && self.config.write_logs {
            self.write_failure_log(file, &conversation)
        } else {
            None
        };

        let duration = start.elapsed();
        tracing::info!(test = %name, passed, ms = duration.as_millis() as u64, "test finished");

        TestCaseResult {
            name,
            file: file.to_path_buf(),
            passed,
            error: None,
            notes: transcript.notes(),
            diff: report.diff(),
            conversation,
            duration,
            log_file,
        }
    }

    /// Parse the script and spawn the subject with the script's arguments
    fn prepare(&self, file: &Path) -> Result<(Script, ProcessHandle)> {
        let script = Script::from_file(file)?;
        let mut argv = split_arguments(&self.config.subject)?;
        argv.extend(script.arguments()?);
        let subject = ProcessHandle::spawn_argv(&argv)?;
        Ok((script, subject))
    }

    fn write_failure_log(&self, file: &Path, conversation: &[String]) -> Option<PathBuf> {
        let path = tools::replace_extension(file, ".failed.log", false);
        let mut content = conversation.join("\n");
        content.push('\n');
        match std::fs::write(&path, content) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(log = %path.display(), error = %e, "failed to write failure log");
                None
            }
        }
    }
}

/// Builder API for convenient test runner construction
pub struct TestRunnerBuilder {
    config: RunConfig,
}

impl TestRunnerBuilder {
    /// Start building a runner for a script file or directory.
    /// Directories are scanned for scripts.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            config: RunConfig {
                dir: path.is_dir(),
                path,
                ..Default::default()
            },
        }
    }

    /// Set the command line of the program under test
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.config.subject = subject.into();
        self
    }

    pub fn dir(mut self, dir: bool) -> Self {
        self.config.dir = dir;
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.config.extension = extension.into();
        self
    }

    pub fn error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.expect.error_prefix = prefix.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.expect.timeout = timeout;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn write_logs(mut self, write_logs: bool) -> Self {
        self.config.write_logs = write_logs;
        self
    }

    /// Apply `COUPLER_VERBOSE` and `COUPLER_TIMEOUT_MS` from the environment
    pub fn from_env(mut self) -> Self {
        if std::env::var_os("COUPLER_VERBOSE").is_some() {
            self.config.verbose = true;
        }
        if let Some(ms) = std::env::var("COUPLER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.config.expect.timeout = Duration::from_millis(ms);
        }
        self
    }

    pub fn build(self) -> TestRunner {
        TestRunner::new(self.config)
    }

    /// Build and run all tests
    pub async fn run(self) -> Result<TestResult> {
        self.build().run_all().await
    }
}

/// Convenience function: create a runner builder for a file or directory
pub fn run(path: impl Into<PathBuf>) -> TestRunnerBuilder {
    TestRunnerBuilder::new(path)
}

/// Run script files against `subject` and integrate with `#[test]` by
/// panicking on failure.
///
/// Usage in cargo tests:
/// ```rust,ignore
/// #[test]
/// fn greeter_scripts() {
///     emx_coupler::run_and_assert("tests/scripts", "sh tests/fixtures/greeter.sh");
/// }
/// ```
pub fn run_and_assert(path: impl Into<PathBuf>, subject: &str) {
    let runner = run(path).subject(subject).from_env().build();
    let verbose = runner.config().verbose;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start runtime");
    let result = rt.block_on(runner.run_all()).expect("failed to run tests");

    let mut report = Vec::new();
    result
        .write_report(&mut report, verbose)
        .expect("failed to render report");
    eprintln!("{}", String::from_utf8_lossy(&report));
    eprintln!("{}", result.summary());

    if !result.all_passed() {
        panic!("{} test(s) failed", result.failed_count());
    }
}
