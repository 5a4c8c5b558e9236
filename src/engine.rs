//! Expect interpreter
//!
//! The Engine replays a parsed [`Script`] against a subject: input lines are
//! written to the subject, expectation lines each consume one line of the
//! subject's output, waiting at most `timeout` for it.
//!
//! A timeout does not give up on the read. The read stays in flight (the
//! reader becomes [`OutputReader::Pending`]) and the next expectation awaits
//! that same read again, so a late line is matched against whichever
//! expectation is current when it arrives. Only one read is ever in flight:
//! the line source moves into the read and comes back when it resolves.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use similar::TextDiff;

use crate::error::Result;
use crate::parser::{Directive, LinePattern, Script};
use crate::process::{BoxedSource, LineSink, ProcessHandle, ProcessStatus};
use crate::transcript::Transcript;

/// Default output prefix that marks an error line
pub const DEFAULT_ERROR_PREFIX: &str = "Error, ";

/// Default wait per expectation when replaying a script
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interpreter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectConfig {
    /// Lines starting with this satisfy `<e`
    pub error_prefix: String,
    /// Maximum wait for each expected line
    pub timeout: Duration,
}

impl Default for ExpectConfig {
    fn default() -> Self {
        Self {
            error_prefix: DEFAULT_ERROR_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExpectConfig {
    pub fn with_error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of one expectation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Matched,
    Mismatched { expected: String, actual: String },
    TimedOut,
    SubjectExited,
}

impl Outcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Outcome::Matched)
    }
}

/// One evaluated expectation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Script line of the expectation
    pub line_number: usize,
    /// The expectation as written
    pub raw: String,
    pub outcome: Outcome,
}

/// Why a run stopped before the end of the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The subject's output ended; no further line can arrive
    SubjectExited,
    /// The subject's input could not be written
    InputClosed,
}

/// Where and why a run stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub line_number: usize,
    pub reason: AbortReason,
}

/// Everything a script run produced
#[derive(Debug, Clone)]
pub struct ExpectReport {
    /// False as soon as any expectation failed
    pub success: bool,
    /// Every evaluated expectation, in order
    pub steps: Vec<Step>,
    /// Set when the run stopped before the end of the script
    pub aborted: Option<Abort>,
    /// Output the subject printed after the script ended
    pub trailing_output: Vec<String>,
    /// The subject's exit status, when the run owned the subject
    pub subject_status: Option<ProcessStatus>,
    expected: Vec<String>,
    actual: Vec<String>,
}

impl Default for ExpectReport {
    fn default() -> Self {
        Self {
            success: true,
            steps: Vec::new(),
            aborted: None,
            trailing_output: Vec::new(),
            subject_status: None,
            expected: Vec::new(),
            actual: Vec::new(),
        }
    }
}

impl ExpectReport {
    /// Whether every expectation matched and the subject never exited early
    pub fn passed(&self) -> bool {
        self.success
    }

    /// Expectations that did not match
    pub fn failures(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| !s.outcome.is_match())
    }

    /// Unified diff of the conversation the script describes against the one
    /// that happened. Empty when both agree.
    pub fn diff(&self) -> String {
        let expected = join_lines(&self.expected);
        let mut actual_lines = self.actual.clone();
        actual_lines.extend(self.trailing_output.iter().cloned());
        let actual = join_lines(&actual_lines);
        if expected == actual {
            return String::new();
        }
        TextDiff::from_lines(&expected, &actual)
            .unified_diff()
            .header("expected", "actual")
            .to_string()
    }

    fn record(&mut self, line_number: usize, raw: &str, outcome: Outcome) {
        if !outcome.is_match() {
            self.success = false;
        }
        self.steps.push(Step {
            line_number,
            raw: raw.to_string(),
            outcome,
        });
    }

    fn abort(&mut self, line_number: usize, reason: AbortReason) {
        self.success = false;
        self.aborted = Some(Abort { line_number, reason });
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// A read of the subject's next output line that may not have resolved yet.
///
/// Owns the line source while in flight and hands it back on completion.
pub struct InFlightRead {
    fut: BoxFuture<'static, (BoxedSource, Result<Option<String>>)>,
}

impl InFlightRead {
    fn issue(mut source: BoxedSource) -> Self {
        Self {
            fut: Box::pin(async move {
                let line = source.next_line().await;
                (source, line)
            }),
        }
    }
}

impl Future for InFlightRead {
    type Output = (BoxedSource, Result<Option<String>>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}

/// The subject's output, either idle or with one read outstanding
pub enum OutputReader {
    /// No read outstanding; the next expectation issues a fresh one
    Ready(BoxedSource),
    /// A read timed out and is still waiting; the next expectation reuses it
    Pending(InFlightRead),
}

impl OutputReader {
    pub fn new(source: BoxedSource) -> Self {
        OutputReader::Ready(source)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, OutputReader::Pending(_))
    }

    /// The outstanding read, or a fresh one
    fn into_read(self) -> InFlightRead {
        match self {
            OutputReader::Ready(source) => InFlightRead::issue(source),
            OutputReader::Pending(read) => read,
        }
    }
}

/// What one expectation looks for
enum Expectation<'a> {
    Error,
    Regex(&'a LinePattern),
    Literal(&'a str),
}

/// A finished script run and the subject output reader, if it is still open
pub struct ExpectRun {
    pub report: ExpectReport,
    pub reader: Option<OutputReader>,
}

/// The expect interpreter
pub struct Engine {
    config: ExpectConfig,
}

impl Engine {
    pub fn new(config: ExpectConfig) -> Self {
        Self { config }
    }

    /// Run `script` against a subject's output and input.
    ///
    /// Mismatches and timeouts are recorded and the run goes on; the end of
    /// the subject's output or a failed write stops it.
    pub async fn execute(
        &self,
        script: &Script,
        subject_out: BoxedSource,
        subject_in: &mut dyn LineSink,
        transcript: &Transcript,
    ) -> ExpectRun {
        let mut report = ExpectReport::default();
        let mut reader = Some(OutputReader::new(subject_out));

        for line in &script.lines {
            let expectation = match &line.directive {
                Directive::Argument(_) => continue,
                Directive::Comment(text) => {
                    transcript.note(text);
                    continue;
                }
                Directive::SendInput(text) => {
                    report.expected.push(format!("> {}", text));
                    if let Err(e) = subject_in.write_line(text).await {
                        tracing::warn!(line = line.line_number, error = %e, "cannot write to subject");
                        transcript.note(&format!("[Could not send input: {}]", e.message));
                        report.abort(line.line_number, AbortReason::InputClosed);
                        break;
                    }
                    transcript.input(text);
                    report.actual.push(format!("> {}", text));
                    continue;
                }
                Directive::ExpectError => Expectation::Error,
                Directive::ExpectRegex(pattern) => Expectation::Regex(pattern),
                Directive::ExpectLiteral(text) => Expectation::Literal(text),
            };

            let Some(current) = reader.take() else {
                break;
            };
            let reused = current.is_pending();
            let mut read = current.into_read();
            tracing::trace!(line = line.line_number, reused, "awaiting subject output");

            match tokio::time::timeout(self.config.timeout, &mut read).await {
                Err(_) => {
                    transcript.note("[Expected more output (timeout)]");
                    report.expected.push(expected_line(&expectation, &line.raw));
                    report.record(line.line_number, &line.raw, Outcome::TimedOut);
                    reader = Some(OutputReader::Pending(read));
                }
                Ok((source, Ok(Some(actual)))) => {
                    transcript.output(&actual);
                    reader = Some(OutputReader::Ready(source));
                    let outcome = self.evaluate(&expectation, &actual);
                    if let Outcome::Mismatched { expected, .. } = &outcome {
                        transcript.note(&mismatch_note(&expectation, expected));
                        transcript.note(&format!("[     Got] {}", actual));
                        report.expected.push(expected_line(&expectation, &line.raw));
                    } else {
                        report.expected.push(actual.clone());
                    }
                    report.actual.push(actual);
                    report.record(line.line_number, &line.raw, outcome);
                }
                Ok((_, ended)) => {
                    if let Err(e) = ended {
                        transcript.note(&format!("[Subject output unreadable: {}]", e));
                    }
                    transcript.note("[Subject exited unexpectedly]");
                    report.expected.push(expected_line(&expectation, &line.raw));
                    report.record(line.line_number, &line.raw, Outcome::SubjectExited);
                    report.abort(line.line_number, AbortReason::SubjectExited);
                    break;
                }
            }
        }

        ExpectRun { report, reader }
    }

    fn evaluate(&self, expectation: &Expectation<'_>, actual: &str) -> Outcome {
        let (matched, expected) = match expectation {
            Expectation::Error => (
                actual.starts_with(&self.config.error_prefix),
                format!("error (starting with '{}')", self.config.error_prefix),
            ),
            Expectation::Regex(pattern) => (pattern.is_match(actual), pattern.anchored()),
            Expectation::Literal(text) => (actual == *text, text.to_string()),
        };
        if matched {
            Outcome::Matched
        } else {
            Outcome::Mismatched {
                expected,
                actual: actual.to_string(),
            }
        }
    }
}

/// The expectation as a line of the expected conversation
fn expected_line(expectation: &Expectation<'_>, raw: &str) -> String {
    match expectation {
        Expectation::Literal(text) => text.to_string(),
        _ => raw.to_string(),
    }
}

fn mismatch_note(expectation: &Expectation<'_>, expected: &str) -> String {
    match expectation {
        Expectation::Error => format!("[Expected {}]", expected),
        Expectation::Regex(_) => format!("[Expected match to {}]", expected),
        Expectation::Literal(_) => format!("[Expected] {}", expected),
    }
}

/// Read whatever the subject still prints until its output ends
pub async fn drain(reader: OutputReader, transcript: &Transcript) -> Vec<String> {
    let mut lines = Vec::new();
    let mut read = reader.into_read();
    loop {
        match read.await {
            (source, Ok(Some(line))) => {
                transcript.output(&line);
                lines.push(line);
                read = InFlightRead::issue(source);
            }
            (_, Ok(None)) => break,
            (_, Err(e)) => {
                transcript.note(&format!("[Subject output unreadable: {}]", e));
                break;
            }
        }
    }
    lines
}

/// Replay `script` against a subject this run owns.
///
/// After the script the subject's input is closed, its remaining output is
/// drained into the transcript and its exit is awaited. The subject's exit
/// status is reported but does not decide success.
pub async fn run_expect(
    subject: ProcessHandle,
    script: &Script,
    config: &ExpectConfig,
    transcript: &Transcript,
) -> Result<ExpectReport> {
    let ProcessHandle {
        name,
        stdout,
        mut stdin,
        exit,
    } = subject;

    let engine = Engine::new(config.clone());
    let ExpectRun { mut report, reader } = engine.execute(script, stdout, stdin.as_mut(), transcript).await;

    stdin.close().await?;
    if let Some(reader) = reader {
        report.trailing_output = drain(reader, transcript).await;
    }

    let status = exit.await?;
    tracing::debug!(subject = %name, ?status, success = report.success, "script finished");
    report.subject_status = Some(status);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{channel, LineSource};

    fn script(text: &str) -> Script {
        Script::parse(text, "test").unwrap()
    }

    /// Greets every input line, reports an error for long lines and quits
    fn greeter() -> ProcessHandle {
        ProcessHandle::in_memory("greeter", |mut stdin, mut stdout| async move {
            while let Ok(Some(line)) = stdin.next_line().await {
                if line.len() > 20 {
                    let _ = stdout.write_line("Error, ight imma head out").await;
                    return ProcessStatus::success();
                }
                let reply = match line.as_str() {
                    "ping" => "pong".to_string(),
                    _ => format!("Hello, {}", line),
                };
                if stdout.write_line(&reply).await.is_err() {
                    break;
                }
            }
            ProcessStatus::success()
        })
    }

    /// Prints `lines` after `delay`, then waits for its input to close
    fn delayed(delay: Duration, lines: &'static [&'static str]) -> ProcessHandle {
        ProcessHandle::in_memory("delayed", move |mut stdin, mut stdout| async move {
            tokio::time::sleep(delay).await;
            for line in lines {
                let _ = stdout.write_line(line).await;
            }
            while let Ok(Some(_)) = stdin.next_line().await {}
            ProcessStatus::success()
        })
    }

    async fn run(subject: ProcessHandle, text: &str) -> (ExpectReport, Transcript) {
        let transcript = Transcript::default();
        let report = run_expect(subject, &script(text), &ExpectConfig::default(), &transcript)
            .await
            .unwrap();
        (report, transcript)
    }

    fn outcomes(report: &ExpectReport) -> Vec<Outcome> {
        report.steps.iter().map(|s| s.outcome.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_pong_passes() {
        let (report, transcript) = run(greeter(), "> ping\npong\n").await;
        assert!(report.passed());
        assert_eq!(outcomes(&report), vec![Outcome::Matched]);
        assert_eq!(transcript.conversation(), vec!["> ping", "pong"]);
        assert!(report.diff().is_empty());
        assert_eq!(report.subject_status, Some(ProcessStatus::success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_with_error() {
        let text = "$$ --verbose\n# greet\n> hello\nHello, hello\n> toolongtoolongtoolongtoolong\n<e\n";
        let (report, transcript) = run(greeter(), text).await;
        assert!(report.passed(), "notes: {}", transcript.notes());
        assert_eq!(outcomes(&report), vec![Outcome::Matched, Outcome::Matched]);
        assert_eq!(transcript.notes(), "# greet\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_regex_mismatch() {
        let subject = delayed(Duration::ZERO, &["abc"]);
        let (report, transcript) = run(subject, "<r ^[0-9]+$\n").await;
        assert!(!report.passed());
        assert_eq!(outcomes(&report), vec![Outcome::Mismatched {
            expected: "^^[0-9]+$$".into(),
            actual: "abc".into(),
        }]);
        assert!(transcript.notes().contains("[Expected match to ^^[0-9]+$$]"));
        assert!(transcript.notes().contains("[     Got] abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regex_partial_match_fails() {
        let subject = delayed(Duration::ZERO, &["123abc", "123"]);
        let (report, _) = run(subject, "<r [0-9]+\n<r [0-9]+\n").await;
        assert_eq!(report.steps[0].outcome, Outcome::Mismatched {
            expected: "^[0-9]+$".into(),
            actual: "123abc".into(),
        });
        assert_eq!(report.steps[1].outcome, Outcome::Matched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_literal_is_exact() {
        let subject = delayed(Duration::ZERO, &["hello ", "Hello", "<l x"]);
        let (report, _) = run(subject, "hello\nhello\n<l <l x\n").await;
        assert_eq!(outcomes(&report), vec![
            Outcome::Mismatched { expected: "hello".into(), actual: "hello ".into() },
            Outcome::Mismatched { expected: "hello".into(), actual: "Hello".into() },
            Outcome::Matched,
        ]);
        // failures are recorded and the run continues
        assert!(report.aborted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_prefix() {
        let subject = delayed(Duration::ZERO, &["Error, nope", "error, nope", "Fehler: nein"]);
        let (report, transcript) = run(subject, "<e\n<e\n").await;
        assert_eq!(outcomes(&report), vec![
            Outcome::Matched,
            Outcome::Mismatched {
                expected: "error (starting with 'Error, ')".into(),
                actual: "error, nope".into(),
            },
        ]);
        assert!(transcript.notes().contains("[Expected error (starting with 'Error, ')]"));

        // custom prefix
        let subject = delayed(Duration::ZERO, &["Fehler: nein"]);
        let config = ExpectConfig::default().with_error_prefix("Fehler: ");
        let report = run_expect(subject, &script("<e\n"), &config, &Transcript::default())
            .await
            .unwrap();
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_pending_read() {
        // the only line arrives after the first expectation gave up
        let subject = delayed(Duration::from_millis(1500), &["second"]);
        let (report, transcript) = run(subject, "first\nsecond\n").await;
        assert!(!report.passed());
        assert_eq!(outcomes(&report), vec![Outcome::TimedOut, Outcome::Matched]);
        assert!(transcript.notes().contains("[Expected more output (timeout)]"));
        assert_eq!(transcript.outputs(), vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_timeouts_reuse_one_read() {
        let subject = delayed(Duration::from_millis(2500), &["late", "later"]);
        let (report, _) = run(subject, "a\nb\nlate\nlater\n").await;
        assert_eq!(outcomes(&report), vec![
            Outcome::TimedOut,
            Outcome::TimedOut,
            Outcome::Matched,
            Outcome::Matched,
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subject_exit_short_circuits() {
        let subject = ProcessHandle::in_memory("quitter", |stdin, mut stdout| async move {
            let _stdin = stdin;
            let _ = stdout.write_line("A").await;
            ProcessStatus::failure(1)
        });
        let (report, transcript) = run(subject, "> go\nA\nB\nC\n> more\nD\n").await;
        assert!(!report.passed());
        assert_eq!(outcomes(&report), vec![Outcome::Matched, Outcome::SubjectExited]);
        assert_eq!(report.aborted, Some(Abort {
            line_number: 3,
            reason: AbortReason::SubjectExited,
        }));
        assert!(transcript.notes().contains("[Subject exited unexpectedly]"));
        // nothing after the abort was sent
        assert_eq!(transcript.conversation(), vec!["> go", "A"]);
        assert_eq!(report.subject_status, Some(ProcessStatus::failure(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_output_is_drained() {
        let subject = delayed(Duration::ZERO, &["one", "two", "three"]);
        let (report, transcript) = run(subject, "one\n").await;
        assert!(report.passed());
        assert_eq!(report.trailing_output, vec!["two", "three"]);
        assert_eq!(transcript.outputs(), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_read_resolves_while_draining() {
        let subject = delayed(Duration::from_millis(1200), &["eventually"]);
        let (report, _) = run(subject, "now\n").await;
        assert_eq!(outcomes(&report), vec![Outcome::TimedOut]);
        assert_eq!(report.trailing_output, vec!["eventually"]);
    }

    #[tokio::test]
    async fn test_write_to_closed_input_aborts() {
        let (mut input, subject_stdin) = channel();
        drop(subject_stdin);
        let (mut output, subject_stdout) = channel();
        output.close().await.unwrap();

        let transcript = Transcript::default();
        let engine = Engine::new(ExpectConfig::default());
        let run = engine
            .execute(&script("> hi\nHello, hi\n"), Box::new(subject_stdout), &mut input, &transcript)
            .await;
        assert!(!run.report.passed());
        assert!(run.report.steps.is_empty());
        assert_eq!(run.report.aborted.map(|a| a.reason), Some(AbortReason::InputClosed));
        assert!(transcript.notes().contains("[Could not send input:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diff_shows_mismatch() {
        let (report, _) = run(greeter(), "> world\nHello, word\n").await;
        let diff = report.diff();
        assert!(diff.contains("-Hello, word"), "{}", diff);
        assert!(diff.contains("+Hello, world"), "{}", diff);
        assert!(diff.contains(" > world"), "{}", diff);
    }

    #[tokio::test]
    async fn test_comments_and_arguments_do_not_touch_subject() {
        let (mut input, mut subject_stdin) = channel();
        let (_output, subject_stdout) = channel();
        let transcript = Transcript::default();
        let engine = Engine::new(ExpectConfig::default());
        let run = engine
            .execute(&script("$$ -x\n# just talk\n"), Box::new(subject_stdout), &mut input, &transcript)
            .await;
        assert!(run.report.passed());
        assert!(run.report.steps.is_empty());
        assert!(matches!(run.reader, Some(OutputReader::Ready(_))));
        input.close().await.unwrap();
        assert_eq!(subject_stdin.next_line().await.unwrap(), None);
        assert_eq!(transcript.notes(), "# just talk\n");
    }
}
