//! emx-coupler: couple interactive CLI programs and replay expect scripts
//!
//! Two ways to drive a line-oriented interactive program (the *subject*):
//!
//! - **Coupling**: connect its stdin/stdout to a second live program (the
//!   *tester*) so the two converse. Each output line of one is forwarded as
//!   an input line of the other until both have ended.
//! - **Expect scripts**: replay a script against it. Every expected output
//!   line waits at most a timeout; a timed-out read stays pending and is
//!   matched against the next expectation.
//!
//! # Script Syntax
//!
//! ```text
//! $$ --name Bob
//! # a comment, printed to the diagnostics
//! > hello
//! Hello, hello
//! <r Hello, [a-z]+
//! <l > this line is expected literally
//! <e
//! ```
//!
//! | Prefix | Meaning |
//! |--------|---------|
//! | `$$ ` | Arguments appended to the subject command |
//! | `> ` | Line sent to the subject |
//! | `#` | Comment |
//! | `<e` | Expect a line starting with the error prefix |
//! | `<r ` | Expect a line fully matching a regex |
//! | `<l ` | Expect the rest of the line literally |
//! | other | Expect the whole line literally |

mod coupler;
mod engine;
mod error;
mod parser;
mod process;
mod recorder;
mod runner;
mod tools;
mod transcript;

pub use coupler::{couple, Shutdown, ShutdownPhase, Side};
pub use engine::{
    drain, run_expect, Abort, AbortReason, Engine, ExpectConfig, ExpectReport, ExpectRun, InFlightRead,
    Outcome, OutputReader, Step, DEFAULT_ERROR_PREFIX, DEFAULT_TIMEOUT,
};
pub use error::{Error, ErrorKind, Result};
pub use parser::{parse_line, split_arguments, split_lines, Directive, LinePattern, Script, ScriptLine};
pub use process::{
    channel, stdio, BoxedSink, BoxedSource, ChannelSink, ChannelSource, ExitFuture, LineReader, LineSink,
    LineSource, LineWriter, ProcessHandle, ProcessStatus,
};
pub use recorder::{record, RecordConfig, DEFAULT_RECORD_TIMEOUT};
pub use runner::{TestCaseResult, TestResult, TestRunner, TestRunnerBuilder, RunConfig};
pub use tools::{
    discover, generalize, generalize_file, replace_extension, split_file, split_script, SplitScript,
    DEFAULT_EXTENSION,
};
pub use transcript::{Echo, Entry, Transcript};

// Convenience functions for cargo test integration
pub use runner::{run, run_and_assert};
