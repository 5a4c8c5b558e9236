//! emx-coupler CLI
//!
//! Couple interactive programs, replay expect scripts and manage script files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgGroup, Args, Parser, Subcommand};
use emx_coupler::{
    couple, discover, generalize_file, record, split_arguments, split_file, stdio, Echo, Engine, ExpectConfig,
    ProcessHandle, RecordConfig, RunConfig, Script, TestRunner, Transcript, DEFAULT_ERROR_PREFIX,
    DEFAULT_EXTENSION,
};

#[derive(Parser, Debug)]
#[command(name = "emx-coupler")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Couple interactive CLI programs and replay expect scripts against them")]
struct Cli {
    /// Verbose output: debug logging and full conversations
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pipe a subject and a tester into each other
    #[command(group(ArgGroup::new("peer").required(true).args(["tester", "expect"])))]
    Couple {
        /// Command line of the program under test
        #[arg(long)]
        subject: String,

        /// Command line of the program that talks to the subject
        #[arg(long)]
        tester: Option<String>,

        /// Script to replay against the subject as the tester
        #[arg(long)]
        expect: Option<PathBuf>,

        #[command(flatten)]
        matching: MatchArgs,
    },

    /// Act as a tester: replay a script over this process's stdin/stdout
    Expect {
        /// The script to replay
        file: PathBuf,

        #[command(flatten)]
        matching: MatchArgs,
    },

    /// Run scripts against a subject and report the results
    #[command(alias = "test")]
    Run {
        /// Script file, or directory with -d
        file: PathBuf,

        /// Command line of the program under test
        #[arg(long)]
        subject: String,

        #[command(flatten)]
        files: FileArgs,

        #[command(flatten)]
        matching: MatchArgs,
    },

    /// Split a script into <name>.in and <name>.out
    Split {
        file: PathBuf,

        #[command(flatten)]
        files: FileArgs,
    },

    /// Rewrite recorded error lines to <e
    Generalize {
        file: PathBuf,

        #[command(flatten)]
        files: FileArgs,

        /// The output prefix indicating an error
        #[arg(long = "error-prefix", alias = "error", default_value = DEFAULT_ERROR_PREFIX)]
        error_prefix: String,
    },

    /// Record an interactive session with a subject as a script
    Record {
        /// Command line of the program to talk to
        #[arg(long)]
        subject: String,

        /// The script file to write
        #[arg(long = "log", alias = "file")]
        log: PathBuf,

        /// Time to wait for answers from the subject, in milliseconds
        #[arg(short, long, default_value_t = 50)]
        timeout: u64,
    },
}

#[derive(Args, Debug, Clone)]
struct MatchArgs {
    /// The output prefix indicating an error
    #[arg(long = "error-prefix", alias = "error", default_value = DEFAULT_ERROR_PREFIX)]
    error_prefix: String,

    /// Time to wait for each expected line, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout: u64,
}

impl MatchArgs {
    fn config(&self) -> ExpectConfig {
        ExpectConfig::default()
            .with_error_prefix(self.error_prefix.clone())
            .with_timeout(Duration::from_millis(self.timeout))
    }
}

#[derive(Args, Debug, Clone)]
struct FileArgs {
    /// Apply the command to all scripts in the given directory
    #[arg(short = 'd', visible_short_alias = 'r', long)]
    dir: bool,

    /// Extension of script files, used with -d
    #[arg(long = "ext", alias = "extension", default_value = DEFAULT_EXTENSION)]
    extension: String,
}

impl FileArgs {
    fn resolve(&self, file: &Path) -> anyhow::Result<Vec<PathBuf>> {
        discover(file, self.dir, &self.extension).with_context(|| format!("cannot list scripts in {}", file.display()))
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from(env_filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(dispatch(cli));
    // a read on our own stdin may still be blocked; do not wait for it
    rt.shutdown_background();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    let verbose = cli.verbose;
    match cli.command {
        Command::Couple { subject, tester, expect, matching } => {
            run_couple(&subject, tester.as_deref(), expect.as_deref(), &matching).await
        }
        Command::Expect { file, matching } => run_tester(&file, &matching).await,
        Command::Run { file, subject, files, matching } => {
            let runner = TestRunner::new(RunConfig {
                path: file,
                subject,
                dir: files.dir,
                extension: files.extension,
                expect: matching.config(),
                verbose,
                write_logs: true,
            });
            let result = runner.run_all().await.context("cannot run scripts")?;
            result.write_report(&mut std::io::stdout().lock(), verbose)?;
            Ok(result.all_passed())
        }
        Command::Split { file, files } => {
            for script in files.resolve(&file)? {
                let (input, output) = split_file(&script)?;
                println!("{} -> {}, {}", script.display(), input.display(), output.display());
            }
            Ok(true)
        }
        Command::Generalize { file, files, error_prefix } => {
            for script in files.resolve(&file)? {
                if generalize_file(&script, &error_prefix)? {
                    println!("generalized {}", script.display());
                }
            }
            Ok(true)
        }
        Command::Record { subject, log, timeout } => {
            let subject = ProcessHandle::spawn(&subject).context("cannot start subject")?;
            let echo = Echo { output: true, input: false, notes: true };
            let transcript = Transcript::new(echo)
                .tee_to(&log)
                .with_context(|| format!("cannot write {}", log.display()))?;
            let (user, _) = stdio();
            let config = RecordConfig {
                timeout: Duration::from_millis(timeout),
            };
            record(subject, user, &transcript, &config).await?;
            Ok(true)
        }
    }
}

/// Couple a subject with a tester command, or with this binary replaying a
/// script in tester mode. The result is the tester's exit status.
async fn run_couple(
    subject: &str,
    tester: Option<&str>,
    expect: Option<&Path>,
    matching: &MatchArgs,
) -> anyhow::Result<bool> {
    let mut subject_argv = split_arguments(subject).context("invalid subject command")?;

    let tester_argv = match (tester, expect) {
        (Some(cmd), _) => split_arguments(cmd).context("invalid tester command")?,
        (None, Some(file)) => {
            let script = Script::from_file(file)?;
            subject_argv.extend(script.arguments()?);
            let exe = std::env::current_exe().context("cannot locate own executable")?;
            vec![
                exe.display().to_string(),
                "expect".to_string(),
                file.display().to_string(),
                // joined so a prefix starting with '-' is not taken as a flag
                format!("--error-prefix={}", matching.error_prefix),
                format!("--timeout={}", matching.timeout),
            ]
        }
        (None, None) => bail!("either --tester or --expect is required"),
    };

    let subject = ProcessHandle::spawn_argv(&subject_argv).context("cannot start subject")?;
    let tester = ProcessHandle::spawn_argv(&tester_argv).context("cannot start tester")?;

    let transcript = Transcript::new(Echo::all());
    Ok(couple(subject, tester, &transcript).await?)
}

/// Tester mode: the subject is on the other end of our stdin/stdout, so only
/// diagnostics are echoed (to stderr).
async fn run_tester(file: &Path, matching: &MatchArgs) -> anyhow::Result<bool> {
    let script = Script::from_file(file)?;
    let (subject_out, mut subject_in) = stdio();
    let transcript = Transcript::new(Echo::notes_only());

    let engine = Engine::new(matching.config());
    let run = engine.execute(&script, subject_out, subject_in.as_mut(), &transcript).await;
    subject_in.close().await?;
    Ok(run.report.passed())
}
