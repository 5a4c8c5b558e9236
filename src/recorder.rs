//! Session recorder
//!
//! Turns a live interactive session into a script: every line the subject
//! prints is recorded as an expectation, every line the user types as `> `
//! input. The resulting file replays against the same subject.

use std::time::Duration;

use crate::error::Result;
use crate::process::{BoxedSource, ProcessHandle, ProcessStatus};
use crate::transcript::Transcript;

/// Default pause after each user line
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_millis(50);

/// Recorder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordConfig {
    /// Time the subject gets to answer before the next user line is read
    pub timeout: Duration,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECORD_TIMEOUT,
        }
    }
}

/// Record a session between `user` and `subject` into `transcript`.
///
/// The transcript decides where lines go; the CLI echoes subject output to
/// the console and tees the conversation into the log file. When the user's
/// input ends the subject's input is closed. Recording finishes once the
/// subject's output has ended.
pub async fn record(
    subject: ProcessHandle,
    mut user: BoxedSource,
    transcript: &Transcript,
    config: &RecordConfig,
) -> Result<ProcessStatus> {
    let ProcessHandle {
        name,
        mut stdout,
        mut stdin,
        exit,
    } = subject;

    let output = async {
        while let Some(line) = stdout.next_line().await? {
            transcript.output(&line);
        }
        transcript.note("[Subject exited]");
        Ok::<_, crate::error::Error>(())
    };

    let input = async {
        while let Some(line) = user.next_line().await? {
            transcript.input(&line);
            if let Err(e) = stdin.write_line(&line).await {
                tracing::warn!(subject = %name, error = %e, "subject stopped accepting input");
                break;
            }
            // let the subject answer before the next line is recorded
            tokio::time::sleep(config.timeout).await;
        }
        stdin.close().await
    };

    tokio::pin!(output);
    tokio::select! {
        biased;
        done = &mut output => done?,
        done = input => {
            done?;
            output.await?;
        }
    }

    let status = exit.await?;
    tracing::debug!(subject = %name, ?status, "recording finished");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{channel, LineSink, LineSource};

    fn greeter() -> ProcessHandle {
        ProcessHandle::in_memory("greeter", |mut stdin, mut stdout| async move {
            let _ = stdout.write_line("Welcome").await;
            while let Ok(Some(name)) = stdin.next_line().await {
                let _ = stdout.write_line(&format!("Hello, {}", name)).await;
            }
            ProcessStatus::success()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_session_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.test");
        let transcript = Transcript::default().tee_to(&log).unwrap();

        let (mut typing, user) = channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            typing.write_line("Ann").await.unwrap();
        });

        let status = record(greeter(), Box::new(user), &transcript, &RecordConfig::default())
            .await
            .unwrap();
        assert!(status.success);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "Welcome\n> Ann\nHello, Ann\n");
        assert_eq!(transcript.notes(), "[Subject exited]\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_stops_when_subject_exits() {
        let subject = ProcessHandle::in_memory("oneshot", |_stdin, mut stdout| async move {
            let _ = stdout.write_line("bye").await;
            ProcessStatus::failure(3)
        });
        // the user never types anything and never closes their input
        let (_typing, user) = channel();

        let transcript = Transcript::default();
        let status = record(subject, Box::new(user), &transcript, &RecordConfig::default())
            .await
            .unwrap();
        assert_eq!(status, ProcessStatus::failure(3));
        assert_eq!(transcript.conversation(), vec!["bye"]);
    }
}
