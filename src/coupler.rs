//! Process coupler
//!
//! Pipes a subject and a tester into each other: every line the subject
//! prints is written to the tester's input and vice versa. Each direction is
//! its own pump task. When a pump sees its source end it logs
//! `[<Side> exited]`, closes the destination's input (which normally makes
//! that process exit too) and reports to the shared [`Shutdown`]. The second
//! report stops both pumps.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, ErrorKind, Result};
use crate::process::{BoxedSink, BoxedSource, ProcessHandle};
use crate::transcript::Transcript;

/// One end of a coupled session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The program under test
    Subject,
    /// The program verifying it
    Tester,
}

impl Side {
    /// Name used in exit lines
    pub fn name(self) -> &'static str {
        match self {
            Side::Subject => "Subject",
            Side::Tester => "Tester",
        }
    }

    /// Prefix of forwarded lines in the transcript
    pub fn label(self) -> &'static str {
        match self {
            Side::Subject => "",
            Side::Tester => "> ",
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Subject => 0,
            Side::Tester => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Subject => Side::Tester,
            Side::Tester => Side::Subject,
        }
    }
}

/// What a "source ended" report did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// First report: recorded, nothing stopped yet
    FirstEnded,
    /// Second report: both pumps were told to stop
    BothEnded,
}

/// Two-phase shutdown shared by the pump tasks.
///
/// Each direction has its own running flag. Reports are counted; only the
/// second one clears both flags. Stopping is advisory: a pump checks its flag
/// before reading the next line, an in-flight read is never interrupted.
#[derive(Debug)]
pub struct Shutdown {
    ended: AtomicUsize,
    first: OnceLock<Side>,
    running: [AtomicBool; 2],
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            ended: AtomicUsize::new(0),
            first: OnceLock::new(),
            running: [AtomicBool::new(true), AtomicBool::new(true)],
        }
    }

    /// Report that the pump reading from `side` is done
    pub fn source_ended(&self, side: Side) -> ShutdownPhase {
        let _ = self.first.set(side);
        if self.ended.fetch_add(1, Ordering::SeqCst) == 0 {
            ShutdownPhase::FirstEnded
        } else {
            self.stop_all();
            ShutdownPhase::BothEnded
        }
    }

    fn stop_all(&self) {
        for flag in &self.running {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the pump reading from `side` should keep going
    pub fn is_running(&self, side: Side) -> bool {
        self.running[side.index()].load(Ordering::SeqCst)
    }

    /// The side whose output ended first, if any has
    pub fn first_ended(&self) -> Option<Side> {
        self.first.get().copied()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// How a pump loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    SourceEnded,
    WriteFailed,
    Stopped,
}

/// Forward lines from `side`'s output into the other side's input
async fn pump(
    side: Side,
    mut source: BoxedSource,
    mut sink: BoxedSink,
    shutdown: Arc<Shutdown>,
    transcript: Transcript,
) {
    let end = forward(side, &mut source, &mut sink, &shutdown, &transcript).await;
    if end == PumpEnd::Stopped {
        return;
    }

    if end == PumpEnd::SourceEnded {
        transcript.note(&format!("[{} exited]", side.name()));
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(side = side.other().name(), error = %e, "closing input failed");
    }
    let phase = shutdown.source_ended(side);
    tracing::debug!(side = side.name(), ?end, ?phase, "pump finished");

    if end == PumpEnd::WriteFailed {
        // keep the source drained so its process never blocks on a full pipe
        while shutdown.is_running(side) {
            match source.next_line().await {
                Ok(Some(line)) => tracing::trace!(side = side.name(), %line, "dropped line"),
                _ => break,
            }
        }
    }
}

async fn forward(
    side: Side,
    source: &mut BoxedSource,
    sink: &mut BoxedSink,
    shutdown: &Shutdown,
    transcript: &Transcript,
) -> PumpEnd {
    loop {
        if !shutdown.is_running(side) {
            return PumpEnd::Stopped;
        }
        let line = match source.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return PumpEnd::SourceEnded,
            Err(e) => {
                transcript.note(&format!("[{} output unreadable: {}]", side.name(), e));
                return PumpEnd::SourceEnded;
            }
        };
        if !shutdown.is_running(side) {
            return PumpEnd::Stopped;
        }

        match side {
            Side::Subject => transcript.output(&line),
            Side::Tester => transcript.input(&line),
        }
        tracing::trace!(from = side.name(), label = side.label(), %line, "forwarding");

        if let Err(e) = sink.write_line(&line).await {
            tracing::warn!(to = side.other().name(), error = %e, "write failed");
            transcript.note(&format!("[{} input closed: {}]", side.other().name(), e.message));
            return PumpEnd::WriteFailed;
        }
    }
}

/// Couple `subject` and `tester` until both have exited.
///
/// Returns the tester's exit success; the subject's status is only logged.
pub async fn couple(subject: ProcessHandle, tester: ProcessHandle, transcript: &Transcript) -> Result<bool> {
    let ProcessHandle {
        name: subject_name,
        stdout: subject_out,
        stdin: subject_in,
        exit: subject_exit,
    } = subject;
    let ProcessHandle {
        name: tester_name,
        stdout: tester_out,
        stdin: tester_in,
        exit: tester_exit,
    } = tester;
    tracing::debug!(subject = %subject_name, tester = %tester_name, "coupling");

    let shutdown = Arc::new(Shutdown::new());
    let subject_to_tester = tokio::spawn(pump(
        Side::Subject,
        subject_out,
        tester_in,
        shutdown.clone(),
        transcript.clone(),
    ));
    let tester_to_subject = tokio::spawn(pump(
        Side::Tester,
        tester_out,
        subject_in,
        shutdown.clone(),
        transcript.clone(),
    ));

    let (subject_status, tester_status) = tokio::join!(subject_exit, tester_exit);
    let (a, b) = tokio::join!(subject_to_tester, tester_to_subject);
    for joined in [a, b] {
        joined.map_err(|e| Error::new(ErrorKind::Other, format!("pump task failed: {}", e)))?;
    }

    let tester_status = tester_status?;
    let subject_status = match subject_status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(subject = %subject_name, error = %e, "cannot observe subject exit");
            None
        }
    };
    tracing::debug!(
        subject = ?subject_status,
        tester = ?tester_status,
        first_ended = ?shutdown.first_ended(),
        "session finished"
    );
    Ok(tester_status.success)
}
