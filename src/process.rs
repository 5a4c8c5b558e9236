//! Process handles
//!
//! A [`ProcessHandle`] is the capability set the coupler and the expect
//! interpreter work against: a line source over the process's output, a line
//! sink over its input, and a one-shot exit future. Real processes are
//! spawned with tokio; [`channel`] gives an in-memory line pipe with the same
//! contract, and [`stdio`] wraps this process's own stdin/stdout.

use std::future::Future;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};
use crate::parser::split_arguments;

/// A sequence of text lines read from some output stream
#[async_trait]
pub trait LineSource: Send {
    /// Read the next line, without its `\n` / `\r\n` terminator.
    /// Returns `Ok(None)` once the stream has ended.
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// A line-oriented input stream
#[async_trait]
pub trait LineSink: Send {
    /// Write one line (a newline is appended) and flush it.
    /// Fails with a write error once the stream is closed.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Close the stream. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Whether `close` was called or a write found the stream broken
    fn is_closed(&self) -> bool;
}

/// A boxed line source
pub type BoxedSource = Box<dyn LineSource>;

/// A boxed line sink
pub type BoxedSink = Box<dyn LineSink>;

/// Resolves once, after the process has exited
pub type ExitFuture = BoxFuture<'static, Result<ProcessStatus>>;

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    /// Whether the process reported success
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
}

impl ProcessStatus {
    pub fn success() -> Self {
        Self { success: true, code: Some(0) }
    }

    pub fn failure(code: i32) -> Self {
        Self { success: false, code: Some(code) }
    }
}

impl From<std::process::ExitStatus> for ProcessStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Handle to a running process (or anything that behaves like one)
pub struct ProcessHandle {
    /// Display name (the command line for spawned processes)
    pub name: String,
    /// Lines the process writes
    pub stdout: BoxedSource,
    /// Lines written to the process
    pub stdin: BoxedSink,
    /// The process's exit status
    pub exit: ExitFuture,
}

impl ProcessHandle {
    /// Spawn a command string, split with [`split_arguments`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(command: &str) -> Result<Self> {
        let argv = split_arguments(command)?;
        Self::spawn_argv(&argv)
    }

    /// Spawn a pre-split argument vector.
    ///
    /// stdin and stdout are piped, stderr is inherited. The child is killed
    /// if the exit future is dropped before it resolves.
    pub fn spawn_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::usage("empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::spawn(program, e))?;
        tracing::debug!(command = ?argv, pid = ?child.id(), "spawned process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn(program, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn(program, "stdout not captured"))?;

        let exit: ExitFuture = Box::pin(async move {
            let status = child.wait().await?;
            Ok(ProcessStatus::from(status))
        });

        Ok(Self {
            name: argv.join(" "),
            stdout: Box::new(LineReader::new(stdout)),
            stdin: Box::new(LineWriter::new(stdin)),
            exit,
        })
    }

    /// An in-memory process driven by an async task.
    ///
    /// `behavior` receives the process's stdin (as a source) and stdout (as a
    /// sink); the process exits with the status it returns, and its stdout
    /// ends when the task drops the sink. Must be called from within a tokio
    /// runtime.
    pub fn in_memory<F, Fut>(name: impl Into<String>, behavior: F) -> Self
    where
        F: FnOnce(ChannelSource, ChannelSink) -> Fut,
        Fut: Future<Output = ProcessStatus> + Send + 'static,
    {
        let (stdin_tx, stdin_rx) = channel();
        let (stdout_tx, stdout_rx) = channel();
        let task = tokio::spawn(behavior(stdin_rx, stdout_tx));
        let exit: ExitFuture = Box::pin(async move {
            task.await
                .map_err(|e| Error::new(ErrorKind::Other, format!("in-memory process failed: {}", e)))
        });
        Self::from_parts(name, Box::new(stdout_rx), Box::new(stdin_tx), exit)
    }

    /// Assemble a handle from its parts
    pub fn from_parts(
        name: impl Into<String>,
        stdout: BoxedSource,
        stdin: BoxedSink,
        exit: ExitFuture,
    ) -> Self {
        Self {
            name: name.into(),
            stdout,
            stdin,
            exit,
        }
    }
}

/// [`LineSource`] over any async reader.
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD; they never end
/// the stream.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for LineReader<R> {
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// [`LineSink`] over any async writer
pub struct LineWriter<W> {
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Some(writer) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LineSink for LineWriter<W> {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::write("input stream already closed"))?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let written = async {
            writer.write_all(buf.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            // a broken pipe means the reader is gone for good
            self.writer = None;
            return Err(Error::write(format!("input stream broken: {}", e)));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            // the stream is dropped either way; a failed shutdown only means
            // the other end went away first
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "shutdown of closed input stream");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

/// Sending half of an in-memory line pipe
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Receiving half of an in-memory line pipe
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create an in-memory line pipe.
///
/// The source ends once the sink is closed or dropped; writes fail once the
/// source is dropped.
pub fn channel() -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

#[async_trait]
impl LineSink for ChannelSink {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::write("input stream already closed"))?;
        if tx.send(line.to_string()).is_err() {
            self.tx = None;
            return Err(Error::write("input stream broken: reader is gone"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

#[async_trait]
impl LineSource for ChannelSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// This process's own stdin (as a source) and stdout (as a sink)
pub fn stdio() -> (BoxedSource, BoxedSink) {
    (
        Box::new(LineReader::new(tokio::io::stdin())),
        Box::new(LineWriter::new(tokio::io::stdout())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_round_trip_and_close() {
        let (mut sink, mut source) = channel();
        sink.write_line("ping").await.unwrap();
        sink.write_line("").await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.is_closed());

        assert_eq!(source.next_line().await.unwrap(), Some("ping".to_string()));
        assert_eq!(source.next_line().await.unwrap(), Some(String::new()));
        assert_eq!(source.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_write_after_close_fails() {
        let (mut sink, _source) = channel();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        let err = sink.write_line("late").await.unwrap_err();
        assert!(err.is_write());
    }

    #[tokio::test]
    async fn test_channel_write_without_reader_fails() {
        let (mut sink, source) = channel();
        drop(source);
        assert!(sink.write_line("nobody").await.unwrap_err().is_write());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_line_reader_strips_crlf() {
        let data: &[u8] = b"one\r\ntwo\nthree";
        let mut reader = LineReader::new(data);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_replaces_invalid_utf8() {
        let data: &[u8] = b"caf\xe9\r\nok\n";
        let mut reader = LineReader::new(data);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("caf\u{fffd}"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_process_with_invalid_utf8_keeps_reading() {
        let argv = ["sh", "-c", r"printf 'caf\351\nok\n'"].map(String::from);
        let mut handle = ProcessHandle::spawn_argv(&argv).unwrap();
        assert_eq!(handle.stdout.next_line().await.unwrap().as_deref(), Some("caf\u{fffd}"));
        assert_eq!(handle.stdout.next_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(handle.stdout.next_line().await.unwrap(), None);
        assert!(handle.exit.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_line_writer_appends_newline() {
        let mut writer = LineWriter::new(Vec::new());
        writer.write_line("hello").await.unwrap();
        writer.write_line("world").await.unwrap();
        let buf = writer.writer.take().unwrap();
        assert_eq!(buf, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let err = ProcessHandle::spawn("definitely-not-a-real-program-4711").err().unwrap();
        assert!(err.is_spawn());
        assert!(err.message.contains("definitely-not-a-real-program-4711"));
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let err = ProcessHandle::spawn("   ").err().unwrap();
        assert_eq!(err.kind, crate::error::ErrorKind::UsageError);
    }

    #[tokio::test]
    async fn test_in_memory_process() {
        let mut handle = ProcessHandle::in_memory("upper", |mut stdin, mut stdout| async move {
            while let Ok(Some(line)) = stdin.next_line().await {
                if stdout.write_line(&line.to_uppercase()).await.is_err() {
                    return ProcessStatus::failure(1);
                }
            }
            ProcessStatus::success()
        });
        handle.stdin.write_line("shout").await.unwrap();
        assert_eq!(handle.stdout.next_line().await.unwrap().as_deref(), Some("SHOUT"));
        handle.stdin.close().await.unwrap();
        assert_eq!(handle.stdout.next_line().await.unwrap(), None);
        assert_eq!(handle.exit.await.unwrap(), ProcessStatus::success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_echo_process() {
        let mut handle = ProcessHandle::spawn("sh -c 'read line; echo \"got $line\"'").unwrap();
        handle.stdin.write_line("ping").await.unwrap();
        handle.stdin.close().await.unwrap();
        assert_eq!(handle.stdout.next_line().await.unwrap().as_deref(), Some("got ping"));
        assert_eq!(handle.stdout.next_line().await.unwrap(), None);
        let status = handle.exit.await.unwrap();
        assert!(status.success);
        assert_eq!(status.code, Some(0));
    }
}
