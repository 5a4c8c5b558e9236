//! Session transcript
//!
//! Chronological record of a session: lines the subject printed, lines sent
//! to it, and diagnostics. Each entry can also be echoed to the console and
//! appended to a file. File appends are synchronous and happen under the same
//! lock as the console echo, so the file never reorders against the console.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A line the subject wrote
    Output(String),
    /// A line written to the subject
    Input(String),
    /// A diagnostic
    Note(String),
}

impl Entry {
    /// Render the entry the way it appears in a script
    pub fn render(&self) -> String {
        match self {
            Entry::Output(line) => line.clone(),
            Entry::Input(line) => format!("> {}", line),
            Entry::Note(note) => note.clone(),
        }
    }
}

/// Where entries are echoed besides the in-memory log
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo {
    /// Print output lines to stdout
    pub output: bool,
    /// Print input lines (`> line`) to stdout
    pub input: bool,
    /// Print notes to stderr
    pub notes: bool,
}

impl Echo {
    /// Echo nothing
    pub fn silent() -> Self {
        Self::default()
    }

    /// Echo the full conversation and diagnostics
    pub fn all() -> Self {
        Self { output: true, input: true, notes: true }
    }

    /// Echo diagnostics only (stdout belongs to someone else)
    pub fn notes_only() -> Self {
        Self { output: false, input: false, notes: true }
    }
}

struct Inner {
    entries: Vec<Entry>,
    echo: Echo,
    file: Option<File>,
}

/// Shared, cloneable session log
#[derive(Clone)]
pub struct Transcript {
    inner: Arc<Mutex<Inner>>,
}

impl Transcript {
    /// An in-memory transcript with the given echo settings
    pub fn new(echo: Echo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: Vec::new(),
                echo,
                file: None,
            })),
        }
    }

    /// Also append the conversation (output and input lines) to `path`.
    /// The file is truncated first.
    pub fn tee_to(self, path: &Path) -> std::io::Result<Self> {
        File::create(path)?;
        let file = OpenOptions::new().append(true).open(path)?;
        self.lock().file = Some(file);
        Ok(self)
    }

    /// Record a line the subject wrote
    pub fn output(&self, line: &str) {
        self.push(Entry::Output(line.to_string()));
    }

    /// Record a line written to the subject
    pub fn input(&self, line: &str) {
        self.push(Entry::Input(line.to_string()));
    }

    /// Record a diagnostic
    pub fn note(&self, msg: &str) {
        self.push(Entry::Note(msg.to_string()));
    }

    fn push(&self, entry: Entry) {
        let mut inner = self.lock();
        let echo = inner.echo;
        match &entry {
            Entry::Output(line) if echo.output => println!("{}", line),
            Entry::Input(line) if echo.input => println!("> {}", line),
            Entry::Note(note) if echo.notes => eprintln!("{}", note),
            _ => {}
        }
        if !matches!(entry, Entry::Note(_)) {
            let rendered = entry.render();
            if let Some(file) = inner.file.as_mut() {
                if let Err(e) = writeln!(file, "{}", rendered) {
                    tracing::warn!(error = %e, "failed to append to transcript file");
                }
            }
        }
        inner.entries.push(entry);
    }

    /// Snapshot of all entries so far
    pub fn entries(&self) -> Vec<Entry> {
        self.lock().entries.clone()
    }

    /// The conversation (no notes), rendered as script lines
    pub fn conversation(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter(|e| !matches!(e, Entry::Note(_)))
            .map(Entry::render)
            .collect()
    }

    /// Lines the subject wrote, in order
    pub fn outputs(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter_map(|e| match e {
                Entry::Output(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// All diagnostics joined with newlines
    pub fn notes(&self) -> String {
        let mut out = String::new();
        for entry in self.lock().entries.iter() {
            if let Entry::Note(note) = entry {
                out.push_str(note);
                out.push('\n');
            }
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a poisoned log is still a usable log
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(Echo::silent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_in_order() {
        let t = Transcript::default();
        t.input("hello");
        t.output("Hello, hello");
        t.note("[Subject exited]");
        assert_eq!(t.entries(), vec![
            Entry::Input("hello".into()),
            Entry::Output("Hello, hello".into()),
            Entry::Note("[Subject exited]".into()),
        ]);
        assert_eq!(t.conversation(), vec!["> hello", "Hello, hello"]);
        assert_eq!(t.outputs(), vec!["Hello, hello"]);
        assert_eq!(t.notes(), "[Subject exited]\n");
    }

    #[test]
    fn test_clones_share_log() {
        let t = Transcript::default();
        let other = t.clone();
        other.output("from the other side");
        assert_eq!(t.outputs(), vec!["from the other side"]);
    }

    #[test]
    fn test_tee_writes_conversation_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.test");
        std::fs::write(&path, "stale content\n").unwrap();

        let t = Transcript::default().tee_to(&path).unwrap();
        t.output("Welcome");
        t.input("ping");
        t.note("not in the file");
        t.output("pong");

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "Welcome\n> ping\npong\n");
    }
}
