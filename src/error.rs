//! Coupler errors

use std::fmt;

/// The kind of coupler error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The executable could not be launched
    Spawn,
    /// Write to an input stream that is already closed
    Write,
    /// Invalid script syntax
    SyntaxError,
    /// Invalid usage (empty command, bad option)
    UsageError,
    /// IO error
    Io,
    /// Other error
    Other,
}

/// A coupler error with file/line context
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn spawn(program: &str, cause: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Spawn, format!("failed to execute '{}': {}", program, cause))
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Write, msg)
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, msg)
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UsageError, msg)
    }

    pub fn is_spawn(&self) -> bool {
        self.kind == ErrorKind::Spawn
    }

    pub fn is_write(&self) -> bool {
        self.kind == ErrorKind::Write
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:", file)?;
        }
        if let Some(line) = self.line {
            write!(f, "{}:", line)?;
        }
        if self.file.is_some() || self.line.is_some() {
            write!(f, " ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}
