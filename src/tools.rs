//! Script file helpers
//!
//! Discovery of script files, splitting a script into its input and expected
//! output streams, generalizing recorded error lines to `<e`, and extension
//! renaming.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};
use crate::parser::split_lines;

/// Default extension of script files
pub const DEFAULT_EXTENSION: &str = ".test";

/// Resolve the files a command applies to.
///
/// Without `dir`, `path` itself is the only file. With `dir`, every regular
/// file directly inside `path` whose name ends with `extension`, sorted by
/// name.
pub fn discover(path: &Path, dir: bool, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = fs::read_dir(path).map_err(|e| {
        Error::new(ErrorKind::Io, format!("cannot read directory: {}", e))
            .with_file(path.display().to_string())
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_string_lossy().ends_with(extension) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// `path` with its extension replaced by `extension` (which includes the
/// dot). With `prepend`, the old extension stays and `extension` follows it.
pub fn replace_extension(path: &Path, extension: &str, prepend: bool) -> PathBuf {
    let base = if prepend { path.file_name() } else { path.file_stem() };
    let mut name = base.map(OsString::from).unwrap_or_default();
    name.push(extension);
    path.with_file_name(name)
}

/// A script taken apart by line kind
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SplitScript {
    pub args: Vec<String>,
    pub input: Vec<String>,
    pub comments: Vec<String>,
    /// Expected output. `<l ` is stripped; `<e` and `<r` lines cannot be
    /// turned into concrete output and are kept as written.
    pub expected: Vec<String>,
}

/// Sort each script line into arguments, input, comments or expected output
pub fn split_script(content: &str) -> SplitScript {
    let mut split = SplitScript::default();
    for line in split_lines(content) {
        if let Some(rest) = line.strip_prefix("$$ ") {
            split.args.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("> ") {
            split.input.push(rest.to_string());
        } else if line.starts_with('#') {
            split.comments.push(line.to_string());
        } else if let Some(rest) = line.strip_prefix("<l ") {
            split.expected.push(rest.to_string());
        } else {
            split.expected.push(line.to_string());
        }
    }
    split
}

/// Write `<name>.in` and `<name>.out` next to a script file.
///
/// Returns the two paths written.
pub fn split_file(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let content = read(path)?;
    let split = split_script(&content);

    let input_path = replace_extension(path, ".in", false);
    let output_path = replace_extension(path, ".out", false);
    write(&input_path, &split.input.join("\n"))?;
    write(&output_path, &split.expected.join("\n"))?;
    tracing::debug!(script = %path.display(), inputs = split.input.len(), outputs = split.expected.len(), "split script");
    Ok((input_path, output_path))
}

/// Replace every line starting with `error_prefix` by `<e`
pub fn generalize(content: &str, error_prefix: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            let text = line.strip_suffix('\r').unwrap_or(line);
            if text.starts_with(error_prefix) {
                "<e"
            } else {
                text
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generalize a script file in place. Returns whether anything changed.
pub fn generalize_file(path: &Path, error_prefix: &str) -> Result<bool> {
    let content = read(path)?;
    let generalized = generalize(&content, error_prefix);
    let changed = generalized != content;
    if changed {
        write(path, &generalized)?;
    }
    tracing::debug!(script = %path.display(), changed, "generalized script");
    Ok(changed)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        Error::new(ErrorKind::Io, format!("failed to read: {}", e)).with_file(path.display().to_string())
    })
}

fn write(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| {
        Error::new(ErrorKind::Io, format!("failed to write: {}", e)).with_file(path.display().to_string())
    })
}
