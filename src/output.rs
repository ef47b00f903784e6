//! Output buffering and log files for launched commands.
//!
//! Every operation keeps a bounded ring of its most recent lines (`LogBuffer`)
//! for the live panes, and a `LogFile` that receives a transcript of everything
//! that was shown.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use strip_ansi_escapes::strip;

/// Lines retained per operation for the live view.
pub const DEFAULT_BUFFER_LINES: usize = 50;

/// A fixed-capacity ring buffer of output lines; the oldest line is evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// The last `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Per-operation transcript, flushed after every write.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
    strip_ansi: bool,
}

impl LogFile {
    /// Creates `<dir>/<stem>_<YYYYmmdd_HHMMSS>.log`, creating `dir` if needed.
    ///
    /// An existing file is never truncated; a numeric suffix is added instead.
    pub fn create(dir: &Path, stem: &str, strip_ansi: bool) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create logs directory {}", dir.display()))?;
        let name = log_file_name(stem, Local::now());
        let (path, file) = create_unique(dir, &name)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            strip_ansi,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends text exactly as given (callers supply line endings).
    pub fn append(&mut self, text: &str) -> io::Result<()> {
        if self.strip_ansi {
            self.writer.write_all(&strip(text.as_bytes()))?;
        } else {
            self.writer.write_all(text.as_bytes())?;
        }
        self.writer.flush()
    }

    /// Handles for redirecting a child's stdout and stderr straight into this file.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        let out = self.writer.get_ref().try_clone()?;
        let err = self.writer.get_ref().try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    /// Flushes and closes the file, returning its path.
    pub fn close(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

/// File name for a log started at `at`.
///
/// Spaces and path separators in `stem` become underscores so the name stays
/// a single component of the logs directory.
fn log_file_name(stem: &str, at: DateTime<Local>) -> String {
    let stem: String = stem
        .chars()
        .map(|ch| if matches!(ch, ' ' | '/' | '\\') { '_' } else { ch })
        .collect();
    format!("{}_{}.log", stem, at.format("%Y%m%d_%H%M%S"))
}

fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let stem = name.trim_end_matches(".log");
    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{}-{}.log", stem, attempt + 1))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create log file {}", candidate.display()))
            }
        }
    }
}

/// Collapses CR-based line endings into a single trailing `\n`.
pub fn normalize_line(line: &str) -> String {
    let mut out = line.replace("\r\n", "\n").replace('\r', "\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Log files under `dir`, newest first.
pub fn list_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified()).ok();
        entries.push((modified, path));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}
