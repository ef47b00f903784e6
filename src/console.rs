//! Themed status output.
//!
//! A `Console` is created once in `main` and handed to everything that reports
//! to the user. Tests build one with [`Console::capture`] to read back exactly
//! what was printed.

use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crossterm::style::Stylize;

/// Severity of a status line; each level has its own color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Success,
    Error,
    Muted,
}

struct Inner {
    sink: Mutex<Box<dyn Write + Send>>,
    color: bool,
}

/// Shared, cheaply clonable output sink.
#[derive(Clone)]
pub struct Console {
    inner: Arc<Inner>,
}

/// Bytes written to a capturing console.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

#[cfg(test)]
impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Console {
    /// Console writing to stdout, colored when stdout is a terminal.
    pub fn stdout() -> Self {
        let color = io::stdout().is_terminal();
        Self::new(Box::new(io::stdout()), color)
    }

    /// Uncolored console whose output can be read back.
    #[cfg(test)]
    pub fn capture() -> (Self, Capture) {
        let capture = Capture::default();
        (Self::new(Box::new(capture.clone()), false), capture)
    }

    fn new(sink: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(sink),
                color,
            }),
        }
    }

    pub fn info(&self, message: impl Display) {
        self.status(Level::Info, message);
    }

    pub fn warning(&self, message: impl Display) {
        self.status(Level::Warning, message);
    }

    pub fn success(&self, message: impl Display) {
        self.status(Level::Success, message);
    }

    pub fn error(&self, message: impl Display) {
        self.status(Level::Error, message);
    }

    pub fn muted(&self, message: impl Display) {
        self.status(Level::Muted, message);
    }

    /// Uncolored line.
    pub fn plain(&self, message: impl Display) {
        self.write_str(&format!("{}\n", message));
    }

    /// Writes child output verbatim and flushes immediately.
    pub fn raw(&self, text: &str) {
        self.write_str(text);
    }

    pub fn status(&self, level: Level, message: impl Display) {
        let text = message.to_string();
        let line = if self.inner.color {
            let text = text.as_str();
            match level {
                Level::Info => text.cyan().to_string(),
                Level::Warning => text.yellow().to_string(),
                Level::Success => text.green().to_string(),
                Level::Error => text.red().bold().to_string(),
                Level::Muted => text.dim().to_string(),
            }
        } else {
            text
        };
        self.write_str(&format!("{}\n", line));
    }

    fn write_str(&self, text: &str) {
        let mut sink = lock(&self.inner.sink);
        // A closed stdout must not take the runner down with it.
        let _ = sink.write_all(text.as_bytes());
        let _ = sink.flush();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_levels_without_color() {
        let (console, capture) = Console::capture();
        console.info("Running: make");
        console.error("Command failed with exit code 2");
        console.raw("child line\n");
        assert_eq!(
            capture.contents(),
            "Running: make\nCommand failed with exit code 2\nchild line\n"
        );
    }

    #[test]
    fn clones_share_the_sink() {
        let (console, capture) = Console::capture();
        let other = console.clone();
        std::thread::spawn(move || other.success("from thread"))
            .join()
            .unwrap();
        console.plain("main");
        assert_eq!(capture.contents(), "from thread\nmain\n");
    }
}
