//! Event definitions for the live session loop.
//!
//! Terminal input and OS signals are bridged onto one channel of `Event`s that
//! the parallel session consumes. Signals are also latched in an
//! `InterruptFlag` so code that does not own the channel can observe them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Represents an event in the live session loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// The process received a termination request from the OS.
    Shutdown { signal: ProcessSignal },
}

/// OS signals that request shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl Event {
    /// Whether this event asks the session to stop.
    ///
    /// In raw mode Ctrl+C arrives as a key press instead of SIGINT.
    pub fn is_interrupt(&self) -> bool {
        match self {
            Event::Shutdown { .. } => true,
            Event::Key(key) => {
                key.kind != KeyEventKind::Release
                    && (matches!(key.code, KeyCode::Char('q'))
                        || (key.modifiers.contains(KeyModifiers::CONTROL)
                            && matches!(key.code, KeyCode::Char('c'))))
            }
            Event::Resize { .. } => false,
        }
    }
}

/// Latched "an interrupt was requested" flag shared across threads.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag is raised, leaving it raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns whether the flag was raised and lowers it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}
