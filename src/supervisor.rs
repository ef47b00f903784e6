//! Tracking of detached background operations.
//!
//! Background launches outlive the call that started them. The `Supervisor`
//! owns their handles until they exit, and terminates whatever is left when it
//! is cleaned up or dropped, so no child outlives the console.

use std::time::Duration;

use tracing::{info, warn};

use crate::console::Console;
use crate::events::InterruptFlag;
use crate::process::{poll_status, terminate_all, ProcessStatus, Termination};
use crate::runner::OperationHandle;
use crate::session::SessionEnd;

pub struct Supervisor {
    console: Console,
    grace: Duration,
    operations: Vec<OperationHandle>,
}

impl Supervisor {
    pub fn new(console: Console, grace: Duration) -> Self {
        Self {
            console,
            grace,
            operations: Vec::new(),
        }
    }

    pub fn adopt(&mut self, handle: OperationHandle) {
        info!(
            pid = handle.pid(),
            name = %handle.name,
            command = %handle.command.text,
            wrapped = %handle.wrapped,
            "tracking background operation"
        );
        self.operations.push(handle);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drops operations that exited, reporting each one.
    pub fn reap(&mut self) -> usize {
        let before = self.operations.len();
        let console = &self.console;
        self.operations.retain_mut(|op| match poll_status(&mut op.child) {
            ProcessStatus::Running => true,
            ProcessStatus::Exited { code } => {
                let message = format!("{} (PID {}) exited with code {}", op.name, op.pid(), code);
                if code == 0 {
                    console.success(message);
                } else {
                    console.error(message);
                }
                console.muted(format!("Log: {}", op.log_path.display()));
                false
            }
        });
        before - self.operations.len()
    }

    /// Waits until every tracked operation exited or `interrupt` is raised.
    pub async fn wait_all(&mut self, interrupt: &InterruptFlag, poll: Duration) -> SessionEnd {
        loop {
            self.reap();
            if self.is_empty() {
                return SessionEnd::Completed;
            }
            if interrupt.take() {
                return SessionEnd::Interrupted;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Terminates every tracked operation, escalating to a kill after the grace period.
    pub fn cleanup(&mut self) {
        if self.is_empty() {
            return;
        }
        self.console
            .warning(format!("Stopping {} background process(es)...", self.len()));
        let mut operations = std::mem::take(&mut self.operations);
        let outcomes = {
            let mut children: Vec<_> = operations.iter_mut().map(|op| &mut op.child).collect();
            terminate_all(&mut children, self.grace)
        };
        for (op, outcome) in operations.iter().zip(outcomes) {
            let verb = match outcome {
                Termination::AlreadyExited(_) => "exited",
                Termination::Terminated(_) => "stopped",
                Termination::Killed(_) => "killed",
            };
            self.console
                .muted(format!("{} (PID {}) {}; log: {}", op.name, op.pid(), verb, op.log_path.display()));
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(count = self.len(), "supervisor dropped with live operations");
            self.cleanup();
        }
    }
}
