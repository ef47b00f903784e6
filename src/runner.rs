//! Single-command execution.
//!
//! `CommandRunner` runs one command either in the foreground, streaming its
//! merged output to the console and a log file line by line, or detached in the
//! background with its output redirected straight into the log file.
//! A foreground run is stopped early when the runner's interrupt flag is
//! raised.
//! Failures are reported through the `Console` and returned as a `RunOutcome`;
//! nothing here propagates an error to the caller.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::console::Console;
use crate::decode::decode;
use crate::envfile::{env_file_path, refresh_env_file};
use crate::events::InterruptFlag;
use crate::output::{normalize_line, LogFile};
use crate::process::{
    exit_code, isolate_group, shell_command, spawn_detached_merged, terminate_all, Command,
};

const SEPARATOR_WIDTH: usize = 60;
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Terminal result of a command run in the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The working directory does not exist; nothing was spawned.
    DirectoryNotFound,
    /// The command ran to completion.
    Completed {
        code: i32,
        lines: usize,
        log_path: PathBuf,
    },
    /// The command was stopped by an interrupt before it finished.
    Interrupted {
        code: i32,
        lines: usize,
        log_path: PathBuf,
    },
    /// The command could not be started or its output could not be handled.
    Failed {
        error: String,
        log_path: Option<PathBuf>,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { code: 0, .. })
    }

    pub fn log_path(&self) -> Option<&Path> {
        match self {
            Self::DirectoryNotFound => None,
            Self::Completed { log_path, .. } | Self::Interrupted { log_path, .. } => Some(log_path),
            Self::Failed { log_path, .. } => log_path.as_deref(),
        }
    }
}

/// A launched process that keeps running after the call returned.
#[derive(Debug)]
pub struct OperationHandle {
    /// Display name of the owning project.
    pub name: String,
    pub command: Command,
    /// Command line actually executed.
    pub wrapped: String,
    pub child: Child,
    pub log_path: PathBuf,
}

impl OperationHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// What `CommandRunner::run` produced.
#[derive(Debug)]
pub enum Launch {
    Background(OperationHandle),
    Finished(RunOutcome),
}

/// Runs single commands; cheap to clone and safe to move onto a blocking thread.
#[derive(Clone)]
pub struct CommandRunner {
    console: Console,
    settings: Settings,
    interrupt: InterruptFlag,
}

impl CommandRunner {
    pub fn new(console: Console, settings: Settings) -> Self {
        Self {
            console,
            settings,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Stops foreground runs once `interrupt` is raised.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    /// Runs `command`, in the foreground unless `background` is set.
    pub fn run(&self, command: &Command, background: bool) -> Launch {
        if !background {
            return Launch::Finished(self.run_to_completion(command));
        }
        match self.begin(command) {
            Some(wrapped) => self.launch_background(command, wrapped),
            None => Launch::Finished(RunOutcome::DirectoryNotFound),
        }
    }

    /// Runs `command` in the foreground, blocking until it exits.
    pub fn run_to_completion(&self, command: &Command) -> RunOutcome {
        match self.begin(command) {
            Some(wrapped) => self.run_foreground(command, &wrapped),
            None => RunOutcome::DirectoryNotFound,
        }
    }

    // Checks the working directory and prints the banner; returns the command line to execute.
    fn begin(&self, command: &Command) -> Option<String> {
        if !command.cwd.is_dir() {
            self.console
                .error(format!("Directory not found: {}", command.cwd.display()));
            return None;
        }

        let wrapped = prepare_command(&self.console, command);
        self.console.info(format!("Running: {}", command.text));
        self.console
            .muted(format!("Directory: {}", command.cwd.display()));
        if command.containerized() {
            if let Some(image) = command.container.as_ref().and_then(|c| c.image()) {
                self.console.muted(format!("Image: {}", image));
            }
            self.console.muted(format!("Container command: {}", wrapped));
        }
        self.console.muted("-".repeat(SEPARATOR_WIDTH));
        Some(wrapped)
    }

    fn run_foreground(&self, command: &Command, wrapped: &str) -> RunOutcome {
        let mut log = match self.create_log(command) {
            Ok(log) => log,
            Err(err) => {
                let outcome = RunOutcome::Failed {
                    error: format!("{:#}", err),
                    log_path: None,
                };
                report(&self.console, &outcome);
                return outcome;
            }
        };
        let log_path = log.path().to_path_buf();

        let outcome = match self.stream(wrapped, &command.cwd, &mut log) {
            Ok(Streamed {
                code,
                lines,
                interrupted: false,
            }) => RunOutcome::Completed {
                code,
                lines,
                log_path: log_path.clone(),
            },
            Ok(Streamed { code, lines, .. }) => RunOutcome::Interrupted {
                code,
                lines,
                log_path: log_path.clone(),
            },
            Err(err) => RunOutcome::Failed {
                error: format!("{:#}", err),
                log_path: Some(log_path.clone()),
            },
        };
        if let Err(err) = log.close() {
            warn!(path = %log_path.display(), error = %err, "failed to flush log file");
        }
        info!(command = %command.text, outcome = ?outcome, "foreground run finished");
        report(&self.console, &outcome);
        outcome
    }

    // Spawns the shell in its own process group and mirrors every line to the
    // console and the log on a scoped thread while this thread watches for the
    // exit or an interrupt.
    fn stream(&self, wrapped: &str, cwd: &Path, log: &mut LogFile) -> Result<Streamed> {
        let shell = shell_command(&self.settings.shell, wrapped, cwd);
        let (mut child, pipe) = spawn_detached_merged(shell)
            .with_context(|| format!("failed to start {}", self.settings.shell))?;
        debug!(pid = child.id(), "spawned foreground command");

        let console = &self.console;
        thread::scope(|scope| {
            let reader = scope.spawn(move || pump(pipe, console, log));
            let waited = self.wait_or_interrupt(&mut child);
            if waited.is_err() {
                let _ = child.kill();
                let _ = child.wait();
            }
            let lines = match reader.join() {
                Ok(lines) => lines,
                Err(_) => Err(anyhow!("output reader panicked")),
            };
            let (code, interrupted) = waited?;
            Ok(Streamed {
                code,
                lines: lines?,
                interrupted,
            })
        })
    }

    // Returns the exit code and whether the child had to be stopped.
    fn wait_or_interrupt(&self, child: &mut Child) -> Result<(i32, bool)> {
        loop {
            if let Some(status) = child.try_wait().context("failed to wait for command")? {
                return Ok((exit_code(status), false));
            }
            if self.interrupt.is_raised() {
                info!(pid = child.id(), "interrupt received, stopping foreground command");
                self.console.warning("Interrupted, stopping command...");
                let outcome = terminate_all(&mut [&mut *child], self.settings.session.terminate_grace);
                let code = outcome.first().map_or(-1, |outcome| outcome.code());
                return Ok((code, true));
            }
            thread::sleep(EXIT_POLL);
        }
    }

    fn launch_background(&self, command: &Command, wrapped: String) -> Launch {
        let log = match self.create_log(command) {
            Ok(log) => log,
            Err(err) => {
                let outcome = RunOutcome::Failed {
                    error: format!("{:#}", err),
                    log_path: None,
                };
                report(&self.console, &outcome);
                return Launch::Finished(outcome);
            }
        };
        let log_path = log.path().to_path_buf();

        let spawned = log.stdio().and_then(|(stdout, stderr)| {
            let mut shell = shell_command(&self.settings.shell, &wrapped, &command.cwd);
            shell.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
            isolate_group(&mut shell);
            shell.spawn()
        });
        if let Err(err) = log.close() {
            warn!(path = %log_path.display(), error = %err, "failed to flush log file");
        }

        match spawned {
            Ok(child) => {
                info!(pid = child.id(), command = %command.text, "started background command");
                self.console
                    .success(format!("Started in background (PID {})", child.id()));
                self.console.muted(format!("Log: {}", log_path.display()));
                Launch::Background(OperationHandle {
                    name: command.kind.display_name().to_string(),
                    command: command.clone(),
                    wrapped,
                    child,
                    log_path,
                })
            }
            Err(err) => {
                let outcome = RunOutcome::Failed {
                    error: format!("failed to start {}: {}", self.settings.shell, err),
                    log_path: Some(log_path),
                };
                report(&self.console, &outcome);
                Launch::Finished(outcome)
            }
        }
    }

    fn create_log(&self, command: &Command) -> Result<LogFile> {
        LogFile::create(
            &self.settings.logs_dir,
            command.kind.key(),
            self.settings.strip_ansi_logs,
        )
    }
}

/// Refreshes the companion `.env` of a containerized command and returns the
/// command line to execute.
pub fn prepare_command(console: &Console, command: &Command) -> String {
    if command.containerized() {
        if let Some(config) = &command.container {
            match refresh_env_file(&command.cwd, config) {
                Ok(entries) if !entries.is_empty() => console.muted(format!(
                    "Updated {}",
                    env_file_path(&command.cwd).display()
                )),
                Ok(_) => {}
                Err(err) => console.warning(format!("Could not update environment file: {:#}", err)),
            }
        }
    }
    command.wrapped()
}

struct Streamed {
    code: i32,
    lines: usize,
    interrupted: bool,
}

// Mirrors output until EOF and returns the number of lines seen.
fn pump(pipe: impl Read, console: &Console, log: &mut LogFile) -> Result<usize> {
    let mut reader = BufReader::new(pipe);
    let mut raw = Vec::new();
    let mut lines = 0usize;
    loop {
        raw.clear();
        let read = reader
            .read_until(b'\n', &mut raw)
            .context("failed to read command output")?;
        if read == 0 {
            return Ok(lines);
        }
        lines += 1;
        let line = normalize_line(&decode(&raw));
        console.raw(&line);
        log.append(&line).context("failed to write log file")?;
    }
}

/// Prints the closing status lines of a foreground run.
pub fn report(console: &Console, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::DirectoryNotFound => {}
        RunOutcome::Completed { code, lines, .. } => {
            if *lines == 0 {
                console.warning("Command produced no output");
            }
            if *code == 0 {
                console.success("Command completed successfully");
            } else {
                console.error(format!("Command failed with exit code {}", code));
            }
        }
        RunOutcome::Interrupted { code, .. } => {
            console.warning(format!("Command interrupted (exit code {})", code));
        }
        RunOutcome::Failed { error, .. } => {
            console.error(format!("Error running command: {}", error));
        }
    }
    if let Some(path) = outcome.log_path() {
        console.muted(format!("Log: {}", path.display()));
    }
}
