//! Commands and the lifecycle of the child processes that run them.
//!
//! This module defines the immutable `Command` handed over by the menu layer,
//! the observable `ProcessStatus` of a child, and the platform plumbing for
//! spawning through a shell with merged output and for tearing children down
//! (graceful signal first, forced kill after a grace period).

use std::fmt;
use std::io::{self, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{ContainerConfig, ContainerConfigs};
use crate::project::{has_compose_file, ProjectKind};

/// Environment added to every child so common tooling streams colored output unbuffered.
pub const FORCED_ENV: [(&str, &str); 6] = [
    ("PYTHONUNBUFFERED", "1"),
    ("DOCKER_BUILDKIT_PROGRESS", "plain"),
    ("BUILDKIT_PROGRESS", "plain"),
    ("COMPOSE_DOCKER_CLI_BUILD", "1"),
    ("TERM", "xterm-256color"),
    ("FORCE_COLOR", "1"),
];

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One command to execute in a project folder.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command text as typed, run through the shell.
    pub text: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Whether the caller asked for containerized execution.
    pub use_container: bool,
    /// Container settings of the owning project, if any.
    pub container: Option<ContainerConfig>,
    /// Project kind, detected once from `cwd`.
    pub kind: ProjectKind,
}

impl Command {
    pub fn new(text: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        let kind = ProjectKind::detect(&cwd);
        Self {
            text: text.into(),
            cwd,
            use_container: false,
            container: None,
            kind,
        }
    }

    pub fn with_container(mut self, use_container: bool, container: Option<ContainerConfig>) -> Self {
        self.use_container = use_container;
        self.container = container;
        self
    }

    /// Containerized execution needs both the request and a compose file.
    pub fn containerized(&self) -> bool {
        self.use_container && has_compose_file(&self.cwd)
    }

    /// The command line actually handed to the shell.
    pub fn wrapped(&self) -> String {
        if self.containerized() {
            self.kind.wrap_for_container(&self.text)
        } else {
            self.text.clone()
        }
    }
}

/// A command request whose container settings are looked up by project key.
#[derive(Debug, Clone)]
pub struct Job {
    pub text: String,
    pub cwd: PathBuf,
    pub use_container: bool,
}

impl Job {
    pub fn new(text: impl Into<String>, cwd: impl Into<PathBuf>, use_container: bool) -> Self {
        Self {
            text: text.into(),
            cwd: cwd.into(),
            use_container,
        }
    }

    pub fn into_command(self, containers: &ContainerConfigs) -> Command {
        let command = Command::new(self.text, self.cwd);
        let container = containers.get(command.kind.key()).cloned();
        command.with_container(self.use_container, container)
    }
}

/// The current lifecycle status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, or the negated signal number when killed by a signal.
    Exited { code: i32 },
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Exited { code } => write!(f, "Exited ({})", code),
        }
    }
}

/// How a child ended when it was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited(i32),
    Terminated(i32),
    Killed(i32),
}

impl Termination {
    pub fn code(&self) -> i32 {
        match *self {
            Self::AlreadyExited(code) | Self::Terminated(code) | Self::Killed(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Non-blocking status check.
pub fn poll_status(child: &mut Child) -> ProcessStatus {
    match child.try_wait() {
        Ok(Some(status)) => ProcessStatus::Exited {
            code: exit_code(status),
        },
        Ok(None) => ProcessStatus::Running,
        Err(err) => {
            warn!(pid = child.id(), error = %err, "failed to poll child");
            ProcessStatus::Exited { code: -1 }
        }
    }
}

/// `<shell> -c <script>` in `cwd` with the forced environment added.
pub fn shell_command(shell: &str, script: &str, cwd: &Path) -> std::process::Command {
    let mut command = std::process::Command::new(shell);
    command.arg("-c").arg(script).current_dir(cwd).envs(FORCED_ENV);
    command
}

/// Starts the child in its own process group so termination reaches the whole pipeline.
pub fn isolate_group(command: &mut std::process::Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Spawns `command` with stdout and stderr merged into one pipe.
pub fn spawn_merged(mut command: std::process::Command) -> io::Result<(Child, PipeReader)> {
    let (reader, writer) = io::pipe()?;
    command.stdout(writer.try_clone()?).stderr(writer);
    let child = command.spawn()?;
    // The parent's copies of the write end live in `command`; drop them so EOF arrives.
    drop(command);
    Ok((child, reader))
}

/// Like [`spawn_merged`] with stdin detached, for children that must not read the terminal.
pub fn spawn_detached_merged(mut command: std::process::Command) -> io::Result<(Child, PipeReader)> {
    command.stdin(Stdio::null());
    isolate_group(&mut command);
    spawn_merged(command)
}

/// Terminates every child that is still running.
///
/// All children get a terminate signal at once; whatever is still alive after
/// `grace` is killed. Returns one outcome per child, in order.
pub fn terminate_all(children: &mut [&mut Child], grace: Duration) -> Vec<Termination> {
    let mut outcomes: Vec<Option<Termination>> = vec![None; children.len()];
    for (slot, child) in outcomes.iter_mut().zip(children.iter_mut()) {
        if let Ok(Some(status)) = child.try_wait() {
            *slot = Some(Termination::AlreadyExited(exit_code(status)));
            continue;
        }
        debug!(pid = child.id(), "sending terminate signal");
        send_signal(child.id(), Signal::Terminate);
    }

    let deadline = Instant::now() + grace;
    loop {
        let mut pending = false;
        for (slot, child) in outcomes.iter_mut().zip(children.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            match child.try_wait() {
                Ok(Some(status)) => *slot = Some(Termination::Terminated(exit_code(status))),
                _ => pending = true,
            }
        }
        if !pending || Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    outcomes
        .into_iter()
        .zip(children.iter_mut())
        .map(|(slot, child)| match slot {
            Some(outcome) => outcome,
            None => Termination::Killed(force_kill(child)),
        })
        .collect()
}

fn force_kill(child: &mut Child) -> i32 {
    warn!(pid = child.id(), "child ignored terminate signal, killing");
    send_signal(child.id(), Signal::Kill);
    let _ = child.kill();
    match child.wait() {
        Ok(status) => exit_code(status),
        Err(err) => {
            warn!(pid = child.id(), error = %err, "failed to reap killed child");
            -1
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, signal: Signal) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal. Kill goes through Child::kill.
    if let Signal::Terminate = signal {
        unsafe {
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_signal(_pid: u32, _signal: Signal) {}
