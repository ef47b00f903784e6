//! Parallel sessions with a live split-pane view.
//!
//! A `Session` launches every job at once, each with merged stdout/stderr on a
//! pipe. One reader thread per process drains that pipe into a bounded
//! `LogBuffer` and the process's own log file. The async `watch` loop redraws
//! the panes on a fixed cadence until every process exited or an interrupt
//! arrives; `finish` then tears everything down and reports log locations.
//! Dropping a session that was never finished terminates its processes.

use std::io::{BufRead, BufReader, PipeReader};
use std::mem;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ratatui::backend::Backend;
use ratatui::Terminal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{ContainerConfigs, Settings};
use crate::console::{Console, Level};
use crate::decode::decode;
use crate::events::Event;
use crate::output::{normalize_line, LogBuffer, LogFile};
use crate::process::{
    poll_status, shell_command, spawn_detached_merged, terminate_all, Command, Job, ProcessStatus,
};
use crate::runner::{prepare_command, CommandRunner, OperationHandle, RunOutcome};
use crate::tui::{draw_panes, init_terminal, restore_terminal, PaneView};

const READER_POLL: Duration = Duration::from_millis(10);

type SharedLog = Arc<Mutex<Option<LogFile>>>;

/// How the live view ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every process exited on its own.
    Completed,
    /// The user or the OS asked to stop.
    Interrupted,
}

/// One launched process with its output plumbing.
struct Pane {
    name: String,
    command: Command,
    wrapped: String,
    child: Child,
    status: ProcessStatus,
    buffer: Arc<Mutex<LogBuffer>>,
    log: SharedLog,
    log_path: PathBuf,
    lines: Arc<AtomicUsize>,
    reader: Option<JoinHandle<()>>,
}

/// A batch of concurrently running commands.
pub struct Session {
    console: Console,
    settings: Settings,
    panes: Vec<Pane>,
}

impl Session {
    /// Starts every job; jobs that cannot be started are reported and skipped.
    pub fn launch(
        console: &Console,
        settings: &Settings,
        jobs: Vec<Job>,
        containers: &ContainerConfigs,
    ) -> Self {
        let mut session = Self {
            console: console.clone(),
            settings: settings.clone(),
            panes: Vec::with_capacity(jobs.len()),
        };
        for job in jobs {
            let command = job.into_command(containers);
            match session.start(command) {
                Ok(Some(pane)) => session.panes.push(pane),
                Ok(None) => {}
                Err(err) => session.console.error(format!("{:#}", err)),
            }
        }
        session
    }

    fn start(&self, command: Command) -> Result<Option<Pane>> {
        let name = command.kind.display_name().to_string();
        if !command.cwd.is_dir() {
            self.console.error(format!(
                "{}: directory not found: {}",
                name,
                command.cwd.display()
            ));
            return Ok(None);
        }

        let wrapped = prepare_command(&self.console, &command);
        let log = LogFile::create(&self.settings.logs_dir, &name, self.settings.strip_ansi_logs)?;
        let log_path = log.path().to_path_buf();
        self.console
            .muted(format!("{}: logging to {}", name, log_path.display()));

        let shell = shell_command(&self.settings.shell, &wrapped, &command.cwd);
        let (child, pipe) = spawn_detached_merged(shell).with_context(|| {
            format!("{}: failed to start {} (log: {})", name, command.text, log_path.display())
        })?;
        info!(pid = child.id(), name = %name, command = %command.text, "launched session process");

        let buffer = Arc::new(Mutex::new(LogBuffer::new(self.settings.session.buffer_lines)));
        let log: SharedLog = Arc::new(Mutex::new(Some(log)));
        let lines = Arc::new(AtomicUsize::new(0));
        let reader = spawn_reader(&name, pipe, buffer.clone(), log.clone(), lines.clone());
        let reader = match reader {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(name = %name, error = %err, "failed to start reader thread");
                None
            }
        };

        Ok(Some(Pane {
            name,
            command,
            wrapped,
            child,
            status: ProcessStatus::Running,
            buffer,
            log,
            log_path,
            lines,
            reader,
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }

    pub fn any_running(&self) -> bool {
        self.panes.iter().any(|pane| pane.status.is_running())
    }

    /// Refreshes the status of every process still marked running.
    pub fn poll_exits(&mut self) {
        for pane in self.panes.iter_mut().filter(|pane| pane.status.is_running()) {
            pane.status = poll_status(&mut pane.child);
            if let ProcessStatus::Exited { code } = pane.status {
                info!(name = %pane.name, code, "session process exited");
            }
        }
    }

    /// Snapshots of what each pane shows right now.
    pub fn views(&self) -> Vec<PaneView> {
        self.panes
            .iter()
            .map(|pane| PaneView {
                name: pane.name.clone(),
                status: pane.status,
                command: pane.command.text.clone(),
                lines: lock(&pane.buffer).tail(self.settings.session.pane_lines),
            })
            .collect()
    }

    /// Runs the live view until all processes exit or an interrupt arrives.
    pub async fn watch<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        events: &mut mpsc::Receiver<Event>,
    ) -> std::io::Result<SessionEnd> {
        let mut ticker = tokio::time::interval(self.settings.session.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;
        // Set once every process exited; the final state stays up until then.
        let mut linger_until: Option<tokio::time::Instant> = None;

        loop {
            let deadline = linger_until.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                _ = ticker.tick(), if linger_until.is_none() => {
                    self.poll_exits();
                    draw_panes(terminal, &self.views())?;
                    if !self.any_running() {
                        linger_until = Some(tokio::time::Instant::now() + self.settings.session.linger);
                    }
                }
                _ = tokio::time::sleep_until(deadline), if linger_until.is_some() => {
                    return Ok(SessionEnd::Completed);
                }
                event = events.recv(), if events_open => match event {
                    Some(event) if event.is_interrupt() => {
                        match event {
                            Event::Shutdown { signal } => info!(?signal, "session interrupted by signal"),
                            other => debug!(?other, "session interrupted from keyboard"),
                        }
                        if linger_until.is_some() {
                            return Ok(SessionEnd::Completed);
                        }
                        return Ok(SessionEnd::Interrupted);
                    }
                    Some(Event::Resize { width, height }) => {
                        debug!(width, height, "terminal resized");
                        terminal.autoresize()?;
                        draw_panes(terminal, &self.views())?;
                    }
                    Some(_) => {}
                    None => events_open = false,
                }
            }
        }
    }

    /// Tears the session down and hands back the process handles.
    ///
    /// Still-running processes are terminated, readers get a bounded join,
    /// logs are closed, and every log location is printed.
    pub fn finish(mut self, end: SessionEnd) -> Vec<OperationHandle> {
        let mut panes = mem::take(&mut self.panes);
        let running = panes.iter().filter(|pane| pane.status.is_running()).count();
        if end == SessionEnd::Interrupted && running > 0 {
            self.console
                .warning(format!("Interrupted, stopping {} running process(es)...", running));
        }
        terminate_running(&mut panes, self.settings.session.terminate_grace);
        join_readers(&mut panes, self.settings.session.reader_join);
        close_logs(&panes);

        for pane in &panes {
            if pane.lines.load(Ordering::SeqCst) == 0 {
                self.console
                    .warning(format!("{}: command produced no output", pane.name));
            }
            let level = match pane.status {
                ProcessStatus::Exited { code: 0 } => Level::Success,
                _ => Level::Error,
            };
            self.console
                .status(level, format!("{}: {}", pane.name, pane.status));
        }
        for pane in &panes {
            self.console
                .muted(format!("{} log: {}", pane.name, pane.log_path.display()));
        }

        panes
            .into_iter()
            .map(|pane| OperationHandle {
                name: pane.name,
                command: pane.command,
                wrapped: pane.wrapped,
                child: pane.child,
                log_path: pane.log_path,
            })
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.panes.is_empty() {
            return;
        }
        warn!(count = self.panes.len(), "session dropped without finish, cleaning up");
        terminate_running(&mut self.panes, self.settings.session.terminate_grace);
        close_logs(&self.panes);
    }
}

/// Runs all jobs concurrently behind the live view.
pub async fn run_parallel(
    console: &Console,
    settings: &Settings,
    jobs: Vec<Job>,
    containers: &ContainerConfigs,
    events: &mut mpsc::Receiver<Event>,
) -> Result<Vec<OperationHandle>> {
    let mut session = Session::launch(console, settings, jobs, containers);
    if session.is_empty() {
        console.warning("Nothing to run");
        return Ok(Vec::new());
    }

    let mut terminal = init_terminal().context("failed to initialize terminal")?;
    let end = session.watch(&mut terminal, events).await;
    if let Err(err) = restore_terminal(terminal) {
        warn!(error = %err, "failed to restore terminal");
    }
    let end = end.unwrap_or_else(|err| {
        console.error(format!("Live view failed: {}", err));
        SessionEnd::Interrupted
    });
    Ok(session.finish(end))
}

/// Runs the jobs one after another through the single-command path.
///
/// An interrupt stops the current job and skips the ones after it.
pub fn run_sequential(
    runner: &CommandRunner,
    jobs: Vec<Job>,
    containers: &ContainerConfigs,
) -> Vec<RunOutcome> {
    let total = jobs.len();
    let mut outcomes = Vec::with_capacity(total);
    for job in jobs {
        if runner.interrupted() {
            info!(skipped = total - outcomes.len(), "sequential run interrupted");
            break;
        }
        outcomes.push(runner.run_to_completion(&job.into_command(containers)));
    }
    outcomes
}

fn spawn_reader(
    name: &str,
    pipe: PipeReader,
    buffer: Arc<Mutex<LogBuffer>>,
    log: SharedLog,
    lines: Arc<AtomicUsize>,
) -> std::io::Result<JoinHandle<()>> {
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("reader-{}", label))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(name = %label, error = %err, "reader stopped");
                        break;
                    }
                }
                lines.fetch_add(1, Ordering::SeqCst);
                let text = decode(&raw);
                lock(&buffer).push(text.trim_end().to_string());
                if let Some(file) = lock(&log).as_mut() {
                    if let Err(err) = file.append(&normalize_line(&text)) {
                        warn!(name = %label, error = %err, "failed to write log");
                    }
                }
            }
        })
}

fn terminate_running(panes: &mut [Pane], grace: Duration) {
    let mut running: Vec<&mut Pane> = panes
        .iter_mut()
        .filter(|pane| pane.status.is_running())
        .collect();
    if running.is_empty() {
        return;
    }
    let outcomes = {
        let mut children: Vec<&mut Child> = running.iter_mut().map(|pane| &mut pane.child).collect();
        terminate_all(&mut children, grace)
    };
    for (pane, outcome) in running.iter_mut().zip(outcomes) {
        info!(name = %pane.name, ?outcome, "stopped session process");
        pane.status = ProcessStatus::Exited {
            code: outcome.code(),
        };
    }
}

fn join_readers(panes: &mut [Pane], wait: Duration) {
    for pane in panes.iter_mut() {
        let Some(handle) = pane.reader.take() else {
            continue;
        };
        let deadline = Instant::now() + wait;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(READER_POLL);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!(name = %pane.name, "reader still blocked, leaving it detached");
        }
    }
}

fn close_logs(panes: &[Pane]) {
    for pane in panes {
        if let Some(file) = lock(&pane.log).take() {
            if let Err(err) = file.close() {
                warn!(name = %pane.name, error = %err, "failed to close log");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Capture;
    use ratatui::backend::TestBackend;
    use std::fs;

    fn setup() -> (tempfile::TempDir, Settings, Console, Capture) {
        let data = tempfile::tempdir().unwrap();
        let settings = Settings::for_tests(data.path());
        let (console, capture) = Console::capture();
        (data, settings, console, capture)
    }

    fn work_dir(root: &tempfile::TempDir, name: &str) -> PathBuf {
        let dir = root.path().join(name);
        fs::create_dir(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn two_processes_report_their_own_exit() {
        let (data, settings, console, capture) = setup();
        let chatty = work_dir(&data, "chatty");
        let silent = work_dir(&data, "silent");
        let jobs = vec![
            Job::new("echo one; echo two; echo three", &chatty, false),
            Job::new("exit 1", &silent, false),
        ];
        let mut session = Session::launch(&console, &settings, jobs, &ContainerConfigs::new());
        let mut terminal = Terminal::new(TestBackend::new(80, 12)).unwrap();
        let (_tx, mut rx) = mpsc::channel(4);

        let end = session.watch(&mut terminal, &mut rx).await.unwrap();
        assert_eq!(end, SessionEnd::Completed);
        let statuses: Vec<String> = session.views().iter().map(|view| view.status.to_string()).collect();
        assert_eq!(statuses, vec!["Exited (0)", "Exited (1)"]);
        let screen: String = terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(screen.contains("chatty - Exited (0)"));
        assert!(screen.contains("silent - Exited (1)"));

        let mut handles = session.finish(end);
        assert_eq!(handles.len(), 2);
        let printed = capture.contents();
        assert!(printed.contains("silent: command produced no output"));
        assert!(!printed.contains("chatty: command produced no output"));
        let chatty_log = fs::read_to_string(&handles[0].log_path).unwrap();
        assert_eq!(chatty_log, "one\ntwo\nthree\n");
        assert!(printed.contains(&format!("chatty log: {}", handles[0].log_path.display())));
        assert!(handles.iter_mut().all(|handle| handle.child.try_wait().unwrap().is_some()));
    }

    #[tokio::test]
    async fn buffer_keeps_only_the_most_recent_lines() {
        let (data, settings, console, _capture) = setup();
        let cwd = work_dir(&data, "noisy");
        let jobs = vec![Job::new("for i in $(seq 1 120); do echo line $i; done", &cwd, false)];
        let mut session = Session::launch(&console, &settings, jobs, &ContainerConfigs::new());
        let mut terminal = Terminal::new(TestBackend::new(60, 20)).unwrap();
        let (_tx, mut rx) = mpsc::channel(4);

        let end = session.watch(&mut terminal, &mut rx).await.unwrap();
        let buffer = session.panes[0].buffer.clone();
        let handles = session.finish(end);

        let retained = lock(&buffer).tail(usize::MAX);
        assert_eq!(retained.len(), 50);
        assert_eq!(retained[0], "line 71");
        assert_eq!(retained[49], "line 120");
        let logged = fs::read_to_string(&handles[0].log_path).unwrap();
        assert_eq!(logged.lines().count(), 120);
    }

    #[tokio::test]
    async fn quitting_during_linger_returns_immediately() {
        let (data, mut settings, console, _capture) = setup();
        settings.session.linger = Duration::from_secs(30);
        let cwd = work_dir(&data, "quick");
        let mut session = Session::launch(
            &console,
            &settings,
            vec![Job::new("echo done", &cwd, false)],
            &ContainerConfigs::new(),
        );
        let mut terminal = Terminal::new(TestBackend::new(60, 10)).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let q = crossterm::event::KeyEvent::new(
                crossterm::event::KeyCode::Char('q'),
                crossterm::event::KeyModifiers::NONE,
            );
            let _ = tx.send(Event::Key(q)).await;
        });

        let started = Instant::now();
        let end = session.watch(&mut terminal, &mut rx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(end, SessionEnd::Completed);
        session.finish(end);
    }

    #[tokio::test]
    async fn interrupt_stops_every_process_and_closes_logs() {
        let (data, settings, console, capture) = setup();
        let jobs = (0..3)
            .map(|i| {
                let cwd = work_dir(&data, &format!("worker{}", i));
                Job::new("echo started; sleep 30", cwd, false)
            })
            .collect();
        let mut session = Session::launch(&console, &settings, jobs, &ContainerConfigs::new());
        let mut terminal = Terminal::new(TestBackend::new(60, 18)).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Event::Shutdown {
            signal: crate::events::ProcessSignal::SigInt,
        })
        .await
        .unwrap();

        let started = Instant::now();
        let end = session.watch(&mut terminal, &mut rx).await.unwrap();
        assert_eq!(end, SessionEnd::Interrupted);
        let logs: Vec<SharedLog> = session.panes.iter().map(|pane| pane.log.clone()).collect();
        let mut handles = session.finish(end);

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(handles.len(), 3);
        for handle in handles.iter_mut() {
            assert!(handle.child.try_wait().unwrap().is_some());
        }
        assert!(logs.iter().all(|log| lock(log).is_none()));
        assert!(capture.contents().contains("Interrupted, stopping 3 running process(es)"));
    }

    #[test]
    fn dropping_an_unfinished_session_kills_its_processes() {
        let (data, settings, console, _capture) = setup();
        let cwd = work_dir(&data, "orphan");
        let session = Session::launch(
            &console,
            &settings,
            vec![Job::new("sleep 30", &cwd, false)],
            &ContainerConfigs::new(),
        );
        let pid = session.panes[0].child.id();
        drop(session);
        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .unwrap()
            .success();
        assert!(!alive);
    }

    #[test]
    fn missing_directories_are_skipped() {
        let (_data, settings, console, capture) = setup();
        let session = Session::launch(
            &console,
            &settings,
            vec![Job::new("echo hi", "/no/such/dir", false)],
            &ContainerConfigs::new(),
        );
        assert!(session.is_empty());
        assert!(capture.contents().contains("directory not found: /no/such/dir"));
        assert!(!settings.logs_dir.exists());
    }

    #[test]
    fn interrupt_skips_the_remaining_sequential_jobs() {
        let (data, settings, console, capture) = setup();
        let first = work_dir(&data, "first");
        let second = work_dir(&data, "second");
        let interrupt = crate::events::InterruptFlag::new();
        let runner = CommandRunner::new(console, settings).with_interrupt(interrupt.clone());
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            interrupt.raise();
        });

        let outcomes = run_sequential(
            &runner,
            vec![Job::new("sleep 30", &first, false), Job::new("echo never", &second, false)],
            &ContainerConfigs::new(),
        );
        raiser.join().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RunOutcome::Interrupted { .. }));
        assert!(!capture.contents().contains("Running: echo never"));
    }

    #[test]
    fn sequential_runs_go_through_the_runner() {
        let (data, settings, console, capture) = setup();
        let first = work_dir(&data, "first");
        let second = work_dir(&data, "second");
        let runner = CommandRunner::new(console, settings);
        let outcomes = run_sequential(
            &runner,
            vec![Job::new("echo a", &first, false), Job::new("exit 2", &second, false)],
            &ContainerConfigs::new(),
        );
        assert!(outcomes[0].is_success());
        assert!(matches!(outcomes[1], RunOutcome::Completed { code: 2, .. }));
        let printed = capture.contents();
        assert!(printed.find("Running: echo a").unwrap() < printed.find("Running: exit 2").unwrap());
    }
}
