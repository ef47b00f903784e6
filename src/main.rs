//! Aedificator: a process console for the local web server, app and extension projects.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, installs the signal bridge and dispatches to the single
//! command runner, the parallel session view or the background supervisor.

mod ansi;
mod config;
mod console;
mod decode;
mod envfile;
mod events;
mod output;
mod process;
mod project;
mod runner;
mod session;
mod supervisor;
mod tui;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Settings};
use crate::console::Console;
use crate::events::{Event, InterruptFlag, ProcessSignal};
use crate::process::Job;
use crate::project::{has_compose_file, ProjectKind};
use crate::runner::{CommandRunner, Launch, RunOutcome};
use crate::session::SessionEnd;
use crate::supervisor::Supervisor;

const LOG_ENV: &str = "AEDIFICATOR_LOG";
const DIAGNOSTICS_FILE: &str = "aedificator.log";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "aedificator",
    version,
    about = "Run, watch and log the commands of your local projects",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to aedificator.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Root directory for logs and diagnostics.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// How long the final session view stays on screen (ms).
    #[arg(long, global = true)]
    linger_ms: Option<u64>,
    /// Time to wait after SIGTERM before force-killing (ms).
    #[arg(long, global = true)]
    terminate_grace_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one command, streaming its output.
    Run {
        /// Working directory (default: current directory).
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Run inside the project's compose service when it has one.
        #[arg(long)]
        container: bool,
        /// Detach and write output only to the log file.
        #[arg(long)]
        background: bool,
        /// Command to run.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run several commands side by side in a live view.
    Parallel {
        /// Job as <DIR>::<command>; repeatable.
        #[arg(long = "job", required = true, value_parser = parse_job_spec)]
        jobs: Vec<JobSpec>,
        /// Run inside each project's compose service when it has one.
        #[arg(long)]
        container: bool,
        /// Run one after another instead of concurrently.
        #[arg(long)]
        sequential: bool,
    },
    /// Start the web server and the app together.
    Dev,
    /// Build the web server and the app, one after another.
    Build,
    /// Run a make target in a configured project.
    Make {
        #[arg(value_enum)]
        project: ProjectArg,
        target: String,
    },
    /// List log files, newest first.
    Logs {
        /// Maximum number of files to list.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProjectArg {
    Webserver,
    App,
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JobSpec {
    cwd: PathBuf,
    command: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = config::find_config(cli.config.as_deref())?;
    let mut settings = Settings::resolve(&config, cli.data_dir.clone());
    if let Some(ms) = cli.linger_ms {
        settings.session.linger = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.terminate_grace_ms {
        settings.session.terminate_grace = Duration::from_millis(ms);
    }

    let console = Console::stdout();
    if let Err(err) = init_tracing(&settings.data_dir) {
        console.warning(format!("Diagnostics disabled: {:#}", err));
    }
    info!(command = ?cli.command, "starting");

    let interrupt = InterruptFlag::new();
    let (event_tx, mut event_rx) = mpsc::channel(256);
    spawn_signal_listener(event_tx.clone(), interrupt.clone());

    let runner = CommandRunner::new(console.clone(), settings.clone()).with_interrupt(interrupt.clone());
    let success = match cli.command {
        Commands::Run {
            cwd,
            container,
            background,
            command,
        } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir().context("failed to resolve current directory")?,
            };
            let job = Job::new(command_text(&command), cwd, container);
            let command = job.into_command(&config.containers);
            if background {
                run_background(&runner, &console, &settings, &interrupt, command).await
            } else {
                run_in_foreground(runner, command).await?.is_success()
            }
        }
        Commands::Parallel {
            jobs,
            container,
            sequential,
        } => {
            let jobs = jobs
                .into_iter()
                .map(|spec| Job::new(spec.command, spec.cwd, container))
                .collect();
            if sequential {
                run_in_sequence(runner, jobs, &config).await?
            } else {
                run_side_by_side(&console, &settings, jobs, &config, event_tx, &mut event_rx).await?
            }
        }
        Commands::Dev => {
            let jobs = dev_jobs(&config)?;
            run_side_by_side(&console, &settings, jobs, &config, event_tx, &mut event_rx).await?
        }
        Commands::Build => {
            let jobs = build_jobs(&config)?;
            run_in_sequence(runner, jobs, &config).await?
        }
        Commands::Make { project, target } => {
            let dir = project_dir(&config, project)?;
            let command = Job::new(format!("make {}", target), &dir, container_enabled(&config, &dir))
                .into_command(&config.containers);
            run_in_foreground(runner, command).await?.is_success()
        }
        Commands::Logs { limit } => {
            let logs = output::list_logs(&settings.logs_dir)?;
            if logs.is_empty() {
                console.info(format!("No logs yet in {}", settings.logs_dir.display()));
            }
            for path in logs.into_iter().take(limit) {
                console.plain(path.display());
            }
            true
        }
    };
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run_in_foreground(runner: CommandRunner, command: process::Command) -> Result<RunOutcome> {
    tokio::task::spawn_blocking(move || runner.run_to_completion(&command))
        .await
        .context("runner thread failed")
}

async fn run_background(
    runner: &CommandRunner,
    console: &Console,
    settings: &Settings,
    interrupt: &InterruptFlag,
    command: process::Command,
) -> bool {
    let handle = match runner.run(&command, true) {
        Launch::Background(handle) => handle,
        Launch::Finished(outcome) => return outcome.is_success(),
    };
    let mut supervisor = Supervisor::new(console.clone(), settings.session.terminate_grace);
    supervisor.adopt(handle);
    console.muted("Waiting for the background process; press Ctrl+C to stop it");
    if supervisor.wait_all(interrupt, settings.session.refresh).await == SessionEnd::Interrupted {
        tokio::task::block_in_place(|| supervisor.cleanup());
        return false;
    }
    true
}

async fn run_in_sequence(runner: CommandRunner, jobs: Vec<Job>, config: &Config) -> Result<bool> {
    let containers = config.containers.clone();
    let total = jobs.len();
    let outcomes = tokio::task::spawn_blocking(move || session::run_sequential(&runner, jobs, &containers))
        .await
        .context("runner thread failed")?;
    let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
    debug!(total, ran = outcomes.len(), failed, "sequential run finished");
    Ok(failed == 0 && outcomes.len() == total)
}

async fn run_side_by_side(
    console: &Console,
    settings: &Settings,
    jobs: Vec<Job>,
    config: &Config,
    event_tx: mpsc::Sender<Event>,
    event_rx: &mut mpsc::Receiver<Event>,
) -> Result<bool> {
    let stop = Arc::new(AtomicBool::new(false));
    spawn_input_listener(event_tx, stop.clone());
    let handles = session::run_parallel(console, settings, jobs, &config.containers, event_rx).await;
    stop.store(true, Ordering::SeqCst);
    let mut handles = handles?;
    debug!(count = handles.len(), "parallel session finished");
    Ok(!handles.is_empty()
        && handles.iter_mut().all(|handle| {
            process::poll_status(&mut handle.child) == process::ProcessStatus::Exited { code: 0 }
        }))
}

/// Preset that starts the web server and the app concurrently.
fn dev_jobs(config: &Config) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if let Some(dir) = &config.paths.webserver {
        let use_container = container_enabled(config, dir);
        let text = if use_container && has_compose_file(dir) {
            "./run.sh"
        } else {
            "bin/zotonic debug"
        };
        jobs.push(Job::new(text, dir, use_container));
    }
    if let Some(dir) = &config.paths.app {
        jobs.push(Job::new("make server", dir, container_enabled(config, dir)));
    }
    if jobs.is_empty() {
        bail!("no project folders configured; set [paths] webserver and app in aedificator.toml");
    }
    Ok(jobs)
}

/// Preset that builds the web server and the app.
fn build_jobs(config: &Config) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if let Some(dir) = &config.paths.webserver {
        jobs.push(Job::new("make", dir, container_enabled(config, dir)));
    }
    if let Some(dir) = &config.paths.app {
        jobs.push(Job::new("make build", dir, container_enabled(config, dir)));
    }
    if jobs.is_empty() {
        bail!("no project folders configured; set [paths] webserver and app in aedificator.toml");
    }
    Ok(jobs)
}

fn project_dir(config: &Config, project: ProjectArg) -> Result<PathBuf> {
    let (dir, key) = match project {
        ProjectArg::Webserver => (&config.paths.webserver, "webserver"),
        ProjectArg::App => (&config.paths.app, "app"),
        ProjectArg::Extension => (&config.paths.extension, "extension"),
    };
    dir.clone()
        .ok_or_else(|| anyhow!("no {} folder configured; set [paths] {} in aedificator.toml", key, key))
}

fn container_enabled(config: &Config, dir: &Path) -> bool {
    config
        .containers
        .get(ProjectKind::detect(dir).key())
        .map_or(false, |container| container.use_container)
}

fn parse_job_spec(raw: &str) -> Result<JobSpec, String> {
    let (cwd, command) = raw
        .split_once("::")
        .ok_or_else(|| format!("expected <DIR>::<command>, got {:?}", raw))?;
    let command = command.trim();
    if cwd.trim().is_empty() || command.is_empty() {
        return Err(format!("expected <DIR>::<command>, got {:?}", raw));
    }
    Ok(JobSpec {
        cwd: PathBuf::from(cwd.trim()),
        command: command.to_string(),
    })
}

/// A single argument is taken as shell text; several are quoted back together.
fn command_text(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => shell_words::join(args),
    }
}

fn init_tracing(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let path = data_dir.join(DIAGNOSTICS_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn spawn_input_listener(tx: mpsc::Sender<Event>, stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            if !crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => Event::Key(key),
                Ok(crossterm::event::Event::Resize(width, height)) => Event::Resize { width, height },
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>, interrupt: InterruptFlag) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                let signal = tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => ProcessSignal::SigInt,
                        Err(_) => return,
                    },
                    _ = sigterm.recv() => ProcessSignal::SigTerm,
                };
                info!(?signal, "received shutdown signal");
                interrupt.raise();
                let _ = tx.try_send(Event::Shutdown { signal });
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupt.raise();
                let _ = tx.try_send(Event::Shutdown {
                    signal: ProcessSignal::SigInt,
                });
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_parallel_jobs() {
        let cli = Cli::parse_from([
            "aedificator",
            "parallel",
            "--job",
            "/src/zotonic::bin/zotonic debug",
            "--job",
            "/src/sl_phoenix::make server",
            "--container",
        ]);
        match cli.command {
            Commands::Parallel { jobs, container, sequential } => {
                assert!(container);
                assert!(!sequential);
                assert_eq!(jobs[0].cwd, PathBuf::from("/src/zotonic"));
                assert_eq!(jobs[1].command, "make server");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn job_spec_requires_both_parts() {
        assert!(parse_job_spec("no-separator").is_err());
        assert!(parse_job_spec("/dir::  ").is_err());
        assert!(parse_job_spec("::make").is_err());
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::parse_from(["aedificator", "run", "--background", "--", "make", "build", "-j", "4"]);
        match cli.command {
            Commands::Run { command, background, .. } => {
                assert!(background);
                assert_eq!(command_text(&command), "make build -j 4");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(command_text(&["echo hi && ls".to_string()]), "echo hi && ls");
        assert_eq!(
            command_text(&["grep".to_string(), "two words".to_string()]),
            "grep 'two words'"
        );
    }

    #[test]
    fn dev_preset_picks_container_entry_point() {
        let root = tempfile::tempdir().unwrap();
        let webserver = root.path().join("zotonic");
        let app = root.path().join("sl_phoenix");
        fs::create_dir(&webserver).unwrap();
        fs::create_dir(&app).unwrap();
        fs::write(webserver.join("docker-compose.yml"), "services: {}\n").unwrap();

        let mut config = Config::default();
        config.paths.webserver = Some(webserver.clone());
        config.paths.app = Some(app.clone());
        let jobs = dev_jobs(&config).unwrap();
        assert_eq!(jobs[0].text, "bin/zotonic debug");
        assert_eq!(jobs[1].text, "make server");

        config.containers.insert(
            "superleme".into(),
            ContainerConfig {
                use_container: true,
                ..Default::default()
            },
        );
        let jobs = dev_jobs(&config).unwrap();
        assert_eq!(jobs[0].text, "./run.sh");
        assert!(jobs[0].use_container);
        assert!(!jobs[1].use_container);
    }

    #[tokio::test]
    async fn sequential_exit_status_reflects_failures() {
        let data = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let (console, _capture) = Console::capture();
        let runner = CommandRunner::new(console, Settings::for_tests(data.path()));
        let config = Config::default();

        let ok = vec![Job::new("echo a", work.path(), false), Job::new("true", work.path(), false)];
        assert!(run_in_sequence(runner.clone(), ok, &config).await.unwrap());
        let failing = vec![Job::new("echo a", work.path(), false), Job::new("exit 3", work.path(), false)];
        assert!(!run_in_sequence(runner, failing, &config).await.unwrap());
    }

    #[tokio::test]
    async fn background_launch_that_never_started_is_a_failure() {
        let data = tempfile::tempdir().unwrap();
        let (console, _capture) = Console::capture();
        let settings = Settings::for_tests(data.path());
        let runner = CommandRunner::new(console.clone(), settings.clone());
        let command = process::Command::new("sleep 30", "/no/such/dir");
        assert!(!run_background(&runner, &console, &settings, &InterruptFlag::new(), command).await);
    }

    #[test]
    fn presets_need_configured_folders() {
        assert!(dev_jobs(&Config::default()).is_err());
        assert!(build_jobs(&Config::default()).is_err());
        let err = project_dir(&Config::default(), ProjectArg::Extension).unwrap_err();
        assert!(err.to_string().contains("[paths] extension"));
    }
}
