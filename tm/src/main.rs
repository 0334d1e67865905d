//! taskmill - task orchestration daemon
//!
//! CLI entry point for the daemon, its watchdog and the maintenance commands.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use taskmill::cleaner::RetentionPolicy;
use taskmill::cli::{Cli, Command, DaemonCommand, OutputFormat};
use taskmill::clock::system_clock;
use taskmill::config::Config;
use taskmill::daemon::{DaemonManager, EXIT_ASSEMBLY, EXIT_STOPPED, VERSION, Watchdog};
use taskmill::domain::{Task, TaskKind, TaskState};
use taskmill::engine::{Engine, StoreSession};
use taskmill::queue::{QueueStats, read_snapshot};
use taskmill::rotation::{CredentialState, CredentialStatus, ResourceRotationClient, read_credential_snapshot};
use taskmill::store::StoreLayout;
use taskmill::supervisor::{Inbox, load_definitions};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskmill")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // The watchdog and the daemon share the file, so append rather than truncate
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("taskmill.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(store = %config.storage.store_dir.display(), version = VERSION, "taskmill loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match &cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => cmd_start(&cli, &config, *foreground).await,
            DaemonCommand::Stop => cmd_stop(),
            DaemonCommand::Status => cmd_status(),
            DaemonCommand::Reload => cmd_reload(),
        },
        Command::RunDaemon => run_daemon(config).await,
        Command::Watchdog => cmd_watchdog(&cli, &config).await,
        Command::Enqueue { files } => cmd_enqueue(&config, files),
        Command::Queue { state, kind, format } => cmd_queue(&config, *state, *kind, *format),
        Command::Cycle => cmd_cycle(config).await,
        Command::Sweep { dry_run, max_age_days } => cmd_sweep(&config, *dry_run, *max_age_days).await,
        Command::RequeueFailed { kind } => cmd_requeue_failed(&config, *kind).await,
        Command::Credentials { format } => cmd_credentials(&config, *format),
    }
}

/// Start the watchdog, detached or in this process
async fn cmd_start(cli: &Cli, config: &Config, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    let daemon = DaemonManager::new();

    if let Some(pid) = daemon.running_pid() {
        println!("taskmill is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting taskmill in foreground mode...");
        cmd_watchdog(cli, config).await
    } else {
        let pid = daemon.start(&cli.passthrough_args())?;
        println!("taskmill started (PID: {})", pid);
        Ok(())
    }
}

fn cmd_stop() -> Result<()> {
    debug!("cmd_stop: called");
    let daemon = DaemonManager::new();
    match daemon.running_pid() {
        Some(pid) => {
            daemon.stop()?;
            println!("taskmill stopped (was PID: {})", pid);
        }
        None => println!("taskmill is not running"),
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    debug!("cmd_status: called");
    let status = DaemonManager::new().status();

    println!("taskmill status");
    println!("---------------");
    if status.running {
        println!("Status: {}", "running".green());
        if let Some(pid) = status.pid {
            println!("PID: {}", pid);
        }
        let version = status.version.unwrap_or_else(|| "unknown".to_string());
        if version == VERSION {
            println!("Version: {}", version);
        } else {
            println!("Version: {} ({} {})", version.yellow(), "cli is".yellow(), VERSION.yellow());
        }
    } else {
        println!("Status: {}", "stopped".red());
    }
    println!("PID file: {}", status.pid_file.display());
    Ok(())
}

fn cmd_reload() -> Result<()> {
    debug!("cmd_reload: called");
    let pid = DaemonManager::new().reload()?;
    println!("Asked taskmill (PID: {}) to reset exhausted credentials", pid);
    Ok(())
}

/// Run `tm run-daemon` under the watchdog until stopped
async fn cmd_watchdog(cli: &Cli, config: &Config) -> Result<()> {
    debug!("cmd_watchdog: called");
    let daemon = DaemonManager::new();
    daemon.register_self()?;

    let stop = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Watchdog received SIGTERM"),
            _ = sigint.recv() => info!("Watchdog received SIGINT"),
        }
        trigger.cancel();
    });

    let exe = std::env::current_exe().context("Failed to get current executable")?;
    let mut args = cli.passthrough_args();
    args.push("run-daemon".into());
    let mut watchdog = Watchdog::new(exe, args, &config.watchdog).with_child_pid_file(daemon.child_pid_file());
    let code = watchdog.run(&stop).await;

    daemon.unregister_self()?;
    let code = code?;
    info!(code, "Watchdog exiting");
    if code != EXIT_STOPPED {
        std::process::exit(code);
    }
    Ok(())
}

/// Cancel on SIGTERM/SIGINT; reset exhausted credentials on SIGHUP
fn spawn_signal_listener(
    cancel: CancellationToken,
    rotation: Option<Arc<ResourceRotationClient>>,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, stopping after the current cycle");
                    cancel.cancel();
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, stopping after the current cycle");
                    cancel.cancel();
                    break;
                }
                _ = sighup.recv() => match &rotation {
                    Some(rotation) => {
                        let reset = rotation.reset_all();
                        info!(reset, "Received SIGHUP, credentials reset");
                    }
                    None => info!("Received SIGHUP, no credential pool configured"),
                },
            }
        }
    }))
}

/// The supervised daemon process
async fn run_daemon(config: Config) -> Result<()> {
    debug!("run_daemon: called");
    info!("Daemon starting...");

    let engine = match Engine::open(config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Startup assembly failed");
            eprintln!("{} {}", "Startup failed:".red(), e);
            std::process::exit(EXIT_ASSEMBLY);
        }
    };

    let cancel = CancellationToken::new();
    let listener = spawn_signal_listener(cancel.clone(), engine.rotation().cloned())?;

    let mut supervisor = engine.supervisor();
    let exit = supervisor.run_forever(&cancel).await;

    listener.abort();
    engine.shutdown().await;
    info!(?exit, "Daemon stopped");
    Ok(())
}

fn cmd_enqueue(config: &Config, files: &[PathBuf]) -> Result<()> {
    debug!(count = files.len(), "cmd_enqueue: called");
    let inbox = Inbox::new(StoreLayout::new(&config.storage.store_dir).inbox_dir());

    let mut total = 0;
    for file in files {
        let definitions = load_definitions(file)?;
        let dropped = inbox
            .submit(&definitions)
            .context(format!("Rejected {}", file.display()))?;
        total += definitions.len();
        println!(
            "{} {} ({} task{}) -> {}",
            "queued".green(),
            file.display(),
            definitions.len(),
            if definitions.len() == 1 { "" } else { "s" },
            dropped.display()
        );
    }
    println!("{} task definitions waiting in {}", total, inbox.dir().display());
    Ok(())
}

fn colored_state(state: TaskState) -> colored::ColoredString {
    let label = state.as_str();
    match state {
        TaskState::Succeeded => label.green(),
        TaskState::Failed => label.red(),
        TaskState::Running => label.cyan(),
        TaskState::Retrying => label.yellow(),
        TaskState::Pending | TaskState::Archived => label.normal(),
    }
}

fn cmd_queue(config: &Config, state: Option<TaskState>, kind: Option<TaskKind>, format: OutputFormat) -> Result<()> {
    debug!(?state, ?kind, %format, "cmd_queue: called");
    let layout = StoreLayout::new(&config.storage.store_dir);
    let all = read_snapshot(&layout.queue_file()).context("Failed to read queue snapshot")?;
    let stats = QueueStats::from_tasks(&all);
    let tasks: Vec<&Task> = all
        .iter()
        .filter(|t| state.is_none_or(|s| t.state == s))
        .filter(|t| kind.is_none_or(|k| t.kind == k))
        .collect();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "stats": stats,
                "tasks": tasks,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!(
                "{} total, {} pending, {} running, {} retrying, {} succeeded, {} failed",
                stats.total,
                stats.pending,
                stats.running,
                stats.retrying.to_string().yellow(),
                stats.succeeded.to_string().green(),
                stats.failed.to_string().red()
            );
            if tasks.is_empty() {
                println!("No matching tasks");
                return Ok(());
            }
            println!();
            for task in tasks {
                println!(
                    "{:<44} {:<30} {:<10} p={:<4} attempts={}",
                    task.id,
                    task.type_label(),
                    colored_state(task.state),
                    task.priority,
                    task.attempt_count
                );
                if let Some(err) = &task.last_error {
                    println!("    {}", err.dimmed());
                }
            }
        }
    }
    Ok(())
}

async fn cmd_cycle(config: Config) -> Result<()> {
    debug!("cmd_cycle: called");
    let engine = Engine::open(config).await.context("Failed to assemble engine")?;
    let cancel = CancellationToken::new();
    let listener = spawn_signal_listener(cancel.clone(), engine.rotation().cloned())?;

    let report = engine.supervisor().run_once(&cancel).await;
    listener.abort();
    engine.shutdown().await;

    println!(
        "ingested {} file(s): {} enqueued, {} rejected",
        report.ingested.files, report.ingested.enqueued, report.ingested.rejected
    );
    let summary = report.summary.to_string();
    if report.summary.is_failure() {
        println!("{}", summary.red());
    } else if report.summary.made_progress() {
        println!("{}", summary.green());
    } else {
        println!("{}", summary);
    }
    if let Some(sweep) = report.sweep {
        println!(
            "swept {} task(s): {} archived, {} failed",
            sweep.scanned, sweep.archived, sweep.failed
        );
    }
    Ok(())
}

async fn cmd_sweep(config: &Config, dry_run: bool, max_age_days: Option<u64>) -> Result<()> {
    debug!(dry_run, ?max_age_days, "cmd_sweep: called");
    let mut cleaner_config = config.cleaner.clone();
    if let Some(days) = max_age_days {
        cleaner_config.max_age_days = days;
    }
    let policy: RetentionPolicy = cleaner_config.policy();

    let session = StoreSession::open(config, system_clock()).await?;
    let cleaner = session.cleaner();
    let result = if dry_run {
        cleaner.preview(&policy).await.map(|preview| {
            println!(
                "{} of {} task(s) would be swept, {} kept",
                preview.to_archive.to_string().yellow(),
                preview.total,
                preview.to_keep
            );
            for task in &preview.sample {
                println!("  {} {} {}", task.id, task.type_label(), colored_state(task.state));
            }
        })
    } else {
        cleaner.sweep(&policy).await.map(|report| {
            println!(
                "swept {} task(s): {} archived, {} failed",
                report.scanned,
                report.archived.to_string().green(),
                report.failed.to_string().red()
            );
            if let Some(backup) = report.backup {
                println!("backup: {}", backup.display());
            }
        })
    };
    session.shutdown().await;
    result.context("Sweep failed")
}

async fn cmd_requeue_failed(config: &Config, kind: Option<TaskKind>) -> Result<()> {
    debug!(?kind, "cmd_requeue_failed: called");
    let session = StoreSession::open(config, system_clock()).await?;
    let result = session.queue().requeue_failed(kind).await;
    session.shutdown().await;
    let count = result.context("Failed to requeue tasks")?;
    println!("{} failed task(s) moved back to pending", count);
    Ok(())
}

fn colored_credential(status: &CredentialStatus) -> colored::ColoredString {
    let label = status.state.to_string();
    match status.state {
        CredentialState::Available => label.green(),
        CredentialState::Cooling => label.yellow(),
        CredentialState::Exhausted => label.red(),
    }
}

fn cmd_credentials(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_credentials: called");
    let layout = StoreLayout::new(&config.storage.store_dir);
    let credentials = read_credential_snapshot(&layout.credentials_file()).context("Failed to read credential state")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&credentials)?),
        OutputFormat::Text => {
            if credentials.is_empty() {
                println!("No credential state recorded yet");
                return Ok(());
            }
            for credential in &credentials {
                let until = credential
                    .cooldown_until
                    .map(|t| format!(" until {}", t.format("%H:%M:%S")))
                    .unwrap_or_default();
                println!(
                    "{:<40} {:<10}{} failures={} successes={}",
                    credential.id,
                    colored_credential(credential),
                    until,
                    credential.failure_count,
                    credential.successes
                );
            }
        }
    }
    Ok(())
}
