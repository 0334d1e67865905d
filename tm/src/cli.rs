//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{TaskKind, TaskState};

/// taskmill - task orchestration daemon
#[derive(Parser)]
#[command(
    name = "tm",
    about = "Task orchestration daemon with credential rotation and adaptive supervision",
    version = env!("CARGO_PKG_VERSION"),
    after_help = generate_after_help(),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Global options to hand to a child `tm` process
    pub fn passthrough_args(&self) -> Vec<std::ffi::OsString> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.clone().into_os_string());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".into());
            args.push(level.into());
        }
        args
    }
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the taskmill daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Internal: the supervised daemon process
    #[command(hide = true)]
    RunDaemon,

    /// Internal: restart wrapper spawned by `daemon start`
    #[command(hide = true)]
    Watchdog,

    /// Validate task definition files and drop them into the inbox
    Enqueue {
        /// YAML or JSON files holding one definition or a list
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show queue statistics and tasks
    Queue {
        /// Only tasks in this state
        #[arg(short, long)]
        state: Option<TaskState>,

        /// Only tasks of this type
        #[arg(short = 't', long = "type")]
        kind: Option<TaskKind>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run one dispatch cycle and a sweep in this process
    Cycle,

    /// Archive finished tasks past the retention window
    Sweep {
        /// Show what would be swept without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Override cleaner.max-age-days
        #[arg(long)]
        max_age_days: Option<u64>,
    },

    /// Move Failed tasks back to Pending
    RequeueFailed {
        /// Only tasks of this type
        #[arg(short = 't', long = "type")]
        kind: Option<TaskKind>,
    },

    /// Show credential pool status
    Credentials {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run the watchdog in this process)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status,

    /// Reset exhausted credentials in the running daemon
    Reload,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskmill")
        .join("logs")
        .join("taskmill.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Help footer naming the log location
pub fn generate_after_help() -> String {
    format!("Logs are written to: {}\n", get_log_path().display())
}

/// Output format for status commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_daemon_start() {
        let cli = Cli::parse_from(["tm", "daemon", "start"]);
        assert!(matches!(
            cli.command,
            Command::Daemon {
                command: DaemonCommand::Start { foreground: false }
            }
        ));
    }

    #[test]
    fn test_cli_parse_daemon_start_foreground() {
        let cli = Cli::parse_from(["tm", "daemon", "start", "--foreground"]);
        assert!(matches!(
            cli.command,
            Command::Daemon {
                command: DaemonCommand::Start { foreground: true }
            }
        ));
    }

    #[test]
    fn test_cli_parse_daemon_reload() {
        let cli = Cli::parse_from(["tm", "daemon", "reload"]);
        assert!(matches!(
            cli.command,
            Command::Daemon {
                command: DaemonCommand::Reload
            }
        ));
    }

    #[test]
    fn test_cli_parse_queue_filters() {
        let cli = Cli::parse_from(["tm", "queue", "--state", "failed", "--type", "code-fix", "-f", "json"]);
        match cli.command {
            Command::Queue { state, kind, format } => {
                assert_eq!(state, Some(TaskState::Failed));
                assert_eq!(kind, Some(TaskKind::CodeFix));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("Expected Queue command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_type() {
        assert!(Cli::try_parse_from(["tm", "requeue-failed", "--type", "painting"]).is_err());
    }

    #[test]
    fn test_cli_parse_sweep() {
        let cli = Cli::parse_from(["tm", "sweep", "--dry-run", "--max-age-days", "3"]);
        assert!(matches!(
            cli.command,
            Command::Sweep {
                dry_run: true,
                max_age_days: Some(3)
            }
        ));
    }

    #[test]
    fn test_cli_enqueue_requires_files() {
        assert!(Cli::try_parse_from(["tm", "enqueue"]).is_err());
        let cli = Cli::parse_from(["tm", "enqueue", "a.yml", "b.json"]);
        assert!(matches!(cli.command, Command::Enqueue { ref files } if files.len() == 2));
    }

    #[test]
    fn test_passthrough_args() {
        let cli = Cli::parse_from(["tm", "-c", "/etc/tm.yml", "-l", "debug", "daemon", "status"]);
        let args: Vec<String> = cli
            .passthrough_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["--config", "/etc/tm.yml", "--log-level", "debug"]);
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
