//! Daemon process management
//!
//! Handles the PID file, process control, and the watchdog that restarts a
//! crashed daemon process.

use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Current version (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stopped on purpose
pub const EXIT_STOPPED: i32 = 0;
/// Unexpected failure; the watchdog restarts the daemon
pub const EXIT_CRASHED: i32 = 1;
/// Startup assembly failed; restarting would fail the same way
pub const EXIT_ASSEMBLY: i32 = 10;

/// Runtime directory for the PID and version files
fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("taskmill")
}

/// Default PID file location
fn default_pid_path() -> PathBuf {
    let path = runtime_dir().join("taskmill.pid");
    debug!(?path, "default_pid_path: returning path");
    path
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    /// Path to the PID file
    pid_file: PathBuf,
    /// Path to the version file
    version_file: PathBuf,
    /// PID of the daemon process the watchdog is running
    child_pid_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    /// Create a new daemon manager with the default PID file location
    pub fn new() -> Self {
        debug!("DaemonManager::new: called");
        Self::with_pid_file(default_pid_path())
    }

    /// Create a daemon manager with a custom PID file path
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        let child_pid_file = pid_file.with_extension("child.pid");
        Self {
            pid_file,
            version_file,
            child_pid_file,
        }
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        debug!("DaemonManager::is_running: called");
        self.read_pid().is_some_and(is_process_running)
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        debug!("DaemonManager::running_pid: called");
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    /// Read the PID from the PID file
    fn read_pid(&self) -> Option<u32> {
        debug!(?self.pid_file, "DaemonManager::read_pid: called");
        read_pid_file(&self.pid_file)
    }

    /// Write the PID to the PID file
    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        write_pid_file(&self.pid_file, pid)
    }

    /// Where the watchdog records its daemon process
    pub fn child_pid_file(&self) -> &Path {
        &self.child_pid_file
    }

    /// Remove the PID file
    fn remove_pid_file(&self) -> Result<()> {
        debug!(?self.pid_file, "DaemonManager::remove_pid_file: called");
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
        }
        Ok(())
    }

    /// Write the version to the version file
    fn write_version(&self, version: &str) -> Result<()> {
        debug!(?self.version_file, version, "DaemonManager::write_version: called");
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent).context("Failed to create version file directory")?;
        }

        let mut file = fs::File::create(&self.version_file).context("Failed to create version file")?;
        write!(file, "{}", version).context("Failed to write version")?;
        Ok(())
    }

    /// Read the version from the version file
    pub fn read_version(&self) -> Option<String> {
        debug!(?self.version_file, "DaemonManager::read_version: called");
        let mut file = fs::File::open(&self.version_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        Some(contents.trim().to_string())
    }

    /// Remove the version file
    fn remove_version_file(&self) -> Result<()> {
        debug!(?self.version_file, "DaemonManager::remove_version_file: called");
        if self.version_file.exists() {
            fs::remove_file(&self.version_file).context("Failed to remove version file")?;
        }
        Ok(())
    }

    /// Check if the running daemon version matches this binary
    pub fn version_matches(&self) -> bool {
        debug!("DaemonManager::version_matches: called");
        self.read_version().is_some_and(|v| v == VERSION)
    }

    /// Start the watchdog in the background
    ///
    /// `args` are passed through to the watchdog (global options such as
    /// `--config`). Returns the watchdog's PID.
    pub fn start(&self, args: &[OsString]) -> Result<u32> {
        debug!(?args, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!("Starting daemon...");
        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let child = Command::new(&exe)
            .args(args)
            .arg("watchdog")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn watchdog process")?;

        let pid = child.id();
        self.write_pid(pid)?;

        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon: SIGTERM, then SIGKILL after 5s
    ///
    /// SIGKILL goes to the watchdog and to the daemon process it was
    /// running, since a killed watchdog cannot stop its child.
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;
        let child = read_pid_file(&self.child_pid_file).filter(|&child| is_process_running(child));

        info!(pid, "Stopping daemon...");
        send_signal(pid, nix::sys::signal::Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(Duration::from_millis(100));
            attempts += 1;
        }
        debug!(attempts, "DaemonManager::stop: waited for process");

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = send_signal(pid, nix::sys::signal::Signal::SIGKILL);
            if let Some(child) = child
                && is_process_running(child)
            {
                warn!(pid = child, "Killing daemon process left by the watchdog");
                let _ = send_signal(child, nix::sys::signal::Signal::SIGKILL);
            }
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        remove_file_if_exists(&self.child_pid_file)?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Ask the daemon to reset exhausted credentials (SIGHUP)
    pub fn reload(&self) -> Result<u32> {
        debug!("DaemonManager::reload: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;
        send_signal(pid, nix::sys::signal::Signal::SIGHUP).context("Failed to send SIGHUP")?;
        info!(pid, "Sent reload signal");
        Ok(pid)
    }

    /// Register the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        debug!("DaemonManager::register_self: called");
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove the PID and version files if they still name this process
    pub fn unregister_self(&self) -> Result<()> {
        debug!("DaemonManager::unregister_self: called");
        if self.read_pid() == Some(std::process::id()) {
            self.remove_pid_file()?;
            self.remove_version_file()?;
            remove_file_if_exists(&self.child_pid_file)?;
        }
        Ok(())
    }

    /// Get the PID file path
    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    /// Get the daemon status
    pub fn status(&self) -> DaemonStatus {
        debug!("DaemonManager::status: called");
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
            version: pid.and_then(|_| self.read_version()),
        }
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let mut file = fs::File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create PID file directory")?;
    }

    let mut file = fs::File::create(path).context("Failed to create PID file")?;
    write!(file, "{}", pid).context("Failed to write PID")?;

    debug!(pid, ?path, "Wrote PID file");
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Failed to remove {}", path.display())),
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    debug!(pid, ?signal, "send_signal: called");
    kill(Pid::from_raw(pid as i32), signal)
}

/// Check if a process with the given PID is running
fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 checks existence without affecting the process
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub version: Option<String>,
}

/// Restart behaviour of the watchdog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Delay before the first restart
    #[serde(rename = "restart-delay-ms")]
    pub restart_delay_ms: u64,

    #[serde(rename = "max-restart-delay-ms")]
    pub max_restart_delay_ms: u64,

    /// A run shorter than this counts as a crash loop and widens the delay
    #[serde(rename = "crash-window-ms")]
    pub crash_window_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 5_000,
            max_restart_delay_ms: 300_000,
            crash_window_ms: 60_000,
        }
    }
}

/// Delay between restarts: doubles while the process keeps crashing quickly,
/// resets after a run that outlived the crash window
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    base: Duration,
    max: Duration,
    crash_window: Duration,
    next: Duration,
}

impl RestartPolicy {
    pub fn new(config: &WatchdogConfig) -> Self {
        let base = Duration::from_millis(config.restart_delay_ms);
        Self {
            base,
            max: Duration::from_millis(config.max_restart_delay_ms).max(base),
            crash_window: Duration::from_millis(config.crash_window_ms),
            next: base,
        }
    }

    /// Delay before restarting a process that ran for `ran_for`
    pub fn on_crash(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.crash_window {
            self.next = self.base;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Runs the daemon process and restarts it when it crashes
#[derive(Debug)]
pub struct Watchdog {
    program: PathBuf,
    args: Vec<OsString>,
    policy: RestartPolicy,
    child_pid_file: Option<PathBuf>,
}

impl Watchdog {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, config: &WatchdogConfig) -> Self {
        Self {
            program: program.into(),
            args,
            policy: RestartPolicy::new(config),
            child_pid_file: None,
        }
    }

    /// Record each spawned child's PID in `path` while it runs
    pub fn with_child_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.child_pid_file = Some(path.into());
        self
    }

    fn record_child(&self, pid: Option<u32>) {
        let Some(path) = &self.child_pid_file else {
            return;
        };
        let result = match pid {
            Some(pid) => write_pid_file(path, pid),
            None => remove_file_if_exists(path),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to update child PID file");
        }
    }

    /// Supervise until the child exits cleanly, fails assembly, or `stop`
    /// fires; returns the exit code to use
    ///
    /// On `stop` the child gets SIGTERM and is waited for. SIGHUP received
    /// by this process is passed on to the child.
    pub async fn run(&mut self, stop: &CancellationToken) -> Result<i32> {
        info!(program = %self.program.display(), "Watchdog started");
        let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let mut restarts = 0u32;

        loop {
            let mut child = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .spawn()
                .context(format!("Failed to spawn {}", self.program.display()))?;
            let started = Instant::now();
            self.record_child(child.id());
            debug!(pid = ?child.id(), restarts, "Watchdog::run: child spawned");

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status.context("Failed to wait for daemon process")?,
                    _ = hangup.recv() => {
                        if let Some(pid) = child.id() {
                            info!(pid, "Forwarding reload to daemon process");
                            let _ = send_signal(pid, nix::sys::signal::Signal::SIGHUP);
                        }
                    }
                    _ = stop.cancelled() => {
                        if let Some(pid) = child.id() {
                            info!(pid, "Forwarding stop to daemon process");
                            let _ = send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                        }
                        let status = child.wait().await.context("Failed to wait for daemon process")?;
                        self.record_child(None);
                        info!(?status, "Daemon process stopped");
                        return Ok(EXIT_STOPPED);
                    }
                }
            };
            self.record_child(None);

            match status.code() {
                Some(EXIT_STOPPED) => {
                    info!("Daemon process exited cleanly");
                    return Ok(EXIT_STOPPED);
                }
                Some(EXIT_ASSEMBLY) => {
                    error!("Daemon process failed assembly, not restarting");
                    return Ok(EXIT_ASSEMBLY);
                }
                code => {
                    let delay = self.policy.on_crash(started.elapsed());
                    restarts += 1;
                    warn!(?code, restarts, ?delay, "Daemon process crashed, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => return Ok(EXIT_STOPPED),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast() -> WatchdogConfig {
        WatchdogConfig {
            restart_delay_ms: 1,
            max_restart_delay_ms: 4,
            crash_window_ms: 60_000,
        }
    }

    fn sh(script: &str) -> Watchdog {
        Watchdog::new("sh", vec!["-c".into(), script.into()], &fast())
    }

    #[test]
    fn test_is_not_running_when_no_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp_dir.path().join("nonexistent.pid"));
        assert!(!manager.is_running());
        assert!(manager.stop().is_err());
        assert!(manager.reload().is_err());
    }

    #[test]
    fn test_register_self_and_status() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("taskmill.pid");
        let manager = DaemonManager::with_pid_file(pid_file.clone());

        manager.register_self().unwrap();
        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert_eq!(status.version.as_deref(), Some(VERSION));
        assert!(manager.version_matches());

        manager.unregister_self().unwrap();
        assert!(!pid_file.exists());
        assert!(!manager.status().running);
    }

    #[test]
    fn test_unregister_leaves_foreign_pid() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp_dir.path().join("taskmill.pid"));
        manager.write_pid(std::process::id() + 1).unwrap();
        manager.unregister_self().unwrap();
        assert!(manager.pid_file().exists());
    }

    #[test]
    fn test_version_file_path_derived_from_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp_dir.path().join("myapp.pid"));
        assert_eq!(manager.version_file, temp_dir.path().join("myapp.version"));
    }

    #[test]
    fn test_forced_stop_kills_watchdog_child() {
        use std::os::unix::process::ExitStatusExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp_dir.path().join("taskmill.pid"));

        // A watchdog that ignores SIGTERM, and the daemon process it runs
        let mut watchdog = Command::new("sh").args(["-c", "trap '' TERM; exec sleep 30"]).spawn().unwrap();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        manager.write_pid(watchdog.id()).unwrap();
        write_pid_file(manager.child_pid_file(), child.id()).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        manager.stop().unwrap();

        assert_eq!(watchdog.wait().unwrap().signal(), Some(9));
        assert_eq!(child.wait().unwrap().signal(), Some(9));
        assert!(!manager.pid_file().exists());
        assert!(!manager.child_pid_file().exists());
    }

    #[test]
    fn test_restart_delay_widens_and_resets() {
        let mut policy = RestartPolicy::new(&WatchdogConfig {
            restart_delay_ms: 100,
            max_restart_delay_ms: 350,
            crash_window_ms: 1_000,
        });
        let quick = Duration::from_millis(10);
        assert_eq!(policy.on_crash(quick), Duration::from_millis(100));
        assert_eq!(policy.on_crash(quick), Duration::from_millis(200));
        assert_eq!(policy.on_crash(quick), Duration::from_millis(350));
        assert_eq!(policy.on_crash(quick), Duration::from_millis(350));
        assert_eq!(policy.on_crash(Duration::from_secs(5)), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_watchdog_clean_exit() {
        let code = sh("exit 0").run(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, EXIT_STOPPED);
    }

    #[tokio::test]
    async fn test_watchdog_does_not_restart_assembly_failure() {
        let temp_dir = TempDir::new().unwrap();
        let counter = temp_dir.path().join("runs");
        let script = format!("echo run >> {}; exit 10", counter.display());

        let code = sh(&script).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, EXIT_ASSEMBLY);
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_watchdog_restarts_crashes() {
        let temp_dir = TempDir::new().unwrap();
        let counter = temp_dir.path().join("count");
        let script = format!(
            "n=$(cat {f} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {f}; [ $n -ge 3 ] && exit 0; exit 1",
            f = counter.display()
        );

        let code = sh(&script).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, EXIT_STOPPED);
        assert_eq!(fs::read_to_string(&counter).unwrap().trim(), "3");
    }

    #[tokio::test]
    async fn test_watchdog_records_child_pid_while_running() {
        let temp_dir = TempDir::new().unwrap();
        let child_pid = temp_dir.path().join("taskmill.child.pid");
        let script = format!(
            "sleep 0.2; [ \"$(cat {f})\" = \"$$\" ] && exit 0; exit 10",
            f = child_pid.display()
        );

        let code = sh(&script)
            .with_child_pid_file(&child_pid)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, EXIT_STOPPED);
        assert!(!child_pid.exists());
    }

    #[tokio::test]
    async fn test_watchdog_forwards_stop() {
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let code = sh("sleep 30").run(&stop).await.unwrap();
        assert_eq!(code, EXIT_STOPPED);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
