//! Supervisor - the long-running improvement loop

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleaner::{CleanerConfig, RetentionPolicy, SweepReport, TaskCleaner};
use crate::dispatcher::{CycleSummary, TaskDispatcher};

use super::config::SupervisorConfig;
use super::inbox::{Inbox, IngestReport};
use super::pacing::{PacingPolicy, SupervisorRunRecord};

/// Where the supervisor is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Inside a cycle
    Running,
    /// Pausing between cycles
    Backoff,
    Stopped,
}

/// How `run_forever` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Cancellation was requested and the in-flight cycle finished
    Stopped { cycles: u64 },
}

/// Everything one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub ingested: IngestReport,
    pub summary: CycleSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepReport>,
    pub next_pause: Duration,
}

pub struct Supervisor {
    dispatcher: TaskDispatcher,
    cleaner: Arc<TaskCleaner>,
    inbox: Inbox,
    retention: RetentionPolicy,
    sweep_every: u64,
    pacing: PacingPolicy,
    record: SupervisorRunRecord,
    state: SupervisorState,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("record", &self.record)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        dispatcher: TaskDispatcher,
        cleaner: Arc<TaskCleaner>,
        inbox: Inbox,
        config: &SupervisorConfig,
        cleaner_config: &CleanerConfig,
    ) -> Self {
        debug!(?config, "Supervisor::new: called");
        let pacing = PacingPolicy::from(config);
        Self {
            dispatcher,
            cleaner,
            inbox,
            retention: cleaner_config.policy(),
            sweep_every: cleaner_config.sweep_every,
            record: pacing.start(),
            pacing,
            state: SupervisorState::Stopped,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn record(&self) -> &SupervisorRunRecord {
        &self.record
    }

    /// First cycle sweeps, then every `sweep_every` cycles
    fn sweep_due(&self) -> bool {
        self.sweep_every > 0 && self.record.cycles % self.sweep_every == 0
    }

    async fn cycle(&mut self, cancel: &CancellationToken, sweep: bool) -> CycleReport {
        debug!(cycle = self.record.cycles, sweep, "Supervisor::cycle: called");
        let ingested = match self.inbox.ingest(self.dispatcher.queue()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Inbox ingest failed");
                IngestReport::default()
            }
        };

        let summary = self.dispatcher.run_cycle(cancel).await;

        let sweep = if sweep {
            match self.cleaner.sweep(&self.retention).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "Sweep failed");
                    None
                }
            }
        } else {
            None
        };

        let next_pause = self.pacing.next(&mut self.record, &summary);
        CycleReport {
            ingested,
            summary,
            sweep,
            next_pause,
        }
    }

    /// One cycle plus a sweep
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> CycleReport {
        debug!("Supervisor::run_once: called");
        self.state = SupervisorState::Running;
        let report = self.cycle(cancel, true).await;
        self.state = SupervisorState::Stopped;
        report
    }

    /// Loop until `cancel` fires
    ///
    /// Cancellation during a cycle lets the in-flight handlers finish;
    /// cancellation during the pause ends it immediately.
    pub async fn run_forever(&mut self, cancel: &CancellationToken) -> SupervisorExit {
        info!("Supervisor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.state = SupervisorState::Running;
            let sweep = self.sweep_due();
            let report = self.cycle(cancel, sweep).await;

            if cancel.is_cancelled() {
                break;
            }

            self.state = SupervisorState::Backoff;
            debug!(pause = ?report.next_pause, "Supervisor::run_forever: pausing");
            tokio::select! {
                _ = tokio::time::sleep(report.next_pause) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.state = SupervisorState::Stopped;
        info!(cycles = self.record.cycles, "Supervisor stopped");
        SupervisorExit::Stopped {
            cycles: self.record.cycles,
        }
    }
}
