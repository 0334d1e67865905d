//! Per-cycle counters

use serde::Serialize;

/// What one dispatch cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub deferred: usize,
    /// Includes `unknown_type`
    pub failed: usize,
    pub unknown_type: usize,
    /// Outcomes the queue refused to record
    pub errors: usize,
}

impl CycleSummary {
    pub fn made_progress(&self) -> bool {
        self.succeeded > 0
    }

    /// Nothing was ready to run
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0
    }

    /// Something went wrong and nothing succeeded
    pub fn is_failure(&self) -> bool {
        self.failed + self.errors > 0 && self.succeeded == 0
    }
}

impl std::fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dispatched={} succeeded={} retried={} deferred={} failed={} unknown_type={} errors={}",
            self.dispatched, self.succeeded, self.retried, self.deferred, self.failed, self.unknown_type, self.errors
        )
    }
}
