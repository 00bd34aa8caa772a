//! Notifications broadcast by the sync service.

use serde::Serialize;

use super::decision::Resolution;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Saved { key: String },
    Deleted { key: String },
    SignedIn,
    SignedOut,
    SyncStarted,
    SyncCompleted(SyncReport),
    ConflictResolved { key: String, resolution: Resolution },
}

/// Per-pass reconciliation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Remote-only keys copied into the local store.
    pub pulled: usize,
    /// Local-only keys pushed to the remote store.
    pub pushed: usize,
    /// Conflicts settled in favour of the local value.
    pub kept_local: usize,
    /// Conflicts settled in favour of the remote value.
    pub took_remote: usize,
    pub unchanged: usize,
    /// Keys left alone: outside this pass's direction, or a dismissed prompt.
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    pub(crate) fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Pulled => self.pulled += 1,
            KeyOutcome::Pushed => self.pushed += 1,
            KeyOutcome::KeptLocal => self.kept_local += 1,
            KeyOutcome::TookRemote => self.took_remote += 1,
            KeyOutcome::Unchanged => self.unchanged += 1,
            KeyOutcome::Skipped => self.skipped += 1,
            KeyOutcome::Failed => self.failed += 1,
        }
    }

    pub fn changed(&self) -> usize {
        self.pulled + self.pushed + self.kept_local + self.took_remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyOutcome {
    Pulled,
    Pushed,
    KeptLocal,
    TookRemote,
    Unchanged,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass was running; this trigger was folded into it.
    AlreadyRunning,
    NotSignedIn,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_outcomes() {
        let mut report = SyncReport::default();
        for outcome in [
            KeyOutcome::Pulled,
            KeyOutcome::Pushed,
            KeyOutcome::Pushed,
            KeyOutcome::Unchanged,
            KeyOutcome::Failed,
        ] {
            report.record(outcome);
        }
        assert_eq!(report.pushed, 2);
        assert_eq!(report.changed(), 3);
        assert_eq!(report.failed, 1);
        assert_eq!(SyncOutcome::Completed(report.clone()).report(), Some(&report));
        assert_eq!(SyncOutcome::AlreadyRunning.report(), None);
    }
}
