//! End-of-run summary.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::RunMode;
use crate::migrate::{ItemOutcome, ItemReport};

/// A secret that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Resource name of the source secret.
    pub secret: String,
    pub reason: String,
}

/// Aggregated outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub mode: RunMode,
    /// Canonical keys created in the destination.
    pub copied: Vec<String>,
    /// Backup files written for secrets deleted from the source.
    pub backed_up: Vec<PathBuf>,
    pub failures: Vec<ItemFailure>,
    /// Secrets skipped because of the ignore list.
    pub ignored: usize,
    /// Secrets skipped for lacking the marker token.
    pub unmarked: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    pub fn new(mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            copied: Vec::new(),
            backed_up: Vec::new(),
            failures: Vec::new(),
            ignored: 0,
            unmarked: 0,
            started_at,
            finished_at: started_at,
        }
    }

    /// Fold per-item results into the report. Entries are sorted so the
    /// summary does not depend on completion order.
    pub fn record_items(&mut self, items: Vec<ItemReport>) {
        for item in items {
            match item.result {
                Ok(ItemOutcome::Copied { key }) => self.copied.push(key),
                Ok(ItemOutcome::BackedUp { path, .. }) => self.backed_up.push(path),
                Err(e) => self.failures.push(ItemFailure {
                    secret: item.secret,
                    reason: e.to_string(),
                }),
            }
        }
        self.copied.sort();
        self.backed_up.sort();
        self.failures.sort_by(|a, b| a.secret.cmp(&b.secret));
    }

    pub fn succeeded(&self) -> usize {
        self.copied.len() + self.backed_up.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Log a one-line summary plus one line per failure.
    pub fn log_summary(&self) {
        let elapsed = self.finished_at - self.started_at;
        tracing::info!(
            mode = self.mode.as_str(),
            succeeded = self.succeeded(),
            failed = self.failures.len(),
            ignored = self.ignored,
            unmarked = self.unmarked,
            elapsed_ms = elapsed.num_milliseconds(),
            "Migration finished"
        );
        for failure in &self.failures {
            tracing::warn!("Not migrated: {} ({})", failure.secret, failure.reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ItemError;

    #[test]
    fn record_items_splits_successes_and_failures() {
        let mut report = MigrationReport::new(RunMode::Copy, Utc::now());
        report.record_items(vec![
            ItemReport {
                secret: "projects/p/secrets/psid_b".to_string(),
                result: Ok(ItemOutcome::Copied {
                    key: "b".to_string(),
                }),
            },
            ItemReport {
                secret: "projects/p/secrets/psid_x".to_string(),
                result: Err(ItemError::Panicked {
                    secret: "projects/p/secrets/psid_x".to_string(),
                }),
            },
            ItemReport {
                secret: "projects/p/secrets/psid_a".to_string(),
                result: Ok(ItemOutcome::Copied {
                    key: "a".to_string(),
                }),
            },
        ]);

        assert_eq!(report.copied, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.succeeded(), 2);
        assert!(!report.is_success());
        assert_eq!(report.failures[0].secret, "projects/p/secrets/psid_x");
        assert!(report.failures[0].reason.contains("panicked"));
    }
}
