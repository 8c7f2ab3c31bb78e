//! Migration run configuration.
//!
//! Project ids and the run mode come from the command line. Tuning knobs are
//! read from environment variables:
//! - `GSM_MIGRATE_MARKER` - Optional. Token marking migratable secrets. Defaults to `psid_`.
//! - `GSM_MIGRATE_ITEM_TIMEOUT_SECS` - Optional. Deadline for one secret's migration. Unset means no deadline.
//! - `SECRET_MANAGER_ENDPOINT` / `GOOGLE_OAUTH_ACCESS_TOKEN` - read by the Secret Manager client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backup::DEFAULT_BACKUP_DIR;
use crate::ignore::DEFAULT_IGNORE_FILE;
use crate::key::DEFAULT_MARKER;

/// Maximum number of secrets migrated concurrently.
pub const MAX_IN_FLIGHT: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required value: {0}")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// What happens to each migrated secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Create the secret in the destination project.
    Copy,
    /// Write a local backup, then delete the secret from the source project.
    BackupDelete,
}

impl RunMode {
    pub fn from_delete_flag(delete: bool) -> Self {
        if delete {
            Self::BackupDelete
        } else {
            Self::Copy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::BackupDelete => "backup-delete",
        }
    }
}

/// Configuration for one migration run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project secrets are read from
    pub source_project: String,

    /// Project secrets are created in (copy mode)
    pub destination_project: String,

    pub mode: RunMode,

    /// Ignore list of canonical keys
    pub ignore_file: PathBuf,

    /// Directory backups are written to (backup-delete mode)
    pub backup_dir: PathBuf,

    /// Token a secret id must contain to be migrated
    pub marker: String,

    /// Optional deadline for a single secret's migration
    pub item_timeout: Option<Duration>,
}

impl Config {
    /// Create a config with defaults for everything but the projects and mode.
    pub fn new(source_project: &str, destination_project: &str, mode: RunMode) -> Self {
        Self {
            source_project: source_project.to_string(),
            destination_project: destination_project.to_string(),
            mode,
            ignore_file: PathBuf::from(DEFAULT_IGNORE_FILE),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            marker: DEFAULT_MARKER.to_string(),
            item_timeout: None,
        }
    }

    /// Apply the environment overrides listed in the module docs.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an empty marker or a timeout that
    /// is not a positive integer.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(marker) = std::env::var("GSM_MIGRATE_MARKER") {
            self.marker = marker;
        }
        self.item_timeout = match std::env::var("GSM_MIGRATE_ITEM_TIMEOUT_SECS") {
            Ok(raw) => Some(parse_timeout(&raw)?),
            Err(_) => None,
        };
        Ok(self)
    }

    /// Check the invariants a run needs before anything is listed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_project.trim().is_empty() {
            return Err(ConfigError::Missing("source project id".to_string()));
        }
        if self.destination_project.trim().is_empty() {
            return Err(ConfigError::Missing("destination project id".to_string()));
        }
        if self.marker.is_empty() {
            return Err(ConfigError::InvalidValue(
                "GSM_MIGRATE_MARKER".to_string(),
                "must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |detail: String| {
        ConfigError::InvalidValue("GSM_MIGRATE_ITEM_TIMEOUT_SECS".to_string(), detail)
    };
    let secs: u64 = raw.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
    if secs == 0 {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(Duration::from_secs(secs))
}
