//! Migration run orchestration.
//!
//! A run is a single pass through `INIT -> LIST -> (COPY | BACKUP_DELETE) -> DONE`:
//!
//! 1. Validate the configuration and load the ignore list
//! 2. List the source project; a listing error or an empty candidate set ends the run
//! 3. Migrate every candidate in the mode chosen for the whole run
//! 4. Wait for all workers and return the report

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, ConfigError, RunMode};
use crate::ignore::IgnoreSet;
use crate::lister;
use crate::migrate::Migrator;
use crate::report::MigrationReport;
use crate::store::{SecretStore, StoreError};

/// Conditions that abort a run before any secret is migrated.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to list secrets in projects/{project}: {source}")]
    Listing {
        project: String,
        #[source]
        source: StoreError,
    },

    #[error("no secrets to migrate in projects/{0}")]
    NothingToMigrate(String),
}

/// Run one migration against `store`.
pub async fn run(config: &Config, store: Arc<dyn SecretStore>) -> Result<MigrationReport, RunError> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("migration", %run_id, mode = config.mode.as_str());
    run_inner(config, store).instrument(span).await
}

async fn run_inner(
    config: &Config,
    store: Arc<dyn SecretStore>,
) -> Result<MigrationReport, RunError> {
    config.validate()?;
    let started_at = Utc::now();

    tracing::info!("Reading ignore list {}", config.ignore_file.display());
    let ignore = IgnoreSet::load(&config.ignore_file).await;

    tracing::info!("Listing secrets in projects/{}", config.source_project);
    let listing = lister::list_candidates(
        store.as_ref(),
        &config.source_project,
        &config.marker,
        &ignore,
    )
    .await
    .map_err(|source| RunError::Listing {
        project: config.source_project.clone(),
        source,
    })?;
    if listing.candidates.is_empty() {
        return Err(RunError::NothingToMigrate(config.source_project.clone()));
    }

    tracing::info!(
        "Migrating {} secret(s) from projects/{} ({})",
        listing.candidates.len(),
        config.source_project,
        match config.mode {
            RunMode::Copy => format!("copy to projects/{}", config.destination_project),
            RunMode::BackupDelete => {
                format!("back up to {} and delete", config.backup_dir.display())
            }
        }
    );

    let mut report = MigrationReport::new(config.mode, started_at);
    report.ignored = listing.ignored.len();
    report.unmarked = listing.unmarked;

    let items = Migrator::new(config, store).run(listing.candidates).await;
    report.record_items(items);
    report.finished_at = Utc::now();
    Ok(report)
}
