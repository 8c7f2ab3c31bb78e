//! Candidate selection from a project's secret catalog.

use futures::StreamExt;

use crate::ignore::IgnoreSet;
use crate::key;
use crate::store::{SecretRef, SecretStore, StoreError};

/// Result of listing and filtering a project.
#[derive(Debug, Default)]
pub struct Listing {
    /// Secrets to migrate, in catalog order.
    pub candidates: Vec<SecretRef>,
    /// Resource names skipped because they are on the ignore list.
    pub ignored: Vec<String>,
    /// Secrets without the marker token, or with an unrecognized path.
    pub unmarked: usize,
}

/// Drain the catalog of `project` and keep the migratable secrets.
///
/// A secret is a candidate when its id contains `marker` and its normalized
/// key is not in `ignore`. The first listing error aborts and is returned.
pub async fn list_candidates(
    store: &dyn SecretStore,
    project: &str,
    marker: &str,
    ignore: &IgnoreSet,
) -> Result<Listing, StoreError> {
    let mut listing = Listing::default();
    let mut secrets = store.list_secrets(project);

    while let Some(secret) = secrets.next().await {
        let secret = secret?;

        let Ok(secret_id) = key::extract_key(&secret.name) else {
            listing.unmarked += 1;
            continue;
        };
        if !key::has_marker(secret_id, marker) {
            tracing::debug!("Skipping {}: no {} marker", secret.name, marker);
            listing.unmarked += 1;
            continue;
        }

        let normalized = key::normalize(secret_id, marker);
        if ignore.contains(&normalized) {
            tracing::warn!("Skipping {}: {} is on the ignore list", secret.name, normalized);
            listing.ignored.push(secret.name);
            continue;
        }

        listing.candidates.push(secret);
    }

    tracing::info!(
        "Listed projects/{}: {} candidate(s), {} ignored, {} unmarked",
        project,
        listing.candidates.len(),
        listing.ignored.len(),
        listing.unmarked
    );
    Ok(listing)
}
