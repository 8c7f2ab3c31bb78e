//! Bounded-concurrency migration of listed secrets.
//!
//! Every candidate becomes one task in a [`JoinSet`]. A task must hold a
//! permit from the gate semaphore ([`MAX_IN_FLIGHT`] permits) for its whole
//! fetch/backup/delete or fetch/create sequence, and the permit is taken
//! before the task is spawned, so dispatch itself waits for a free slot.
//! A failed or panicking item is reported and never affects its siblings.
//!
//! Canonical keys are claimed by the dispatcher before any task starts. A
//! second secret mapping onto an already claimed key is failed without being
//! fetched, so two sources can never share a destination secret or a backup
//! file within one run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::backup::{BackupError, BackupWriter};
use crate::config::{Config, RunMode, MAX_IN_FLIGHT};
use crate::key::{self, KeyError};
use crate::store::{SecretRecord, SecretRef, SecretStore, StoreError};

/// Why a single secret failed to migrate.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid key for {secret}: {source}")]
    InvalidKey {
        secret: String,
        #[source]
        source: KeyError,
    },

    #[error("failed to get value of {secret}: {source}")]
    Fetch {
        secret: String,
        #[source]
        source: StoreError,
    },

    #[error("{secret} maps to {key}, already claimed by {claimed_by}")]
    DuplicateKey {
        secret: String,
        key: String,
        claimed_by: String,
    },

    #[error("failed to create {key} from {secret}: {source}")]
    Create {
        secret: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("created {key} from {secret} but failed to add its value, empty secret left behind: {source}")]
    AddVersion {
        secret: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to back up {secret}: {source}")]
    Backup {
        secret: String,
        #[source]
        source: BackupError,
    },

    #[error("cannot delete {secret}: {source}")]
    Delete {
        secret: String,
        #[source]
        source: StoreError,
    },

    #[error("migration of {secret} timed out after {after:?}")]
    TimedOut { secret: String, after: Duration },

    #[error("worker for {secret} panicked")]
    Panicked { secret: String },
}

/// What a successful item did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Created in the destination under `key`.
    Copied { key: String },
    /// Written to `path` and deleted from the source.
    BackedUp { key: String, path: PathBuf },
}

/// Result of migrating one secret.
#[derive(Debug)]
pub struct ItemReport {
    /// Resource name of the source secret.
    pub secret: String,
    pub result: Result<ItemOutcome, ItemError>,
}

/// Per-item migration logic shared by every task.
struct Worker {
    store: Arc<dyn SecretStore>,
    source_project: String,
    destination_project: String,
    mode: RunMode,
    marker: String,
    backup: BackupWriter,
}

impl Worker {
    async fn migrate(&self, secret: SecretRef) -> Result<ItemOutcome, ItemError> {
        let invalid = |source: KeyError| ItemError::InvalidKey {
            secret: secret.name.clone(),
            source,
        };
        // Both keys are validated before any remote call.
        let source_id = key::extract_key(&secret.name)
            .and_then(key::validate_key)
            .map_err(invalid)?
            .to_string();
        let canonical = key::canonical_key(&secret.name, &self.marker).map_err(invalid)?;

        let value = self
            .store
            .access_latest(&self.source_project, &source_id)
            .await
            .map_err(|source| ItemError::Fetch {
                secret: secret.name.clone(),
                source,
            })?;
        let record = SecretRecord { secret, value };

        match self.mode {
            RunMode::BackupDelete => self.backup_and_delete(record, &source_id, canonical).await,
            RunMode::Copy => self.copy(record, canonical).await,
        }
    }

    async fn backup_and_delete(
        &self,
        record: SecretRecord,
        source_id: &str,
        canonical: String,
    ) -> Result<ItemOutcome, ItemError> {
        let path = self
            .backup
            .write(&record, &canonical)
            .await
            .map_err(|source| ItemError::Backup {
                secret: record.secret.name.clone(),
                source,
            })?;

        self.store
            .delete_secret(&self.source_project, source_id)
            .await
            .map_err(|source| ItemError::Delete {
                secret: record.secret.name.clone(),
                source,
            })?;

        tracing::info!(
            "Deleted {} after backing it up to {}",
            record.secret.name,
            path.display()
        );
        Ok(ItemOutcome::BackedUp {
            key: canonical,
            path,
        })
    }

    async fn copy(&self, record: SecretRecord, canonical: String) -> Result<ItemOutcome, ItemError> {
        self.store
            .create_secret(&self.destination_project, &canonical, &record.secret.labels)
            .await
            .map_err(|source| ItemError::Create {
                secret: record.secret.name.clone(),
                key: canonical.clone(),
                source,
            })?;
        self.store
            .add_version(&self.destination_project, &canonical, &record.value)
            .await
            .map_err(|source| ItemError::AddVersion {
                secret: record.secret.name.clone(),
                key: canonical.clone(),
                source,
            })?;

        tracing::info!(
            "Created secret {} in projects/{}",
            canonical,
            self.destination_project
        );
        Ok(ItemOutcome::Copied { key: canonical })
    }

    /// Form of `canonical` that must be unique within a run. Backup file
    /// names are compared without case so they stay distinct on
    /// case-insensitive filesystems.
    fn claim_key(&self, canonical: &str) -> String {
        match self.mode {
            RunMode::Copy => canonical.to_string(),
            RunMode::BackupDelete => canonical.to_lowercase(),
        }
    }
}

/// Fans candidate secrets out over at most [`MAX_IN_FLIGHT`] workers.
pub struct Migrator {
    worker: Arc<Worker>,
    gate: Arc<Semaphore>,
    item_timeout: Option<Duration>,
}

impl Migrator {
    pub fn new(config: &Config, store: Arc<dyn SecretStore>) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                source_project: config.source_project.clone(),
                destination_project: config.destination_project.clone(),
                mode: config.mode,
                marker: config.marker.clone(),
                backup: BackupWriter::new(&config.backup_dir),
            }),
            gate: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            item_timeout: config.item_timeout,
        }
    }

    /// Migrate every candidate and wait for all of them to finish.
    ///
    /// Reports come back in completion order, after any duplicate-key
    /// rejections.
    pub async fn run(&self, candidates: Vec<SecretRef>) -> Vec<ItemReport> {
        let total = candidates.len();
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(total);
        let mut claimed: HashMap<String, String> = HashMap::new();

        for secret in candidates {
            // Invalid keys are left for the worker to reject.
            if let Ok(canonical) = key::canonical_key(&secret.name, &self.worker.marker) {
                let claim = self.worker.claim_key(&canonical);
                if let Some(first) = claimed.get(&claim) {
                    let error = ItemError::DuplicateKey {
                        secret: secret.name.clone(),
                        key: canonical,
                        claimed_by: first.clone(),
                    };
                    tracing::error!("{}", error);
                    reports.push(ItemReport {
                        secret: secret.name,
                        result: Err(error),
                    });
                    continue;
                }
                claimed.insert(claim, secret.name.clone());
            }

            let Ok(permit) = Arc::clone(&self.gate).acquire_owned().await else {
                tracing::error!("Concurrency gate closed, {} not dispatched", secret.name);
                break;
            };
            tracing::debug!("Migrating {}", secret.name);

            let worker = Arc::clone(&self.worker);
            let item_timeout = self.item_timeout;
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let name = secret.name.clone();
                    let work = AssertUnwindSafe(worker.migrate(secret)).catch_unwind();
                    let outcome = match item_timeout {
                        Some(after) => match tokio::time::timeout(after, work).await {
                            Ok(outcome) => outcome,
                            Err(_) => Ok(Err(ItemError::TimedOut {
                                secret: name.clone(),
                                after,
                            })),
                        },
                        None => work.await,
                    };
                    let result = outcome.unwrap_or_else(|_| {
                        Err(ItemError::Panicked {
                            secret: name.clone(),
                        })
                    });
                    if let Err(e) = &result {
                        tracing::error!("{}", e);
                    }
                    ItemReport {
                        secret: name,
                        result,
                    }
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Migration task did not complete: {}", e),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::CallCounts;
    use crate::store::{Labels, MemorySecretStore, SecretValue};

    fn refs(store: &MemorySecretStore, project: &str) -> Vec<SecretRef> {
        store
            .secret_ids(project)
            .into_iter()
            .map(|id| {
                let labels = store.get(project, &id).map(|(l, _)| l).unwrap_or_default();
                SecretRef::new(format!("projects/{}/secrets/{}", project, id), labels)
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_candidate_list_dispatches_nothing() {
        let store = Arc::new(MemorySecretStore::new());
        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone()).run(Vec::new()).await;
        assert!(reports.is_empty());
        assert_eq!(store.calls(), CallCounts::default());
    }

    #[tokio::test]
    async fn copy_mode_creates_under_canonical_key_and_never_deletes() {
        let store = Arc::new(MemorySecretStore::new());
        let labels = Labels::from([("owner".to_string(), "billing".to_string())]);
        store.insert("src", "psid_Foo", labels.clone(), "foo-value");

        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].result.as_ref().unwrap(),
            &ItemOutcome::Copied {
                key: "Foo".to_string()
            }
        );
        let (dst_labels, value) = store.get("dst", "Foo").expect("created");
        assert_eq!(dst_labels, labels);
        assert_eq!(value, Some(SecretValue::from("foo-value")));
        assert_eq!(store.calls().delete, 0);
        assert!(store.get("src", "psid_Foo").is_some());
    }

    #[tokio::test]
    async fn backup_delete_mode_never_creates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "foo-value");

        let mut config = Config::new("src", "dst", RunMode::BackupDelete);
        config.backup_dir = temp.path().join("backup");
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        match reports[0].result.as_ref().unwrap() {
            ItemOutcome::BackedUp { key, path } => {
                assert_eq!(key, "Foo");
                assert_eq!(path, &temp.path().join("backup").join("Foo.json"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.calls().create, 0);
        assert_eq!(store.calls().delete, 1);
        assert!(store.get("src", "psid_Foo").is_none());
    }

    #[tokio::test]
    async fn failed_backup_prevents_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("backup");
        tokio::fs::write(&blocker, "not a directory").await.unwrap();

        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "foo-value");

        let mut config = Config::new("src", "dst", RunMode::BackupDelete);
        config.backup_dir = blocker;
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        assert!(matches!(
            reports[0].result,
            Err(ItemError::Backup { .. })
        ));
        assert_eq!(store.calls().delete, 0);
        assert!(store.get("src", "psid_Foo").is_some());
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_item() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_a", Labels::new(), "a");
        store.insert("src", "psid_b", Labels::new(), "b");
        store.insert("src", "psid_c", Labels::new(), "c");
        store.fail_access("psid_b");

        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        assert_eq!(reports.len(), 3);
        let failed: Vec<&str> = reports
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.secret.as_str())
            .collect();
        assert_eq!(failed, vec!["projects/src/secrets/psid_b"]);
        let mut created = store.secret_ids("dst");
        created.sort();
        assert_eq!(created, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn existing_destination_secret_is_a_create_failure() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "new");
        store.insert("dst", "Foo", Labels::new(), "old");

        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        assert!(matches!(
            &reports[0].result,
            Err(ItemError::Create {
                source: StoreError::AlreadyExists(_),
                ..
            })
        ));
        assert_eq!(
            store.get("dst", "Foo").and_then(|(_, v)| v),
            Some(SecretValue::from("old"))
        );
    }

    #[tokio::test]
    async fn failed_add_version_reports_the_empty_secret() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "foo-value");
        store.fail_add_version("Foo");

        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        let err = reports[0].result.as_ref().unwrap_err();
        assert!(matches!(err, ItemError::AddVersion { key, .. } if key == "Foo"));
        assert!(err.to_string().contains("empty secret left behind"));
        assert_eq!(store.get("dst", "Foo"), Some((Labels::new(), None)));
    }

    #[tokio::test]
    async fn colliding_keys_in_delete_mode_back_up_and_delete_only_the_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "value-one");
        store.insert("src", "PSID_Foo", Labels::new(), "value-two");
        store.insert("src", "psid_foo", Labels::new(), "value-three");

        let mut config = Config::new("src", "dst", RunMode::BackupDelete);
        config.backup_dir = temp.path().join("backup");
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        assert_eq!(reports.len(), 3);
        let backed_up: Vec<&str> = reports
            .iter()
            .filter(|r| r.result.is_ok())
            .map(|r| r.secret.as_str())
            .collect();
        assert_eq!(backed_up, vec!["projects/src/secrets/psid_Foo"]);
        for report in reports.iter().filter(|r| r.result.is_err()) {
            match &report.result {
                Err(ItemError::DuplicateKey { claimed_by, .. }) => {
                    assert_eq!(claimed_by, "projects/src/secrets/psid_Foo");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }

        let calls = store.calls();
        assert_eq!(calls.access, 1);
        assert_eq!(calls.delete, 1);
        assert_eq!(
            store.secret_ids("src"),
            vec!["PSID_Foo".to_string(), "psid_foo".to_string()]
        );
        let entry = crate::backup::read_entry(&temp.path().join("backup").join("Foo.json"))
            .await
            .expect("read backup");
        assert_eq!(entry.value, "value-one");
        assert_eq!(entry.secret_id, "projects/src/secrets/psid_Foo");
    }

    #[tokio::test]
    async fn colliding_keys_in_copy_mode_are_case_sensitive() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert("src", "psid_Foo", Labels::new(), "value-one");
        store.insert("src", "Foopsid_", Labels::new(), "value-two");
        store.insert("src", "psid_foo", Labels::new(), "value-three");

        let config = Config::new("src", "dst", RunMode::Copy);
        let reports = Migrator::new(&config, store.clone())
            .run(refs(&store, "src"))
            .await;

        let duplicate = reports
            .iter()
            .find(|r| r.result.is_err())
            .expect("one duplicate");
        assert_eq!(duplicate.secret, "projects/src/secrets/Foopsid_");
        assert!(matches!(
            duplicate.result,
            Err(ItemError::DuplicateKey { .. })
        ));

        let mut created = store.secret_ids("dst");
        created.sort();
        assert_eq!(created, vec!["Foo".to_string(), "foo".to_string()]);
        assert_eq!(
            store.get("dst", "Foo").and_then(|(_, v)| v),
            Some(SecretValue::from("value-one"))
        );
        assert_eq!(store.calls().create, 2);
    }

    #[tokio::test]
    async fn invalid_keys_fail_before_any_remote_call() {
        let store = Arc::new(MemorySecretStore::new());
        let config = Config::new("src", "dst", RunMode::Copy);
        let candidates = vec![
            SecretRef::new("projects/src/secrets/psid_", Labels::new()),
            SecretRef::new(
                format!("projects/src/secrets/psid_{}", "k".repeat(300)),
                Labels::new(),
            ),
            SecretRef::new("src/psid_short", Labels::new()),
        ];

        let reports = Migrator::new(&config, store.clone()).run(candidates).await;

        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|r| matches!(r.result, Err(ItemError::InvalidKey { .. }))));
        assert_eq!(store.calls().access, 0);
        assert_eq!(store.calls().create, 0);
    }

    struct StalledAccess(MemorySecretStore);

    #[async_trait::async_trait]
    impl SecretStore for StalledAccess {
        fn list_secrets<'a>(
            &'a self,
            project: &'a str,
        ) -> futures::stream::BoxStream<'a, Result<SecretRef, StoreError>> {
            self.0.list_secrets(project)
        }

        async fn access_latest(
            &self,
            project: &str,
            secret_id: &str,
        ) -> Result<SecretValue, StoreError> {
            if secret_id == "psid_stuck" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.0.access_latest(project, secret_id).await
        }

        async fn create_secret(
            &self,
            project: &str,
            secret_id: &str,
            labels: &Labels,
        ) -> Result<(), StoreError> {
            self.0.create_secret(project, secret_id, labels).await
        }

        async fn add_version(
            &self,
            project: &str,
            secret_id: &str,
            payload: &SecretValue,
        ) -> Result<(), StoreError> {
            self.0.add_version(project, secret_id, payload).await
        }

        async fn delete_secret(&self, project: &str, secret_id: &str) -> Result<(), StoreError> {
            self.0.delete_secret(project, secret_id).await
        }
    }

    #[tokio::test]
    async fn item_timeout_releases_the_slot() {
        let inner = MemorySecretStore::new();
        inner.insert("src", "psid_stuck", Labels::new(), "s");
        inner.insert("src", "psid_ok", Labels::new(), "o");
        let store = Arc::new(StalledAccess(inner));
        let candidates = refs(&store.0, "src");

        let mut config = Config::new("src", "dst", RunMode::Copy);
        config.item_timeout = Some(Duration::from_millis(50));
        let reports = Migrator::new(&config, store.clone()).run(candidates).await;

        let stuck = reports
            .iter()
            .find(|r| r.secret.ends_with("psid_stuck"))
            .unwrap();
        assert!(matches!(stuck.result, Err(ItemError::TimedOut { .. })));
        assert!(store.0.get("dst", "ok").is_some());
    }
}
