//! In-memory secret store for tests and local dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::{secret_resource_name, Labels, SecretRef, SecretStore, SecretValue, StoreError};

#[derive(Debug, Clone)]
struct StoredSecret {
    id: String,
    labels: Labels,
    versions: Vec<SecretValue>,
}

#[derive(Debug, Default)]
struct State {
    // project -> secrets in insertion order
    projects: HashMap<String, Vec<StoredSecret>>,
    failing_listings: HashSet<String>,
    failing_access: HashSet<String>,
    failing_add_version: HashSet<String>,
}

impl State {
    fn find(&self, project: &str, secret_id: &str) -> Option<&StoredSecret> {
        self.projects
            .get(project)
            .and_then(|secrets| secrets.iter().find(|s| s.id == secret_id))
    }

    fn find_mut(&mut self, project: &str, secret_id: &str) -> Option<&mut StoredSecret> {
        self.projects
            .get_mut(project)
            .and_then(|secrets| secrets.iter_mut().find(|s| s.id == secret_id))
    }
}

/// Number of calls made against a [`MemorySecretStore`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub access: usize,
    pub create: usize,
    pub add_version: usize,
    pub delete: usize,
}

/// Secret store backed by process memory.
///
/// Listing yields secrets in insertion order. Failures can be injected per
/// project (listing) and per secret id (access, add version).
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    state: Mutex<State>,
    list_calls: AtomicUsize,
    access_calls: AtomicUsize,
    create_calls: AtomicUsize,
    add_version_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret with a single version.
    pub fn insert(
        &self,
        project: &str,
        secret_id: &str,
        labels: Labels,
        value: impl Into<SecretValue>,
    ) {
        let mut state = self.lock();
        state
            .projects
            .entry(project.to_string())
            .or_default()
            .push(StoredSecret {
                id: secret_id.to_string(),
                labels,
                versions: vec![value.into()],
            });
    }

    /// Make listing `project` end with an API error after yielding its secrets.
    pub fn fail_listing(&self, project: &str) {
        self.lock().failing_listings.insert(project.to_string());
    }

    /// Make accessing `secret_id` fail in every project.
    pub fn fail_access(&self, secret_id: &str) {
        self.lock().failing_access.insert(secret_id.to_string());
    }

    /// Make adding a version to `secret_id` fail in every project.
    pub fn fail_add_version(&self, secret_id: &str) {
        self.lock().failing_add_version.insert(secret_id.to_string());
    }

    /// Labels and latest value of a secret, if it exists.
    pub fn get(&self, project: &str, secret_id: &str) -> Option<(Labels, Option<SecretValue>)> {
        self.lock()
            .find(project, secret_id)
            .map(|s| (s.labels.clone(), s.versions.last().cloned()))
    }

    /// Ids of every secret in `project`, in insertion order.
    pub fn secret_ids(&self, project: &str) -> Vec<String> {
        self.lock()
            .projects
            .get(project)
            .map(|secrets| secrets.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            list: self.list_calls.load(Ordering::SeqCst),
            access: self.access_calls.load(Ordering::SeqCst),
            create: self.create_calls.load(Ordering::SeqCst),
            add_version: self.add_version_calls.load(Ordering::SeqCst),
            delete: self.delete_calls.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not wedge the other workers.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn list_secrets<'a>(&'a self, project: &'a str) -> BoxStream<'a, Result<SecretRef, StoreError>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let mut items: Vec<Result<SecretRef, StoreError>> = state
            .projects
            .get(project)
            .map(|secrets| {
                secrets
                    .iter()
                    .map(|s| {
                        Ok(SecretRef::new(
                            secret_resource_name(project, &s.id),
                            s.labels.clone(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if state.failing_listings.contains(project) {
            items.push(Err(StoreError::Api {
                status: 503,
                message: format!("listing {} is unavailable", project),
            }));
        }
        stream::iter(items).boxed()
    }

    async fn access_latest(
        &self,
        project: &str,
        secret_id: &str,
    ) -> Result<SecretValue, StoreError> {
        self.access_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if state.failing_access.contains(secret_id) {
            return Err(StoreError::Api {
                status: 500,
                message: format!("access to {} failed", secret_id),
            });
        }
        state
            .find(project, secret_id)
            .and_then(|s| s.versions.last().cloned())
            .ok_or_else(|| StoreError::NotFound(secret_resource_name(project, secret_id)))
    }

    async fn create_secret(
        &self,
        project: &str,
        secret_id: &str,
        labels: &Labels,
    ) -> Result<(), StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.find(project, secret_id).is_some() {
            return Err(StoreError::AlreadyExists(secret_resource_name(
                project, secret_id,
            )));
        }
        state
            .projects
            .entry(project.to_string())
            .or_default()
            .push(StoredSecret {
                id: secret_id.to_string(),
                labels: labels.clone(),
                versions: Vec::new(),
            });
        Ok(())
    }

    async fn add_version(
        &self,
        project: &str,
        secret_id: &str,
        payload: &SecretValue,
    ) -> Result<(), StoreError> {
        self.add_version_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.failing_add_version.contains(secret_id) {
            return Err(StoreError::Api {
                status: 500,
                message: format!("adding a version to {} failed", secret_id),
            });
        }
        let secret = state
            .find_mut(project, secret_id)
            .ok_or_else(|| StoreError::NotFound(secret_resource_name(project, secret_id)))?;
        secret.versions.push(payload.clone());
        Ok(())
    }

    async fn delete_secret(&self, project: &str, secret_id: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        let not_found = || StoreError::NotFound(secret_resource_name(project, secret_id));
        let secrets = state.projects.get_mut(project).ok_or_else(not_found)?;
        let index = secrets
            .iter()
            .position(|s| s.id == secret_id)
            .ok_or_else(not_found)?;
        secrets.remove(index);
        Ok(())
    }
}
