//! Secret store capability.
//!
//! The migration pipeline talks to the remote secret service only through the
//! [`SecretStore`] trait. Two implementations ship with the crate:
//!
//! - [`GcpSecretStore`]: Google Secret Manager v1 over REST
//! - [`MemorySecretStore`]: in-process store with call counters, for tests
//!
//! ```text
//!   lister ──list_secrets──┐
//!                          ▼
//!   migrate ──access/create/add_version/delete──▶ SecretStore
//! ```

pub mod gcp;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use gcp::GcpSecretStore;
pub use memory::MemorySecretStore;

/// Secret labels. Ordered so serialized output is stable.
pub type Labels = BTreeMap<String, String>;

/// Errors returned by a secret store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret already exists: {0}")]
    AlreadyExists(String),

    #[error("secret store API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// A secret as listed from a project: resource name and labels, no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Fully-qualified resource name, `projects/<p>/secrets/<id>`.
    pub name: String,
    pub labels: Labels,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

/// Secret payload. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Vec<u8>);

impl SecretValue {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED; {} bytes]", self.0.len())
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

/// A listed secret together with its latest value.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub secret: SecretRef,
    pub value: SecretValue,
}

/// Remote secret service operations used by a migration.
///
/// `project` is a bare project id and `secret_id` is the last segment of a
/// secret's resource name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Lazily page through every secret in `project`.
    ///
    /// The stream is finite and cannot be restarted. An `Err` item ends the
    /// listing.
    fn list_secrets<'a>(&'a self, project: &'a str) -> BoxStream<'a, Result<SecretRef, StoreError>>;

    /// Fetch the payload of the latest version of a secret.
    async fn access_latest(&self, project: &str, secret_id: &str)
        -> Result<SecretValue, StoreError>;

    /// Create an empty secret with automatic replication and the given labels.
    async fn create_secret(
        &self,
        project: &str,
        secret_id: &str,
        labels: &Labels,
    ) -> Result<(), StoreError>;

    /// Add a new version holding `payload` to an existing secret.
    async fn add_version(
        &self,
        project: &str,
        secret_id: &str,
        payload: &SecretValue,
    ) -> Result<(), StoreError>;

    /// Delete a secret and all of its versions.
    async fn delete_secret(&self, project: &str, secret_id: &str) -> Result<(), StoreError>;
}

/// Resource name of a secret in a project.
pub fn secret_resource_name(project: &str, secret_id: &str) -> String {
    format!("projects/{}/secrets/{}", project, secret_id)
}
