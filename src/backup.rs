//! Local backups of secrets removed from the source project.
//!
//! Each deleted secret is written to `<backup_dir>/<canonical key>.json`:
//!
//! ```json
//! {
//!   "secretID": "projects/123/secrets/psid_Foo",
//!   "secretKey": "Foo",
//!   "value": "...",
//!   "labels": {}
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::store::{Labels, SecretRecord};

/// Default backup directory, relative to the working directory.
pub const DEFAULT_BACKUP_DIR: &str = "backup";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("value of {0} is not valid UTF-8 and cannot be written as JSON")]
    NonUtf8Value(String),

    #[error("failed to encode backup entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serialized form of a backed-up secret. Field order is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Full resource name of the source secret.
    #[serde(rename = "secretID")]
    pub secret_id: String,
    /// Canonical key the backup file is named after.
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    pub value: String,
    #[serde(default)]
    pub labels: Labels,
}

impl BackupEntry {
    pub fn from_record(record: &SecretRecord, canonical_key: &str) -> Result<Self, BackupError> {
        let value = record
            .value
            .as_str()
            .ok_or_else(|| BackupError::NonUtf8Value(record.secret.name.clone()))?;
        Ok(Self {
            secret_id: record.secret.name.clone(),
            secret_key: canonical_key.to_string(),
            value: value.to_string(),
            labels: record.secret.labels.clone(),
        })
    }
}

/// Writes backup entries into a single directory.
#[derive(Debug, Clone)]
pub struct BackupWriter {
    dir: PathBuf,
}

impl BackupWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the backup file for `canonical_key`.
    pub fn path_for(&self, canonical_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", canonical_key))
    }

    /// Write `record` to `<dir>/<canonical_key>.json`, replacing any existing
    /// file, and return the path written.
    pub async fn write(
        &self,
        record: &SecretRecord,
        canonical_key: &str,
    ) -> Result<PathBuf, BackupError> {
        let entry = BackupEntry::from_record(record, canonical_key)?;
        let payload = serde_json::to_string_pretty(&entry)?;
        let path = self.path_for(canonical_key);
        let io_err = |source: std::io::Error| BackupError::Io {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        file.write_all(payload.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        tracing::debug!("Backed up {} to {}", record.secret.name, path.display());
        Ok(path)
    }
}

/// Read a backup entry from disk.
pub async fn read_entry(path: &Path) -> anyhow::Result<BackupEntry> {
    use anyhow::Context;

    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read backup {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse backup {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SecretRef, SecretValue};

    fn record(value: SecretValue, labels: Labels) -> SecretRecord {
        SecretRecord {
            secret: SecretRef::new("projects/123/secrets/psid_Foo", labels),
            value,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = BackupWriter::new(temp.path().join("backup"));
        let labels = Labels::from([
            ("env".to_string(), "prod".to_string()),
            ("team".to_string(), "payments".to_string()),
        ]);

        let path = writer
            .write(&record(SecretValue::from("s3cr3t"), labels.clone()), "Foo")
            .await
            .expect("write backup");
        assert_eq!(path, temp.path().join("backup").join("Foo.json"));

        let entry = read_entry(&path).await.expect("read backup");
        assert_eq!(entry.secret_id, "projects/123/secrets/psid_Foo");
        assert_eq!(entry.secret_key, "Foo");
        assert_eq!(entry.value, "s3cr3t");
        assert_eq!(entry.labels, labels);
    }

    #[tokio::test]
    async fn file_uses_fixed_field_order_and_empty_labels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = BackupWriter::new(temp.path());

        let path = writer
            .write(&record(SecretValue::from("v"), Labels::new()), "Foo")
            .await
            .unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();

        let positions: Vec<usize> = ["\"secretID\"", "\"secretKey\"", "\"value\"", "\"labels\""]
            .iter()
            .map(|field| raw.find(field).expect("field present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(raw.contains("\"labels\": {}"));
    }

    #[tokio::test]
    async fn rewrite_truncates_previous_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = BackupWriter::new(temp.path());

        writer
            .write(&record(SecretValue::from("a much longer original value"), Labels::new()), "Foo")
            .await
            .unwrap();
        let path = writer
            .write(&record(SecretValue::from("short"), Labels::new()), "Foo")
            .await
            .unwrap();

        assert_eq!(read_entry(&path).await.unwrap().value, "short");
    }

    #[tokio::test]
    async fn non_utf8_value_is_rejected_without_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = BackupWriter::new(temp.path().join("backup"));

        let err = writer
            .write(&record(SecretValue::new(vec![0xff, 0x00]), Labels::new()), "Foo")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NonUtf8Value(_)));
        assert!(!writer.path_for("Foo").exists());
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        tokio::fs::write(&blocker, "file").await.unwrap();
        let writer = BackupWriter::new(&blocker);

        let err = writer
            .write(&record(SecretValue::from("v"), Labels::new()), "Foo")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Io { .. }));
    }

    #[tokio::test]
    async fn missing_labels_read_as_empty_map() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("Foo.json");
        tokio::fs::write(
            &path,
            r#"{"secretID":"projects/1/secrets/psid_Foo","secretKey":"Foo","value":"v"}"#,
        )
        .await
        .unwrap();

        let entry = read_entry(&path).await.unwrap();
        assert!(entry.labels.is_empty());
    }
}
