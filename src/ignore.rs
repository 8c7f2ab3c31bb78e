//! Ignore list of canonical keys that must not be migrated.
//!
//! The list lives in a plain text file (`ignore.psids` by default), one key
//! per line. Keys are compared lower-cased, so `Foo` in the catalog is
//! skipped when the file lists `foo`.

use std::collections::HashSet;
use std::path::Path;

/// Default location of the ignore list, relative to the working directory.
pub const DEFAULT_IGNORE_FILE: &str = "ignore.psids";

/// Lower-cased canonical keys to skip. Read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    keys: HashSet<String>,
}

impl IgnoreSet {
    /// Load the ignore list from `path`.
    ///
    /// A missing or unreadable file yields an empty set and a warning.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let set = Self::parse(&contents);
                tracing::info!(
                    "Loaded {} ignored key(s) from {}",
                    set.len(),
                    path.display()
                );
                set
            }
            Err(e) => {
                tracing::warn!(
                    "Could not read ignore list {}: {}, ignoring nothing",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Build a set from file contents.
    pub fn parse(contents: &str) -> Self {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Whether `key` is ignored. The caller's key is lower-cased first.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for IgnoreSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|key| key.as_ref().to_lowercase())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lowercases_and_skips_blank_lines() {
        let set = IgnoreSet::parse("Bar\n\n  staging_Node  \r\nbar\n");
        assert_eq!(set.len(), 2);
        assert!(set.contains("bar"));
        assert!(set.contains("BAR"));
        assert!(set.contains("staging_node"));
        assert!(!set.contains("foo"));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ignore.psids");
        tokio::fs::write(&path, "bar\nQux\n").await.expect("write");

        let set = IgnoreSet::load(&path).await;
        assert!(set.contains("bar"));
        assert!(set.contains("qux"));
    }

    #[tokio::test]
    async fn missing_file_is_empty_set() {
        let temp = tempfile::tempdir().expect("tempdir");
        let set = IgnoreSet::load(&temp.path().join("nope.psids")).await;
        assert!(set.is_empty());
    }
}
