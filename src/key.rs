//! Secret key codec.
//!
//! Secret Manager identifies secrets by resource paths of the form
//! `projects/<project>/secrets/<id>`. Migratable application secrets carry a
//! marker token in their id (`psid_Foo`). This module turns those paths into
//! the keys used across a migration:
//!
//! - the **source id** (`psid_Foo`), used to read and delete in the source
//! - the **canonical key** (`Foo`), used for the destination id and backup file
//! - the **normalized key** (`foo`), used only for ignore-list comparison

use thiserror::Error;

/// Default marker token identifying migratable secrets.
pub const DEFAULT_MARKER: &str = "psid_";

/// Secret Manager rejects ids longer than this.
pub const MAX_KEY_LEN: usize = 255;

/// Minimum number of `/`-separated segments in a secret resource path.
const MIN_PATH_SEGMENTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key pattern is incorrect: {0:?}")]
    MalformedPath(String),

    #[error("invalid secret key {key:?}: length {len} is outside 1..={max}", max = MAX_KEY_LEN)]
    InvalidLength { key: String, len: usize },
}

/// Return the last segment of a fully-qualified secret resource path.
pub fn extract_key(path: &str) -> Result<&str, KeyError> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < MIN_PATH_SEGMENTS {
        tracing::error!("key pattern is incorrect: {:?}", parts);
        return Err(KeyError::MalformedPath(path.to_string()));
    }
    Ok(parts[parts.len() - 1])
}

/// Reject keys that are empty or longer than [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> Result<&str, KeyError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(KeyError::InvalidLength {
            key: key.to_string(),
            len: key.len(),
        });
    }
    Ok(key)
}

/// Remove the first case-insensitive occurrence of `marker` from `key`.
pub fn strip_marker(key: &str, marker: &str) -> String {
    if marker.is_empty() {
        return key.to_string();
    }
    match find_ignore_case(key, marker) {
        Some(start) => {
            let mut stripped = String::with_capacity(key.len() - marker.len());
            stripped.push_str(&key[..start]);
            stripped.push_str(&key[start + marker.len()..]);
            stripped
        }
        None => key.to_string(),
    }
}

/// Lower-cased, marker-stripped form of `key` for ignore-list lookups.
pub fn normalize(key: &str, marker: &str) -> String {
    strip_marker(key, marker).to_lowercase()
}

/// Whether `key` contains `marker`, ignoring ASCII case.
pub fn has_marker(key: &str, marker: &str) -> bool {
    find_ignore_case(key, marker).is_some()
}

/// Extract, strip and validate the canonical key of a secret resource path.
pub fn canonical_key(path: &str, marker: &str) -> Result<String, KeyError> {
    let key = strip_marker(extract_key(path)?, marker);
    validate_key(&key)?;
    Ok(key)
}

// Byte offset of the first ASCII case-insensitive match on char boundaries.
fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    if pat.is_empty() || pat.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - pat.len())
        .filter(|&i| haystack.is_char_boundary(i) && haystack.is_char_boundary(i + pat.len()))
        .find(|&i| hay[i..i + pat.len()].eq_ignore_ascii_case(pat))
}
