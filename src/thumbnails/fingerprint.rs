use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::db::FileIdentity;

/// What a cached thumbnail was generated from. A cached entry is only valid
/// while the file still has the same modification time and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub identity: String,
    /// Milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub size_bytes: u64,
}

impl Fingerprint {
    pub fn new(identity: impl Into<String>, modified_ms: i64, size_bytes: u64) -> Self {
        Self {
            identity: identity.into(),
            modified_ms,
            size_bytes,
        }
    }

    /// Stat `path` and fingerprint its current state.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            identity: identity_of(path)?,
            modified_ms: modified.timestamp_millis(),
            size_bytes: metadata.len(),
        })
    }

    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.modified_ms == other.modified_ms && self.size_bytes == other.size_bytes
    }
}

/// Cache key for `path`: the same normalized absolute path the repository uses.
pub fn identity_of(path: &Path) -> io::Result<String> {
    let absolute = std::path::absolute(path)?;
    FileIdentity::from_path(absolute)
        .map(|id| id.as_str().to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_file_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"abc").unwrap();
        let first = Fingerprint::of_file(&path).unwrap();
        assert_eq!(first.size_bytes, 3);
        assert!(first.identity.ends_with("a.jpg"));

        std::fs::write(&path, b"abcdef").unwrap();
        let second = Fingerprint::of_file(&path).unwrap();
        assert!(!first.matches(&second));
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Fingerprint::of_file(&dir.path().join("gone.jpg")).is_err());
    }
}
