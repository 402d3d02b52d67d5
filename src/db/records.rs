//! Plain value types stored by the repository.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Timestamp format used for capture times and album creation times.
/// Lexicographic order matches chronological order, so range filters can
/// compare the stored text directly.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub const MAX_RATING: u8 = 5;

/// Stable key of a tracked file: an absolute, lexically normalized path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileIdentity(String);

impl FileIdentity {
    /// Normalize `path` without touching the filesystem: `.` components are
    /// dropped and `..` pops the previous component. Paths that are not valid
    /// UTF-8 are rejected rather than lossily converted, so two distinct files
    /// never share a key.
    pub fn from_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(StoreError::invalid(format!(
                "file identity must be an absolute path: {}",
                path.display()
            )));
        }
        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        let text = normalized.into_os_string().into_string().map_err(|raw| {
            StoreError::invalid(format!("file identity is not valid UTF-8: {}", raw.to_string_lossy()))
        })?;
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a keyword name: trimmed and lowercased.
pub fn normalize_keyword(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Metadata for one tracked file, as produced by the extraction layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size_bytes: i64,
    /// Milliseconds since the Unix epoch.
    pub modified_at: i64,
    pub rating: Option<u8>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub taken_at: Option<NaiveDateTime>,
    pub keywords: BTreeSet<String>,
    pub albums: BTreeSet<String>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keywords.insert(keyword.to_string());
        self
    }

    pub fn with_album(mut self, album: &str) -> Self {
        self.albums.insert(album.to_string());
        self
    }

    pub fn identity(&self) -> StoreResult<FileIdentity> {
        FileIdentity::from_path(&self.path)
    }

    /// Returns a copy with the key normalized and keywords case-folded.
    /// Rejects records the repository would not be able to store faithfully.
    pub fn normalized(&self) -> StoreResult<FileRecord> {
        let identity = self.identity()?;
        if let Some(rating) = self.rating {
            if rating > MAX_RATING {
                return Err(StoreError::invalid(format!(
                    "rating {} out of range 0..={} for {}",
                    rating, MAX_RATING, identity
                )));
            }
        }
        if self.size_bytes < 0 {
            return Err(StoreError::invalid(format!("negative size for {}", identity)));
        }

        let mut keywords = BTreeSet::new();
        for keyword in &self.keywords {
            let name = normalize_keyword(keyword)
                .ok_or_else(|| StoreError::invalid(format!("empty keyword on {}", identity)))?;
            keywords.insert(name);
        }

        let mut albums = BTreeSet::new();
        for album in &self.albums {
            let name = album.trim();
            if name.is_empty() {
                return Err(StoreError::invalid(format!("empty album name on {}", identity)));
            }
            albums.insert(name.to_string());
        }

        Ok(FileRecord {
            path: identity.as_str().to_string(),
            keywords,
            albums,
            ..self.clone()
        })
    }

    pub fn taken_at_text(&self) -> Option<String> {
        self.taken_at.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
    }
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

/// An album with its member count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub name: String,
    pub created_at: String,
    pub file_count: i64,
}

/// Conjunction of filters for [`crate::db::Repository::search`].
/// Empty criteria match every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    /// Every listed keyword must be attached to the record.
    pub keywords: Vec<String>,
    pub taken_from: Option<NaiveDateTime>,
    pub taken_to: Option<NaiveDateTime>,
    pub rating_min: Option<u8>,
    pub rating_max: Option<u8>,
    /// Case-insensitive substring match on title or description.
    pub text: Option<String>,
}

impl SearchCriteria {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keywords.push(keyword.to_string());
        self
    }

    pub fn with_rating_range(mut self, min: Option<u8>, max: Option<u8>) -> Self {
        self.rating_min = min;
        self.rating_max = max;
        self
    }

    pub fn with_taken_range(mut self, from: Option<NaiveDateTime>, to: Option<NaiveDateTime>) -> Self {
        self.taken_from = from;
        self.taken_to = to;
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }
}

/// Row counts of the data tables, compared after a migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub files: i64,
    pub keywords: i64,
    pub file_keywords: i64,
    pub albums: i64,
    pub album_files: i64,
}

impl TableCounts {
    pub fn as_pairs(&self) -> [(&'static str, i64); 5] {
        [
            ("files", self.files),
            ("keywords", self.keywords),
            ("file_keywords", self.file_keywords),
            ("albums", self.albums),
            ("album_files", self.album_files),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.as_pairs().iter().all(|(_, n)| *n == 0)
    }
}
