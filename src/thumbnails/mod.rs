//! Persistent, size-bounded thumbnail cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.db                     SQLite index (WAL)
//! blobs/ab/<sha256>.thumb      thumbnail bytes, one file per identity
//! ```
//!
//! The cache never fails its caller. Lookups that cannot be served are
//! misses; stores that cannot be written report [`CacheWrite::Degraded`].
//! After repeated write failures the cache flags itself degraded and keeps
//! serving whatever it still can.
//!
//! Locking: a per-identity mutex serializes work on one file, and is always
//! taken before the index mutex. Eviction picks victims under the index lock,
//! releases it, then takes each victim's identity lock before deleting.

mod fingerprint;
mod index;

pub use fingerprint::{identity_of, Fingerprint};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ThumbnailConfig;
use index::{CacheIndex, IndexEntry};

const INDEX_FILE: &str = "index.db";
const BLOB_DIR: &str = "blobs";
const BLOB_EXT: &str = "thumb";

/// Consecutive failed writes before the cache reports itself degraded.
const DEGRADE_AFTER: u32 = 3;

/// Victims fetched per eviction round.
const EVICTION_BATCH: usize = 64;

/// Identity locks kept before idle ones are dropped.
const LOCK_MAP_SOFT_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A cached thumbnail with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailCacheEntry {
    pub fingerprint: Fingerprint,
    pub thumbnail: Thumbnail,
    pub generated_at: DateTime<Utc>,
    pub generation: u64,
    pub access: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    /// Not stored; the caller keeps working without the cache.
    Degraded(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub root: PathBuf,
    pub entries: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub degraded: bool,
}

pub struct ThumbnailCache {
    root: PathBuf,
    blob_dir: PathBuf,
    /// `None` when the index could not be opened; every call is then a miss.
    index: Mutex<Option<CacheIndex>>,
    max_bytes: u64,
    tick: AtomicU64,
    identity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    write_failures: AtomicU32,
    degraded: AtomicBool,
}

impl ThumbnailCache {
    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::open(&config.path, config.max_size_bytes)
    }

    /// Open or create the cache at `root`. Never fails; an unusable root
    /// yields a cache that is degraded from the start.
    pub fn open(root: &Path, max_bytes: u64) -> Self {
        let blob_dir = root.join(BLOB_DIR);
        let index = match fs::create_dir_all(&blob_dir)
            .map_err(|e| e.to_string())
            .and_then(|_| CacheIndex::open(&root.join(INDEX_FILE)).map_err(|e| e.to_string()))
        {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Thumbnail cache unavailable, running degraded");
                None
            }
        };

        let start_tick = index
            .as_ref()
            .and_then(|index| index.max_tick().ok())
            .unwrap_or(0);
        let degraded = index.is_none();

        tracing::debug!(root = %root.display(), max_bytes, "Thumbnail cache opened");
        Self {
            root: root.to_path_buf(),
            blob_dir,
            index: Mutex::new(index),
            max_bytes,
            tick: AtomicU64::new(start_tick),
            identity_locks: Mutex::new(HashMap::new()),
            write_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(degraded),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_index(&self) -> MutexGuard<'_, Option<CacheIndex>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn identity_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.identity_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > LOCK_MAP_SOFT_LIMIT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }

    fn blob_path(&self, identity: &str) -> PathBuf {
        let digest = hex_digest(identity);
        self.blob_dir
            .join(&digest[..2])
            .join(format!("{}.{}", digest, BLOB_EXT))
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Cached thumbnail for `path`, if present and still matching the file.
    pub fn get(&self, path: &Path) -> Option<Thumbnail> {
        self.get_entry(path).map(|entry| entry.thumbnail)
    }

    /// Like [`get`](Self::get), with the entry's bookkeeping.
    pub fn get_entry(&self, path: &Path) -> Option<ThumbnailCacheEntry> {
        let current = match Fingerprint::of_file(path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Thumbnail miss: cannot stat file");
                return None;
            }
        };

        let lock = self.identity_lock(&current.identity);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let stored = {
            let index = self.lock_index();
            let index = index.as_ref()?;
            match index.lookup(&current.identity) {
                Ok(entry) => entry?,
                Err(e) => {
                    tracing::warn!(identity = %current.identity, error = %e, "Thumbnail index lookup failed");
                    return None;
                }
            }
        };

        if !stored.fingerprint.matches(&current) {
            tracing::debug!(identity = %current.identity, "Thumbnail stale: file changed");
            return None;
        }

        let bytes = match fs::read(self.blob_path(&current.identity)) {
            Ok(bytes) if bytes.len() as u64 == stored.blob_len => bytes,
            Ok(_) => {
                tracing::warn!(identity = %current.identity, "Thumbnail blob has unexpected length");
                return None;
            }
            Err(e) => {
                tracing::warn!(identity = %current.identity, error = %e, "Thumbnail blob unreadable");
                return None;
            }
        };

        let access = self.next_tick();
        if let Some(index) = self.lock_index().as_ref() {
            if let Err(e) = index.touch(&current.identity, access) {
                tracing::debug!(identity = %current.identity, error = %e, "Failed to record thumbnail access");
            }
        }

        let generated_at = DateTime::parse_from_rfc3339(&stored.generated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        Some(ThumbnailCacheEntry {
            fingerprint: stored.fingerprint,
            thumbnail: Thumbnail {
                bytes,
                width: stored.width,
                height: stored.height,
            },
            generated_at,
            generation: stored.generation,
            access,
        })
    }

    // ========================================================================
    // Store
    // ========================================================================

    /// Store `thumbnail` for the file described by `fingerprint`, replacing any
    /// previous entry, then evict until the cache is within its size bound.
    pub fn put(&self, fingerprint: &Fingerprint, thumbnail: &Thumbnail) -> CacheWrite {
        // same key `get` derives from the live path
        let identity = match identity_of(Path::new(&fingerprint.identity)) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!(identity = %fingerprint.identity, error = %e, "Thumbnail not stored: bad identity");
                return CacheWrite::Degraded(format!("invalid identity {}: {}", fingerprint.identity, e));
            }
        };
        let fingerprint = Fingerprint {
            identity,
            ..fingerprint.clone()
        };

        {
            let lock = self.identity_lock(&fingerprint.identity);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = self.store(&fingerprint, thumbnail) {
                return self.record_write_failure(&fingerprint.identity, e);
            }
        }

        if self.write_failures.swap(0, Ordering::SeqCst) >= DEGRADE_AFTER && self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(root = %self.root.display(), "Thumbnail cache recovered");
        }
        self.enforce_bound();
        CacheWrite::Stored
    }

    fn store(&self, fingerprint: &Fingerprint, thumbnail: &Thumbnail) -> Result<()> {
        let blob_path = self.blob_path(&fingerprint.identity);
        let parent = blob_path
            .parent()
            .ok_or_else(|| anyhow!("blob path has no parent"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        staged.write_all(&thumbnail.bytes)?;
        staged.flush()?;
        staged
            .persist(&blob_path)
            .with_context(|| format!("Failed to write {}", blob_path.display()))?;

        let tick = self.next_tick();
        let entry = IndexEntry {
            fingerprint: fingerprint.clone(),
            width: thumbnail.width,
            height: thumbnail.height,
            blob_len: thumbnail.bytes.len() as u64,
            generated_at: Utc::now().to_rfc3339(),
            generation: tick,
            access: tick,
        };

        let index = self.lock_index();
        let index = index.as_ref().ok_or_else(|| anyhow!("thumbnail index unavailable"))?;
        index.upsert(&entry).context("Failed to update thumbnail index")
    }

    fn record_write_failure(&self, identity: &str, error: anyhow::Error) -> CacheWrite {
        let failures = self.write_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(identity, error = %format!("{:#}", error), failures, "Failed to store thumbnail");
        if failures >= DEGRADE_AFTER && !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                root = %self.root.display(),
                failures,
                "Thumbnail cache degraded after repeated write failures"
            );
        }
        CacheWrite::Degraded(format!("{:#}", error))
    }

    /// Evict least recently used entries until the total is within bounds.
    fn enforce_bound(&self) {
        loop {
            let (mut total, victims) = {
                let index = self.lock_index();
                let Some(index) = index.as_ref() else {
                    return;
                };
                let total = match index.total_size() {
                    Ok(total) => total,
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot size thumbnail cache");
                        return;
                    }
                };
                if total <= self.max_bytes {
                    return;
                }
                match index.eviction_candidates(EVICTION_BATCH) {
                    Ok(victims) => (total, victims),
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot select thumbnails to evict");
                        return;
                    }
                }
            };
            if victims.is_empty() {
                return;
            }

            let mut evicted = 0;
            for victim in victims {
                if total <= self.max_bytes {
                    break;
                }
                let lock = self.identity_lock(&victim.identity);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let removed = match self.lock_index().as_ref().map(|index| index.remove_generation(&victim)) {
                    Some(Ok(removed)) => removed,
                    Some(Err(e)) => {
                        tracing::warn!(identity = %victim.identity, error = %e, "Eviction failed");
                        return;
                    }
                    None => return,
                };
                if let Some(blob_len) = removed {
                    remove_blob(&self.blob_path(&victim.identity));
                    total = total.saturating_sub(blob_len);
                    evicted += 1;
                    tracing::debug!(identity = %victim.identity, "Evicted thumbnail");
                }
            }
            if evicted == 0 {
                // every candidate was replaced concurrently; re-read the index
                continue;
            }
            if total <= self.max_bytes {
                return;
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop the entry for `path`. Returns whether one existed.
    pub fn remove(&self, path: &Path) -> bool {
        let Ok(identity) = identity_of(path) else {
            return false;
        };
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let removed = match self.lock_index().as_ref().map(|index| index.remove(&identity)) {
            Some(Ok(removed)) => removed,
            Some(Err(e)) => {
                tracing::warn!(identity = %identity, error = %e, "Failed to remove thumbnail");
                return false;
            }
            None => return false,
        };
        remove_blob(&self.blob_path(&identity));
        removed
    }

    /// Move the entry for `from` to `to` after the file was renamed. The
    /// fingerprint is kept, so the entry stays valid as long as the moved
    /// file is unchanged.
    pub fn rename(&self, from: &Path, to: &Path) -> bool {
        let (Ok(from), Ok(to)) = (identity_of(from), identity_of(to)) else {
            return false;
        };
        if from == to {
            return true;
        }

        // fixed order so two opposite renames cannot deadlock
        let (first, second) = if from < to { (&from, &to) } else { (&to, &from) };
        let first_lock = self.identity_lock(first);
        let _first = first_lock.lock().unwrap_or_else(|e| e.into_inner());
        let second_lock = self.identity_lock(second);
        let _second = second_lock.lock().unwrap_or_else(|e| e.into_inner());

        let from_blob = self.blob_path(&from);
        let to_blob = self.blob_path(&to);
        let moved = to_blob
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::rename(&from_blob, &to_blob));
        if let Err(e) = moved {
            tracing::debug!(from = %from, to = %to, error = %e, "Thumbnail blob not moved");
            if let Some(index) = self.lock_index().as_ref() {
                let _ = index.remove(&from);
            }
            return false;
        }

        match self.lock_index().as_ref().map(|index| index.rename(&from, &to)) {
            Some(Ok(renamed)) => renamed,
            Some(Err(e)) => {
                tracing::warn!(from = %from, to = %to, error = %e, "Failed to rename thumbnail entry");
                false
            }
            None => false,
        }
    }

    /// Identities with a cached entry, sorted.
    pub fn identities(&self) -> Vec<String> {
        match self.lock_index().as_ref().map(|index| index.identities()) {
            Some(Ok(identities)) => identities,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to list thumbnail identities");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Reclaim index space and delete blob files no entry refers to.
    /// Returns how many files were removed. Meant for idle periods: a blob
    /// staged by a concurrent `put` counts as unreferenced.
    pub fn compact(&self) -> Result<usize> {
        let expected: HashSet<PathBuf> = self
            .identities()
            .iter()
            .map(|identity| self.blob_path(identity))
            .collect();

        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&self.blob_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if !expected.contains(entry.path()) {
                fs::remove_file(entry.path())
                    .with_context(|| format!("Failed to delete {}", entry.path().display()))?;
                removed += 1;
            }
        }

        let index = self.lock_index();
        let index = index.as_ref().ok_or_else(|| anyhow!("thumbnail index unavailable"))?;
        index.vacuum().context("Failed to vacuum thumbnail index")?;

        tracing::info!(removed, "Thumbnail cache compacted");
        Ok(removed)
    }

    /// Remove every entry and blob.
    pub fn clear(&self) -> Result<()> {
        let index = self.lock_index();
        if let Some(index) = index.as_ref() {
            index.clear().context("Failed to clear thumbnail index")?;
        }
        match fs::remove_dir_all(&self.blob_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.blob_dir)?;
        tracing::info!(root = %self.root.display(), "Thumbnail cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = match self.lock_index().as_ref() {
            Some(index) => (
                index.count().unwrap_or(0),
                index.total_size().unwrap_or(0),
            ),
            None => (0, 0),
        };
        CacheStats {
            root: self.root.clone(),
            entries,
            total_bytes,
            max_bytes: self.max_bytes,
            degraded: self.is_degraded(),
        }
    }
}

fn hex_digest(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn remove_blob(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(blob = %path.display(), error = %e, "Failed to delete thumbnail blob"),
    }
}
