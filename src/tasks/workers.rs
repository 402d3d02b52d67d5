//! Async wrappers over the repository and the thumbnail cache.

use std::path::PathBuf;
use std::sync::Arc;

use super::CancelFlag;
use crate::db::{FileRecord, Repository, SearchCriteria};
use crate::error::{StoreError, StoreResult};
use crate::thumbnails::{CacheWrite, Fingerprint, Thumbnail, ThumbnailCache};

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(format!("worker task failed: {}", e)))
}

/// Records collected by a background search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub records: Vec<FileRecord>,
    /// The flag was raised before the results ran out.
    pub cancelled: bool,
}

/// Result of importing many records, one transaction each.
#[derive(Debug, Default)]
pub struct BatchImport {
    pub saved: usize,
    pub failures: Vec<(String, StoreError)>,
}

/// Runs repository operations on the blocking pool.
#[derive(Clone)]
pub struct RepositoryWorker {
    repo: Arc<Repository>,
}

impl RepositoryWorker {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Repository) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(join_error)?
    }

    pub async fn upsert(&self, record: FileRecord) -> StoreResult<()> {
        self.run(move |repo| repo.upsert_file_record(&record)).await
    }

    /// Save each record in its own transaction. A failing record is reported
    /// and skipped; the rest still land.
    pub async fn import(&self, records: Vec<FileRecord>, cancel: CancelFlag) -> StoreResult<BatchImport> {
        self.run(move |repo| {
            let mut outcome = BatchImport::default();
            for record in records {
                if cancel.is_cancelled() {
                    break;
                }
                match repo.upsert_file_record(&record) {
                    Ok(()) => outcome.saved += 1,
                    Err(e) => {
                        tracing::warn!(path = %record.path, error = %e, "Failed to save record");
                        outcome.failures.push((record.path, e));
                    }
                }
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn find_by_path(&self, path: PathBuf) -> StoreResult<Option<FileRecord>> {
        self.run(move |repo| repo.find_by_path(path)).await
    }

    pub async fn delete(&self, path: PathBuf) -> StoreResult<bool> {
        self.run(move |repo| repo.delete_file_record(path)).await
    }

    pub async fn rename(&self, old: PathBuf, new: PathBuf) -> StoreResult<bool> {
        self.run(move |repo| repo.rename_file_identity(old, new)).await
    }

    /// Collect all matches, stopping early when `cancel` is raised.
    pub async fn search(&self, criteria: SearchCriteria, cancel: CancelFlag) -> StoreResult<SearchOutcome> {
        self.run(move |repo| {
            let mut outcome = SearchOutcome::default();
            for record in repo.search(criteria).with_cancel(cancel.clone()) {
                outcome.records.push(record?);
            }
            outcome.cancelled = cancel.is_cancelled();
            Ok(outcome)
        })
        .await
    }
}

/// Runs thumbnail cache operations on the blocking pool.
#[derive(Clone)]
pub struct CacheWorker {
    cache: Arc<ThumbnailCache>,
}

impl CacheWorker {
    pub fn new(cache: Arc<ThumbnailCache>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, path: PathBuf) -> Option<Thumbnail> {
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.get(&path)).await {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                tracing::warn!(error = %e, "Thumbnail lookup task failed");
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: Fingerprint, thumbnail: Thumbnail) -> CacheWrite {
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.put(&fingerprint, &thumbnail)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Thumbnail store task failed");
                CacheWrite::Degraded(e.to_string())
            }
        }
    }
}
