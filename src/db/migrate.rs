//! Backend-to-backend migration.
//!
//! Copies every record from a source store opened read-only into an empty
//! target, in path order and in batches, each batch in one target
//! transaction. The keyword and album vocabulary is copied first so that
//! orphan keywords and empty albums survive. Afterwards the per-table row
//! counts of both stores are compared; the target is only marked `complete`
//! when they match.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Instant;

use super::albums::AlbumLink;
use super::records::{SearchCriteria, TableCounts};
use super::{BackendDescriptor, FileRecord, Repository, RepositoryOptions};
use crate::error::{CountMismatch, StoreError, StoreResult};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// Copy started but was never verified. Such a store refuses normal use.
    Incomplete,
    Complete,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Incomplete => "incomplete",
            MigrationState::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(MigrationState::Incomplete),
            "complete" => Some(MigrationState::Complete),
            _ => None,
        }
    }
}

/// Sent after every committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub batch: usize,
    pub records_done: i64,
    pub records_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub source: String,
    pub target: String,
    pub batches: usize,
    pub records: i64,
    pub counts: TableCounts,
    pub elapsed_ms: u64,
}

pub struct Migrator {
    source: BackendDescriptor,
    target: BackendDescriptor,
    batch_size: usize,
    replace_target: bool,
    progress_tx: Option<Sender<MigrationProgress>>,
}

impl Migrator {
    pub fn new(source: BackendDescriptor, target: BackendDescriptor) -> Self {
        Self {
            source,
            target,
            batch_size: DEFAULT_BATCH_SIZE,
            replace_target: false,
            progress_tx: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Delete whatever the target holds before copying. The source is opened
    /// and locked first, so this can never remove the store being read.
    pub fn with_replace_target(mut self, replace: bool) -> Self {
        self.replace_target = replace;
        self
    }

    pub fn with_progress(mut self, tx: Sender<MigrationProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn run(&self) -> StoreResult<MigrationReport> {
        let started = Instant::now();
        if resolve_location(&self.source.location) == resolve_location(&self.target.location) {
            return Err(StoreError::unavailable(
                &self.target.location,
                "source and target are the same store",
            ));
        }

        tracing::info!(source = %self.source, target = %self.target, batch_size = self.batch_size, "Starting migration");

        let source = Repository::open_read_only(&self.source, RepositoryOptions::default())?;
        if self.replace_target {
            tracing::warn!(target = %self.target, "Removing existing target store");
            self.target.driver().remove_storage(&self.target.location)?;
        }
        let target = Repository::open_migration_target(&self.target)?;

        if target.migration_state()? == Some(MigrationState::Complete) || !target.table_counts()?.is_empty() {
            return Err(StoreError::unavailable(
                &self.target.location,
                "target store is not empty",
            ));
        }
        target.set_migration_state(MigrationState::Incomplete)?;

        copy_vocabulary(&source, &target)?;

        let total = source.count_files()?;
        let mut cursor = source.search(SearchCriteria::all()).with_page_size(self.batch_size);
        let mut batches = 0;
        let mut done: i64 = 0;

        loop {
            let mut batch: Vec<FileRecord> = Vec::with_capacity(self.batch_size);
            for record in cursor.by_ref().take(self.batch_size) {
                batch.push(record?);
            }
            if batch.is_empty() {
                break;
            }

            let paths: Vec<String> = batch.iter().map(|r| r.path.clone()).collect();
            let links = source.album_links(&paths)?;
            copy_batch(&target, &batch, &links)?;

            batches += 1;
            done += batch.len() as i64;
            tracing::info!(batch = batches, records = done, total, "Migrated batch");
            if let Some(ref tx) = self.progress_tx {
                let _ = tx.send(MigrationProgress {
                    batch: batches,
                    records_done: done,
                    records_total: total,
                });
            }
        }

        let source_counts = source.table_counts()?;
        let target_counts = target.table_counts()?;
        if let Err(e) = verify_counts(&source_counts, &target_counts) {
            tracing::error!(error = %e, target = %self.target, "Migration verification failed; target left incomplete");
            return Err(e);
        }

        target.set_migration_state(MigrationState::Complete)?;

        let report = MigrationReport {
            source: self.source.to_string(),
            target: self.target.to_string(),
            batches,
            records: done,
            counts: target_counts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(records = done, batches, elapsed_ms = report.elapsed_ms, "Migration complete");
        Ok(report)
    }
}

/// Location with symlinks and `.`/`..` resolved, so two spellings of one
/// store compare equal. A missing store resolves through its parent.
fn resolve_location(location: &Path) -> PathBuf {
    if let Ok(path) = location.canonicalize() {
        return path;
    }
    let absolute = std::path::absolute(location).unwrap_or_else(|_| location.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Keywords and albums, including ones with no file links.
fn copy_vocabulary(source: &Repository, target: &Repository) -> StoreResult<()> {
    let keywords = source.keywords()?;
    let albums = source.albums()?;
    target.write(|w| {
        for keyword in &keywords {
            w.ensure_keyword(keyword)?;
        }
        for album in &albums {
            w.create_album(&album.name, &album.created_at)?;
        }
        Ok(())
    })?;
    tracing::debug!(keywords = keywords.len(), albums = albums.len(), "Copied vocabulary");
    Ok(())
}

/// One target transaction: records with their keywords, then album links
/// at their source positions.
fn copy_batch(target: &Repository, batch: &[FileRecord], links: &[AlbumLink]) -> StoreResult<()> {
    target.write(|w| {
        for record in batch {
            let mut record = record.clone();
            record.albums.clear();
            w.upsert_file_record(&record)?;
        }
        for link in links {
            w.insert_album_link(link)?;
        }
        Ok(())
    })
}

pub fn verify_counts(source: &TableCounts, target: &TableCounts) -> StoreResult<()> {
    let mismatches: Vec<CountMismatch> = source
        .as_pairs()
        .iter()
        .zip(target.as_pairs().iter())
        .filter(|((_, s), (_, t))| s != t)
        .map(|((table, s), (_, t))| CountMismatch {
            table: *table,
            source: *s,
            target: *t,
        })
        .collect();
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(StoreError::MigrationIntegrity { mismatches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BackendKind;

    #[test]
    fn test_verify_counts_reports_each_table() {
        let source = TableCounts {
            files: 3,
            keywords: 2,
            file_keywords: 4,
            albums: 1,
            album_files: 2,
        };
        assert!(verify_counts(&source, &source).is_ok());

        let target = TableCounts {
            keywords: 1,
            file_keywords: 3,
            ..source
        };
        match verify_counts(&source, &target) {
            Err(StoreError::MigrationIntegrity { mismatches }) => {
                let tables: Vec<_> = mismatches.iter().map(|m| m.table).collect();
                assert_eq!(tables, vec!["keywords", "file_keywords"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_case_variant_keywords_fail_verification() {
        let dir = tempfile::tempdir().unwrap();
        let source = BackendDescriptor::new(BackendKind::Script, dir.path().join("legacy"));
        let target = BackendDescriptor::sqlite(dir.path().join("catalog.db"));
        {
            let repo = Repository::open(&source, RepositoryOptions::default()).unwrap();
            repo.upsert_file_record(&FileRecord::new("/a.jpg").with_keyword("sunset"))
                .unwrap();
            // a legacy row that differs only by case
            repo.write(|w| {
                w.conn.execute("INSERT INTO keywords (id, name) VALUES (100, 'Sunset')", [])?;
                w.conn.execute("INSERT INTO file_keywords (file_id, keyword_id) VALUES (1, 100)", [])?;
                Ok(())
            })
            .unwrap();
        }

        let err = Migrator::new(source, target.clone()).run().unwrap_err();
        assert!(matches!(err, StoreError::MigrationIntegrity { .. }));

        let reopened = Repository::open(&target, RepositoryOptions::default());
        assert!(reopened.is_err(), "unverified target must not open");
    }

    #[test]
    fn test_same_store_is_refused() {
        let desc = BackendDescriptor::sqlite("/tmp/does-not-matter.db");
        let err = Migrator::new(desc.clone(), desc).run().unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable { .. }));
    }

    #[test]
    fn test_same_store_spelled_differently_survives_replace() {
        let dir = tempfile::tempdir().unwrap();
        let source = BackendDescriptor::sqlite(dir.path().join("catalog.db"));
        {
            let repo = Repository::open(&source, RepositoryOptions::default()).unwrap();
            repo.upsert_file_record(&FileRecord::new("/a.jpg")).unwrap();
        }
        let target = BackendDescriptor::sqlite(dir.path().join("sub").join("..").join("catalog.db"));
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let err = Migrator::new(source.clone(), target)
            .with_replace_target(true)
            .run()
            .unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable { .. }));

        let repo = Repository::open(&source, RepositoryOptions::default()).unwrap();
        assert_eq!(repo.count_files().unwrap(), 1);
    }

    #[test]
    fn test_resolve_location_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let spelled = dir.path().join(".").join("new.db");
        assert_eq!(resolve_location(&spelled), dir.path().canonicalize().unwrap().join("new.db"));
    }

    #[test]
    fn test_replace_target_clears_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let source = BackendDescriptor::sqlite(dir.path().join("source.db"));
        let target = BackendDescriptor::sqlite(dir.path().join("target.db"));
        for (desc, path) in [(&source, "/a.jpg"), (&target, "/stale.jpg")] {
            let repo = Repository::open(desc, RepositoryOptions::default()).unwrap();
            repo.upsert_file_record(&FileRecord::new(path)).unwrap();
        }

        let report = Migrator::new(source, target.clone())
            .with_replace_target(true)
            .run()
            .unwrap();
        assert_eq!(report.records, 1);

        let repo = Repository::open(&target, RepositoryOptions::default()).unwrap();
        assert!(repo.find_by_path("/stale.jpg").unwrap().is_none());
        assert!(repo.find_by_path("/a.jpg").unwrap().is_some());
    }
}
