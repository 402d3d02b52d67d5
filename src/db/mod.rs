mod schema;
mod script_schema;
pub mod albums;
pub mod driver;
pub mod migrate;
pub mod records;
pub mod script;
pub mod search;
pub mod sqlite;

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use driver::{BackendDescriptor, BackendKind, ConnectionHandle, OpenMode, CURRENT_SCHEMA_VERSION};
pub use migrate::{MigrationProgress, MigrationReport, MigrationState, Migrator};
pub use records::{Album, FileIdentity, FileRecord, SearchCriteria, TableCounts};
pub use search::SearchCursor;

use crate::config::RepositoryConfig;
use crate::error::{StoreError, StoreResult};
use driver::{count_rows, Dialect};
use records::{normalize_keyword, parse_timestamp, TIMESTAMP_FORMAT};

/// Key of the migration marker in `store_properties`.
pub(crate) const MIGRATION_STATE_KEY: &str = "migration_state";

/// Behaviour switches that do not depend on the backend.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Delete keywords that lose their last file link.
    pub prune_orphan_keywords: bool,
    /// Records fetched per transaction while iterating search results.
    pub search_page_size: usize,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            prune_orphan_keywords: false,
            search_page_size: 200,
        }
    }
}

impl From<&RepositoryConfig> for RepositoryOptions {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            prune_orphan_keywords: config.prune_orphan_keywords,
            search_page_size: config.search_page_size.max(1),
        }
    }
}

/// Metadata repository over one backend.
///
/// All access is serialized through one connection; every operation runs in
/// its own transaction unless batched through [`Repository::write`].
pub struct Repository {
    handle: Mutex<ConnectionHandle>,
    descriptor: BackendDescriptor,
    options: RepositoryOptions,
}

impl Repository {
    /// Open the store read-write, creating and upgrading the schema as needed.
    pub fn open(descriptor: &BackendDescriptor, options: RepositoryOptions) -> StoreResult<Self> {
        Self::open_with(descriptor, options, OpenMode::ReadWrite, false)
    }

    /// Open an existing store without ever writing to it.
    pub fn open_read_only(descriptor: &BackendDescriptor, options: RepositoryOptions) -> StoreResult<Self> {
        Self::open_with(descriptor, options, OpenMode::ReadOnly, false)
    }

    /// Open a migration target, which may carry an `incomplete` marker.
    pub(crate) fn open_migration_target(descriptor: &BackendDescriptor) -> StoreResult<Self> {
        let options = RepositoryOptions {
            prune_orphan_keywords: false,
            ..Default::default()
        };
        Self::open_with(descriptor, options, OpenMode::ReadWrite, true)
    }

    fn open_with(
        descriptor: &BackendDescriptor,
        options: RepositoryOptions,
        mode: OpenMode,
        allow_incomplete: bool,
    ) -> StoreResult<Self> {
        let mut handle = descriptor.driver().open(&descriptor.location, mode)?;
        let version = handle.migrate_schema()?;

        let repo = Self {
            handle: Mutex::new(handle),
            descriptor: descriptor.clone(),
            options,
        };

        if !allow_incomplete && repo.migration_state()? == Some(MigrationState::Incomplete) {
            return Err(StoreError::unavailable(
                &descriptor.location,
                "store is an unfinished migration target",
            ));
        }

        tracing::info!(
            backend = %descriptor.kind,
            location = %descriptor.location.display(),
            ?mode,
            version,
            "Repository opened"
        );
        Ok(repo)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn schema_version(&self) -> StoreResult<u32> {
        self.lock().schema_version()
    }

    /// Run `f` in one write transaction. Commits if `f` returns `Ok`,
    /// rolls back otherwise.
    pub fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut RecordWriter<'_>) -> StoreResult<T>,
    {
        let mut handle = self.lock();
        let tx = handle.begin_transaction()?;
        let result = {
            let mut writer = RecordWriter {
                conn: tx.conn(),
                dialect: tx.dialect(),
                options: &self.options,
            };
            f(&mut writer)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let mut handle = self.lock();
        let tx = handle.begin_read()?;
        let value = f(tx.conn())?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================================================
    // File records
    // ========================================================================

    /// Insert or replace the record for `record.path`, reconciling its
    /// keyword and album links.
    pub fn upsert_file_record(&self, record: &FileRecord) -> StoreResult<()> {
        self.write(|w| w.upsert_file_record(record).map(|_| ()))
    }

    pub fn find_by_path(&self, path: impl AsRef<Path>) -> StoreResult<Option<FileRecord>> {
        let identity = FileIdentity::from_path(path)?;
        self.read(|conn| load_record_by_path(conn, identity.as_str()))
    }

    /// Lazily iterate records matching `criteria`, ordered by path.
    pub fn search(&self, criteria: SearchCriteria) -> SearchCursor<'_> {
        SearchCursor::new(self, criteria, self.options.search_page_size)
    }

    /// Delete the record and its links. Returns `false` if none existed.
    pub fn delete_file_record(&self, path: impl AsRef<Path>) -> StoreResult<bool> {
        self.write(|w| w.delete_file_record(path))
    }

    /// Re-key a record after a file move. Returns `false` if `old` is not
    /// tracked; fails with `Conflict` if `new` already is.
    pub fn rename_file_identity(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> StoreResult<bool> {
        self.write(|w| w.rename_file_identity(old, new))
    }

    pub fn count_files(&self) -> StoreResult<i64> {
        self.read(|conn| Ok(count_rows(conn, "files")?))
    }

    pub fn table_counts(&self) -> StoreResult<TableCounts> {
        self.read(|conn| Ok(table_counts(conn)?))
    }

    // ========================================================================
    // Keywords
    // ========================================================================

    /// All keyword names, sorted.
    pub fn keywords(&self) -> StoreResult<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM keywords ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    /// Delete every keyword with no file link. Returns how many were removed.
    pub fn prune_orphan_keywords(&self) -> StoreResult<usize> {
        let removed = self.write(|w| {
            Ok(w.conn.execute(
                "DELETE FROM keywords WHERE id NOT IN (SELECT keyword_id FROM file_keywords)",
                [],
            )?)
        })?;
        if removed > 0 {
            tracing::info!(removed, "Pruned orphan keywords");
        }
        Ok(removed)
    }

    // ========================================================================
    // Store properties
    // ========================================================================

    pub fn migration_state(&self) -> StoreResult<Option<MigrationState>> {
        let value = self.read(|conn| read_property(conn, MIGRATION_STATE_KEY))?;
        Ok(value.as_deref().and_then(MigrationState::from_str))
    }

    pub(crate) fn set_migration_state(&self, state: MigrationState) -> StoreResult<()> {
        self.write(|w| w.set_property(MIGRATION_STATE_KEY, state.as_str()))
    }
}

/// Write access inside one [`Repository::write`] transaction.
pub struct RecordWriter<'a> {
    pub(crate) conn: &'a Connection,
    dialect: &'static dyn Dialect,
    options: &'a RepositoryOptions,
}

impl RecordWriter<'_> {
    /// Returns the row id of the stored record.
    pub fn upsert_file_record(&mut self, record: &FileRecord) -> StoreResult<i64> {
        let record = record.normalized()?;
        let file_id = self.dialect.upsert_file(self.conn, &record)?;
        self.reconcile_keywords(file_id, &record.keywords)?;
        self.reconcile_albums(file_id, &record.albums)?;
        tracing::trace!(path = %record.path, file_id, "Upserted file record");
        Ok(file_id)
    }

    pub fn delete_file_record(&mut self, path: impl AsRef<Path>) -> StoreResult<bool> {
        let identity = FileIdentity::from_path(path)?;
        let Some(file_id) = file_id(self.conn, identity.as_str())? else {
            return Ok(false);
        };

        let keyword_ids = linked_keyword_ids(self.conn, file_id)?;
        self.conn
            .execute("DELETE FROM file_keywords WHERE file_id = ?1", [file_id])?;
        self.conn
            .execute("DELETE FROM album_files WHERE file_id = ?1", [file_id])?;
        self.conn.execute("DELETE FROM files WHERE id = ?1", [file_id])?;
        self.prune_keywords(&keyword_ids)?;

        tracing::debug!(path = %identity, "Deleted file record");
        Ok(true)
    }

    pub fn rename_file_identity(&mut self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> StoreResult<bool> {
        let old = FileIdentity::from_path(old)?;
        let new = FileIdentity::from_path(new)?;
        if old == new {
            return Ok(file_id(self.conn, old.as_str())?.is_some());
        }
        if file_id(self.conn, new.as_str())?.is_some() {
            return Err(StoreError::Conflict {
                path: new.as_str().to_string(),
            });
        }
        let changed = self.conn.execute(
            "UPDATE files SET path = ?2 WHERE path = ?1",
            params![old.as_str(), new.as_str()],
        )?;
        if changed > 0 {
            tracing::debug!(from = %old, to = %new, "Renamed file identity");
        }
        Ok(changed > 0)
    }

    /// Id of keyword `name` (normalized), creating it if missing.
    pub fn ensure_keyword(&mut self, name: &str) -> StoreResult<i64> {
        let name = normalize_keyword(name).ok_or_else(|| StoreError::invalid("empty keyword"))?;
        Ok(self.dialect.ensure_keyword(self.conn, &name)?)
    }

    pub(crate) fn set_property(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM store_properties WHERE key = ?1", [key])?;
        self.conn.execute(
            "INSERT INTO store_properties (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn reconcile_keywords(&mut self, file_id: i64, desired: &BTreeSet<String>) -> StoreResult<()> {
        let current = linked_keywords(self.conn, file_id)?;

        let mut removed = Vec::new();
        for (keyword_id, name) in &current {
            if !desired.contains(name) {
                self.conn.execute(
                    "DELETE FROM file_keywords WHERE file_id = ?1 AND keyword_id = ?2",
                    params![file_id, keyword_id],
                )?;
                removed.push(*keyword_id);
            }
        }

        for name in desired {
            if current.iter().any(|(_, existing)| existing == name) {
                continue;
            }
            let keyword_id = self.dialect.ensure_keyword(self.conn, name)?;
            self.conn.execute(
                "INSERT INTO file_keywords (file_id, keyword_id) VALUES (?1, ?2)",
                params![file_id, keyword_id],
            )?;
        }

        self.prune_keywords(&removed)?;
        Ok(())
    }

    fn reconcile_albums(&mut self, file_id: i64, desired: &BTreeSet<String>) -> StoreResult<()> {
        let current = albums::linked_albums(self.conn, file_id)?;

        for (album_id, name) in &current {
            if !desired.contains(name) {
                self.conn.execute(
                    "DELETE FROM album_files WHERE album_id = ?1 AND file_id = ?2",
                    params![album_id, file_id],
                )?;
            }
        }

        for name in desired {
            if current.iter().any(|(_, existing)| existing == name) {
                continue;
            }
            let album_id = self.dialect.ensure_album(self.conn, name, &now_text())?;
            albums::append_member(self.conn, album_id, file_id)?;
        }
        Ok(())
    }

    /// Drop the given keywords if they no longer have links and pruning is on.
    fn prune_keywords(&mut self, keyword_ids: &[i64]) -> StoreResult<usize> {
        if !self.options.prune_orphan_keywords {
            return Ok(0);
        }
        let mut removed = 0;
        for keyword_id in keyword_ids {
            removed += self.conn.execute(
                "DELETE FROM keywords WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM file_keywords WHERE keyword_id = ?1)",
                [keyword_id],
            )?;
        }
        Ok(removed)
    }
}

pub(crate) fn now_text() -> String {
    chrono::Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) const FILE_COLUMNS: &str = "f.id, f.path, f.size_bytes, f.modified_at, f.rating, f.title, \
     f.description, f.gps_latitude, f.gps_longitude, f.camera_make, f.camera_model, f.taken_at";

/// Map a row selected with [`FILE_COLUMNS`]. Links are loaded separately.
pub(crate) fn file_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, FileRecord)> {
    let taken_at: Option<String> = row.get(11)?;
    Ok((
        row.get(0)?,
        FileRecord {
            path: row.get(1)?,
            size_bytes: row.get(2)?,
            modified_at: row.get(3)?,
            rating: row.get(4)?,
            title: row.get(5)?,
            description: row.get(6)?,
            gps_latitude: row.get(7)?,
            gps_longitude: row.get(8)?,
            camera_make: row.get(9)?,
            camera_model: row.get(10)?,
            taken_at: taken_at.as_deref().and_then(parse_timestamp),
            keywords: BTreeSet::new(),
            albums: BTreeSet::new(),
        },
    ))
}

pub(crate) fn load_links(conn: &Connection, file_id: i64, record: &mut FileRecord) -> rusqlite::Result<()> {
    record.keywords = linked_keywords(conn, file_id)?
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    record.albums = albums::linked_albums(conn, file_id)?
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    Ok(())
}

fn load_record_by_path(conn: &Connection, path: &str) -> StoreResult<Option<FileRecord>> {
    let found = conn
        .query_row(
            &format!("SELECT {} FROM files f WHERE f.path = ?1", FILE_COLUMNS),
            [path],
            file_from_row,
        )
        .optional()?;
    match found {
        Some((file_id, mut record)) => {
            load_links(conn, file_id, &mut record)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub(crate) fn file_id(conn: &Connection, path: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM files WHERE path = ?1", [path], |row| row.get(0))
        .optional()
}

fn linked_keywords(conn: &Connection, file_id: i64) -> rusqlite::Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT k.id, k.name FROM file_keywords fk
         JOIN keywords k ON k.id = fk.keyword_id
         WHERE fk.file_id = ?1
         ORDER BY k.name",
    )?;
    let rows = stmt.query_map([file_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn linked_keyword_ids(conn: &Connection, file_id: i64) -> rusqlite::Result<Vec<i64>> {
    Ok(linked_keywords(conn, file_id)?
        .into_iter()
        .map(|(id, _)| id)
        .collect())
}

fn read_property(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM store_properties WHERE key = ?1", [key], |row| row.get(0))
        .optional()?)
}

pub(crate) fn table_counts(conn: &Connection) -> rusqlite::Result<TableCounts> {
    Ok(TableCounts {
        files: count_rows(conn, "files")?,
        keywords: count_rows(conn, "keywords")?,
        file_keywords: count_rows(conn, "file_keywords")?,
        albums: count_rows(conn, "albums")?,
        album_files: count_rows(conn, "album_files")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_repo(dir: &Path, kind: BackendKind, options: RepositoryOptions) -> Repository {
        let location = match kind {
            BackendKind::Sqlite => dir.join("catalog.db"),
            BackendKind::Script => dir.join("catalog"),
        };
        Repository::open(&BackendDescriptor::new(kind, location), options).unwrap()
    }

    #[test]
    fn test_keyword_links_are_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [BackendKind::Sqlite, BackendKind::Script] {
            let repo = open_repo(&dir.path().join(kind.as_str()), kind, RepositoryOptions::default());
            let record = FileRecord::new("/photos/a.jpg")
                .with_keyword("beach")
                .with_keyword("sunset");
            repo.upsert_file_record(&record).unwrap();

            let record = FileRecord::new("/photos/a.jpg")
                .with_keyword("sunset")
                .with_keyword("family");
            repo.upsert_file_record(&record).unwrap();

            let stored = repo.find_by_path("/photos/a.jpg").unwrap().unwrap();
            let keywords: Vec<_> = stored.keywords.into_iter().collect();
            assert_eq!(keywords, vec!["family", "sunset"], "{}", kind);

            // unpruned: "beach" stays in the vocabulary
            assert_eq!(repo.keywords().unwrap(), vec!["beach", "family", "sunset"]);
            assert_eq!(repo.table_counts().unwrap().file_keywords, 2);
        }
    }

    #[test]
    fn test_pruning_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let options = RepositoryOptions {
            prune_orphan_keywords: true,
            ..Default::default()
        };
        let repo = open_repo(dir.path(), BackendKind::Sqlite, options);
        repo.upsert_file_record(&FileRecord::new("/a.jpg").with_keyword("beach"))
            .unwrap();
        repo.upsert_file_record(&FileRecord::new("/a.jpg").with_keyword("city"))
            .unwrap();
        assert_eq!(repo.keywords().unwrap(), vec!["city"]);

        assert!(repo.delete_file_record("/a.jpg").unwrap());
        assert!(repo.keywords().unwrap().is_empty());
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(dir.path(), BackendKind::Script, RepositoryOptions::default());
        let result = repo.write(|w| {
            w.upsert_file_record(&FileRecord::new("/ok.jpg"))?;
            w.upsert_file_record(&FileRecord::new("/bad.jpg").with_rating(9))
        });
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
        assert_eq!(repo.count_files().unwrap(), 0);
    }

    #[test]
    fn test_rename_to_self_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(dir.path(), BackendKind::Sqlite, RepositoryOptions::default());
        repo.upsert_file_record(&FileRecord::new("/a.jpg")).unwrap();
        assert!(repo.rename_file_identity("/a.jpg", "/./a.jpg").unwrap());
        assert!(repo.find_by_path("/a.jpg").unwrap().is_some());
    }

    #[test]
    fn test_incomplete_store_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = BackendDescriptor::sqlite(dir.path().join("catalog.db"));
        {
            let repo = Repository::open(&descriptor, RepositoryOptions::default()).unwrap();
            repo.set_migration_state(MigrationState::Incomplete).unwrap();
        }
        let err = Repository::open(&descriptor, RepositoryOptions::default()).err().unwrap();
        assert!(matches!(err, StoreError::StorageUnavailable { .. }));
    }
}
