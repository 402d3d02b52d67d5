//! Backend driver abstraction.
//!
//! A [`Driver`] knows how to open one storage engine at a location and hands
//! back a [`ConnectionHandle`]. SQL differences between engines live behind
//! [`Dialect`]; how a commit is made durable lives behind [`Durability`].
//! The repository only ever talks to these three seams, so both engines share
//! every query that is not dialect specific.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::records::FileRecord;
use super::script::ScriptDriver;
use super::sqlite::SqliteDriver;
use crate::error::{StoreError, StoreResult};

/// Schema version written by this build. Version 1 holds the tables,
/// version 2 adds the rating/date indexes.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Oldest schema a read-only handle can query without upgrading.
pub const MIN_READABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-file SQLite database.
    Sqlite,
    /// HSQLDB-style directory store: an in-memory database persisted as a
    /// SQL script on every commit.
    #[serde(alias = "hsqldb")]
    Script,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Script => "script",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Some(BackendKind::Sqlite),
            "script" | "hsqldb" => Some(BackendKind::Script),
            _ => None,
        }
    }

    pub fn driver(&self) -> &'static dyn Driver {
        match self {
            BackendKind::Sqlite => &SqliteDriver,
            BackendKind::Script => &ScriptDriver,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine type plus storage location, written `kind:location`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub location: PathBuf,
}

impl BackendDescriptor {
    pub fn new(kind: BackendKind, location: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }

    pub fn sqlite(location: impl Into<PathBuf>) -> Self {
        Self::new(BackendKind::Sqlite, location)
    }

    pub fn script(location: impl Into<PathBuf>) -> Self {
        Self::new(BackendKind::Script, location)
    }

    pub fn driver(&self) -> &'static dyn Driver {
        self.kind.driver()
    }
}

impl FromStr for BackendDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, location) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <kind>:<location>, got '{}'", s))?;
        let kind = BackendKind::from_str(kind)
            .ok_or_else(|| format!("unknown backend '{}' (expected sqlite or script)", kind))?;
        if location.is_empty() {
            return Err(format!("missing storage location in '{}'", s));
        }
        Ok(Self::new(kind, location))
    }
}

impl std::fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.location.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    /// Never writes and never upgrades the schema. Used for migration sources.
    ReadOnly,
}

/// Opens one storage engine.
pub trait Driver: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dialect(&self) -> &'static dyn Dialect;

    /// Lock file guarding `location` against a second process instance.
    fn lock_path(&self, location: &Path) -> PathBuf;

    /// Open (creating on first use in read-write mode) the store at `location`.
    fn open(&self, location: &Path, mode: OpenMode) -> StoreResult<ConnectionHandle>;

    /// Delete every file of the store at `location`. Fails with
    /// `StorageLocked` if the store is open elsewhere.
    fn remove_storage(&self, location: &Path) -> StoreResult<()>;
}

/// SQL that differs between engines.
pub trait Dialect: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// DDL per schema step; entry `i` upgrades version `i` to `i + 1`.
    fn schema_steps(&self) -> &'static [&'static str];

    fn read_version(&self, conn: &Connection) -> rusqlite::Result<u32>;

    fn write_version(&self, conn: &Connection, version: u32) -> rusqlite::Result<()>;

    /// Insert or fully replace the scalar columns of `record`, keyed by path.
    /// Returns the row id.
    fn upsert_file(&self, conn: &Connection, record: &FileRecord) -> rusqlite::Result<i64>;

    /// Id of keyword `name`, inserting it if missing. `name` is already normalized.
    fn ensure_keyword(&self, conn: &Connection, name: &str) -> rusqlite::Result<i64>;

    /// Id of album `name`, inserting it with `created_at` if missing.
    fn ensure_album(&self, conn: &Connection, name: &str, created_at: &str) -> rusqlite::Result<i64>;
}

/// Makes a transaction durable. Runs inside the transaction, right before
/// the engine commit; an error rolls the transaction back.
pub trait Durability: Send {
    fn before_commit(&self, conn: &Connection) -> StoreResult<()>;

    /// Runs once when a read-write handle is dropped, outside any transaction.
    fn on_close(&self, _conn: &Connection) {}
}

/// The engine persists commits itself (journal/WAL).
pub struct EngineManaged;

impl Durability for EngineManaged {
    fn before_commit(&self, _conn: &Connection) -> StoreResult<()> {
        Ok(())
    }
}

/// Advisory lock on a `.lck` file, held for the lifetime of a handle.
/// The OS drops it if the process dies, so a crash never leaves a stale lock.
pub struct StorageLock {
    file: File,
    path: PathBuf,
}

impl StorageLock {
    pub fn acquire(lock_path: &Path, location: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| StoreError::unavailable(location, format!("cannot create lock file: {}", e)))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(StoreError::StorageLocked {
                    location: location.to_path_buf(),
                });
            }
            Err(TryLockError::Error(e)) => {
                return Err(StoreError::unavailable(location, format!("cannot lock storage: {}", e)));
            }
        }

        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        tracing::debug!(lock = %lock_path.display(), "Storage lock acquired");
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release storage lock");
        }
    }
}

/// An open store: connection, engine strategies and the storage lock.
pub struct ConnectionHandle {
    conn: Connection,
    kind: BackendKind,
    mode: OpenMode,
    location: PathBuf,
    dialect: &'static dyn Dialect,
    durability: Box<dyn Durability>,
    _lock: StorageLock,
}

impl ConnectionHandle {
    pub(crate) fn new(
        conn: Connection,
        mode: OpenMode,
        location: &Path,
        dialect: &'static dyn Dialect,
        durability: Box<dyn Durability>,
        lock: StorageLock,
    ) -> Self {
        Self {
            conn,
            kind: dialect.kind(),
            mode,
            location: location.to_path_buf(),
            dialect,
            durability,
            _lock: lock,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// Raw connection, outside any transaction.
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> StoreResult<u32> {
        Ok(self.dialect.read_version(&self.conn)?)
    }

    /// Create or upgrade the schema to [`CURRENT_SCHEMA_VERSION`]. Safe to call
    /// on every open. Read-only handles only validate the version.
    pub fn migrate_schema(&mut self) -> StoreResult<u32> {
        let version = self.schema_version()?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Schema(format!(
                "stored schema version {} is newer than supported version {}",
                version, CURRENT_SCHEMA_VERSION
            )));
        }

        if self.mode == OpenMode::ReadOnly {
            if version < MIN_READABLE_VERSION {
                return Err(StoreError::Schema(format!(
                    "schema version {} is too old to read without upgrading",
                    version
                )));
            }
            return Ok(version);
        }

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(version);
        }

        let steps = self.dialect.schema_steps();
        if steps.len() != CURRENT_SCHEMA_VERSION as usize {
            return Err(StoreError::Schema(format!(
                "{} dialect defines {} schema steps, expected {}",
                self.kind,
                steps.len(),
                CURRENT_SCHEMA_VERSION
            )));
        }

        let dialect = self.dialect;
        let tx = self.begin_transaction()?;
        for (index, step) in steps.iter().enumerate().skip(version as usize) {
            let target = index as u32 + 1;
            tx.conn().execute_batch(step).map_err(|e| {
                StoreError::Schema(format!("upgrade to schema version {} failed: {}", target, e))
            })?;
        }
        dialect
            .write_version(tx.conn(), CURRENT_SCHEMA_VERSION)
            .map_err(|e| StoreError::Schema(format!("cannot record schema version: {}", e)))?;
        tx.commit()?;

        tracing::info!(
            backend = %self.kind,
            location = %self.location.display(),
            from = version,
            to = CURRENT_SCHEMA_VERSION,
            "Schema upgraded"
        );
        Ok(CURRENT_SCHEMA_VERSION)
    }

    /// Start a write transaction. Fails with `ReadOnly` on read-only handles.
    pub fn begin_transaction(&mut self) -> StoreResult<Transaction<'_>> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::ReadOnly {
                location: self.location.clone(),
            });
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Transaction {
            tx,
            dialect: self.dialect,
            durability: self.durability.as_ref(),
            writable: true,
        })
    }

    /// Start a read transaction: a consistent snapshot, never persisted.
    pub fn begin_read(&mut self) -> StoreResult<Transaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(Transaction {
            tx,
            dialect: self.dialect,
            durability: self.durability.as_ref(),
            writable: false,
        })
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.mode == OpenMode::ReadWrite {
            self.durability.on_close(&self.conn);
        }
    }
}

/// A transaction on a [`ConnectionHandle`]. Dropping it without
/// [`commit`](Transaction::commit) rolls back.
pub struct Transaction<'a> {
    tx: rusqlite::Transaction<'a>,
    dialect: &'static dyn Dialect,
    durability: &'a dyn Durability,
    writable: bool,
}

impl<'a> Transaction<'a> {
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn commit(self) -> StoreResult<()> {
        let Transaction {
            tx,
            durability,
            writable,
            ..
        } = self;
        if writable {
            if let Err(e) = durability.before_commit(&tx) {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback after failed persist also failed");
                }
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> StoreResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

/// `location` with `suffix` appended to its file name.
pub(crate) fn with_suffix(location: &Path, suffix: &str) -> PathBuf {
    let mut name = location.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let desc: BackendDescriptor = "sqlite:/data/catalog.db".parse().unwrap();
        assert_eq!(desc.kind, BackendKind::Sqlite);
        assert_eq!(desc.location, PathBuf::from("/data/catalog.db"));

        let desc: BackendDescriptor = "hsqldb:/data/legacy".parse().unwrap();
        assert_eq!(desc.kind, BackendKind::Script);
        assert_eq!(desc.to_string(), "script:/data/legacy");
    }

    #[test]
    fn test_parse_descriptor_errors() {
        assert!("catalog.db".parse::<BackendDescriptor>().is_err());
        assert!("oracle:/x".parse::<BackendDescriptor>().is_err());
        assert!("sqlite:".parse::<BackendDescriptor>().is_err());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/data/catalog.db"), ".lck"),
            PathBuf::from("/data/catalog.db.lck")
        );
    }

    #[test]
    fn test_dialects_cover_current_version() {
        for kind in [BackendKind::Sqlite, BackendKind::Script] {
            assert_eq!(
                kind.driver().dialect().schema_steps().len(),
                CURRENT_SCHEMA_VERSION as usize,
                "{} dialect",
                kind
            );
        }
    }

    #[test]
    fn test_second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("store.lck");
        let first = StorageLock::acquire(&lock_path, dir.path()).unwrap();
        let second = StorageLock::acquire(&lock_path, dir.path());
        assert!(matches!(second, Err(StoreError::StorageLocked { .. })));
        drop(first);
        assert!(StorageLock::acquire(&lock_path, dir.path()).is_ok());
    }
}
