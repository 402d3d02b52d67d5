//! SQLite backend: a single database file in WAL mode.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::driver::{
    with_suffix, BackendKind, ConnectionHandle, Dialect, Driver, EngineManaged, OpenMode, StorageLock,
    CURRENT_SCHEMA_VERSION,
};
use super::records::FileRecord;
use super::schema::SQLITE_SCHEMA_STEPS;
use crate::error::{StoreError, StoreResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDriver;

pub struct SqliteDialect;

static SQLITE_DIALECT: SqliteDialect = SqliteDialect;

/// Connection pragmas shared by the catalog and the thumbnail index.
pub(crate) fn configure_connection(conn: &Connection, writable: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if writable {
        // journal_mode returns the resulting mode as a row
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

impl Driver for SqliteDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn dialect(&self) -> &'static dyn Dialect {
        &SQLITE_DIALECT
    }

    fn lock_path(&self, location: &Path) -> PathBuf {
        with_suffix(location, ".lck")
    }

    fn open(&self, location: &Path, mode: OpenMode) -> StoreResult<ConnectionHandle> {
        if mode == OpenMode::ReadOnly && !location.is_file() {
            return Err(StoreError::unavailable(location, "no database file"));
        }
        if let Some(parent) = location.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::unavailable(location, e.to_string()))?;
            }
        }

        let lock = StorageLock::acquire(&self.lock_path(location), location)?;

        let flags = match mode {
            OpenMode::ReadWrite => OpenFlags::default(),
            OpenMode::ReadOnly => {
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI
            }
        };
        let conn = Connection::open_with_flags(location, flags)
            .map_err(|e| StoreError::unavailable(location, e.to_string()))?;
        configure_connection(&conn, mode == OpenMode::ReadWrite)
            .map_err(|e| StoreError::unavailable(location, e.to_string()))?;

        let version = SQLITE_DIALECT
            .read_version(&conn)
            .map_err(|e| StoreError::unavailable(location, e.to_string()))?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::unavailable(
                location,
                format!(
                    "schema version {} is newer than supported version {}",
                    version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }
        if mode == OpenMode::ReadOnly && version == 0 {
            return Err(StoreError::unavailable(location, "database has no catalog schema"));
        }

        tracing::debug!(location = %location.display(), ?mode, version, "Opened SQLite store");
        Ok(ConnectionHandle::new(
            conn,
            mode,
            location,
            &SQLITE_DIALECT,
            Box::new(EngineManaged),
            lock,
        ))
    }

    fn remove_storage(&self, location: &Path) -> StoreResult<()> {
        let lock_path = self.lock_path(location);
        let lock = StorageLock::acquire(&lock_path, location)?;
        for path in [
            location.to_path_buf(),
            with_suffix(location, "-wal"),
            with_suffix(location, "-shm"),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(lock);
        let _ = std::fs::remove_file(lock_path);
        Ok(())
    }
}

impl Dialect for SqliteDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn schema_steps(&self) -> &'static [&'static str] {
        SQLITE_SCHEMA_STEPS
    }

    fn read_version(&self, conn: &Connection) -> rusqlite::Result<u32> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version.max(0) as u32)
    }

    fn write_version(&self, conn: &Connection, version: u32) -> rusqlite::Result<()> {
        conn.pragma_update(None, "user_version", version as i64)
    }

    fn upsert_file(&self, conn: &Connection, record: &FileRecord) -> rusqlite::Result<i64> {
        conn.query_row(
            "INSERT INTO files (path, size_bytes, modified_at, rating, title, description,
                                gps_latitude, gps_longitude, camera_make, camera_model, taken_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(path) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                rating = excluded.rating,
                title = excluded.title,
                description = excluded.description,
                gps_latitude = excluded.gps_latitude,
                gps_longitude = excluded.gps_longitude,
                camera_make = excluded.camera_make,
                camera_model = excluded.camera_model,
                taken_at = excluded.taken_at
             RETURNING id",
            params![
                record.path,
                record.size_bytes,
                record.modified_at,
                record.rating,
                record.title,
                record.description,
                record.gps_latitude,
                record.gps_longitude,
                record.camera_make,
                record.camera_model,
                record.taken_at_text(),
            ],
            |row| row.get(0),
        )
    }

    fn ensure_keyword(&self, conn: &Connection, name: &str) -> rusqlite::Result<i64> {
        if let Some(id) = conn
            .query_row("SELECT id FROM keywords WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
        {
            return Ok(id);
        }
        conn.execute("INSERT INTO keywords (name) VALUES (?1)", [name])?;
        Ok(conn.last_insert_rowid())
    }

    fn ensure_album(&self, conn: &Connection, name: &str, created_at: &str) -> rusqlite::Result<i64> {
        if let Some(id) = conn
            .query_row("SELECT id FROM albums WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
        {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO albums (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
