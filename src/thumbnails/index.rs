//! SQLite index of cached thumbnails. Blob bytes live on disk; this table
//! holds fingerprints, dimensions and the recency counters used for eviction.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use super::Fingerprint;
use crate::db::sqlite::configure_connection;

const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS thumbnails (
    identity TEXT PRIMARY KEY,
    modified_ms INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    blob_len INTEGER NOT NULL,
    generated_at TEXT NOT NULL,
    generation INTEGER NOT NULL,
    access INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_thumbnails_recency ON thumbnails(access, generation);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub fingerprint: Fingerprint,
    pub width: u32,
    pub height: u32,
    pub blob_len: u64,
    pub generated_at: String,
    pub generation: u64,
    pub access: u64,
}

impl IndexEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: Fingerprint {
                identity: row.get(0)?,
                modified_ms: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)? as u64,
            },
            width: row.get(3)?,
            height: row.get(4)?,
            blob_len: row.get::<_, i64>(5)? as u64,
            generated_at: row.get(6)?,
            generation: row.get::<_, i64>(7)? as u64,
            access: row.get::<_, i64>(8)? as u64,
        })
    }
}

const ENTRY_COLUMNS: &str =
    "identity, modified_ms, size_bytes, width, height, blob_len, generated_at, generation, access";

/// Eviction candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Victim {
    pub identity: String,
    pub generation: u64,
}

pub(crate) struct CacheIndex {
    conn: Connection,
}

impl CacheIndex {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        configure_connection(&conn, true)?;
        conn.execute_batch(INDEX_SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn lookup(&self, identity: &str) -> rusqlite::Result<Option<IndexEntry>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM thumbnails WHERE identity = ?1", ENTRY_COLUMNS),
                [identity],
                IndexEntry::from_row,
            )
            .optional()
    }

    pub fn upsert(&self, entry: &IndexEntry) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO thumbnails (identity, modified_ms, size_bytes, width, height, blob_len,
                                     generated_at, generation, access)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(identity) DO UPDATE SET
                modified_ms = excluded.modified_ms,
                size_bytes = excluded.size_bytes,
                width = excluded.width,
                height = excluded.height,
                blob_len = excluded.blob_len,
                generated_at = excluded.generated_at,
                generation = excluded.generation,
                access = excluded.access",
            params![
                entry.fingerprint.identity,
                entry.fingerprint.modified_ms,
                entry.fingerprint.size_bytes as i64,
                entry.width,
                entry.height,
                entry.blob_len as i64,
                entry.generated_at,
                entry.generation as i64,
                entry.access as i64,
            ],
        )?;
        Ok(())
    }

    pub fn touch(&self, identity: &str, access: u64) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE thumbnails SET access = ?2 WHERE identity = ?1",
            params![identity, access as i64],
        )?;
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> rusqlite::Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM thumbnails WHERE identity = ?1", [identity])?
            > 0)
    }

    /// Remove the entry only if it still has `generation`. Returns its blob length.
    pub fn remove_generation(&self, victim: &Victim) -> rusqlite::Result<Option<u64>> {
        let blob_len: Option<i64> = self
            .conn
            .query_row(
                "SELECT blob_len FROM thumbnails WHERE identity = ?1 AND generation = ?2",
                params![victim.identity, victim.generation as i64],
                |row| row.get(0),
            )
            .optional()?;
        if blob_len.is_some() {
            self.conn.execute(
                "DELETE FROM thumbnails WHERE identity = ?1 AND generation = ?2",
                params![victim.identity, victim.generation as i64],
            )?;
        }
        Ok(blob_len.map(|n| n as u64))
    }

    /// Re-key an entry. Any entry already under `to` is replaced.
    pub fn rename(&self, from: &str, to: &str) -> rusqlite::Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM thumbnails WHERE identity = ?1", [to])?;
        let moved = tx.execute(
            "UPDATE thumbnails SET identity = ?2 WHERE identity = ?1",
            params![from, to],
        )?;
        tx.commit()?;
        Ok(moved > 0)
    }

    pub fn total_size(&self) -> rusqlite::Result<u64> {
        let total: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(blob_len), 0) FROM thumbnails", [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }

    pub fn count(&self) -> rusqlite::Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM thumbnails", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Highest generation or access tick stored, so a reopened cache keeps
    /// counting upwards.
    pub fn max_tick(&self) -> rusqlite::Result<u64> {
        let tick: i64 = self.conn.query_row(
            "SELECT MAX(COALESCE(MAX(generation), 0), COALESCE(MAX(access), 0)) FROM thumbnails",
            [],
            |row| row.get(0),
        )?;
        Ok(tick.max(0) as u64)
    }

    /// Least recently used entries first; ties go to the older generation.
    pub fn eviction_candidates(&self, limit: usize) -> rusqlite::Result<Vec<Victim>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT identity, generation FROM thumbnails
             ORDER BY access ASC, generation ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(Victim {
                identity: row.get(0)?,
                generation: row.get::<_, i64>(1)? as u64,
            })
        })?;
        rows.collect()
    }

    pub fn identities(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM thumbnails ORDER BY identity")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    pub fn clear(&self) -> rusqlite::Result<()> {
        self.conn.execute("DELETE FROM thumbnails", [])?;
        Ok(())
    }

    pub fn vacuum(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("VACUUM")
    }
}
