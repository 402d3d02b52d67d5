//! Album operations. Membership is ordered by `position`; new members are
//! appended after the current last one.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;

use super::records::{Album, FileIdentity};
use super::{file_id, now_text, RecordWriter, Repository};
use crate::error::{StoreError, StoreResult};

/// Paths bound per `IN (...)` query. SQLite's default limit is 32766
/// variables; older builds allow only 999.
const LINK_QUERY_CHUNK: usize = 900;

/// One album membership, as copied between backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumLink {
    pub album: String,
    pub path: String,
    pub position: i64,
}

impl Repository {
    /// Create an empty album. Returns `false` if it already exists.
    pub fn create_album(&self, name: &str) -> StoreResult<bool> {
        let name = album_name(name)?;
        self.write(|w| w.create_album(&name, &now_text()))
    }

    /// Delete an album and its memberships. The files stay.
    pub fn delete_album(&self, name: &str) -> StoreResult<bool> {
        let name = album_name(name)?;
        self.write(|w| {
            let Some(album_id) = album_id(w.conn, &name)? else {
                return Ok(false);
            };
            w.conn
                .execute("DELETE FROM album_files WHERE album_id = ?1", [album_id])?;
            w.conn.execute("DELETE FROM albums WHERE id = ?1", [album_id])?;
            tracing::debug!(album = %name, "Deleted album");
            Ok(true)
        })
    }

    /// All albums with member counts, ordered by name.
    pub fn albums(&self) -> StoreResult<Vec<Album>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.name, a.created_at,
                        (SELECT COUNT(*) FROM album_files af WHERE af.album_id = a.id)
                 FROM albums a
                 ORDER BY a.name",
            )?;
            let albums = stmt
                .query_map([], |row| {
                    Ok(Album {
                        name: row.get(0)?,
                        created_at: row.get(1)?,
                        file_count: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(albums)
        })
    }

    /// Member paths of `name` in album order. Empty if the album is unknown.
    pub fn album_files(&self, name: &str) -> StoreResult<Vec<String>> {
        let name = album_name(name)?;
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.path FROM album_files af
                 JOIN albums a ON a.id = af.album_id
                 JOIN files f ON f.id = af.file_id
                 WHERE a.name = ?1
                 ORDER BY af.position, f.path",
            )?;
            let paths = stmt
                .query_map([&name], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(paths)
        })
    }

    /// Append a tracked file to an album, creating the album if needed.
    /// Returns `false` if the file was already a member.
    pub fn add_to_album(&self, name: &str, path: impl AsRef<Path>) -> StoreResult<bool> {
        let name = album_name(name)?;
        let identity = FileIdentity::from_path(path)?;
        self.write(|w| w.add_to_album(&name, &identity))
    }

    pub fn remove_from_album(&self, name: &str, path: impl AsRef<Path>) -> StoreResult<bool> {
        let name = album_name(name)?;
        let identity = FileIdentity::from_path(path)?;
        self.write(|w| {
            let (Some(album_id), Some(file_id)) = (album_id(w.conn, &name)?, file_id(w.conn, identity.as_str())?)
            else {
                return Ok(false);
            };
            let removed = w.conn.execute(
                "DELETE FROM album_files WHERE album_id = ?1 AND file_id = ?2",
                params![album_id, file_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// Album memberships of the given paths, with their stored positions.
    /// Any number of paths may be passed; they are queried in chunks that
    /// stay under SQLite's bound-parameter limit.
    pub(crate) fn album_links(&self, paths: &[String]) -> StoreResult<Vec<AlbumLink>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut links = self.read(|conn| {
            let mut links = Vec::new();
            for chunk in paths.chunks(LINK_QUERY_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT a.name, f.path, af.position FROM album_files af
                     JOIN albums a ON a.id = af.album_id
                     JOIN files f ON f.id = af.file_id
                     WHERE f.path IN ({})",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(AlbumLink {
                        album: row.get(0)?,
                        path: row.get(1)?,
                        position: row.get(2)?,
                    })
                })?;
                for link in rows {
                    links.push(link?);
                }
            }
            Ok(links)
        })?;
        links.sort_by(|a, b| (&a.album, a.position, &a.path).cmp(&(&b.album, b.position, &b.path)));
        Ok(links)
    }
}

impl RecordWriter<'_> {
    /// Returns `false` if the album already exists.
    pub fn create_album(&mut self, name: &str, created_at: &str) -> StoreResult<bool> {
        let name = album_name(name)?;
        if album_id(self.conn, &name)?.is_some() {
            return Ok(false);
        }
        self.dialect.ensure_album(self.conn, &name, created_at)?;
        tracing::debug!(album = %name, "Created album");
        Ok(true)
    }

    pub fn add_to_album(&mut self, name: &str, identity: &FileIdentity) -> StoreResult<bool> {
        let name = album_name(name)?;
        let file_id = file_id(self.conn, identity.as_str())?
            .ok_or_else(|| StoreError::invalid(format!("no record for {}", identity)))?;
        let album_id = self.dialect.ensure_album(self.conn, &name, &now_text())?;
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT position FROM album_files WHERE album_id = ?1 AND file_id = ?2",
                params![album_id, file_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }
        append_member(self.conn, album_id, file_id)?;
        Ok(true)
    }

    /// Insert a membership at an explicit position. Used when copying
    /// albums between backends so order survives.
    pub(crate) fn insert_album_link(&mut self, link: &AlbumLink) -> StoreResult<()> {
        let file_id = file_id(self.conn, &link.path)?
            .ok_or_else(|| StoreError::invalid(format!("no record for {}", link.path)))?;
        let album_id = self.dialect.ensure_album(self.conn, &link.album, &now_text())?;
        self.conn.execute(
            "INSERT INTO album_files (album_id, file_id, position) VALUES (?1, ?2, ?3)",
            params![album_id, file_id, link.position],
        )?;
        Ok(())
    }
}

fn album_name(name: &str) -> StoreResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::invalid("empty album name"));
    }
    Ok(trimmed.to_string())
}

fn album_id(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM albums WHERE name = ?1", [name], |row| row.get(0))
        .optional()
}

pub(crate) fn linked_albums(conn: &Connection, file_id: i64) -> rusqlite::Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT a.id, a.name FROM album_files af
         JOIN albums a ON a.id = af.album_id
         WHERE af.file_id = ?1
         ORDER BY a.name",
    )?;
    let rows = stmt.query_map([file_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Add `file_id` at the end of the album.
pub(crate) fn append_member(conn: &Connection, album_id: i64, file_id: i64) -> rusqlite::Result<()> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM album_files WHERE album_id = ?1",
        [album_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO album_files (album_id, file_id, position) VALUES (?1, ?2, ?3)",
        params![album_id, file_id, next],
    )?;
    Ok(())
}
