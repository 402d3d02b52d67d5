//! Script backend: an HSQLDB-style directory store.
//!
//! The working set lives in an in-memory database. `catalog.script` holds a
//! full checkpoint (DDL followed by one `INSERT` per row) and `catalog.log`
//! the transactions committed since, one checksummed block each. Both name
//! the checkpoint generation they belong to and a log from another
//! generation is ignored. Opening replays the script, then the log up to its
//! first incomplete block.
//!
//! The log is folded into a fresh script when it outgrows
//! [`LOG_CHECKPOINT_BYTES`], when the schema changes and when the store is
//! closed. Renaming the new script into place is the commit point of a
//! checkpoint; the properties file is written before it.

use rusqlite::hooks::Action;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::driver::{
    BackendKind, ConnectionHandle, Dialect, Driver, Durability, EngineManaged, OpenMode, StorageLock,
    CURRENT_SCHEMA_VERSION,
};
use super::records::FileRecord;
use super::script_schema::SCRIPT_SCHEMA_STEPS;
use crate::error::{StoreError, StoreResult};

const STORE_NAME: &str = "catalog";

/// Log size past which the next commit writes a full checkpoint instead.
pub const LOG_CHECKPOINT_BYTES: u64 = 8 * 1024 * 1024;

const SCRIPT_HEADER: &str = "-- photocat script checkpoint ";
const LOG_HEADER: &str = "-- photocat log checkpoint ";
const BLOCK_HEADER: &str = "-- tx ";

pub struct ScriptDriver;

pub struct ScriptDialect;

static SCRIPT_DIALECT: ScriptDialect = ScriptDialect;

/// File layout of one script store directory.
#[derive(Debug, Clone)]
struct ScriptFiles {
    dir: PathBuf,
}

impl ScriptFiles {
    fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn named(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", STORE_NAME, suffix))
    }

    fn script(&self) -> PathBuf {
        self.named("script")
    }

    fn script_new(&self) -> PathBuf {
        self.named("script.new")
    }

    fn log(&self) -> PathBuf {
        self.named("log")
    }

    fn log_new(&self) -> PathBuf {
        self.named("log.new")
    }

    fn properties(&self) -> PathBuf {
        self.named("properties")
    }

    fn properties_new(&self) -> PathBuf {
        self.named("properties.new")
    }

    fn lock(&self) -> PathBuf {
        self.named("lck")
    }

    /// Staging files left behind by a checkpoint that never completed.
    fn staging(&self) -> [PathBuf; 3] {
        [self.script_new(), self.log_new(), self.properties_new()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScriptProperties {
    version: u32,
    #[serde(default)]
    modified: Option<String>,
}

fn read_properties(files: &ScriptFiles) -> StoreResult<Option<ScriptProperties>> {
    let path = files.properties();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::unavailable(&files.dir, e.to_string())),
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::unavailable(&files.dir, format!("corrupt properties file: {}", e)))
}

/// Write `contents` to `staging`, fsync, then rename over `target`.
fn replace_file(staging: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(staging)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(staging, target)
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Generation named by the first line of a script or log.
fn header_generation(text: &str, prefix: &str) -> Option<u64> {
    text.lines().next()?.strip_prefix(prefix)?.trim().parse().ok()
}

fn schema_cookie(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "schema_version", |row| row.get(0))
}

/// Serialize the whole database as a replayable SQL script.
fn dump_script(conn: &Connection, generation: u64) -> rusqlite::Result<String> {
    let mut out = format!("{}{}\n", SCRIPT_HEADER, generation);

    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
         ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, rowid",
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (_, _, sql) in &objects {
        out.push_str(sql);
        out.push_str(";\n");
    }

    for (_, table, _) in objects.iter().filter(|(kind, _, _)| kind == "table") {
        let mut rows_stmt = conn.prepare(&format!("SELECT rowid, * FROM \"{}\" ORDER BY rowid", table))?;
        let columns = column_list(&rows_stmt);
        let count = rows_stmt.column_count();
        let mut rows = rows_stmt.query([])?;
        while let Some(row) = rows.next()? {
            push_insert(&mut out, table, &columns, count, row)?;
        }
    }

    Ok(out)
}

/// Statements bringing the rows in `touched` to their current state: every
/// row is deleted, then the ones that still exist are inserted again.
fn dump_rows(conn: &Connection, touched: &BTreeSet<(String, i64)>) -> rusqlite::Result<String> {
    let mut out = String::new();
    for (table, rowid) in touched {
        let _ = writeln!(out, "DELETE FROM \"{}\" WHERE rowid = {};", table, rowid);
    }

    let mut by_table: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for (table, rowid) in touched {
        by_table.entry(table.as_str()).or_default().push(*rowid);
    }
    for (table, rowids) in by_table {
        let mut stmt = conn.prepare(&format!("SELECT rowid, * FROM \"{}\" WHERE rowid = ?1", table))?;
        let columns = column_list(&stmt);
        let count = stmt.column_count();
        for rowid in rowids {
            let mut rows = stmt.query([rowid])?;
            if let Some(row) = rows.next()? {
                push_insert(&mut out, table, &columns, count, row)?;
            }
        }
    }
    Ok(out)
}

/// `(rowid, "a", "b", ...)` for a `SELECT rowid, *` statement.
fn column_list(stmt: &rusqlite::Statement<'_>) -> String {
    let mut list = String::from("(rowid");
    for name in stmt.column_names().iter().skip(1) {
        let _ = write!(list, ",\"{}\"", name);
    }
    list.push(')');
    list
}

fn push_insert(
    out: &mut String,
    table: &str,
    columns: &str,
    count: usize,
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<()> {
    let _ = write!(out, "INSERT INTO \"{}\" {} VALUES(", table, columns);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        push_literal(out, row.get_ref(i)?);
    }
    out.push_str(");\n");
    Ok(())
}

fn push_literal(out: &mut String, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => out.push_str("NULL"),
        ValueRef::Integer(i) => {
            let _ = write!(out, "{}", i);
        }
        ValueRef::Real(f) if f.is_finite() => {
            let _ = write!(out, "{:?}", f);
        }
        ValueRef::Real(_) => out.push_str("NULL"),
        ValueRef::Text(bytes) => {
            out.push('\'');
            out.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
            out.push('\'');
        }
        ValueRef::Blob(bytes) => {
            out.push_str("X'");
            for b in bytes {
                let _ = write!(out, "{:02X}", b);
            }
            out.push('\'');
        }
    }
}

fn format_block(body: &str) -> String {
    format!("{}{} {}\n{}", BLOCK_HEADER, body.len(), hex_sha256(body.as_bytes()), body)
}

/// Replayable part of a log belonging to the current generation.
struct LogContents {
    blocks: Vec<String>,
    /// Bytes up to the end of the last intact block.
    valid_len: u64,
}

/// `None` when the log has no header or belongs to another generation.
fn parse_log(bytes: &[u8], generation: u64) -> Option<LogContents> {
    let header_end = bytes.iter().position(|&b| b == b'\n')? + 1;
    let header = std::str::from_utf8(&bytes[..header_end]).ok()?;
    if header_generation(header, LOG_HEADER)? != generation {
        return None;
    }

    let mut blocks = Vec::new();
    let mut pos = header_end;
    while let Some((body, next)) = next_block(bytes, pos) {
        blocks.push(body);
        pos = next;
    }
    Some(LogContents {
        blocks,
        valid_len: pos as u64,
    })
}

/// The block at `pos` and the offset after it, if it is complete and its
/// checksum matches.
fn next_block(bytes: &[u8], pos: usize) -> Option<(String, usize)> {
    let rest = bytes.get(pos..)?;
    let line_end = rest.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&rest[..line_end]).ok()?;
    let mut fields = line.strip_prefix(BLOCK_HEADER)?.split(' ');
    let len: usize = fields.next()?.parse().ok()?;
    let digest = fields.next()?;
    let end = (line_end + 1).checked_add(len)?;
    let body = rest.get(line_end + 1..end)?;
    if hex_sha256(body) != digest {
        return None;
    }
    let body = String::from_utf8(body.to_vec()).ok()?;
    Some((body, pos + end))
}

/// Append handle on `catalog.log`.
struct LogWriter {
    file: File,
    len: u64,
    /// Whether any block follows the header.
    dirty: bool,
}

impl LogWriter {
    /// Replace the log with an empty one for `generation`.
    fn create(files: &ScriptFiles, generation: u64) -> io::Result<Self> {
        let header = format!("{}{}\n", LOG_HEADER, generation);
        replace_file(&files.log_new(), &files.log(), header.as_bytes())?;
        Self::open(files, header.len() as u64, false)
    }

    /// Open the existing log, cutting it back to `len`.
    fn open(files: &ScriptFiles, len: u64, dirty: bool) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(files.log())?;
        file.set_len(len)?;
        Ok(Self { file, len, dirty })
    }

    fn append(&mut self, body: &str) -> io::Result<()> {
        let block = format_block(body);
        let written = self
            .file
            .seek(SeekFrom::Start(self.len))
            .and_then(|_| self.file.write_all(block.as_bytes()))
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            if let Err(truncate_err) = self.file.set_len(self.len) {
                tracing::warn!(error = %truncate_err, "Cannot cut failed block from script log");
            }
            return Err(e);
        }
        self.len += block.len() as u64;
        self.dirty = true;
        Ok(())
    }
}

/// Rows written by the open transaction, as reported by the update hook.
type TouchedRows = Arc<Mutex<BTreeSet<(String, i64)>>>;

struct JournalState {
    generation: u64,
    schema_cookie: i64,
    /// `None` after a failed log write; the next commit checkpoints.
    log: Option<LogWriter>,
}

/// Persists commits of a read-write script store: a log block per
/// transaction, a full checkpoint when needed.
struct ScriptJournal {
    files: ScriptFiles,
    checkpoint_bytes: u64,
    touched: TouchedRows,
    state: Mutex<JournalState>,
}

impl ScriptJournal {
    fn state(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_touched(&self) -> BTreeSet<(String, i64)> {
        std::mem::take(&mut *self.touched.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Write the whole database as generation `n + 1` and start an empty log.
    fn checkpoint(&self, conn: &Connection, state: &mut JournalState) -> StoreResult<()> {
        let generation = state.generation + 1;
        let script = dump_script(conn, generation)?;
        let cookie = schema_cookie(conn)?;
        let properties = ScriptProperties {
            version: SCRIPT_DIALECT.read_version(conn)?,
            modified: Some(chrono::Utc::now().to_rfc3339()),
        };
        let text = toml::to_string(&properties).map_err(|e| io::Error::other(e.to_string()))?;

        replace_file(&self.files.properties_new(), &self.files.properties(), text.as_bytes())?;
        replace_file(&self.files.script_new(), &self.files.script(), script.as_bytes())?;

        state.generation = generation;
        state.schema_cookie = cookie;
        state.log = match LogWriter::create(&self.files, generation) {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(dir = %self.files.dir.display(), error = %e, "Cannot reset script log");
                None
            }
        };
        tracing::debug!(dir = %self.files.dir.display(), generation, bytes = script.len(), "Script checkpoint written");
        Ok(())
    }
}

impl Durability for ScriptJournal {
    fn before_commit(&self, conn: &Connection) -> StoreResult<()> {
        let mut state = self.state();
        let cookie = schema_cookie(conn)?;
        let append = matches!(
            state.log.as_ref(),
            Some(log) if cookie == state.schema_cookie && log.len < self.checkpoint_bytes
        );
        let touched = self.take_touched();

        if !append {
            return self.checkpoint(conn, &mut state);
        }
        if touched.is_empty() {
            return Ok(());
        }

        let body = dump_rows(conn, &touched)?;
        if let Some(log) = state.log.as_mut() {
            if let Err(e) = log.append(&body) {
                state.log = None;
                return Err(e.into());
            }
            tracing::trace!(rows = touched.len(), log_bytes = log.len, "Script log block appended");
        }
        Ok(())
    }

    fn on_close(&self, conn: &Connection) {
        let mut state = self.state();
        let pending = state.log.as_ref().is_none_or(|log| log.dirty);
        if !pending {
            return;
        }
        if let Err(e) = self.checkpoint(conn, &mut state) {
            tracing::warn!(dir = %self.files.dir.display(), error = %e, "Checkpoint on close failed; log kept for replay");
        }
    }
}

/// Record every row change and forget them again on rollback.
fn install_hooks(conn: &Connection, touched: &TouchedRows) {
    let on_update = Arc::clone(touched);
    conn.update_hook(Some(move |_: Action, _: &str, table: &str, rowid: i64| {
        on_update
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((table.to_string(), rowid));
    }));
    let on_rollback = Arc::clone(touched);
    conn.rollback_hook(Some(move || {
        on_rollback.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }));
}

fn open_script_store(location: &Path, mode: OpenMode, checkpoint_bytes: u64) -> StoreResult<ConnectionHandle> {
    let files = ScriptFiles::new(location);
    if mode == OpenMode::ReadOnly && !files.script().is_file() {
        return Err(StoreError::unavailable(location, "no catalog script"));
    }
    if location.exists() && !location.is_dir() {
        return Err(StoreError::unavailable(location, "script store location is not a directory"));
    }
    fs::create_dir_all(location).map_err(|e| StoreError::unavailable(location, e.to_string()))?;

    let lock = StorageLock::acquire(&files.lock(), location)?;

    // staged files belong to a checkpoint that never reached its commit point
    if mode == OpenMode::ReadWrite {
        for staged in files.staging() {
            match fs::remove_file(&staged) {
                Ok(()) => tracing::warn!(file = %staged.display(), "Discarded unfinished checkpoint file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::unavailable(location, e.to_string())),
            }
        }
    }

    if let Some(properties) = read_properties(&files)? {
        if properties.version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::unavailable(
                location,
                format!(
                    "schema version {} is newer than supported version {}",
                    properties.version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }
    }

    let conn = Connection::open_in_memory().map_err(|e| StoreError::unavailable(location, e.to_string()))?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;

    let generation = match fs::read_to_string(files.script()) {
        Ok(script) => {
            conn.execute_batch(&script)
                .map_err(|e| StoreError::unavailable(location, format!("corrupt catalog script: {}", e)))?;
            header_generation(&script, SCRIPT_HEADER).unwrap_or(0)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(StoreError::unavailable(location, e.to_string())),
    };

    let log = match fs::read(files.log()) {
        Ok(bytes) => {
            let contents = parse_log(&bytes, generation);
            match &contents {
                Some(contents) if contents.valid_len < bytes.len() as u64 => tracing::warn!(
                    dir = %location.display(),
                    discarded = bytes.len() as u64 - contents.valid_len,
                    "Discarding incomplete tail of script log"
                ),
                None => tracing::warn!(dir = %location.display(), generation, "Ignoring script log of another checkpoint"),
                _ => {}
            }
            contents
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(StoreError::unavailable(location, e.to_string())),
    };
    if let Some(contents) = &log {
        for (index, block) in contents.blocks.iter().enumerate() {
            conn.execute_batch(block).map_err(|e| {
                StoreError::unavailable(location, format!("corrupt script log at block {}: {}", index + 1, e))
            })?;
        }
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let version = SCRIPT_DIALECT
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
        return Err(StoreError::unavailable(location, "catalog script has no schema"));
    }

    let durability: Box<dyn Durability> = match mode {
        OpenMode::ReadWrite => {
            let writer = match &log {
                Some(contents) => LogWriter::open(&files, contents.valid_len, !contents.blocks.is_empty()),
                None => LogWriter::create(&files, generation),
            }
            .map_err(|e| StoreError::unavailable(location, format!("cannot open script log: {}", e)))?;

            let touched = TouchedRows::default();
            install_hooks(&conn, &touched);
            Box::new(ScriptJournal {
                files,
                checkpoint_bytes,
                touched,
                state: Mutex::new(JournalState {
                    generation,
                    schema_cookie: schema_cookie(&conn)?,
                    log: Some(writer),
                }),
            })
        }
        OpenMode::ReadOnly => Box::new(EngineManaged),
    };

    tracing::debug!(
        location = %location.display(),
        ?mode,
        version,
        generation,
        log_blocks = log.as_ref().map_or(0, |l| l.blocks.len()),
        "Opened script store"
    );
    Ok(ConnectionHandle::new(conn, mode, location, &SCRIPT_DIALECT, durability, lock))
}

impl Driver for ScriptDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Script
    }

    fn dialect(&self) -> &'static dyn Dialect {
        &SCRIPT_DIALECT
    }

    fn lock_path(&self, location: &Path) -> PathBuf {
        ScriptFiles::new(location).lock()
    }

    fn open(&self, location: &Path, mode: OpenMode) -> StoreResult<ConnectionHandle> {
        open_script_store(location, mode, LOG_CHECKPOINT_BYTES)
    }

    fn remove_storage(&self, location: &Path) -> StoreResult<()> {
        let files = ScriptFiles::new(location);
        if !location.exists() {
            return Ok(());
        }
        let lock = StorageLock::acquire(&files.lock(), location)?;
        let [script_new, log_new, properties_new] = files.staging();
        for path in [
            files.script(),
            files.log(),
            files.properties(),
            script_new,
            log_new,
            properties_new,
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(lock);
        let _ = fs::remove_file(files.lock());
        Ok(())
    }
}

impl ScriptDialect {
    /// Next identity value of `sequence`.
    fn next_id(&self, conn: &Connection, sequence: &str) -> rusqlite::Result<i64> {
        let id: Option<i64> = conn
            .query_row(
                "SELECT next_value FROM sequences WHERE name = ?1",
                [sequence],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => {
                conn.execute(
                    "UPDATE sequences SET next_value = ?2 WHERE name = ?1",
                    params![sequence, id + 1],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO sequences (name, next_value) VALUES (?1, 2)",
                    [sequence],
                )?;
                Ok(1)
            }
        }
    }
}

impl Dialect for ScriptDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Script
    }

    fn schema_steps(&self) -> &'static [&'static str] {
        SCRIPT_SCHEMA_STEPS
    }

    fn read_version(&self, conn: &Connection) -> rusqlite::Result<u32> {
        let has_meta: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
            [],
            |row| row.get(0),
        )?;
        if has_meta == 0 {
            return Ok(0);
        }
        let version: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_meta", [], |row| {
            row.get(0)
        })?;
        Ok(version.max(0) as u32)
    }

    fn write_version(&self, conn: &Connection, version: u32) -> rusqlite::Result<()> {
        // row-wise so the change reaches the update hook
        if conn.execute("UPDATE schema_meta SET version = ?1", [version])? == 0 {
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [version])?;
        }
        Ok(())
    }

    fn upsert_file(&self, conn: &Connection, record: &FileRecord) -> rusqlite::Result<i64> {
        let taken_at = record.taken_at_text();
        let updated = conn.execute(
            "UPDATE files SET size_bytes = ?2, modified_at = ?3, rating = ?4, title = ?5,
                    description = ?6, gps_latitude = ?7, gps_longitude = ?8,
                    camera_make = ?9, camera_model = ?10, taken_at = ?11
             WHERE path = ?1",
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
                taken_at,
            ],
        )?;
        if updated > 0 {
            return conn.query_row("SELECT id FROM files WHERE path = ?1", [&record.path], |row| {
                row.get(0)
            });
        }

        let id = self.next_id(conn, "files")?;
        conn.execute(
            "INSERT INTO files (id, path, size_bytes, modified_at, rating, title, description,
                                gps_latitude, gps_longitude, camera_make, camera_model, taken_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
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
                taken_at,
            ],
        )?;
        Ok(id)
    }

    fn ensure_keyword(&self, conn: &Connection, name: &str) -> rusqlite::Result<i64> {
        if let Some(id) = conn
            .query_row("SELECT id FROM keywords WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
        {
            return Ok(id);
        }
        let id = self.next_id(conn, "keywords")?;
        conn.execute("INSERT INTO keywords (id, name) VALUES (?1, ?2)", params![id, name])?;
        Ok(id)
    }

    fn ensure_album(&self, conn: &Connection, name: &str, created_at: &str) -> rusqlite::Result<i64> {
        if let Some(id) = conn
            .query_row("SELECT id FROM albums WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
        {
            return Ok(id);
        }
        let id = self.next_id(conn, "albums")?;
        conn.execute(
            "INSERT INTO albums (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, created_at],
        )?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> ConnectionHandle {
        open_with_limit(dir, LOG_CHECKPOINT_BYTES)
    }

    fn open_with_limit(dir: &Path, checkpoint_bytes: u64) -> ConnectionHandle {
        let mut handle = open_script_store(dir, OpenMode::ReadWrite, checkpoint_bytes).unwrap();
        handle.migrate_schema().unwrap();
        handle
    }

    fn insert(handle: &mut ConnectionHandle, path: &str) -> StoreResult<i64> {
        let tx = handle.begin_transaction()?;
        let id = SCRIPT_DIALECT.upsert_file(tx.conn(), &FileRecord::new(path))?;
        tx.commit()?;
        Ok(id)
    }

    fn paths(handle: &ConnectionHandle) -> Vec<String> {
        let mut stmt = handle.connection().prepare("SELECT path FROM files ORDER BY path").unwrap();
        let paths = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        paths
    }

    /// The store's files as a crash at this point would leave them.
    fn snapshot(store: &Path, into: &Path) {
        fs::create_dir_all(into).unwrap();
        for name in ["catalog.script", "catalog.log", "catalog.properties"] {
            let from = store.join(name);
            if from.exists() {
                fs::copy(&from, into.join(name)).unwrap();
            }
        }
    }

    #[test]
    fn test_commit_writes_script_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let _handle = open_store(&store);

        let files = ScriptFiles::new(&store);
        let script = fs::read_to_string(files.script()).unwrap();
        assert!(script.starts_with("-- photocat script checkpoint 1\n"));
        assert!(script.contains("CREATE TABLE"));
        assert!(script.contains("path VARCHAR(4096)"));
        assert!(script.contains("INSERT INTO \"sequences\" (rowid,\"name\",\"next_value\") VALUES(1,'files',1);"));
        assert_eq!(fs::read_to_string(files.log()).unwrap(), "-- photocat log checkpoint 1\n");

        let properties = read_properties(&files).unwrap().unwrap();
        assert_eq!(properties.version, CURRENT_SCHEMA_VERSION);
        assert!(files.staging().iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_commit_appends_to_log_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let files = ScriptFiles::new(&store);
        let mut handle = open_store(&store);
        let script_before = fs::read(files.script()).unwrap();

        insert(&mut handle, "/photos/a.jpg").unwrap();
        insert(&mut handle, "/photos/b.jpg").unwrap();

        assert_eq!(fs::read(files.script()).unwrap(), script_before);
        let log = fs::read_to_string(files.log()).unwrap();
        assert!(log.starts_with("-- photocat log checkpoint 1\n-- tx "));
        assert!(log.contains("'/photos/a.jpg'"));
        assert!(log.contains("'/photos/b.jpg'"));
        assert_eq!(log.matches("-- tx ").count(), 2);
    }

    #[test]
    fn test_log_replays_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let copy = dir.path().join("copy");
        {
            let mut handle = open_store(&store);
            insert(&mut handle, "/photos/it's.jpg").unwrap();
            insert(&mut handle, "/photos/b.jpg").unwrap();
            let tx = handle.begin_transaction().unwrap();
            tx.conn()
                .execute("DELETE FROM files WHERE path = '/photos/b.jpg'", [])
                .unwrap();
            tx.commit().unwrap();
            snapshot(&store, &copy);
        }

        let mut handle = open_store(&copy);
        assert_eq!(paths(&handle), vec!["/photos/it's.jpg"]);
        // the identity sequence came back with the rows
        assert_eq!(insert(&mut handle, "/photos/c.jpg").unwrap(), 3);
    }

    #[test]
    fn test_close_folds_log_into_script() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let files = ScriptFiles::new(&store);
        {
            let mut handle = open_store(&store);
            insert(&mut handle, "/photos/a.jpg").unwrap();
        }

        let script = fs::read_to_string(files.script()).unwrap();
        assert!(script.starts_with("-- photocat script checkpoint 2\n"));
        assert!(script.contains("'/photos/a.jpg'"));
        assert_eq!(fs::read_to_string(files.log()).unwrap(), "-- photocat log checkpoint 2\n");

        let handle = open_script_store(&store, OpenMode::ReadOnly, LOG_CHECKPOINT_BYTES).unwrap();
        assert_eq!(paths(&handle), vec!["/photos/a.jpg"]);
    }

    #[test]
    fn test_damaged_log_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let copy = dir.path().join("copy");
        {
            let mut handle = open_store(&store);
            insert(&mut handle, "/photos/a.jpg").unwrap();
            snapshot(&store, &copy);
        }

        let log_path = ScriptFiles::new(&copy).log();
        let intact = fs::read(&log_path).unwrap();
        let body = "DELETE FROM \"files\" WHERE rowid = 1;\n";
        let forged = format!("-- tx {} {}\n{}", body.len(), "0".repeat(64), body);
        let mut damaged = intact.clone();
        damaged.extend_from_slice(forged.as_bytes());
        damaged.extend_from_slice(b"-- tx 500 abc\nINSERT INTO");
        fs::write(&log_path, damaged).unwrap();

        let handle = open_store(&copy);
        assert_eq!(paths(&handle), vec!["/photos/a.jpg"]);
        assert_eq!(fs::read(&log_path).unwrap(), intact);
    }

    #[test]
    fn test_log_of_another_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let files = ScriptFiles::new(&store);
        drop(open_store(&store));

        let block = format_block("INSERT INTO \"files\" (rowid,\"id\",\"path\") VALUES(9,9,'/stale.jpg');\n");
        fs::write(files.log(), format!("{}0\n{}", LOG_HEADER, block)).unwrap();
        {
            let handle = open_script_store(&store, OpenMode::ReadOnly, LOG_CHECKPOINT_BYTES).unwrap();
            assert!(paths(&handle).is_empty());
        }

        fs::write(files.log(), format!("{}1\n{}", LOG_HEADER, block)).unwrap();
        let handle = open_script_store(&store, OpenMode::ReadOnly, LOG_CHECKPOINT_BYTES).unwrap();
        assert_eq!(paths(&handle), vec!["/stale.jpg"]);
    }

    #[test]
    fn test_log_size_limit_forces_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let files = ScriptFiles::new(&store);
        let mut handle = open_with_limit(&store, 0);

        insert(&mut handle, "/photos/a.jpg").unwrap();

        let script = fs::read_to_string(files.script()).unwrap();
        assert!(script.starts_with("-- photocat script checkpoint 2\n"));
        assert!(script.contains("'/photos/a.jpg'"));
        assert_eq!(fs::read_to_string(files.log()).unwrap(), "-- photocat log checkpoint 2\n");
    }

    #[test]
    fn test_failed_properties_write_fails_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        let files = ScriptFiles::new(&store);
        let mut handle = open_with_limit(&store, 0);
        let script_before = fs::read(files.script()).unwrap();

        // a directory in the way makes the staged properties file uncreatable
        fs::create_dir(files.properties_new()).unwrap();
        assert!(insert(&mut handle, "/photos/a.jpg").is_err());
        assert!(paths(&handle).is_empty());
        assert_eq!(fs::read(files.script()).unwrap(), script_before);

        fs::remove_dir(files.properties_new()).unwrap();
        insert(&mut handle, "/photos/b.jpg").unwrap();
        drop(handle);

        let handle = open_script_store(&store, OpenMode::ReadOnly, LOG_CHECKPOINT_BYTES).unwrap();
        assert_eq!(paths(&handle), vec!["/photos/b.jpg"]);
    }

    #[test]
    fn test_uncommitted_rows_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        {
            let mut handle = open_store(&store);
            let tx = handle.begin_transaction().unwrap();
            SCRIPT_DIALECT
                .upsert_file(tx.conn(), &FileRecord::new("/photos/a.jpg"))
                .unwrap();
            tx.rollback().unwrap();
            insert(&mut handle, "/photos/b.jpg").unwrap();

            let log = fs::read_to_string(ScriptFiles::new(&store).log()).unwrap();
            assert!(!log.contains("/photos/a.jpg"));
        }
        let script = fs::read_to_string(ScriptFiles::new(&store).script()).unwrap();
        assert!(!script.contains("/photos/a.jpg"));
        assert!(script.contains("/photos/b.jpg"));
    }

    #[test]
    fn test_stale_staging_files_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("legacy");
        drop(open_store(&store));
        let files = ScriptFiles::new(&store);
        for staged in files.staging() {
            fs::write(staged, "garbage").unwrap();
        }
        drop(open_store(&store));
        assert!(files.staging().iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_parse_log_stops_at_first_bad_block() {
        let header = format!("{}4\n", LOG_HEADER);
        let good = format!("{}{}{}", header, format_block("SELECT 1;\n"), format_block("SELECT 2;\n"));
        let bytes = format!("{}-- tx 3 zz\nSELECT 3;\n", good).into_bytes();

        let contents = parse_log(&bytes, 4).unwrap();
        assert_eq!(contents.blocks, vec!["SELECT 1;\n", "SELECT 2;\n"]);
        assert_eq!(contents.valid_len, good.len() as u64);

        assert!(parse_log(&bytes, 5).is_none());
        assert!(parse_log(b"SELECT 1;\n", 4).is_none());
    }

    #[test]
    fn test_literals() {
        let mut out = String::new();
        push_literal(&mut out, ValueRef::Text(b"o'neil"));
        out.push(' ');
        push_literal(&mut out, ValueRef::Blob(&[0x0a, 0xff]));
        out.push(' ');
        push_literal(&mut out, ValueRef::Real(f64::NAN));
        out.push(' ');
        push_literal(&mut out, ValueRef::Real(2.0));
        assert_eq!(out, "'o''neil' X'0AFF' NULL 2.0");
    }
}
