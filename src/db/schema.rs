//! SQLite DDL, one entry per schema version.

/// Version 1: catalog tables.
const SCHEMA_V1: &str = r#"
-- Files table: one row per tracked file, keyed by absolute path
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    modified_at INTEGER NOT NULL DEFAULT 0,
    rating INTEGER,
    title TEXT,
    description TEXT,
    gps_latitude REAL,
    gps_longitude REAL,
    camera_make TEXT,
    camera_model TEXT,
    taken_at TEXT
);

CREATE TABLE IF NOT EXISTS keywords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_keywords (
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    keyword_id INTEGER NOT NULL REFERENCES keywords(id) ON DELETE CASCADE,
    PRIMARY KEY (file_id, keyword_id)
);

CREATE TABLE IF NOT EXISTS albums (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS album_files (
    album_id INTEGER NOT NULL REFERENCES albums(id) ON DELETE CASCADE,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (album_id, file_id)
);

-- Store-level key/value pairs (migration marker)
CREATE TABLE IF NOT EXISTS store_properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_keywords_keyword ON file_keywords(keyword_id);
CREATE INDEX IF NOT EXISTS idx_album_files_file ON album_files(file_id);
"#;

/// Version 2: indexes for the rating and date filters.
const SCHEMA_V2: &str = r#"
CREATE INDEX IF NOT EXISTS idx_files_rating ON files(rating);
CREATE INDEX IF NOT EXISTS idx_files_taken_rating ON files(taken_at, rating);
"#;

pub const SQLITE_SCHEMA_STEPS: &[&str] = &[SCHEMA_V1, SCHEMA_V2];
