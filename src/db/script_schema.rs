//! DDL for the script engine, written in the HSQLDB column vocabulary.
//! Identity values come from the `sequences` table instead of autoincrement.

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sequences (
    name VARCHAR(64) PRIMARY KEY,
    next_value BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id BIGINT PRIMARY KEY,
    path VARCHAR(4096) NOT NULL UNIQUE,
    size_bytes BIGINT NOT NULL DEFAULT 0,
    modified_at BIGINT NOT NULL DEFAULT 0,
    rating SMALLINT,
    title VARCHAR(1024),
    description VARCHAR(16384),
    gps_latitude DOUBLE,
    gps_longitude DOUBLE,
    camera_make VARCHAR(256),
    camera_model VARCHAR(256),
    taken_at VARCHAR(32)
);

CREATE TABLE IF NOT EXISTS keywords (
    id BIGINT PRIMARY KEY,
    name VARCHAR(256) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_keywords (
    file_id BIGINT NOT NULL REFERENCES files(id),
    keyword_id BIGINT NOT NULL REFERENCES keywords(id),
    PRIMARY KEY (file_id, keyword_id)
);

CREATE TABLE IF NOT EXISTS albums (
    id BIGINT PRIMARY KEY,
    name VARCHAR(256) NOT NULL UNIQUE,
    created_at VARCHAR(32) NOT NULL
);

CREATE TABLE IF NOT EXISTS album_files (
    album_id BIGINT NOT NULL REFERENCES albums(id),
    file_id BIGINT NOT NULL REFERENCES files(id),
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (album_id, file_id)
);

CREATE TABLE IF NOT EXISTS store_properties (
    key VARCHAR(64) PRIMARY KEY,
    value VARCHAR(256) NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_keywords_keyword ON file_keywords(keyword_id);
CREATE INDEX IF NOT EXISTS idx_album_files_file ON album_files(file_id);

INSERT INTO sequences (name, next_value) VALUES ('files', 1);
INSERT INTO sequences (name, next_value) VALUES ('keywords', 1);
INSERT INTO sequences (name, next_value) VALUES ('albums', 1);
"#;

const SCHEMA_V2: &str = r#"
CREATE INDEX IF NOT EXISTS idx_files_rating ON files(rating);
CREATE INDEX IF NOT EXISTS idx_files_taken_rating ON files(taken_at, rating);
"#;

pub const SCRIPT_SCHEMA_STEPS: &[&str] = &[SCHEMA_V1, SCHEMA_V2];
