//! CLI integration tests for photocat.
//!
//! Every test points `--config` into a temp dir so nothing touches the
//! user's real catalog or cache.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use photocat::{BackendDescriptor, FileRecord, Repository, RepositoryOptions};

fn cmd() -> Command {
    Command::cargo_bin("photocat").unwrap()
}

/// Config whose every path lives under `dir`.
fn config_in(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let contents = format!(
        "[storage]\nbackend = \"script\"\nsqlite_path = {:?}\nscript_dir = {:?}\n\n[thumbnails]\npath = {:?}\nmax_size_bytes = 4096\n",
        dir.join("catalog.db").display().to_string(),
        dir.join("legacy").display().to_string(),
        dir.join("thumbs").display().to_string(),
    );
    fs::write(&path, contents).unwrap();
    path
}

fn seed_script(dir: &Path, files: usize) -> BackendDescriptor {
    let desc = BackendDescriptor::script(dir.join("legacy"));
    let repo = Repository::open(&desc, RepositoryOptions::default()).unwrap();
    repo.write(|w| {
        for i in 0..files {
            let record = FileRecord::new(format!("/photos/{}.jpg", i))
                .with_rating(4)
                .with_keyword("holiday")
                .with_album("Trip");
            w.upsert_file_record(&record)?;
        }
        Ok(())
    })
    .unwrap();
    desc
}

// =============================================================================
// Help
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("cache"));
}

#[test]
fn test_migrate_subcommand_help() {
    cmd()
        .args(["migrate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--from"))
        .stdout(predicate::str::contains("--to"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--activate"));
}

#[test]
fn test_migrate_requires_from_and_to() {
    cmd()
        .arg("migrate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from"));
}

// =============================================================================
// Migrate
// =============================================================================

#[test]
fn test_migrate_script_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let source = seed_script(dir.path(), 12);
    let target = format!("sqlite:{}", dir.path().join("catalog.db").display());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", &source.to_string(), "--to", &target, "--batch-size", "5", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"records\": 12"))
        .stdout(predicate::str::contains("\"batches\": 3"));

    let repo = Repository::open(&BackendDescriptor::sqlite(dir.path().join("catalog.db")), RepositoryOptions::default())
        .unwrap();
    assert_eq!(repo.count_files().unwrap(), 12);
    assert_eq!(repo.album_files("Trip").unwrap().len(), 12);
}

#[test]
fn test_migrate_activate_rewrites_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let source = seed_script(dir.path(), 3);
    let new_db = dir.path().join("moved.db");
    let target = format!("sqlite:{}", new_db.display());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", &source.to_string(), "--to", &target, "--activate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Migrated 3 records"))
        .stdout(predicate::str::contains("Active backend is now"));

    let saved = fs::read_to_string(&config).unwrap();
    assert!(saved.contains("backend = \"sqlite\""));
    assert!(saved.contains("moved.db"));
}

#[test]
fn test_migrate_into_non_empty_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let source = seed_script(dir.path(), 2);
    let target = BackendDescriptor::sqlite(dir.path().join("catalog.db"));
    {
        let repo = Repository::open(&target, RepositoryOptions::default()).unwrap();
        repo.upsert_file_record(&FileRecord::new("/other.jpg")).unwrap();
    }

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", &source.to_string(), "--to", &target.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not empty"));

    // --force clears it first
    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", &source.to_string(), "--to", &target.to_string(), "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Migrated 2 records"));
}

#[test]
fn test_force_never_removes_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let db = dir.path().join("catalog.db");
    {
        let repo = Repository::open(&BackendDescriptor::sqlite(&db), RepositoryOptions::default()).unwrap();
        repo.upsert_file_record(&FileRecord::new("/keep.jpg")).unwrap();
    }
    let from = format!("sqlite:{}", db.display());

    for to in [from.clone(), format!("sqlite:{}", dir.path().join(".").join("catalog.db").display())] {
        cmd()
            .arg("--config")
            .arg(&config)
            .args(["migrate", "--from", &from, "--to", &to, "--force"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("same store"));
    }

    let repo = Repository::open(&BackendDescriptor::sqlite(&db), RepositoryOptions::default()).unwrap();
    assert_eq!(repo.count_files().unwrap(), 1);
}

#[test]
fn test_migrate_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let source = format!("script:{}", dir.path().join("nowhere").display());
    let target = format!("sqlite:{}", dir.path().join("catalog.db").display());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", &source, "--to", &target])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_bad_descriptor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["migrate", "--from", "oracle:/tmp/x", "--to", "sqlite:/tmp/y.db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle"));
}

// =============================================================================
// Info and cache
// =============================================================================

#[test]
fn test_info_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    seed_script(dir.path(), 4);

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["info", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"files\": 4"))
        .stdout(predicate::str::contains("\"schema_version\""));
}

#[test]
fn test_cache_stats_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["cache", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries:  0"))
        .stdout(predicate::str::contains("/ 4096 bytes"));

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleared"));
}
