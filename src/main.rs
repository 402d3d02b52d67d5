//! photocat - catalog storage maintenance: backend migration, store
//! inspection and thumbnail cache upkeep.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use photocat::config::{Config, CONFIG_ENV};
use photocat::db::{BackendDescriptor, Migrator, Repository, RepositoryOptions};
use photocat::logging;
use photocat::thumbnails::ThumbnailCache;

#[derive(Parser)]
#[command(name = "photocat")]
#[command(about = "Photo catalog storage tools")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every record from one backend into a fresh one and verify it
    Migrate {
        /// Source store, e.g. script:/data/legacy
        #[arg(long)]
        from: BackendDescriptor,

        /// Target store, e.g. sqlite:/data/catalog.db
        #[arg(long)]
        to: BackendDescriptor,

        /// Records per target transaction [default: from config]
        #[arg(long)]
        batch_size: Option<usize>,

        /// Delete whatever is stored at the target before migrating
        #[arg(long)]
        force: bool,

        /// Make the target the active backend in the config file on success
        #[arg(long)]
        activate: bool,

        /// Print the migration report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show schema version and row counts of a store
    Info {
        /// Store to inspect [default: the configured backend]
        #[arg(long)]
        storage: Option<BackendDescriptor>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Thumbnail cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and size
    Stats,
    /// Vacuum the index and delete unreferenced blob files
    Compact,
    /// Remove every cached thumbnail
    Clear,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = logging::init(Some(Config::config_dir().join("logs")), cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&config_path)?;

    match cli.command {
        Commands::Migrate {
            from,
            to,
            batch_size,
            force,
            activate,
            json,
        } => {
            let batch_size = batch_size.unwrap_or(config.migration.batch_size);
            let (tx, rx) = mpsc::channel();
            let migrator = Migrator::new(from, to.clone())
                .with_batch_size(batch_size)
                .with_replace_target(force)
                .with_progress(tx);

            let show_progress = !json;
            let printer = std::thread::spawn(move || {
                for progress in rx {
                    if show_progress {
                        eprintln!(
                            "batch {}: {}/{} records",
                            progress.batch, progress.records_done, progress.records_total
                        );
                    }
                }
            });
            let result = migrator.run();
            drop(migrator);
            let _ = printer.join();
            let report = result.context("Migration failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Migrated {} records in {} batches ({} ms)",
                    report.records, report.batches, report.elapsed_ms
                );
                for (table, count) in report.counts.as_pairs() {
                    println!("  {:<14} {}", table, count);
                }
            }

            if activate {
                config.storage.activate(&to);
                config.save_to(&config_path)?;
                println!("Active backend is now {}", to);
            }
        }

        Commands::Info { storage, json } => {
            let descriptor = storage.unwrap_or_else(|| config.storage.descriptor());
            let repo = Repository::open_read_only(&descriptor, RepositoryOptions::from(&config.repository))
                .with_context(|| format!("Cannot open {}", descriptor))?;
            let version = repo.schema_version()?;
            let counts = repo.table_counts()?;
            let state = repo.migration_state()?;

            if json {
                let value = serde_json::json!({
                    "storage": descriptor.to_string(),
                    "schema_version": version,
                    "migration_state": state,
                    "counts": counts,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Storage:        {}", descriptor);
                println!("Schema version: {}", version);
                if let Some(state) = state {
                    println!("Migration:      {}", state.as_str());
                }
                for (table, count) in counts.as_pairs() {
                    println!("  {:<14} {}", table, count);
                }
            }
        }

        Commands::Cache { action } => {
            let cache = ThumbnailCache::from_config(&config.thumbnails);
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats();
                    println!("Cache:    {}", stats.root.display());
                    println!("Entries:  {}", stats.entries);
                    println!("Size:     {} / {} bytes", stats.total_bytes, stats.max_bytes);
                    if stats.degraded {
                        println!("Status:   degraded");
                    }
                }
                CacheAction::Compact => {
                    let removed = cache.compact()?;
                    println!("Removed {} orphaned blob files", removed);
                }
                CacheAction::Clear => {
                    cache.clear()?;
                    println!("Thumbnail cache cleared");
                }
            }
        }
    }

    Ok(())
}
