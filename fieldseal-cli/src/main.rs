//! `FieldSeal` CLI tool for key management and column migrations.

#![warn(clippy::pedantic, clippy::nursery)]

mod settings;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fieldseal::audit::{Sample, VerificationReport};
use fieldseal::key_registry::KeyRegistry;
use fieldseal::migration::{CancelFlag, Summary};
use fieldseal::rotation::RotationHandle;
use fieldseal::tooling::MigrationTooling;
use fieldseal_key_file::FileKeySource;
use fieldseal_sqlite::SqliteStore;
use secrecy::ExposeSecret;
use settings::{Settings, DEFAULT_SETTINGS_FILE};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldseal")]
#[command(about = "FieldSeal key management and migration CLI", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, env = "FIELDSEAL_CONFIG", default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the key directory with a first current key
    Keygen {
        /// Version label of the first key
        #[arg(long, default_value = "v1")]
        label: String,
    },
    /// Encrypt legacy plaintext into the encrypted columns
    Backfill(BatchArgs),
    /// Check that stored values are opaque and decrypt
    Verify {
        /// Number of rows to sample per column
        #[arg(long, conflicts_with = "all")]
        sample: Option<NonZeroUsize>,
        /// Check every row
        #[arg(long)]
        all: bool,
    },
    /// Generate a new key and make it current
    Rotate {
        /// Version label of the new key
        #[arg(long)]
        label: String,
    },
    /// Re-encrypt rows still under an old key version
    Drain {
        /// Version being drained
        #[arg(long)]
        from: String,
        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Remove a key version nothing references any more
    Retire {
        /// Version label to retire
        #[arg(long)]
        label: String,
    },
    /// Drop legacy plaintext columns of a table once verified
    Finalize {
        /// Table to finalize
        #[arg(long)]
        table: String,
        /// Confirm the destructive schema change
        #[arg(long)]
        confirm: bool,
    },
    /// Show key versions and how many stored values use each
    Status,
}

#[derive(Args)]
struct BatchArgs {
    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Pause between batches in milliseconds
    #[arg(long)]
    rate_limit_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current batch");
            on_signal.cancel();
        }
    });

    tokio::task::spawn_blocking(move || execute(cli.command, &settings, cancel))
        .await
        .context("command task failed")?
}

fn execute(command: Commands, settings: &Settings, cancel: CancelFlag) -> Result<ExitCode> {
    let engine = &settings.engine;
    match command {
        Commands::Keygen { label } => {
            let source = FileKeySource::init(&settings.key_dir, &label)?;
            let registry = KeyRegistry::from_source(&source)?;
            let key = registry.current()?;
            println!(
                "Initialized {} with key {} ({})",
                settings.key_dir.display(),
                key.label(),
                key.fingerprint()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backfill(args) => {
            let (_, tooling) = open(settings, cancel)?;
            let summary = tooling.run_backfill(
                args.batch_size.unwrap_or(engine.batch_size),
                args.rate_limit_ms.unwrap_or(engine.rate_limit_ms),
            )?;
            print_summary("Backfill", &summary);
            Ok(exit_code(summary.is_clean()))
        }
        Commands::Verify { sample, all } => {
            let (_, tooling) = open(settings, cancel)?;
            let sample = if all {
                Sample::All
            } else {
                Sample::Count(sample.map_or(engine.verify_sample, NonZeroUsize::get))
            };
            let report = tooling.verify(sample)?;
            print_report(&report);
            Ok(exit_code(report.ensure_clean().is_ok()))
        }
        Commands::Rotate { label } => {
            let (source, tooling) = open(settings, cancel)?;
            let keys = source.labels()?;
            if keys.len() > 1 {
                bail!(
                    "previous rotation not retired yet (keys present: {}); drain and retire first",
                    keys.join(", ")
                );
            }
            let key = source.generate(&label)?;
            let handle = match tooling.rotate(&label, key.expose_secret().clone()) {
                Ok(handle) => handle,
                Err(err) => {
                    source.destroy(&label)?;
                    return Err(err.into());
                }
            };
            source.set_current(&label)?;
            println!("Rotated {} -> {}", handle.from(), handle.to());
            println!("Next: fieldseal drain --from {}", handle.from());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Drain { from, batch_size } => {
            let (source, tooling) = open(settings, cancel)?;
            let handle = RotationHandle::new(from, source.current()?);
            let summary = tooling.drain(&handle, batch_size.unwrap_or(engine.batch_size))?;
            print_summary("Drain", &summary);
            let remaining = tooling.references(handle.from())?;
            println!("Values still under {}: {remaining}", handle.from());
            Ok(exit_code(summary.is_clean() && remaining == 0))
        }
        Commands::Retire { label } => {
            let (source, tooling) = open(settings, cancel)?;
            tooling.retire(&label)?;
            source.destroy(&label)?;
            println!("Retired {label}; key material destroyed");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Finalize { table, confirm } => {
            if !confirm {
                bail!("finalize drops plaintext columns of {table}; pass --confirm to proceed");
            }
            let (_, tooling) = open(settings, cancel)?;
            let config = tooling.config();
            let plans: Vec<_> =
                config.columns_for(&table).filter(|p| p.plaintext_column.is_some()).collect();
            if plans.is_empty() {
                bail!("no plaintext columns left for table {table}");
            }
            for plan in plans {
                let finalized = tooling.finalize(plan)?;
                println!(
                    "Dropped {table}.{} ({} rows verified)",
                    finalized.dropped_column, finalized.report.checked
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let (_, tooling) = open(settings, cancel)?;
            let registry = tooling.registry();
            let current = registry.current()?;
            println!("Current key: {} ({})", current.label(), current.fingerprint());
            for label in registry.labels() {
                let version = registry.resolve(&label)?;
                println!(
                    "  {label:<12} {}  created {}  references {}",
                    version.fingerprint(),
                    version.created_at().format("%Y-%m-%d"),
                    tooling.references(&label)?
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open(
    settings: &Settings,
    cancel: CancelFlag,
) -> Result<(FileKeySource, MigrationTooling<SqliteStore>)> {
    let source = FileKeySource::open(&settings.key_dir)
        .context("run `fieldseal keygen` to create the key directory")?;
    let registry = Arc::new(KeyRegistry::from_source(&source)?);
    let store = Arc::new(SqliteStore::open(&settings.database)?);
    let tooling =
        MigrationTooling::with_cancel_flag(store, registry, settings.engine.clone(), cancel)?;
    Ok((source, tooling))
}

fn print_summary(job: &str, summary: &Summary) {
    println!(
        "{job}: total {}, migrated {}, failed {}, skipped {}{}",
        summary.total,
        summary.migrated,
        summary.failed,
        summary.skipped,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    for failure in &summary.failures {
        println!("  {}.{} id={}: {}", failure.table, failure.column, failure.id, failure.reason);
    }
}

fn print_report(report: &VerificationReport) {
    println!(
        "Verify: checked {}, passed {}, failed {} (pass rate {:.2}%)",
        report.checked,
        report.passed,
        report.failures,
        report.pass_rate() * 100.0
    );
    for row in report.failed_rows() {
        println!(
            "  {}.{} id={}: {}",
            row.table,
            row.column,
            row.id,
            row.failure.as_deref().unwrap_or_default()
        );
    }
}

const fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_sample_must_be_positive() {
        assert!(Cli::try_parse_from(["fieldseal", "verify", "--sample", "0"]).is_err());

        let cli = Cli::try_parse_from(["fieldseal", "verify", "--sample", "25"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Verify { sample: Some(n), all: false } if n.get() == 25
        ));
    }

    #[test]
    fn test_finalize_flags() {
        let cli = Cli::try_parse_from(["fieldseal", "finalize", "--table", "clients"]).unwrap();
        assert!(matches!(cli.command, Commands::Finalize { confirm: false, .. }));
    }
}
