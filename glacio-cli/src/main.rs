mod config;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use glacio_core::{
    EntryFilter, EntryLookup, FreeOutcome, Glacio, PollOutcome, RestoreOperationRequest,
    RestoreOutcome, RestoreStatus, SqliteIndexStore, StorageTier, UnitOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "glacio")]
#[command(about = "Archive cold file trees to tiered object storage and restore them")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "glacio.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive eligible files under a directory
    Archive {
        path: PathBuf,

        /// Override the configured minimum file size
        #[arg(long)]
        min_size_bytes: Option<u64>,

        /// Override the configured minimum age in days
        #[arg(long)]
        min_age_days: Option<u32>,

        /// Upload every file individually
        #[arg(long)]
        no_bundle: bool,

        /// Archive files that are already in the index again
        #[arg(long)]
        recheck: bool,
    },
    /// Restore an archived file or bundle by local path or remote key
    Restore {
        target: String,

        /// Write to this path instead of the original location
        #[arg(long)]
        to: Option<PathBuf>,

        /// Issue the request and return without waiting for the tier
        #[arg(long)]
        no_wait: bool,

        /// Replace a differing file at the destination
        #[arg(long)]
        overwrite: bool,
    },
    /// Poll one in-flight restore
    Poll {
        target: String,

        /// Only record the status, never download
        #[arg(long)]
        no_download: bool,
    },
    /// Poll every in-flight restore and revert elapsed copies
    Reconcile {
        #[arg(long)]
        no_download: bool,
    },
    /// List archive entries
    List {
        #[arg(long)]
        tier: Option<StorageTier>,

        #[arg(long)]
        prefix: Option<String>,

        /// Only entries archived at least this many days ago
        #[arg(long)]
        older_than_days: Option<i64>,

        #[arg(long)]
        integrity_failed: bool,

        /// Include superseded entries
        #[arg(long)]
        all: bool,
    },
    /// Summarize the index by tier and restore state
    Status,
    /// Delete local copies of verified archived files
    FreeLocal {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        yes: bool,
    },
    /// Remove the remote object and its index entry
    Delete {
        target: String,

        #[arg(long)]
        yes: bool,
    },
    /// Write the index as JSON lines
    Export {
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glacio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let glacio = match open_engine(&cfg) {
        Ok(glacio) => glacio,
        Err(e) => {
            tracing::error!("Failed to open archive: {:#}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight transfers");
            interrupt.cancel();
        }
    });

    match run_command(&glacio, cli.command, cancel).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn open_engine(cfg: &Config) -> anyhow::Result<Glacio> {
    let index = SqliteIndexStore::open(&cfg.index.path)
        .with_context(|| format!("opening index {}", cfg.index.path.display()))?;
    let tier = cfg.tier_builder().build().context("building tier client")?;
    tracing::info!(
        "Index: {}, storage class: {}",
        cfg.index.path.display(),
        tier.storage_class()
    );
    Ok(Glacio::new(Arc::new(index), tier, cfg.glacio_options())?)
}

/// Returns the process exit code: 0 on success, 2 when some units failed.
async fn run_command(
    glacio: &Glacio,
    command: Commands,
    cancel: CancellationToken,
) -> anyhow::Result<i32> {
    match command {
        Commands::Archive {
            path,
            min_size_bytes,
            min_age_days,
            no_bundle,
            recheck,
        } => {
            let options = glacio.options();
            let mut policy = options.policy.clone();
            if let Some(size) = min_size_bytes {
                policy.min_size_bytes = size;
            }
            if let Some(days) = min_age_days {
                policy.min_age_days = days;
            }
            policy.recheck_existing |= recheck;
            let bundling = if no_bundle {
                glacio_core::BundlingConfig::disabled()
            } else {
                options.bundling.clone()
            };

            let target = absolute(&path)?;
            let report = glacio
                .archive_with(
                    &target,
                    glacio_core::Policy::compile(policy)?,
                    bundling,
                    cancel,
                )
                .await?;

            for outcome in &report.outcomes {
                match outcome {
                    UnitOutcome::Failed {
                        path,
                        remote_key,
                        error,
                    } => println!(
                        "FAILED    {} ({}): {}",
                        path.display(),
                        remote_key.as_deref().unwrap_or("-"),
                        error
                    ),
                    UnitOutcome::Cancelled { path } => {
                        println!("CANCELLED {}", path.display())
                    }
                    _ => {}
                }
            }
            println!(
                "archived {} units ({} bytes), skipped {}, failed {}, cancelled {}",
                report.archived_count(),
                report.archived_bytes(),
                report.skipped_count(),
                report.failed_count(),
                report.cancelled_count()
            );
            Ok(exit_code(report.failed_count() + report.cancelled_count()))
        }
        Commands::Restore {
            target,
            to,
            no_wait,
            overwrite,
        } => {
            let mut request = RestoreOperationRequest::new(lookup_for(&target)?);
            request.destination = to.map(|p| absolute(&p)).transpose()?;
            request.wait = !no_wait;
            request.overwrite = overwrite;
            request.cancel = cancel;

            print_restore(&glacio.restore(request).await?);
            Ok(0)
        }
        Commands::Poll {
            target,
            no_download,
        } => {
            match glacio.poll(&lookup_for(&target)?, !no_download).await? {
                PollOutcome::Idle => println!("no restore in flight for {}", target),
                PollOutcome::Polled(request) => println!(
                    "{} {} (poll {})",
                    request.remote_key, request.status, request.poll_count
                ),
                PollOutcome::Restored(outcome) => print_restore(&outcome),
            }
            Ok(0)
        }
        Commands::Reconcile { no_download } => {
            let report = glacio.reconcile(!no_download, cancel).await?;
            for restore in &report.restores {
                match (&restore.restored_to, &restore.error) {
                    (_, Some(error)) => {
                        println!("ERROR     {}: {}", restore.request.remote_key, error)
                    }
                    (Some(dest), None) => println!(
                        "RESTORED  {} -> {}",
                        restore.request.remote_key,
                        dest.display()
                    ),
                    (None, None) => println!(
                        "{:<9} {}",
                        restore.request.status, restore.request.remote_key
                    ),
                }
            }
            println!(
                "reverted {}, completed {}, waiting {}, failed {}, errors {}",
                report.reverted,
                report.count(RestoreStatus::Completed),
                report.count(RestoreStatus::Pending)
                    + report.count(RestoreStatus::InProgress)
                    + report.count(RestoreStatus::Ready)
                    + report.count(RestoreStatus::Downloading),
                report.count(RestoreStatus::Failed),
                report.errors()
            );
            Ok(exit_code(report.errors()))
        }
        Commands::List {
            tier,
            prefix,
            older_than_days,
            integrity_failed,
            all,
        } => {
            let filter = EntryFilter {
                tier,
                archived_before: older_than_days.map(|days| Utc::now() - Duration::days(days)),
                path_prefix: prefix,
                include_superseded: all,
                integrity_failed_only: integrity_failed,
                ..EntryFilter::default()
            };
            for entry in glacio.list_entries(filter)? {
                println!(
                    "{:<13} {:>12}  {}  {}  {}",
                    entry.storage_tier,
                    entry.size_bytes,
                    entry.archived_at.format("%Y-%m-%d"),
                    entry.origin_path,
                    entry.remote_key
                );
            }
            Ok(0)
        }
        Commands::Status => {
            let report = glacio.report_status()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Commands::FreeLocal { paths, yes } => {
            let paths = paths
                .iter()
                .map(|p| absolute(p))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let report = glacio.free_local(paths, yes).await?;
            for outcome in &report.outcomes {
                match outcome {
                    FreeOutcome::Freed {
                        remote_key, paths, ..
                    } => println!("FREED     {} ({} files)", remote_key, paths.len()),
                    FreeOutcome::Refused { remote_key, reason } => {
                        println!("REFUSED   {}: {}", remote_key, reason)
                    }
                }
            }
            println!("freed {} bytes", report.freed_bytes());
            Ok(exit_code(report.refused_count()))
        }
        Commands::Delete { target, yes } => {
            let entry = glacio.delete_entry(lookup_for(&target)?, yes).await?;
            println!("deleted {} ({})", entry.remote_key, entry.origin_path);
            Ok(0)
        }
        Commands::Export { output, all } => {
            let filter = EntryFilter {
                include_superseded: all,
                ..EntryFilter::default()
            };
            let written = match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    let mut writer = std::io::BufWriter::new(file);
                    glacio.export(filter, &mut writer)?
                }
                None => glacio.export(filter, &mut std::io::stdout().lock())?,
            };
            tracing::info!("Exported {} entries", written);
            Ok(0)
        }
    }
}

fn print_restore(outcome: &RestoreOutcome) {
    match outcome {
        RestoreOutcome::Restored {
            entry,
            destination,
            already_present,
        } => {
            if *already_present {
                println!("{} already present at {}", entry.remote_key, destination.display());
            } else {
                println!("restored {} -> {}", entry.remote_key, destination.display());
            }
        }
        RestoreOutcome::Requested(request) => println!(
            "restore {} of {} is {}; run `glacio poll {}` later",
            request.request_id, request.remote_key, request.status, request.remote_key
        ),
        RestoreOutcome::Expired(request) => println!(
            "gave up waiting for {} after {} polls; run `glacio poll {}` later",
            request.remote_key, request.poll_count, request.remote_key
        ),
    }
}

/// Relative local paths are resolved so they match recorded origin paths.
fn lookup_for(target: &str) -> anyhow::Result<EntryLookup> {
    if target.starts_with('.') || Path::new(target).exists() {
        let path = absolute(Path::new(target))?;
        return Ok(EntryLookup::OriginPath(path.to_string_lossy().into_owned()));
    }
    Ok(EntryLookup::parse(target))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}

fn exit_code(problems: usize) -> i32 {
    if problems == 0 { 0 } else { 2 }
}
