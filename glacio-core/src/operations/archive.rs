use super::bundle::{BUNDLE_OBJECT_NAME, BundlingConfig, TransferUnit, build_bundle, plan_units};
use crate::checksum::DigestReader;
use crate::error::{GlacioError, Result};
use crate::model::{ArchiveEntry, BundleMember, EntryKind, FileMetadata, IntegrityState, timestamp_now};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use crate::policy::{EligibilityDecision, EligibilityInput, IneligibleReason, Policy, decide};
use crate::retry::RetryPolicy;
use crate::storage::{IndexStore, PutMode};
use crate::tier::{ObjectHead, TierClient, TierError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Note left behind when local copies are freed; never archived itself.
pub const WHERE_DID_THE_FILES_GO: &str = "Where-did-the-files-go.txt";

const SNAPSHOT_DIR: &str = ".snapshot";

fn default_key_prefix() -> String {
    "glacio".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("glacio-staging")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per unit, covering transient errors and digest mismatches.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Mark earlier entries for a re-archived file as superseded.
    #[serde(default)]
    pub supersede: bool,
    #[serde(default)]
    pub archived_by: Option<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            staging_dir: default_staging_dir(),
            supersede: false,
            archived_by: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOperationRequest {
    pub target: PathBuf,
    pub policy: Policy,
    pub bundling: BundlingConfig,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum UnitOutcome {
    Archived(ArchiveEntry),
    Skipped {
        path: PathBuf,
        reason: IneligibleReason,
    },
    Failed {
        path: PathBuf,
        remote_key: Option<String>,
        error: GlacioError,
    },
    Cancelled {
        path: PathBuf,
    },
}

impl UnitOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Archived(entry) => Path::new(&entry.origin_path),
            Self::Skipped { path, .. } | Self::Failed { path, .. } | Self::Cancelled { path } => path,
        }
    }
}

#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub outcomes: Vec<UnitOutcome>,
}

impl ArchiveReport {
    pub fn archived(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Archived(entry) => Some(entry),
            _ => None,
        })
    }

    pub fn archived_count(&self) -> usize {
        self.archived().count()
    }

    pub fn archived_bytes(&self) -> u64 {
        self.archived().map(|entry| entry.size_bytes).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { .. }))
    }

    pub fn skipped_for(&self, reason: IneligibleReason) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { reason: r, .. } if *r == reason))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed { .. }))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Cancelled { .. }))
    }

    fn count(&self, predicate: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(o)).count()
    }
}

/// Strictly increasing commit times. Bundles of one directory share an origin
/// path and may commit within the same microsecond.
#[derive(Default)]
struct CommitClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl CommitClock {
    fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let mut now = timestamp_now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + ChronoDuration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[derive(Clone)]
pub struct ArchiveOperation {
    index: Arc<dyn IndexStore>,
    tier: Arc<dyn TierClient>,
    options: ArchiveOptions,
    clock: Arc<CommitClock>,
}

impl ArchiveOperation {
    pub fn new(
        index: Arc<dyn IndexStore>,
        tier: Arc<dyn TierClient>,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            index,
            tier,
            options,
            clock: Arc::new(CommitClock::default()),
        }
    }

    pub async fn run(&self, request: ArchiveOperationRequest) -> Result<ArchiveReport> {
        let ArchiveOperationRequest {
            target,
            policy,
            bundling,
            cancel,
        } = request;

        tokio::fs::metadata(&target).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                GlacioError::Policy(format!("archive target {} does not exist", target.display()))
            }
            _ => GlacioError::Io(e),
        })?;

        let (files, walk_errors) = enumerate_files(target.clone()).await?;
        tracing::info!(
            "Found {} files under {}",
            files.len(),
            target.display()
        );

        let mut report = ArchiveReport::default();
        report.outcomes.extend(walk_errors);

        let now = timestamp_now();
        let mut eligible = Vec::new();
        for file in files {
            let already_archived = self.index.is_path_archived(&file.path.to_string_lossy())?;
            let input = EligibilityInput {
                metadata: &file,
                already_archived,
                now,
            };
            match decide(&input, &policy) {
                EligibilityDecision::Eligible => eligible.push(file),
                EligibilityDecision::Ineligible(reason) => {
                    tracing::debug!("Skipping {}: {}", file.path.display(), reason);
                    report.outcomes.push(UnitOutcome::Skipped {
                        path: file.path,
                        reason,
                    });
                }
            }
        }

        let units = plan_units(eligible, &bundling);
        tracing::info!("Planned {} transfer units", units.len());

        let results: Vec<Result<UnitOutcome>> = futures_util::stream::iter(units)
            .map(|unit| self.run_unit(unit, &cancel))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            report.outcomes.push(result?);
        }
        report
            .outcomes
            .sort_by(|a, b| a.path().cmp(b.path()));

        tracing::info!(
            "Archive of {} finished: {} archived ({} bytes), {} skipped, {} failed, {} cancelled",
            target.display(),
            report.archived_count(),
            report.archived_bytes(),
            report.skipped_count(),
            report.failed_count(),
            report.cancelled_count()
        );
        Ok(report)
    }

    /// Only index errors escape as `Err`; everything else becomes an outcome.
    async fn run_unit(&self, unit: TransferUnit, cancel: &CancellationToken) -> Result<UnitOutcome> {
        let origin = unit.origin_path().to_path_buf();
        if cancel.is_cancelled() {
            return Ok(UnitOutcome::Cancelled { path: origin });
        }

        let remote_key = self.remote_key(&unit);
        let (source, members, staged) = match self.prepare_source(&unit, &remote_key).await {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::warn!("Failed to prepare {}: {}", origin.display(), error);
                return Ok(UnitOutcome::Failed {
                    path: origin,
                    remote_key: Some(remote_key),
                    error,
                });
            }
        };

        let uploaded = self.upload_verified(&remote_key, &source).await;

        if let Some(staged) = staged {
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                tracing::warn!("Failed to remove staged bundle {}: {}", staged.display(), e);
            }
        }

        let (digest, size_bytes, head, etag) = match uploaded {
            Ok(verified) => verified,
            Err(error) => {
                tracing::warn!("Failed to archive {} as {}: {}", origin.display(), remote_key, error);
                return Ok(UnitOutcome::Failed {
                    path: origin,
                    remote_key: Some(remote_key),
                    error,
                });
            }
        };

        let kind = match unit {
            TransferUnit::File(_) => EntryKind::File,
            TransferUnit::Bundle { .. } => EntryKind::Bundle,
        };
        let entry = ArchiveEntry {
            remote_key: remote_key.clone(),
            origin_path: origin.to_string_lossy().to_string(),
            kind,
            size_bytes,
            digest,
            archived_at: self.clock.next(),
            storage_tier: head.tier,
            storage_class: head.storage_class,
            restore_expiry: None,
            integrity: IntegrityState::Verified,
            remote_etag: etag,
            archived_by: self.options.archived_by.clone(),
            superseded_at: None,
            members,
        };

        let mode = if self.options.supersede && kind == EntryKind::File {
            PutMode::Supersede
        } else {
            PutMode::Insert
        };
        match self.index.put(&entry, mode) {
            Ok(()) => {}
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                tracing::warn!("Refused to commit {}: {}", entry.remote_key, error);
                return Ok(UnitOutcome::Failed {
                    path: origin,
                    remote_key: Some(remote_key),
                    error,
                });
            }
        }

        tracing::info!(
            "Archived {} as {} ({} bytes, {})",
            entry.origin_path,
            entry.remote_key,
            entry.size_bytes,
            entry.storage_tier
        );
        Ok(UnitOutcome::Archived(entry))
    }

    fn remote_key(&self, unit: &TransferUnit) -> String {
        let prefix = self.options.key_prefix.trim_matches('/');
        let id = ulid::Ulid::new().to_string();
        let origin = unit.origin_path().to_string_lossy();
        let relative = origin.trim_start_matches('/');

        let mut key = if prefix.is_empty() {
            format!("{}/{}", id, relative)
        } else {
            format!("{}/{}/{}", prefix, id, relative)
        };
        if matches!(unit, TransferUnit::Bundle { .. }) {
            key = format!("{}/{}", key.trim_end_matches('/'), BUNDLE_OBJECT_NAME);
        }
        key
    }

    /// Returns the path to upload from, bundle members, and a staged file to clean up.
    async fn prepare_source(
        &self,
        unit: &TransferUnit,
        remote_key: &str,
    ) -> Result<(PathBuf, Vec<BundleMember>, Option<PathBuf>)> {
        match unit {
            TransferUnit::File(file) => Ok((file.path.clone(), Vec::new(), None)),
            TransferUnit::Bundle { dir, files } => {
                let staged = self
                    .options
                    .staging_dir
                    .join(format!("{}.tar", crate::compute_hash(remote_key.as_bytes())));
                let dir = dir.clone();
                let files = files.clone();
                let staged_path = staged.clone();
                let members = tokio::task::spawn_blocking(move || {
                    build_bundle(&dir, &files, &staged_path)
                })
                .await
                .map_err(|e| GlacioError::Internal(format!("bundle task failed: {}", e)))?;

                match members {
                    Ok(members) => Ok((staged.clone(), members, Some(staged))),
                    Err(error) => {
                        let _ = tokio::fs::remove_file(&staged).await;
                        Err(error)
                    }
                }
            }
        }
    }

    /// Upload, then confirm the provider holds exactly what was read.
    async fn upload_verified(
        &self,
        remote_key: &str,
        source: &Path,
    ) -> Result<(String, u64, ObjectHead, Option<String>)> {
        let attempts = self.options.retry.attempts();
        let mut attempt = 1;

        loop {
            let file = tokio::fs::File::open(source).await?;
            let mut reader = DigestReader::new(file);

            let failure = match self.tier.upload(remote_key, &mut reader).await {
                Ok(etag) => {
                    let (digest, size) = reader.finish();
                    match self.head_after_upload(remote_key).await {
                        Ok(head) => {
                            let digest_matches = head
                                .remote_digest
                                .as_deref()
                                .is_none_or(|remote| remote.eq_ignore_ascii_case(&digest));
                            if head.size == size && digest_matches {
                                return Ok((digest, size, head, etag));
                            }
                            GlacioError::Integrity {
                                key: remote_key.to_string(),
                                expected: format!("{} ({} bytes)", digest, size),
                                actual: format!(
                                    "{} ({} bytes)",
                                    head.remote_digest.as_deref().unwrap_or("unknown"),
                                    head.size
                                ),
                            }
                        }
                        Err(error) => GlacioError::from_tier(remote_key, error),
                    }
                }
                Err(error) => GlacioError::from_tier(remote_key, error),
            };

            let retryable =
                failure.is_integrity() || matches!(failure, GlacioError::Transient { .. });
            if !retryable || attempt >= attempts {
                if failure.is_integrity() {
                    self.discard_remote(remote_key).await;
                }
                return Err(failure);
            }

            let backoff = self.options.retry.backoff(attempt);
            tracing::warn!(
                "Upload of {} failed verification (attempt {}/{}), retrying in {}ms: {}",
                remote_key,
                attempt,
                attempts,
                backoff.as_millis(),
                failure
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// `head` right after an upload; the object may take a moment to appear.
    async fn head_after_upload(&self, remote_key: &str) -> std::result::Result<ObjectHead, TierError> {
        let attempts = self.options.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.tier.head(remote_key).await {
                Ok(head) => return Ok(head),
                Err(TierError::NotFound(_) | TierError::Transient(_)) if attempt < attempts => {
                    tokio::time::sleep(self.options.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn discard_remote(&self, remote_key: &str) {
        match self.tier.delete(remote_key).await {
            Ok(()) | Err(TierError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Failed to discard unverified object {}: {}", remote_key, e),
        }
    }
}

/// Walk `target` off the runtime. Unreadable entries come back as failures.
async fn enumerate_files(target: PathBuf) -> Result<(Vec<FileMetadata>, Vec<UnitOutcome>)> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let mut failures = Vec::new();

        let walker = WalkDir::new(&target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir() && entry.file_name() == SNAPSHOT_DIR)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    let path = error.path().map(Path::to_path_buf).unwrap_or_else(|| target.clone());
                    tracing::warn!("Cannot read {}: {}", path.display(), error);
                    failures.push(UnitOutcome::Failed {
                        path,
                        remote_key: None,
                        error: GlacioError::Io(error.into()),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() || entry.file_name() == WHERE_DID_THE_FILES_GO {
                continue;
            }

            match entry.metadata() {
                Ok(metadata) => files.push(FileMetadata::from_fs(entry.path(), &metadata)),
                Err(error) => failures.push(UnitOutcome::Failed {
                    path: entry.path().to_path_buf(),
                    remote_key: None,
                    error: GlacioError::Io(error.into()),
                }),
            }
        }

        (files, failures)
    })
    .await
    .map_err(|e| GlacioError::Internal(format!("directory walk failed: {}", e)))
}
