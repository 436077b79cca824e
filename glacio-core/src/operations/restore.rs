use super::bundle::unpack_bundle;
use crate::checksum::{StreamingDigest, digest_file};
use crate::error::{GlacioError, Result};
use crate::model::{
    ArchiveEntry, EntryKind, RestoreRequest, RestoreStatus, StorageTier, timestamp_now,
};
use crate::retry::RetryPolicy;
use crate::storage::{EntryLookup, IndexStore, RestoreBegin, RestoreChange};
use crate::tier::{ProviderRestoreStatus, RestoreSpeed, TierClient, TierError};
use chrono::Duration as ChronoDuration;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PARTIAL_SUFFIX: &str = ".glacio-partial";

/// Upper bound between checks while another caller holds the download.
const CLAIM_WAIT_INTERVAL: Duration = Duration::from_secs(5);

fn default_days() -> u32 {
    30
}

fn default_poll_initial_ms() -> u64 {
    60_000
}

fn default_poll_max_ms() -> u64 {
    15 * 60_000
}

fn default_timeout_secs() -> u64 {
    48 * 3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// How long the provider keeps a restored copy readable.
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default)]
    pub speed: RestoreSpeed,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    /// Overall wait before a request is declared expired.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            days: default_days(),
            speed: RestoreSpeed::default(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RestoreOptions {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms.max(1))
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_initial_ms).max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOperationRequest {
    pub lookup: EntryLookup,
    /// File path for plain entries, directory for bundles. Defaults to the origin.
    pub destination: Option<PathBuf>,
    pub wait: bool,
    pub overwrite: bool,
    pub cancel: CancellationToken,
}

impl RestoreOperationRequest {
    pub fn new(lookup: EntryLookup) -> Self {
        Self {
            lookup,
            destination: None,
            wait: true,
            overwrite: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored {
        entry: ArchiveEntry,
        destination: PathBuf,
        /// The destination already held the archived bytes.
        already_present: bool,
    },
    /// Request issued (or already in flight); bytes not yet local.
    Requested(RestoreRequest),
    /// Waiting timed out. The request stays pollable.
    Expired(RestoreRequest),
}

enum WaitResult {
    Ready(RestoreRequest),
    Failed(RestoreRequest),
    Expired(RestoreRequest),
}

#[derive(Clone)]
pub struct RestoreOperation {
    index: Arc<dyn IndexStore>,
    tier: Arc<dyn TierClient>,
    options: RestoreOptions,
}

impl RestoreOperation {
    pub fn new(
        index: Arc<dyn IndexStore>,
        tier: Arc<dyn TierClient>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            index,
            tier,
            options,
        }
    }

    pub fn options(&self) -> &RestoreOptions {
        &self.options
    }

    pub async fn run(&self, request: RestoreOperationRequest) -> Result<RestoreOutcome> {
        let RestoreOperationRequest {
            lookup,
            destination,
            wait,
            overwrite,
            cancel,
        } = request;

        let mut entry = self.index.get(&lookup)?;
        if !entry.is_trusted() {
            return Err(GlacioError::Policy(format!(
                "{} failed integrity verification and cannot be restored",
                entry.remote_key
            )));
        }

        let now = timestamp_now();
        if entry.restore_elapsed(now) {
            self.index
                .update_tier(&entry.remote_key, StorageTier::Cold, None)?;
            entry.storage_tier = StorageTier::Cold;
            entry.restore_expiry = None;
        }

        let destination = destination.unwrap_or_else(|| PathBuf::from(&entry.origin_path));
        if self.destination_matches(&entry, &destination, overwrite).await? {
            tracing::info!(
                "{} already holds the archived bytes of {}",
                destination.display(),
                entry.remote_key
            );
            return Ok(RestoreOutcome::Restored {
                entry,
                destination,
                already_present: true,
            });
        }

        if entry.is_readable(now) {
            return self.download_and_commit(&entry, &destination, None).await;
        }

        let request = self.begin_request(&entry, &destination).await?;
        if !wait {
            return Ok(RestoreOutcome::Requested(request));
        }

        let destination = PathBuf::from(&request.destination);
        match self.wait_for_ready(&entry, request, &cancel).await? {
            WaitResult::Ready(request) => {
                self.download_and_commit(&entry, &destination, Some(request))
                    .await
            }
            WaitResult::Failed(request) => Err(GlacioError::Permanent {
                key: entry.remote_key.clone(),
                message: request
                    .last_error
                    .unwrap_or_else(|| "restore failed".to_string()),
            }),
            WaitResult::Expired(request) => Ok(RestoreOutcome::Expired(request)),
        }
    }

    /// True when the destination already holds the entry's bytes. Errors when
    /// it holds something else and `overwrite` is off.
    async fn destination_matches(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        overwrite: bool,
    ) -> Result<bool> {
        let targets: Vec<(PathBuf, &str)> = match entry.kind {
            EntryKind::File => vec![(destination.to_path_buf(), entry.digest.as_str())],
            EntryKind::Bundle => entry
                .members
                .iter()
                .map(|member| (destination.join(&member.name), member.digest.as_str()))
                .collect(),
        };

        let mut all_match = true;
        for (path, expected) in targets {
            if !tokio::fs::try_exists(&path).await? {
                all_match = false;
                continue;
            }
            let (digest, _) = digest_file(&path).await?;
            if digest.eq_ignore_ascii_case(expected) {
                continue;
            }
            if !overwrite {
                return Err(GlacioError::Policy(format!(
                    "{} exists with different content; pass overwrite to replace it",
                    path.display()
                )));
            }
            all_match = false;
        }

        Ok(all_match)
    }

    /// Reuse the active request for this entry, or issue a new one.
    async fn begin_request(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
    ) -> Result<RestoreRequest> {
        let candidate = RestoreRequest::new(&entry.remote_key, &destination.to_string_lossy());
        let request = match self.index.begin_restore(&candidate)? {
            RestoreBegin::Existing(existing) => {
                tracing::info!(
                    "Restore of {} already in flight as {} ({})",
                    entry.remote_key,
                    existing.request_id,
                    existing.status
                );
                return Ok(existing);
            }
            RestoreBegin::Created(request) => request,
        };

        let key = entry.remote_key.clone();
        let issued = self
            .options
            .retry
            .run("restore request", || {
                self.tier
                    .request_restore(&key, self.options.days, self.options.speed)
            })
            .await;

        match issued {
            Ok(provider_id) => {
                self.index
                    .update_tier(&entry.remote_key, StorageTier::Restoring, None)?;
                tracing::info!(
                    "Requested restore of {} ({} days, {}), provider id {}",
                    entry.remote_key,
                    self.options.days,
                    self.options.speed,
                    provider_id
                );
                Ok(request)
            }
            Err(error) => {
                self.index.transition_restore(
                    &request.request_id,
                    &RestoreStatus::POLLABLE,
                    &RestoreChange::to(RestoreStatus::Failed).with_error(error.to_string()),
                )?;
                Err(GlacioError::from_tier(&entry.remote_key, error))
            }
        }
    }

    async fn wait_for_ready(
        &self,
        entry: &ArchiveEntry,
        mut request: RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        let deadline = Instant::now() + self.options.timeout();
        let mut interval = self.options.poll_initial();

        loop {
            if matches!(
                request.status,
                RestoreStatus::Downloading | RestoreStatus::Completed
            ) {
                return Ok(WaitResult::Ready(request));
            }

            match self.poll_once(entry, &mut request).await? {
                RestoreStatus::Ready | RestoreStatus::Downloading | RestoreStatus::Completed => {
                    return Ok(WaitResult::Ready(request));
                }
                RestoreStatus::Failed => return Ok(WaitResult::Failed(request)),
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                let change = RestoreChange {
                    status: Some(RestoreStatus::Expired),
                    last_error: request.last_error.clone(),
                    polled: false,
                };
                let transition = self.index.transition_restore(
                    &request.request_id,
                    &RestoreStatus::POLLABLE,
                    &change,
                )?;
                let applied = transition.applied();
                request = transition.into_request();
                if !applied {
                    return Ok(match request.status {
                        RestoreStatus::Failed => WaitResult::Failed(request),
                        RestoreStatus::Expired => WaitResult::Expired(request),
                        _ => WaitResult::Ready(request),
                    });
                }
                tracing::warn!(
                    "Restore of {} not ready after {} polls; marked expired",
                    entry.remote_key,
                    request.poll_count
                );
                return Ok(WaitResult::Expired(request));
            }

            let pause = interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stopped waiting for {}; request stays active", entry.remote_key);
                    return Err(GlacioError::Cancelled);
                }
                _ = tokio::time::sleep(pause) => {}
            }
            interval = (interval * 2).min(self.options.poll_max());
        }
    }

    /// One provider poll. The new status is stored only while the request is
    /// still pollable; `request` is refreshed with the stored row either way.
    pub(crate) async fn poll_once(
        &self,
        entry: &ArchiveEntry,
        request: &mut RestoreRequest,
    ) -> Result<RestoreStatus> {
        let change = match self.tier.poll_restore(&entry.remote_key).await {
            Ok(ProviderRestoreStatus::Pending) => RestoreChange::to(RestoreStatus::Pending),
            Ok(ProviderRestoreStatus::InProgress) => RestoreChange::to(RestoreStatus::InProgress),
            Ok(ProviderRestoreStatus::Ready { .. }) => RestoreChange::to(RestoreStatus::Ready),
            Ok(ProviderRestoreStatus::Failed(reason)) => {
                RestoreChange::to(RestoreStatus::Failed).with_error(reason)
            }
            Err(TierError::Transient(message)) => {
                tracing::warn!("Poll of {} failed transiently: {}", entry.remote_key, message);
                RestoreChange {
                    status: None,
                    last_error: Some(message),
                    polled: false,
                }
            }
            Err(error) => RestoreChange::to(RestoreStatus::Failed).with_error(error.to_string()),
        };

        let transition = self.index.transition_restore(
            &request.request_id,
            &RestoreStatus::POLLABLE,
            &change.polled(),
        )?;
        let applied = transition.applied();
        *request = transition.into_request();

        if applied && request.status == RestoreStatus::Failed {
            self.index
                .update_tier(&entry.remote_key, revert_tier(entry), None)?;
            tracing::warn!(
                "Restore of {} failed: {}",
                entry.remote_key,
                request.last_error.as_deref().unwrap_or("unknown")
            );
        } else {
            tracing::debug!(
                "Restore of {} is {} after {} polls",
                entry.remote_key,
                request.status,
                request.poll_count
            );
        }

        Ok(request.status)
    }

    /// Download a ready restore. Only the caller that moves the request from
    /// READY to DOWNLOADING fetches the object; everyone else waits for that
    /// download and returns its outcome.
    pub(crate) async fn download_and_commit(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        request: Option<RestoreRequest>,
    ) -> Result<RestoreOutcome> {
        let Some(mut request) = request else {
            return self.download(entry, destination, None).await;
        };

        let deadline = Instant::now() + self.options.timeout();
        let interval = self.options.poll_initial().min(CLAIM_WAIT_INTERVAL);
        loop {
            let claim = self.index.transition_restore(
                &request.request_id,
                &[RestoreStatus::Ready],
                &RestoreChange::to(RestoreStatus::Downloading),
            )?;
            if claim.applied() {
                return self
                    .download(entry, destination, Some(claim.into_request()))
                    .await;
            }

            request = claim.into_request();
            match request.status {
                RestoreStatus::Completed => {
                    let restored = self
                        .index
                        .get(&EntryLookup::RemoteKey(entry.remote_key.clone()))?;
                    return Ok(RestoreOutcome::Restored {
                        entry: restored,
                        destination: PathBuf::from(&request.destination),
                        already_present: false,
                    });
                }
                RestoreStatus::Failed => {
                    return Err(GlacioError::Permanent {
                        key: entry.remote_key.clone(),
                        message: request
                            .last_error
                            .unwrap_or_else(|| "restore failed".to_string()),
                    });
                }
                RestoreStatus::Downloading => {
                    tracing::debug!(
                        "Download of {} is claimed elsewhere; waiting",
                        entry.remote_key
                    );
                }
                _ => {
                    // A concurrent poll moved the request off READY; ask the provider again.
                    if self.poll_once(entry, &mut request).await? == RestoreStatus::Ready {
                        continue;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(RestoreOutcome::Requested(request));
            }
            tokio::time::sleep(interval).await;
            request = self.index.get_restore(&request.request_id)?;
        }
    }

    /// Fetch, verify, place, and record the tier change. `claim` is the
    /// request this caller holds in DOWNLOADING, if any.
    async fn download(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        claim: Option<RestoreRequest>,
    ) -> Result<RestoreOutcome> {
        let partial = partial_path(entry, destination, &ulid::Ulid::new().to_string())?;
        let placed = self.fetch_and_place(entry, destination, &partial).await;

        let size = match placed {
            Ok(size) => size,
            Err(error) if error.is_integrity() => {
                self.index.mark_integrity_failed(&entry.remote_key)?;
                let current = self
                    .index
                    .get(&EntryLookup::RemoteKey(entry.remote_key.clone()))?;
                if current.storage_tier == StorageTier::Restoring {
                    self.index
                        .update_tier(&entry.remote_key, StorageTier::Cold, None)?;
                }
                if let Some(claim) = claim {
                    self.index.transition_restore(
                        &claim.request_id,
                        &[RestoreStatus::Downloading],
                        &RestoreChange::to(RestoreStatus::Failed)
                            .with_error("downloaded bytes failed verification"),
                    )?;
                }
                return Err(error);
            }
            Err(error) => {
                if let Some(claim) = claim {
                    // Hand the download back so another caller can retry it.
                    self.index.transition_restore(
                        &claim.request_id,
                        &[RestoreStatus::Downloading],
                        &RestoreChange::to(RestoreStatus::Ready).with_error(error.to_string()),
                    )?;
                }
                return Err(error);
            }
        };

        let mut restored = entry.clone();
        if matches!(entry.storage_tier, StorageTier::Cold | StorageTier::Restoring) {
            let expiry = timestamp_now() + ChronoDuration::days(i64::from(self.options.days));
            self.index
                .update_tier(&entry.remote_key, StorageTier::RestoredTemp, Some(expiry))?;
            restored.storage_tier = StorageTier::RestoredTemp;
            restored.restore_expiry = Some(expiry);
        }

        if let Some(claim) = claim {
            self.index.transition_restore(
                &claim.request_id,
                &[RestoreStatus::Downloading],
                &RestoreChange::to(RestoreStatus::Completed),
            )?;
        }

        tracing::info!(
            "Restored {} to {} ({} bytes)",
            entry.remote_key,
            destination.display(),
            size
        );
        Ok(RestoreOutcome::Restored {
            entry: restored,
            destination: destination.to_path_buf(),
            already_present: false,
        })
    }

    /// Returns the verified size. The partial file never outlives a failure.
    async fn fetch_and_place(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        partial: &Path,
    ) -> Result<u64> {
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let fetched = self.fetch_to(&entry.remote_key, partial).await;
        let (digest, size) = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                let _ = tokio::fs::remove_file(partial).await;
                return Err(error);
            }
        };

        if !digest.eq_ignore_ascii_case(&entry.digest) || size != entry.size_bytes {
            let _ = tokio::fs::remove_file(partial).await;
            tracing::error!(
                "Integrity failure restoring {}: expected {}, got {} ({} bytes)",
                entry.remote_key,
                entry.digest,
                digest,
                size
            );
            return Err(GlacioError::Integrity {
                key: entry.remote_key.clone(),
                expected: entry.digest.clone(),
                actual: digest,
            });
        }

        match entry.kind {
            EntryKind::File => {
                if let Err(error) = tokio::fs::rename(partial, destination).await {
                    let _ = tokio::fs::remove_file(partial).await;
                    return Err(error.into());
                }
            }
            EntryKind::Bundle => {
                let bundle = partial.to_path_buf();
                let dest_dir = destination.to_path_buf();
                let unpacked =
                    tokio::task::spawn_blocking(move || unpack_bundle(&bundle, &dest_dir))
                        .await
                        .map_err(|e| GlacioError::Internal(format!("unpack task failed: {}", e)));
                let _ = tokio::fs::remove_file(partial).await;
                unpacked??;
            }
        }

        Ok(size)
    }

    /// Stream the object into `partial`, hashing on the way. Transient errors,
    /// including ones mid-stream, restart the download.
    async fn fetch_to(&self, remote_key: &str, partial: &Path) -> Result<(String, u64)> {
        let attempts = self.options.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.fetch_once(remote_key, partial).await {
                Ok(fetched) => return Ok(fetched),
                Err(TierOrIo::Tier(TierError::Transient(message))) if attempt < attempts => {
                    let backoff = self.options.retry.backoff(attempt);
                    tracing::warn!(
                        "Download of {} failed (attempt {}/{}), retrying in {}ms: {}",
                        remote_key,
                        attempt,
                        attempts,
                        backoff.as_millis(),
                        message
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(TierOrIo::Tier(error)) => return Err(GlacioError::from_tier(remote_key, error)),
                Err(TierOrIo::Io(error)) => return Err(GlacioError::Io(error)),
            }
        }
    }

    async fn fetch_once(
        &self,
        remote_key: &str,
        partial: &Path,
    ) -> std::result::Result<(String, u64), TierOrIo> {
        let mut stream = self
            .tier
            .download(remote_key)
            .await
            .map_err(TierOrIo::Tier)?;
        let mut file = tokio::fs::File::create(partial).await.map_err(TierOrIo::Io)?;
        let mut digest = StreamingDigest::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(TierOrIo::Tier)?;
            digest.update(&chunk);
            file.write_all(&chunk).await.map_err(TierOrIo::Io)?;
        }
        file.flush().await.map_err(TierOrIo::Io)?;
        file.sync_all().await.map_err(TierOrIo::Io)?;

        let len = digest.len();
        Ok((digest.finish(), len))
    }
}

enum TierOrIo {
    Tier(TierError),
    Io(std::io::Error),
}

/// Tier an entry falls back to when its restore fails.
fn revert_tier(entry: &ArchiveEntry) -> StorageTier {
    match entry.storage_tier {
        StorageTier::Standard => StorageTier::Standard,
        _ => StorageTier::Cold,
    }
}

/// Download target beside the final destination, so the rename stays on one
/// filesystem. `attempt` keeps concurrent downloads apart.
fn partial_path(entry: &ArchiveEntry, destination: &Path, attempt: &str) -> Result<PathBuf> {
    match entry.kind {
        EntryKind::File => {
            let name = destination.file_name().ok_or_else(|| {
                GlacioError::Policy(format!("invalid restore destination {}", destination.display()))
            })?;
            Ok(destination.with_file_name(format!(
                ".{}.{}{}",
                name.to_string_lossy(),
                attempt,
                PARTIAL_SUFFIX
            )))
        }
        EntryKind::Bundle => Ok(destination.join(format!(
            ".glacio-bundle.{}{}",
            attempt, PARTIAL_SUFFIX
        ))),
    }
}
