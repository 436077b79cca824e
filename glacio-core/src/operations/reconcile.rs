use super::list_entries::revert_elapsed_restores;
use super::restore::{RestoreOperation, RestoreOutcome};
use crate::error::{GlacioError, Result};
use crate::model::{RestoreRequest, RestoreStatus, timestamp_now};
use crate::storage::{EntryLookup, IndexStore, RestoreChange};
use chrono::Duration as ChronoDuration;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A download claim older than this is assumed abandoned.
const DOWNLOAD_CLAIM_TTL_HOURS: i64 = 12;

#[derive(Debug, Clone)]
pub struct ReconcileOperationRequest {
    /// Download and place requests that turned ready.
    pub download_ready: bool,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct ReconciledRestore {
    pub request: RestoreRequest,
    pub restored_to: Option<PathBuf>,
    pub error: Option<GlacioError>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Temporary copies whose retention elapsed and went back to COLD.
    pub reverted: usize,
    /// Abandoned download claims handed back for another attempt.
    pub released: usize,
    pub restores: Vec<ReconciledRestore>,
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn count(&self, status: RestoreStatus) -> usize {
        self.restores
            .iter()
            .filter(|r| r.request.status == status)
            .count()
    }

    pub fn errors(&self) -> usize {
        self.restores.iter().filter(|r| r.error.is_some()).count()
    }
}

/// Result of polling a single entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// No restore was in flight for the entry.
    Idle,
    Polled(RestoreRequest),
    Restored(RestoreOutcome),
}

/// Drives every in-flight restore forward by one poll.
#[derive(Clone)]
pub struct ReconcileOperation {
    index: Arc<dyn IndexStore>,
    restore: RestoreOperation,
    concurrency: usize,
}

impl ReconcileOperation {
    pub fn new(index: Arc<dyn IndexStore>, restore: RestoreOperation, concurrency: usize) -> Self {
        Self {
            index,
            restore,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self, request: ReconcileOperationRequest) -> Result<ReconcileReport> {
        let ReconcileOperationRequest {
            download_ready,
            cancel,
        } = request;

        let mut report = ReconcileReport {
            reverted: revert_elapsed_restores(&self.index, timestamp_now())?,
            released: self.release_stale_claims()?,
            ..ReconcileReport::default()
        };

        let active = self.index.list_restores(&RestoreStatus::ACTIVE)?;
        tracing::info!("Reconciling {} active restores", active.len());

        let results: Vec<Result<Option<ReconciledRestore>>> = futures_util::stream::iter(active)
            .map(|request| self.advance(request, download_ready, &cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            match result? {
                Some(reconciled) => report.restores.push(reconciled),
                None => report.skipped += 1,
            }
        }
        report
            .restores
            .sort_by(|a, b| a.request.requested_at.cmp(&b.request.requested_at));

        tracing::info!(
            "Reconcile finished: {} reverted, {} released, {} ready, {} completed, {} failed, {} still waiting",
            report.reverted,
            report.released,
            report.count(RestoreStatus::Ready),
            report.count(RestoreStatus::Completed),
            report.count(RestoreStatus::Failed),
            report.count(RestoreStatus::Pending)
                + report.count(RestoreStatus::InProgress)
                + report.count(RestoreStatus::Expired)
                + report.count(RestoreStatus::Downloading)
        );
        Ok(report)
    }

    /// Hand downloads claimed by a process that went away back to READY.
    fn release_stale_claims(&self) -> Result<usize> {
        let cutoff = timestamp_now() - ChronoDuration::hours(DOWNLOAD_CLAIM_TTL_HOURS);
        let mut released = 0;
        for request in self.index.list_restores(&[RestoreStatus::Downloading])? {
            let claimed_at = request.last_polled_at.unwrap_or(request.requested_at);
            if claimed_at > cutoff {
                continue;
            }
            let transition = self.index.transition_restore(
                &request.request_id,
                &[RestoreStatus::Downloading],
                &RestoreChange::to(RestoreStatus::Ready)
                    .with_error("download claim expired"),
            )?;
            if transition.applied() {
                tracing::warn!(
                    "Released stale download claim on {} ({})",
                    request.remote_key,
                    request.request_id
                );
                released += 1;
            }
        }
        Ok(released)
    }

    /// Poll the active restore for one entry, downloading it when ready.
    pub async fn poll_entry(&self, lookup: &EntryLookup, download_ready: bool) -> Result<PollOutcome> {
        revert_elapsed_restores(&self.index, timestamp_now())?;

        let entry = self.index.get(lookup)?;
        let Some(mut request) = self.index.get_active_restore(&entry.remote_key)? else {
            return Ok(PollOutcome::Idle);
        };

        let status = self.restore.poll_once(&entry, &mut request).await?;
        if status != RestoreStatus::Ready || !download_ready {
            return Ok(PollOutcome::Polled(request));
        }

        let destination = PathBuf::from(&request.destination);
        let outcome = self
            .restore
            .download_and_commit(&entry, &destination, Some(request))
            .await?;
        Ok(PollOutcome::Restored(outcome))
    }

    /// Per-request failures land in the report; index errors abort the sweep.
    async fn advance(
        &self,
        mut request: RestoreRequest,
        download_ready: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<ReconciledRestore>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if request.status == RestoreStatus::Downloading {
            return Ok(Some(ReconciledRestore {
                request,
                restored_to: None,
                error: None,
            }));
        }

        let entry = match self.index.get(&EntryLookup::RemoteKey(request.remote_key.clone())) {
            Ok(entry) => entry,
            Err(GlacioError::NotFound(_)) => {
                let request = self
                    .index
                    .transition_restore(
                        &request.request_id,
                        &RestoreStatus::ACTIVE,
                        &RestoreChange::to(RestoreStatus::Failed)
                            .with_error("archive entry no longer exists"),
                    )?
                    .into_request();
                return Ok(Some(ReconciledRestore {
                    request,
                    restored_to: None,
                    error: None,
                }));
            }
            Err(error) => return Err(error),
        };

        let status = self.restore.poll_once(&entry, &mut request).await?;
        if status != RestoreStatus::Ready || !download_ready {
            return Ok(Some(ReconciledRestore {
                request,
                restored_to: None,
                error: None,
            }));
        }

        let destination = PathBuf::from(&request.destination);
        let request_id = request.request_id.clone();
        match self
            .restore
            .download_and_commit(&entry, &destination, Some(request))
            .await
        {
            Ok(RestoreOutcome::Restored { destination, .. }) => Ok(Some(ReconciledRestore {
                request: self.index.get_restore(&request_id)?,
                restored_to: Some(destination),
                error: None,
            })),
            Ok(RestoreOutcome::Requested(request) | RestoreOutcome::Expired(request)) => {
                Ok(Some(ReconciledRestore {
                    request,
                    restored_to: None,
                    error: None,
                }))
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                tracing::warn!("Restore of {} could not complete: {}", entry.remote_key, error);
                Ok(Some(ReconciledRestore {
                    request: self.index.get_restore(&request_id)?,
                    restored_to: None,
                    error: Some(error),
                }))
            }
        }
    }
}
