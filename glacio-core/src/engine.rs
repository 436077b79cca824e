use crate::error::Result;
use crate::model::ArchiveEntry;
use crate::operations::{
    ArchiveOperation, ArchiveOperationRequest, ArchiveOptions, ArchiveReport, BundlingConfig,
    DeleteEntryOperation, DeleteEntryOperationRequest, FreeLocalOperation,
    FreeLocalOperationRequest, FreeLocalReport, ListEntriesOperation, PollOutcome,
    ReconcileOperation, ReconcileOperationRequest, ReconcileReport, ReportStatusOperation,
    RestoreOperation, RestoreOperationRequest, RestoreOptions, RestoreOutcome, StatusReport,
};
use crate::policy::{Policy, PolicyConfig};
use crate::storage::{EntryFilter, EntryLookup, IndexStore};
use crate::tier::TierClient;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct GlacioOptions {
    pub policy: PolicyConfig,
    pub bundling: BundlingConfig,
    pub archive: ArchiveOptions,
    pub restore: RestoreOptions,
}

/// Front door to the archive and restore engines.
///
/// Holds the shared index and tier client; every operation is built from
/// them on demand.
#[derive(Clone)]
pub struct Glacio {
    index: Arc<dyn IndexStore>,
    tier: Arc<dyn TierClient>,
    policy: Policy,
    options: GlacioOptions,
}

impl Glacio {
    pub fn new(
        index: Arc<dyn IndexStore>,
        tier: Arc<dyn TierClient>,
        options: GlacioOptions,
    ) -> Result<Self> {
        let policy = Policy::compile(options.policy.clone())?;
        Ok(Self {
            index,
            tier,
            policy,
            options,
        })
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn tier(&self) -> &Arc<dyn TierClient> {
        &self.tier
    }

    pub fn options(&self) -> &GlacioOptions {
        &self.options
    }

    pub async fn archive(&self, target: &Path, cancel: CancellationToken) -> Result<ArchiveReport> {
        self.archive_with(
            target,
            self.policy.clone(),
            self.options.bundling.clone(),
            cancel,
        )
        .await
    }

    /// Archive with a policy and bundling other than the configured ones.
    pub async fn archive_with(
        &self,
        target: &Path,
        policy: Policy,
        bundling: BundlingConfig,
        cancel: CancellationToken,
    ) -> Result<ArchiveReport> {
        ArchiveOperation::new(
            self.index.clone(),
            self.tier.clone(),
            self.options.archive.clone(),
        )
        .run(ArchiveOperationRequest {
            target: target.to_path_buf(),
            policy,
            bundling,
            cancel,
        })
        .await
    }

    pub async fn restore(&self, request: RestoreOperationRequest) -> Result<RestoreOutcome> {
        self.restore_operation().run(request).await
    }

    pub async fn poll(&self, lookup: &EntryLookup, download_ready: bool) -> Result<PollOutcome> {
        self.reconcile_operation()
            .poll_entry(lookup, download_ready)
            .await
    }

    pub async fn reconcile(
        &self,
        download_ready: bool,
        cancel: CancellationToken,
    ) -> Result<ReconcileReport> {
        self.reconcile_operation()
            .run(ReconcileOperationRequest {
                download_ready,
                cancel,
            })
            .await
    }

    pub fn list_entries(&self, filter: EntryFilter) -> Result<Vec<ArchiveEntry>> {
        ListEntriesOperation::new(self.index.clone()).run(filter)
    }

    pub fn export<W: Write>(&self, filter: EntryFilter, writer: &mut W) -> Result<usize> {
        ListEntriesOperation::new(self.index.clone()).export(filter, writer)
    }

    pub fn report_status(&self) -> Result<StatusReport> {
        ReportStatusOperation::new(self.index.clone()).run()
    }

    pub async fn free_local(&self, paths: Vec<PathBuf>, confirm: bool) -> Result<FreeLocalReport> {
        FreeLocalOperation::new(
            self.index.clone(),
            self.tier.clone(),
            self.options.archive.retry,
        )
        .run(FreeLocalOperationRequest { paths, confirm })
        .await
    }

    pub async fn delete_entry(&self, lookup: EntryLookup, confirm: bool) -> Result<ArchiveEntry> {
        DeleteEntryOperation::new(
            self.index.clone(),
            self.tier.clone(),
            self.options.archive.retry,
        )
        .run(DeleteEntryOperationRequest { lookup, confirm })
        .await
    }

    fn restore_operation(&self) -> RestoreOperation {
        RestoreOperation::new(
            self.index.clone(),
            self.tier.clone(),
            self.options.restore.clone(),
        )
    }

    fn reconcile_operation(&self) -> ReconcileOperation {
        ReconcileOperation::new(
            self.index.clone(),
            self.restore_operation(),
            self.options.archive.concurrency,
        )
    }
}
