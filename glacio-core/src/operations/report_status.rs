use super::list_entries::revert_elapsed_restores;
use crate::error::Result;
use crate::model::{RestoreStatus, StorageTier, timestamp_now};
use crate::storage::{EntryCursor, EntryFilter, IndexStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub tiers: BTreeMap<StorageTier, TierSummary>,
    pub total: TierSummary,
    pub superseded: u64,
    pub integrity_failures: u64,
    pub active_restores: u64,
    pub expired_restores: u64,
    pub failed_restores: u64,
}

#[derive(Clone)]
pub struct ReportStatusOperation {
    index: Arc<dyn IndexStore>,
}

impl ReportStatusOperation {
    pub fn new(index: Arc<dyn IndexStore>) -> Self {
        Self { index }
    }

    pub fn run(&self) -> Result<StatusReport> {
        revert_elapsed_restores(&self.index, timestamp_now())?;

        let mut report = StatusReport::default();
        let everything = EntryFilter {
            include_superseded: true,
            ..EntryFilter::default()
        };

        for entry in EntryCursor::new(self.index.clone(), everything) {
            let entry = entry?;
            if entry.superseded_at.is_some() {
                report.superseded += 1;
                continue;
            }
            if !entry.is_trusted() {
                report.integrity_failures += 1;
            }

            let summary = report.tiers.entry(entry.storage_tier).or_default();
            summary.entries += 1;
            summary.bytes += entry.size_bytes;
            report.total.entries += 1;
            report.total.bytes += entry.size_bytes;
        }

        for request in self.index.list_restores(&RestoreStatus::ACTIVE)? {
            report.active_restores += 1;
            if request.status == RestoreStatus::Expired {
                report.expired_restores += 1;
            }
        }
        report.failed_restores = self.index.list_restores(&[RestoreStatus::Failed])?.len() as u64;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArchiveEntry, EntryKind, IntegrityState, RestoreRequest};
    use crate::storage::{MemoryIndexStore, PutMode};

    fn entry(key: &str, tier: StorageTier, size: u64) -> ArchiveEntry {
        ArchiveEntry {
            remote_key: key.to_string(),
            origin_path: format!("/data/{}", key),
            kind: EntryKind::File,
            size_bytes: size,
            digest: "d".to_string(),
            archived_at: timestamp_now(),
            storage_tier: tier,
            storage_class: "DEEP_ARCHIVE".to_string(),
            restore_expiry: None,
            integrity: IntegrityState::Verified,
            remote_etag: None,
            archived_by: None,
            superseded_at: None,
            members: Vec::new(),
        }
    }

    #[test]
    fn test_counts_per_tier() {
        let index: Arc<dyn IndexStore> = Arc::new(MemoryIndexStore::new());
        index.put(&entry("a", StorageTier::Cold, 10), PutMode::Insert).unwrap();
        index.put(&entry("b", StorageTier::Cold, 5), PutMode::Insert).unwrap();
        index.put(&entry("c", StorageTier::Standard, 1), PutMode::Insert).unwrap();
        index.mark_integrity_failed("c").unwrap();

        let mut request = RestoreRequest::new("a", "/data/a");
        index.begin_restore(&request).unwrap();
        request.status = RestoreStatus::Expired;
        index.update_restore(&request).unwrap();

        let report = ReportStatusOperation::new(index).run().unwrap();
        assert_eq!(
            report.tiers[&StorageTier::Cold],
            TierSummary { entries: 2, bytes: 15 }
        );
        assert_eq!(report.total.entries, 3);
        assert_eq!(report.integrity_failures, 1);
        assert_eq!(report.active_restores, 1);
        assert_eq!(report.expired_restores, 1);
    }
}
