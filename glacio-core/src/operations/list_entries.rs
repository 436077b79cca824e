use crate::error::Result;
use crate::model::{ArchiveEntry, StorageTier};
use crate::storage::{EntryCursor, EntryFilter, IndexStore};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::Arc;

/// Send temporary copies whose retention has passed back to COLD.
pub(crate) fn revert_elapsed_restores(index: &Arc<dyn IndexStore>, now: DateTime<Utc>) -> Result<usize> {
    let filter = EntryFilter {
        tier: Some(StorageTier::RestoredTemp),
        include_superseded: true,
        ..EntryFilter::default()
    };

    let mut elapsed = Vec::new();
    for entry in EntryCursor::new(index.clone(), filter) {
        let entry = entry?;
        if entry.restore_elapsed(now) {
            elapsed.push(entry.remote_key);
        }
    }

    for remote_key in &elapsed {
        index.update_tier(remote_key, StorageTier::Cold, None)?;
        tracing::info!("Restored copy of {} expired; back to COLD", remote_key);
    }
    Ok(elapsed.len())
}

#[derive(Clone)]
pub struct ListEntriesOperation {
    index: Arc<dyn IndexStore>,
}

impl ListEntriesOperation {
    pub fn new(index: Arc<dyn IndexStore>) -> Self {
        Self { index }
    }

    pub fn run(&self, filter: EntryFilter) -> Result<Vec<ArchiveEntry>> {
        revert_elapsed_restores(&self.index, Utc::now())?;
        EntryCursor::new(self.index.clone(), filter).collect()
    }

    /// Write matching entries as JSON lines. Returns the number written.
    pub fn export<W: Write>(&self, filter: EntryFilter, writer: &mut W) -> Result<usize> {
        revert_elapsed_restores(&self.index, Utc::now())?;

        let mut written = 0;
        for entry in EntryCursor::new(self.index.clone(), filter) {
            serde_json::to_writer(&mut *writer, &entry?)?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, IntegrityState, timestamp_now};
    use crate::storage::{MemoryIndexStore, PutMode};
    use chrono::Duration;

    fn entry(key: &str, tier: StorageTier) -> ArchiveEntry {
        ArchiveEntry {
            remote_key: key.to_string(),
            origin_path: format!("/data/{}", key),
            kind: EntryKind::File,
            size_bytes: 1,
            digest: "d".to_string(),
            archived_at: timestamp_now(),
            storage_tier: tier,
            storage_class: "GLACIER".to_string(),
            restore_expiry: None,
            integrity: IntegrityState::Verified,
            remote_etag: None,
            archived_by: None,
            superseded_at: None,
            members: Vec::new(),
        }
    }

    #[test]
    fn test_list_reverts_elapsed_first() {
        let index: Arc<dyn IndexStore> = Arc::new(MemoryIndexStore::new());
        let mut expired = entry("a", StorageTier::RestoredTemp);
        expired.restore_expiry = Some(timestamp_now() - Duration::minutes(1));
        let mut fresh = entry("b", StorageTier::RestoredTemp);
        fresh.restore_expiry = Some(timestamp_now() + Duration::days(1));
        index.put(&expired, PutMode::Insert).unwrap();
        index.put(&fresh, PutMode::Insert).unwrap();

        let op = ListEntriesOperation::new(index);
        let cold = op
            .run(EntryFilter {
                tier: Some(StorageTier::Cold),
                ..EntryFilter::default()
            })
            .unwrap();
        assert_eq!(cold.len(), 1);
        assert_eq!(cold[0].remote_key, "a");
    }

    #[test]
    fn test_export_json_lines() {
        let index: Arc<dyn IndexStore> = Arc::new(MemoryIndexStore::new());
        index.put(&entry("a", StorageTier::Cold), PutMode::Insert).unwrap();
        index.put(&entry("b", StorageTier::Standard), PutMode::Insert).unwrap();

        let mut out = Vec::new();
        let written = ListEntriesOperation::new(index)
            .export(EntryFilter::default(), &mut out)
            .unwrap();
        assert_eq!(written, 2);

        let lines: Vec<ArchiveEntry> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[1].storage_tier, StorageTier::Standard);
    }
}
