use crate::error::{GlacioError, Result};
use crate::model::ArchiveEntry;
use crate::retry::RetryPolicy;
use crate::storage::{EntryLookup, IndexStore};
use crate::tier::{TierClient, TierError};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DeleteEntryOperationRequest {
    pub lookup: EntryLookup,
    pub confirm: bool,
}

/// Removes the remote object, then the index entry.
#[derive(Clone)]
pub struct DeleteEntryOperation {
    index: Arc<dyn IndexStore>,
    tier: Arc<dyn TierClient>,
    retry: RetryPolicy,
}

impl DeleteEntryOperation {
    pub fn new(index: Arc<dyn IndexStore>, tier: Arc<dyn TierClient>, retry: RetryPolicy) -> Self {
        Self { index, tier, retry }
    }

    pub async fn run(&self, request: DeleteEntryOperationRequest) -> Result<ArchiveEntry> {
        let DeleteEntryOperationRequest { lookup, confirm } = request;
        if !confirm {
            return Err(GlacioError::Policy(
                "deleting an archive entry destroys the remote copy; confirmation is required"
                    .to_string(),
            ));
        }

        let entry = self.index.get(&lookup)?;
        if let Some(active) = self.index.get_active_restore(&entry.remote_key)? {
            return Err(GlacioError::Policy(format!(
                "restore {} of {} is still {}",
                active.request_id, entry.remote_key, active.status
            )));
        }

        let deleted = self
            .retry
            .run("delete", || self.tier.delete(&entry.remote_key))
            .await;
        match deleted {
            Ok(()) => {}
            Err(TierError::NotFound(_)) => {
                tracing::warn!("Remote object {} was already gone", entry.remote_key);
            }
            Err(error) => return Err(GlacioError::from_tier(&entry.remote_key, error)),
        }

        self.index.delete(&entry.remote_key)?;
        tracing::info!("Deleted {} ({})", entry.remote_key, entry.origin_path);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, IntegrityState, RestoreRequest, StorageTier, timestamp_now};
    use crate::storage::{MemoryIndexStore, PutMode};
    use crate::tier::MemoryTierClient;

    fn setup() -> (Arc<MemoryIndexStore>, Arc<MemoryTierClient>, DeleteEntryOperation) {
        let index = Arc::new(MemoryIndexStore::new());
        let tier = Arc::new(MemoryTierClient::cold());
        tier.insert_object("k", b"bytes".to_vec());
        index
            .put(
                &ArchiveEntry {
                    remote_key: "k".to_string(),
                    origin_path: "/data/k".to_string(),
                    kind: EntryKind::File,
                    size_bytes: 5,
                    digest: crate::compute_hash(b"bytes"),
                    archived_at: timestamp_now(),
                    storage_tier: StorageTier::Cold,
                    storage_class: "DEEP_ARCHIVE".to_string(),
                    restore_expiry: None,
                    integrity: IntegrityState::Verified,
                    remote_etag: None,
                    archived_by: None,
                    superseded_at: None,
                    members: Vec::new(),
                },
                PutMode::Insert,
            )
            .unwrap();
        let op = DeleteEntryOperation::new(index.clone(), tier.clone(), RetryPolicy::default());
        (index, tier, op)
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation_and_idle_entry() {
        let (index, tier, op) = setup();
        let lookup = EntryLookup::RemoteKey("k".to_string());

        let err = op
            .run(DeleteEntryOperationRequest {
                lookup: lookup.clone(),
                confirm: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GlacioError::Policy(_)));

        index.begin_restore(&RestoreRequest::new("k", "/data/k")).unwrap();
        let err = op
            .run(DeleteEntryOperationRequest {
                lookup,
                confirm: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GlacioError::Policy(_)));
        assert_eq!(tier.object_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_remote_then_index() {
        let (index, tier, op) = setup();
        let deleted = op
            .run(DeleteEntryOperationRequest {
                lookup: EntryLookup::OriginPath("/data/k".to_string()),
                confirm: true,
            })
            .await
            .unwrap();
        assert_eq!(deleted.remote_key, "k");
        assert_eq!(tier.object_count(), 0);
        assert!(index.is_empty());
    }
}
