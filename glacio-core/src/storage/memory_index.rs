use super::index_store::{
    EntryFilter, EntryLookup, IndexStore, PutMode, RestoreBegin, RestoreChange, Transition,
};
use crate::error::{GlacioError, Result};
use crate::model::{
    ArchiveEntry, IntegrityState, RestoreRequest, RestoreStatus, StorageTier, format_timestamp,
    timestamp_now,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Default)]
struct Tables {
    entries: BTreeMap<String, ArchiveEntry>,
    restores: BTreeMap<String, RestoreRequest>,
}

/// Volatile index for tests and dry runs.
#[derive(Default)]
pub struct MemoryIndexStore {
    tables: RwLock<Tables>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn covers(entry: &ArchiveEntry, path: &str) -> bool {
        entry.origin_path == path
            || entry.members.iter().any(|member| {
                Path::new(&entry.origin_path).join(&member.name) == Path::new(path)
            })
    }

    fn newest_live<'a>(
        entries: impl Iterator<Item = &'a ArchiveEntry>,
    ) -> Option<&'a ArchiveEntry> {
        entries
            .filter(|entry| entry.superseded_at.is_none())
            .max_by_key(|entry| entry.archived_at)
    }
}

impl IndexStore for MemoryIndexStore {
    fn put(&self, entry: &ArchiveEntry, mode: PutMode) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.entries.contains_key(&entry.remote_key) {
            return Err(GlacioError::Internal(format!(
                "duplicate remote key: {}",
                entry.remote_key
            )));
        }

        let taken = tables.entries.values().find(|existing| {
            existing.origin_path == entry.origin_path && existing.archived_at == entry.archived_at
        });
        if let Some(existing) = taken {
            return Err(GlacioError::Policy(format!(
                "{} already has an entry archived at {} ({})",
                entry.origin_path,
                format_timestamp(&entry.archived_at),
                existing.remote_key
            )));
        }

        if mode == PutMode::Supersede {
            let now = timestamp_now();
            for existing in tables.entries.values_mut() {
                if existing.origin_path == entry.origin_path && existing.superseded_at.is_none() {
                    existing.superseded_at = Some(now);
                }
            }
        }

        tables
            .entries
            .insert(entry.remote_key.clone(), entry.clone());
        Ok(())
    }

    fn get(&self, lookup: &EntryLookup) -> Result<ArchiveEntry> {
        let tables = self.tables.read();
        let found = match lookup {
            EntryLookup::RemoteKey(key) => tables.entries.get(key),
            EntryLookup::OriginPath(path) => Self::newest_live(
                tables
                    .entries
                    .values()
                    .filter(|entry| entry.origin_path == *path),
            )
            .or_else(|| {
                Self::newest_live(
                    tables
                        .entries
                        .values()
                        .filter(|entry| Self::covers(entry, path)),
                )
            }),
        };

        found
            .cloned()
            .ok_or_else(|| GlacioError::NotFound(lookup.describe().to_string()))
    }

    fn list_page(
        &self,
        filter: &EntryFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArchiveEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .values()
            .filter(|entry| after.is_none_or(|after| entry.remote_key.as_str() > after))
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }

    fn update_tier(
        &self,
        remote_key: &str,
        tier: StorageTier,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .entries
            .get_mut(remote_key)
            .ok_or_else(|| GlacioError::NotFound(remote_key.to_string()))?;
        entry.storage_tier = tier;
        entry.restore_expiry = expiry;
        Ok(())
    }

    fn mark_integrity_failed(&self, remote_key: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .entries
            .get_mut(remote_key)
            .ok_or_else(|| GlacioError::NotFound(remote_key.to_string()))?;
        entry.integrity = IntegrityState::IntegrityFailed;
        Ok(())
    }

    fn delete(&self, remote_key: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.entries.remove(remote_key).is_none() {
            return Err(GlacioError::NotFound(remote_key.to_string()));
        }
        tables
            .restores
            .retain(|_, request| request.remote_key != remote_key);
        Ok(())
    }

    fn is_path_archived(&self, path: &str) -> Result<bool> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .values()
            .any(|entry| entry.superseded_at.is_none() && Self::covers(entry, path)))
    }

    fn begin_restore(&self, request: &RestoreRequest) -> Result<RestoreBegin> {
        let mut tables = self.tables.write();
        let existing = tables
            .restores
            .values()
            .find(|r| r.remote_key == request.remote_key && r.status.is_active());
        if let Some(existing) = existing {
            return Ok(RestoreBegin::Existing(existing.clone()));
        }

        tables
            .restores
            .insert(request.request_id.clone(), request.clone());
        Ok(RestoreBegin::Created(request.clone()))
    }

    fn get_active_restore(&self, remote_key: &str) -> Result<Option<RestoreRequest>> {
        let tables = self.tables.read();
        Ok(tables
            .restores
            .values()
            .find(|r| r.remote_key == remote_key && r.status.is_active())
            .cloned())
    }

    fn update_restore(&self, request: &RestoreRequest) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .restores
            .get_mut(&request.request_id)
            .ok_or_else(|| {
                GlacioError::NotFound(format!("restore request {}", request.request_id))
            })?;
        *slot = request.clone();
        Ok(())
    }

    fn get_restore(&self, request_id: &str) -> Result<RestoreRequest> {
        self.tables
            .read()
            .restores
            .get(request_id)
            .cloned()
            .ok_or_else(|| GlacioError::NotFound(format!("restore request {}", request_id)))
    }

    fn transition_restore(
        &self,
        request_id: &str,
        from: &[RestoreStatus],
        change: &RestoreChange,
    ) -> Result<Transition> {
        let mut tables = self.tables.write();
        let request = tables
            .restores
            .get_mut(request_id)
            .ok_or_else(|| GlacioError::NotFound(format!("restore request {}", request_id)))?;

        let now = timestamp_now();
        if change.polled {
            request.poll_count += 1;
            request.last_polled_at = Some(now);
        }

        if !from.contains(&request.status) {
            return Ok(Transition::Rejected(request.clone()));
        }
        if let Some(status) = change.status {
            request.status = status;
        }
        request.last_error = change.last_error.clone();
        request.last_polled_at = Some(now);
        Ok(Transition::Applied(request.clone()))
    }

    fn list_restores(&self, statuses: &[RestoreStatus]) -> Result<Vec<RestoreRequest>> {
        let tables = self.tables.read();
        let mut requests: Vec<RestoreRequest> = tables
            .restores
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        requests.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(requests)
    }
}
