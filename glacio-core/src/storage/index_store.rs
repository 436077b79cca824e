use crate::error::Result;
use crate::model::{ArchiveEntry, RestoreRequest, RestoreStatus, StorageTier};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// How `put` treats earlier live entries for the same origin path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Keep earlier entries visible; the new one becomes the newest.
    #[default]
    Insert,
    /// Stamp `superseded_at` on earlier live entries for the same origin path.
    Supersede,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryLookup {
    RemoteKey(String),
    OriginPath(String),
}

impl EntryLookup {
    /// Keys never start with '/', absolute local paths always do.
    pub fn parse(value: &str) -> Self {
        if Path::new(value).is_absolute() {
            Self::OriginPath(value.trim_end_matches('/').to_string())
        } else {
            Self::RemoteKey(value.to_string())
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            Self::RemoteKey(key) => key,
            Self::OriginPath(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub tier: Option<StorageTier>,
    pub archived_before: Option<DateTime<Utc>>,
    pub archived_after: Option<DateTime<Utc>>,
    pub path_prefix: Option<String>,
    pub include_superseded: bool,
    pub integrity_failed_only: bool,
}

impl EntryFilter {
    pub fn matches(&self, entry: &ArchiveEntry) -> bool {
        if let Some(tier) = self.tier {
            if entry.storage_tier != tier {
                return false;
            }
        }
        if let Some(before) = self.archived_before {
            if entry.archived_at >= before {
                return false;
            }
        }
        if let Some(after) = self.archived_after {
            if entry.archived_at < after {
                return false;
            }
        }
        if let Some(prefix) = self.path_prefix.as_deref() {
            if !entry.origin_path.starts_with(prefix) {
                return false;
            }
        }
        if !self.include_superseded && entry.superseded_at.is_some() {
            return false;
        }
        if self.integrity_failed_only && entry.is_trusted() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreBegin {
    Created(RestoreRequest),
    Existing(RestoreRequest),
}

impl RestoreBegin {
    pub fn request(&self) -> &RestoreRequest {
        match self {
            Self::Created(request) | Self::Existing(request) => request,
        }
    }

    pub fn into_request(self) -> RestoreRequest {
        match self {
            Self::Created(request) | Self::Existing(request) => request,
        }
    }
}

/// A guarded change to a restore request, applied by `transition_restore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreChange {
    /// New status; `None` keeps the current one.
    pub status: Option<RestoreStatus>,
    pub last_error: Option<String>,
    /// Count a provider poll, whether or not the change applies.
    pub polled: bool,
}

impl RestoreChange {
    pub fn to(status: RestoreStatus) -> Self {
        Self {
            status: Some(status),
            last_error: None,
            polled: false,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn polled(mut self) -> Self {
        self.polled = true;
        self
    }
}

/// Result of a guarded restore change. Both arms carry the row as stored
/// after the call.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(RestoreRequest),
    /// The row was not in one of the expected statuses.
    Rejected(RestoreRequest),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn request(&self) -> &RestoreRequest {
        match self {
            Self::Applied(request) | Self::Rejected(request) => request,
        }
    }

    pub fn into_request(self) -> RestoreRequest {
        match self {
            Self::Applied(request) | Self::Rejected(request) => request,
        }
    }
}

/// Durable record of archived entries and in-flight restores.
///
/// Every mutating call is committed before it returns. Implementations must
/// make per-key updates atomic; concurrent callers touching distinct keys must
/// not block each other for longer than a single statement.
pub trait IndexStore: Send + Sync {
    fn put(&self, entry: &ArchiveEntry, mode: PutMode) -> Result<()>;

    /// Fails with `NotFound` when nothing matches.
    fn get(&self, lookup: &EntryLookup) -> Result<ArchiveEntry>;

    /// One page of entries ordered by remote key, strictly after `after`.
    fn list_page(
        &self,
        filter: &EntryFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArchiveEntry>>;

    fn update_tier(
        &self,
        remote_key: &str,
        tier: StorageTier,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn mark_integrity_failed(&self, remote_key: &str) -> Result<()>;

    fn delete(&self, remote_key: &str) -> Result<()>;

    /// True when a live entry covers this path, directly or as a bundle member.
    fn is_path_archived(&self, path: &str) -> Result<bool>;

    /// Insert `request` unless an active one exists for the same key, in one
    /// atomic step.
    fn begin_restore(&self, request: &RestoreRequest) -> Result<RestoreBegin>;

    fn get_active_restore(&self, remote_key: &str) -> Result<Option<RestoreRequest>>;

    /// Fails with `NotFound` when no request has this id.
    fn get_restore(&self, request_id: &str) -> Result<RestoreRequest>;

    /// Overwrites every field of the stored request.
    fn update_restore(&self, request: &RestoreRequest) -> Result<()>;

    /// Apply `change` only while the stored status is one of `from`, in one
    /// atomic step. A counted poll increments `poll_count` in place, so
    /// concurrent pollers never lose each other's counts.
    fn transition_restore(
        &self,
        request_id: &str,
        from: &[RestoreStatus],
        change: &RestoreChange,
    ) -> Result<Transition>;

    fn list_restores(&self, statuses: &[RestoreStatus]) -> Result<Vec<RestoreRequest>>;
}

/// Lazily walks entries page by page.
pub struct EntryCursor {
    store: Arc<dyn IndexStore>,
    filter: EntryFilter,
    page_size: usize,
    buffer: std::vec::IntoIter<ArchiveEntry>,
    last_key: Option<String>,
    exhausted: bool,
}

impl EntryCursor {
    pub const DEFAULT_PAGE_SIZE: usize = 256;

    pub fn new(store: Arc<dyn IndexStore>, filter: EntryFilter) -> Self {
        Self::with_page_size(store, filter, Self::DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: Arc<dyn IndexStore>, filter: EntryFilter, page_size: usize) -> Self {
        Self {
            store,
            filter,
            page_size: page_size.max(1),
            buffer: Vec::new().into_iter(),
            last_key: None,
            exhausted: false,
        }
    }
}

impl Iterator for EntryCursor {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buffer.next() {
            self.last_key = Some(entry.remote_key.clone());
            return Some(Ok(entry));
        }

        if self.exhausted {
            return None;
        }

        let page = match self
            .store
            .list_page(&self.filter, self.last_key.as_deref(), self.page_size)
        {
            Ok(page) => page,
            Err(error) => {
                self.exhausted = true;
                return Some(Err(error));
            }
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer = page.into_iter();

        let entry = self.buffer.next()?;
        self.last_key = Some(entry.remote_key.clone());
        Some(Ok(entry))
    }
}
