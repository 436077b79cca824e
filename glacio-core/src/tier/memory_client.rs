use super::{
    ByteStream, ObjectHead, ProviderRestoreStatus, RestoreSpeed, TierClient, TierError,
    TierResult, is_cold_class, tier_for_class,
};
use crate::checksum::compute_hash;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    restore: Option<RestoreState>,
}

#[derive(Debug, Clone, Copy)]
struct RestoreState {
    polls_remaining: u32,
    days: u32,
    ready: bool,
}

#[derive(Debug, Default)]
struct Faults {
    upload: VecDeque<TierError>,
    download: VecDeque<TierError>,
    restore_request: VecDeque<TierError>,
    poll: VecDeque<TierError>,
    delete: VecDeque<TierError>,
    corrupt_uploads: u32,
    hidden_heads: u32,
    corrupt_downloads: bool,
}

#[derive(Debug, Default)]
struct Counters {
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    heads: AtomicUsize,
    restore_requests: AtomicUsize,
    polls: AtomicUsize,
    deletes: AtomicUsize,
}

/// Snapshot of how often each provider call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub uploads: usize,
    pub downloads: usize,
    pub heads: usize,
    pub restore_requests: usize,
    pub polls: usize,
    pub deletes: usize,
}

/// Simulated provider kept entirely in memory.
///
/// Objects in a cold storage class must be restored before they can be
/// downloaded. A restore reports `InProgress` for a configurable number of
/// polls and then `Ready`. Failures can be queued per call type.
pub struct MemoryTierClient {
    storage_class: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    restore_polls: Mutex<u32>,
    never_ready: Mutex<bool>,
    counters: Counters,
}

impl MemoryTierClient {
    pub fn new(storage_class: &str) -> Self {
        Self {
            storage_class: storage_class.trim().to_ascii_uppercase(),
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            restore_polls: Mutex::new(0),
            never_ready: Mutex::new(false),
            counters: Counters::default(),
        }
    }

    pub fn cold() -> Self {
        Self::new("DEEP_ARCHIVE")
    }

    pub fn standard() -> Self {
        Self::new("STANDARD")
    }

    /// Polls answered with `InProgress` before a restore turns ready.
    pub fn set_restore_polls(&self, polls: u32) {
        *self.restore_polls.lock() = polls;
    }

    pub fn set_never_ready(&self, never_ready: bool) {
        *self.never_ready.lock() = never_ready;
    }

    /// Flip a byte in every downloaded payload.
    pub fn set_corrupt_downloads(&self, corrupt: bool) {
        self.faults.lock().corrupt_downloads = corrupt;
    }

    /// Store the next `count` uploads with one byte altered.
    pub fn corrupt_next_uploads(&self, count: u32) {
        self.faults.lock().corrupt_uploads = count;
    }

    /// Answer the next `count` heads with `NotFound`, as a lagging listing would.
    pub fn hide_next_heads(&self, count: u32) {
        self.faults.lock().hidden_heads = count;
    }

    pub fn fail_next_upload(&self, error: TierError) {
        self.faults.lock().upload.push_back(error);
    }

    pub fn fail_next_download(&self, error: TierError) {
        self.faults.lock().download.push_back(error);
    }

    pub fn fail_next_restore_request(&self, error: TierError) {
        self.faults.lock().restore_request.push_back(error);
    }

    pub fn fail_next_poll(&self, error: TierError) {
        self.faults.lock().poll.push_back(error);
    }

    pub fn fail_next_delete(&self, error: TierError) {
        self.faults.lock().delete.push_back(error);
    }

    /// Place an object directly, bypassing upload.
    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                restore: None,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|object| object.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Drop the restored copy of `key`, as the provider does after the retention period.
    pub fn expire_restore(&self, key: &str) {
        if let Some(object) = self.objects.lock().get_mut(key) {
            object.restore = None;
        }
    }

    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            uploads: self.counters.uploads.load(Ordering::SeqCst),
            downloads: self.counters.downloads.load(Ordering::SeqCst),
            heads: self.counters.heads.load(Ordering::SeqCst),
            restore_requests: self.counters.restore_requests.load(Ordering::SeqCst),
            polls: self.counters.polls.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    fn is_cold(&self) -> bool {
        is_cold_class(&self.storage_class)
    }

    fn take_fault(queue: &mut VecDeque<TierError>) -> TierResult<()> {
        match queue.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TierClient for MemoryTierClient {
    fn name(&self) -> &str {
        "memory"
    }

    fn storage_class(&self) -> &str {
        &self.storage_class
    }

    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> TierResult<Option<String>> {
        self.counters.uploads.fetch_add(1, Ordering::SeqCst);

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| TierError::Permanent(format!("failed to read source: {}", e)))?;

        let corrupt = {
            let mut faults = self.faults.lock();
            Self::take_fault(&mut faults.upload)?;
            if faults.corrupt_uploads > 0 {
                faults.corrupt_uploads -= 1;
                true
            } else {
                false
            }
        };

        let etag = compute_hash(&data)[..32].to_string();
        if corrupt {
            match data.first_mut() {
                Some(byte) => *byte ^= 0xff,
                None => data.push(0),
            }
        }

        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                restore: None,
            },
        );
        Ok(Some(etag))
    }

    async fn download(&self, key: &str) -> TierResult<ByteStream> {
        self.counters.downloads.fetch_add(1, Ordering::SeqCst);

        let corrupt = {
            let mut faults = self.faults.lock();
            Self::take_fault(&mut faults.download)?;
            faults.corrupt_downloads
        };

        let object = self
            .objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| TierError::NotFound(key.to_string()))?;

        let restored = object.restore.is_some_and(|restore| restore.ready);
        if self.is_cold() && !restored {
            return Err(TierError::Permanent(format!(
                "InvalidObjectState: {} is archived and must be restored first",
                key
            )));
        }

        let mut data = object.data.to_vec();
        if corrupt {
            match data.last_mut() {
                Some(byte) => *byte ^= 0xff,
                None => data.push(0),
            }
        }

        let chunks: Vec<TierResult<Bytes>> = data
            .chunks(DOWNLOAD_CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn head(&self, key: &str) -> TierResult<ObjectHead> {
        self.counters.heads.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = self.faults.lock();
            if faults.hidden_heads > 0 {
                faults.hidden_heads -= 1;
                return Err(TierError::NotFound(key.to_string()));
            }
        }

        let objects = self.objects.lock();
        let object = objects
            .get(key)
            .ok_or_else(|| TierError::NotFound(key.to_string()))?;

        Ok(ObjectHead {
            size: object.data.len() as u64,
            remote_digest: Some(compute_hash(&object.data)),
            tier: tier_for_class(&self.storage_class),
            storage_class: self.storage_class.clone(),
        })
    }

    async fn request_restore(
        &self,
        key: &str,
        days: u32,
        speed: RestoreSpeed,
    ) -> TierResult<String> {
        self.counters.restore_requests.fetch_add(1, Ordering::SeqCst);
        Self::take_fault(&mut self.faults.lock().restore_request)?;

        let polls = *self.restore_polls.lock();
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| TierError::NotFound(key.to_string()))?;

        if object.restore.is_none() {
            object.restore = Some(RestoreState {
                polls_remaining: polls,
                days,
                ready: !self.is_cold(),
            });
        }

        tracing::debug!("Memory restore requested for {} ({} days, {})", key, days, speed);
        Ok(ulid::Ulid::new().to_string())
    }

    async fn poll_restore(&self, key: &str) -> TierResult<ProviderRestoreStatus> {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        Self::take_fault(&mut self.faults.lock().poll)?;

        let never_ready = *self.never_ready.lock();
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| TierError::NotFound(key.to_string()))?;

        if !self.is_cold() {
            return Ok(ProviderRestoreStatus::Ready { expires_at: None });
        }

        let Some(restore) = object.restore.as_mut() else {
            return Ok(ProviderRestoreStatus::Pending);
        };

        if restore.ready {
            return Ok(ProviderRestoreStatus::Ready {
                expires_at: Some(Utc::now() + Duration::days(i64::from(restore.days))),
            });
        }
        if never_ready {
            return Ok(ProviderRestoreStatus::InProgress);
        }
        if restore.polls_remaining > 0 {
            restore.polls_remaining -= 1;
            return Ok(ProviderRestoreStatus::InProgress);
        }

        restore.ready = true;
        Ok(ProviderRestoreStatus::Ready {
            expires_at: Some(Utc::now() + Duration::days(i64::from(restore.days))),
        })
    }

    async fn delete(&self, key: &str) -> TierResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        Self::take_fault(&mut self.faults.lock().delete)?;

        match self.objects.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(TierError::NotFound(key.to_string())),
        }
    }
}
