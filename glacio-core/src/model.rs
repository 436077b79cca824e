use crate::error::{GlacioError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageTier {
    Standard,
    Cold,
    Restoring,
    RestoredTemp,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Cold => "COLD",
            Self::Restoring => "RESTORING",
            Self::RestoredTemp => "RESTORED_TEMP",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = GlacioError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(Self::Standard),
            "COLD" => Ok(Self::Cold),
            "RESTORING" => Ok(Self::Restoring),
            "RESTORED_TEMP" => Ok(Self::RestoredTemp),
            other => Err(GlacioError::IndexCorrupt(format!(
                "unknown storage tier: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityState {
    Verified,
    IntegrityFailed,
}

impl IntegrityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::IntegrityFailed => "INTEGRITY_FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "VERIFIED" => Ok(Self::Verified),
            "INTEGRITY_FAILED" => Ok(Self::IntegrityFailed),
            other => Err(GlacioError::IndexCorrupt(format!(
                "unknown integrity state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    File,
    Bundle,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Bundle => "BUNDLE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "FILE" => Ok(Self::File),
            "BUNDLE" => Ok(Self::Bundle),
            other => Err(GlacioError::IndexCorrupt(format!(
                "unknown entry kind: {}",
                other
            ))),
        }
    }
}

/// A file carried inside a bundle, relative to the bundle's origin directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMember {
    pub name: String,
    pub size_bytes: u64,
    pub digest: String,
}

/// Provenance record of one archived file or bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub remote_key: String,
    pub origin_path: String,
    pub kind: EntryKind,
    pub size_bytes: u64,
    pub digest: String,
    pub archived_at: DateTime<Utc>,
    pub storage_tier: StorageTier,
    pub storage_class: String,
    pub restore_expiry: Option<DateTime<Utc>>,
    pub integrity: IntegrityState,
    pub remote_etag: Option<String>,
    pub archived_by: Option<String>,
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub members: Vec<BundleMember>,
}

impl ArchiveEntry {
    pub fn is_trusted(&self) -> bool {
        self.integrity == IntegrityState::Verified
    }

    /// Local paths this entry restores to when no destination override is given.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        match self.kind {
            EntryKind::File => vec![PathBuf::from(&self.origin_path)],
            EntryKind::Bundle => self
                .members
                .iter()
                .map(|member| Path::new(&self.origin_path).join(&member.name))
                .collect(),
        }
    }

    /// True once a temporary restored copy has passed its expiry.
    pub fn restore_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.storage_tier == StorageTier::RestoredTemp
            && self.restore_expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Whether the remote bytes can be downloaded without a restore request.
    pub fn is_readable(&self, now: DateTime<Utc>) -> bool {
        match self.storage_tier {
            StorageTier::Standard => true,
            StorageTier::RestoredTemp => !self.restore_elapsed(now),
            StorageTier::Cold | StorageTier::Restoring => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Ready,
    /// One caller has claimed the download of a ready restore.
    Downloading,
    Failed,
    Expired,
    Completed,
}

impl RestoreStatus {
    pub const ACTIVE: [RestoreStatus; 5] = [
        RestoreStatus::Pending,
        RestoreStatus::InProgress,
        RestoreStatus::Ready,
        RestoreStatus::Downloading,
        RestoreStatus::Expired,
    ];

    /// Statuses a provider poll may overwrite.
    pub const POLLABLE: [RestoreStatus; 4] = [
        RestoreStatus::Pending,
        RestoreStatus::InProgress,
        RestoreStatus::Ready,
        RestoreStatus::Expired,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Downloading => "DOWNLOADING",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "READY" => Ok(Self::Ready),
            "DOWNLOADING" => Ok(Self::Downloading),
            "FAILED" => Ok(Self::Failed),
            "EXPIRED" => Ok(Self::Expired),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(GlacioError::IndexCorrupt(format!(
                "unknown restore status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight restore. Refers to its entry by remote key only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub request_id: String,
    pub remote_key: String,
    pub destination: String,
    pub requested_at: DateTime<Utc>,
    pub status: RestoreStatus,
    pub poll_count: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RestoreRequest {
    pub fn new(remote_key: &str, destination: &str) -> Self {
        Self {
            request_id: ulid::Ulid::new().to_string(),
            remote_key: remote_key.to_string(),
            destination: destination.to_string(),
            requested_at: timestamp_now(),
            status: RestoreStatus::Pending,
            poll_count: 0,
            last_polled_at: None,
            last_error: None,
        }
    }
}

/// Plain file attributes consumed by the eligibility policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl FileMetadata {
    pub fn from_fs(path: &Path, metadata: &std::fs::Metadata) -> Self {
        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        let atime = metadata
            .accessed()
            .map(DateTime::<Utc>::from)
            .unwrap_or(mtime);

        Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            mtime,
            atime,
        }
    }

    /// Most recent of access and modification time.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.atime.max(self.mtime)
    }
}

/// Current time at the precision the index stores.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GlacioError::IndexCorrupt(format!("invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_tier_round_trips_through_text() {
        for tier in [
            StorageTier::Standard,
            StorageTier::Cold,
            StorageTier::Restoring,
            StorageTier::RestoredTemp,
        ] {
            assert_eq!(tier.as_str().parse::<StorageTier>().unwrap(), tier);
        }
        assert!("WARM".parse::<StorageTier>().is_err());
    }

    #[test]
    fn test_restored_copy_expiry() {
        let now = Utc::now();
        let mut entry = ArchiveEntry {
            remote_key: "k".to_string(),
            origin_path: "/data/a".to_string(),
            kind: EntryKind::File,
            size_bytes: 1,
            digest: String::new(),
            archived_at: now,
            storage_tier: StorageTier::RestoredTemp,
            storage_class: "DEEP_ARCHIVE".to_string(),
            restore_expiry: Some(now + Duration::days(1)),
            integrity: IntegrityState::Verified,
            remote_etag: None,
            archived_by: None,
            superseded_at: None,
            members: Vec::new(),
        };
        assert!(entry.is_readable(now));
        assert!(!entry.restore_elapsed(now));

        entry.restore_expiry = Some(now - Duration::seconds(1));
        assert!(entry.restore_elapsed(now));
        assert!(!entry.is_readable(now));
    }

    #[test]
    fn test_active_statuses() {
        assert!(RestoreStatus::Expired.is_active());
        assert!(RestoreStatus::Downloading.is_active());
        assert!(!RestoreStatus::POLLABLE.contains(&RestoreStatus::Downloading));
        assert_eq!(
            RestoreStatus::parse("DOWNLOADING").unwrap(),
            RestoreStatus::Downloading
        );
        assert!(!RestoreStatus::Failed.is_active());
        assert!(!RestoreStatus::Completed.is_active());
    }
}
