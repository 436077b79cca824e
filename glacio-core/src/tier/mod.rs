//! Object storage adapters.
//!
//! A `TierClient` moves bytes to and from one storage class of one provider.
//! Adapters classify failures but never retry; retry and backoff belong to the
//! engines.

mod factory;
mod memory_client;
mod object_store_client;
mod s3_restore;

pub use factory::TierClientBuilder;
pub use memory_client::{CallCounts, MemoryTierClient};
pub use object_store_client::{ObjectStoreTierClient, S3Options};

use crate::model::StorageTier;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl TierError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type TierResult<T> = std::result::Result<T, TierError>;

pub type ByteStream = BoxStream<'static, TierResult<Bytes>>;

/// Storage classes whose objects must be restored before they can be read.
pub const COLD_STORAGE_CLASSES: &[&str] = &["GLACIER", "DEEP_ARCHIVE"];

pub fn is_cold_class(storage_class: &str) -> bool {
    COLD_STORAGE_CLASSES
        .iter()
        .any(|class| class.eq_ignore_ascii_case(storage_class.trim()))
}

pub fn tier_for_class(storage_class: &str) -> StorageTier {
    if is_cold_class(storage_class) {
        StorageTier::Cold
    } else {
        StorageTier::Standard
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    /// SHA-256 hex of the stored bytes, when the provider can supply it.
    pub remote_digest: Option<String>,
    pub tier: StorageTier,
    pub storage_class: String,
}

/// Retrieval speed for restores from cold classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreSpeed {
    #[default]
    Bulk,
    Standard,
    Expedited,
}

impl RestoreSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bulk => "Bulk",
            Self::Standard => "Standard",
            Self::Expedited => "Expedited",
        }
    }
}

impl fmt::Display for RestoreSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreSpeed {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bulk" => Ok(Self::Bulk),
            "standard" => Ok(Self::Standard),
            "expedited" => Ok(Self::Expedited),
            other => Err(format!("unknown restore speed: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRestoreStatus {
    Pending,
    InProgress,
    Ready { expires_at: Option<DateTime<Utc>> },
    Failed(String),
}

#[async_trait]
pub trait TierClient: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Storage class new uploads land in.
    fn storage_class(&self) -> &str;

    /// Returns the provider etag, if any.
    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> TierResult<Option<String>>;

    async fn download(&self, key: &str) -> TierResult<ByteStream>;

    async fn head(&self, key: &str) -> TierResult<ObjectHead>;

    /// Returns a provider request id.
    async fn request_restore(&self, key: &str, days: u32, speed: RestoreSpeed)
    -> TierResult<String>;

    async fn poll_restore(&self, key: &str) -> TierResult<ProviderRestoreStatus>;

    async fn delete(&self, key: &str) -> TierResult<()>;
}
