//! Glacio Core - archive cold file trees to tiered object storage and restore them
//!
//! - Eligibility policy over size, age and exclude globs
//! - Small files bundled per directory into tar objects
//! - SHA-256 digests verified on upload and on restore
//! - SQLite index of every archived entry and in-flight restore

pub mod checksum;
pub mod engine;
pub mod error;
pub mod model;
pub mod operations;
pub mod policy;
pub mod retry;
pub mod storage;
pub mod tier;

pub use checksum::{DigestReader, StreamingDigest, compute_hash, digest_file, verify_hash};
pub use engine::{Glacio, GlacioOptions};
pub use error::{GlacioError, Result};
pub use model::{
    ArchiveEntry, BundleMember, EntryKind, FileMetadata, IntegrityState, RestoreRequest,
    RestoreStatus, StorageTier,
};
pub use operations::{
    ArchiveOptions, ArchiveReport, BundlingConfig, FreeLocalReport, FreeOutcome, PollOutcome,
    ReconcileReport, RestoreOperationRequest, RestoreOptions, RestoreOutcome, StatusReport,
    UnitOutcome,
};
pub use policy::{EligibilityDecision, EligibilityInput, IneligibleReason, Policy, PolicyConfig, decide};
pub use retry::RetryPolicy;
pub use storage::{
    EntryCursor, EntryFilter, EntryLookup, IndexStore, MemoryIndexStore, PutMode, SqliteIndexStore,
};
pub use tier::{
    MemoryTierClient, ObjectHead, ObjectStoreTierClient, ProviderRestoreStatus, RestoreSpeed,
    S3Options, TierClient, TierClientBuilder, TierError,
};
