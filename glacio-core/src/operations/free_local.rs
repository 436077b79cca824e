use super::archive::WHERE_DID_THE_FILES_GO;
use crate::checksum::digest_file;
use crate::error::{GlacioError, Result};
use crate::model::{ArchiveEntry, EntryKind, format_timestamp, timestamp_now};
use crate::retry::RetryPolicy;
use crate::storage::{EntryCursor, EntryFilter, EntryLookup, IndexStore};
use crate::tier::TierClient;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct FreeLocalOperationRequest {
    /// Files or directories; directories cover every entry archived beneath them.
    pub paths: Vec<PathBuf>,
    pub confirm: bool,
}

#[derive(Debug)]
pub enum FreeOutcome {
    Freed {
        remote_key: String,
        paths: Vec<PathBuf>,
        bytes: u64,
    },
    Refused {
        remote_key: String,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct FreeLocalReport {
    pub outcomes: Vec<FreeOutcome>,
}

impl FreeLocalReport {
    pub fn freed_bytes(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                FreeOutcome::Freed { bytes, .. } => *bytes,
                FreeOutcome::Refused { .. } => 0,
            })
            .sum()
    }

    pub fn refused_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FreeOutcome::Refused { .. }))
            .count()
    }
}

/// Deletes local copies of archived data after re-checking both sides.
#[derive(Clone)]
pub struct FreeLocalOperation {
    index: Arc<dyn IndexStore>,
    tier: Arc<dyn TierClient>,
    retry: RetryPolicy,
}

impl FreeLocalOperation {
    pub fn new(index: Arc<dyn IndexStore>, tier: Arc<dyn TierClient>, retry: RetryPolicy) -> Self {
        Self { index, tier, retry }
    }

    pub async fn run(&self, request: FreeLocalOperationRequest) -> Result<FreeLocalReport> {
        if !request.confirm {
            return Err(GlacioError::Policy(
                "freeing local space deletes files; confirmation is required".to_string(),
            ));
        }

        let mut report = FreeLocalReport::default();
        for entry in self.resolve(&request.paths)? {
            let outcome = match self.verify(&entry).await? {
                Some(reason) => {
                    tracing::warn!("Keeping local copy of {}: {}", entry.remote_key, reason);
                    FreeOutcome::Refused {
                        remote_key: entry.remote_key.clone(),
                        reason,
                    }
                }
                None => self.free(&entry).await?,
            };
            report.outcomes.push(outcome);
        }

        tracing::info!(
            "Freed {} bytes, refused {} entries",
            report.freed_bytes(),
            report.refused_count()
        );
        Ok(report)
    }

    fn resolve(&self, paths: &[PathBuf]) -> Result<Vec<ArchiveEntry>> {
        let mut entries: BTreeMap<String, ArchiveEntry> = BTreeMap::new();
        for path in paths {
            let text = path.to_string_lossy().trim_end_matches('/').to_string();

            if path.is_dir() {
                let filter = EntryFilter {
                    path_prefix: Some(text.clone()),
                    ..EntryFilter::default()
                };
                for entry in EntryCursor::new(self.index.clone(), filter) {
                    let entry = entry?;
                    let inside = Path::new(&entry.origin_path).starts_with(&text);
                    if inside {
                        entries.insert(entry.remote_key.clone(), entry);
                    }
                }
            }

            match self.index.get(&EntryLookup::OriginPath(text)) {
                Ok(entry) => {
                    entries.insert(entry.remote_key.clone(), entry);
                }
                Err(GlacioError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }

        if entries.is_empty() {
            return Err(GlacioError::NotFound(format!(
                "no archived entries under {:?}",
                paths
            )));
        }
        Ok(entries.into_values().collect())
    }

    /// `None` when the local copy may go; otherwise the reason it stays.
    async fn verify(&self, entry: &ArchiveEntry) -> Result<Option<String>> {
        if !entry.is_trusted() {
            return Ok(Some("entry failed integrity verification".to_string()));
        }

        let head = match self
            .retry
            .run("head", || self.tier.head(&entry.remote_key))
            .await
        {
            Ok(head) => head,
            Err(error) => return Ok(Some(format!("remote object unavailable: {}", error))),
        };
        if head.size != entry.size_bytes {
            return Ok(Some(format!(
                "remote size {} differs from recorded {}",
                head.size, entry.size_bytes
            )));
        }
        if let Some(remote) = head.remote_digest.as_deref() {
            if !remote.eq_ignore_ascii_case(&entry.digest) {
                return Ok(Some("remote digest differs from recorded digest".to_string()));
            }
        }

        for (path, expected) in local_members(entry) {
            if !tokio::fs::try_exists(&path).await? {
                continue;
            }
            let (digest, _) = digest_file(&path).await?;
            if !digest.eq_ignore_ascii_case(&expected) {
                return Ok(Some(format!("{} changed since it was archived", path.display())));
            }
        }

        Ok(None)
    }

    async fn free(&self, entry: &ArchiveEntry) -> Result<FreeOutcome> {
        let mut freed = Vec::new();
        let mut bytes = 0;
        for (path, _) in local_members(entry) {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            tokio::fs::remove_file(&path).await?;
            bytes += metadata.len();
            freed.push(path);
        }

        if !freed.is_empty() {
            write_note(entry, &freed).await?;
        }

        tracing::info!(
            "Freed {} local files ({} bytes) of {}",
            freed.len(),
            bytes,
            entry.remote_key
        );
        Ok(FreeOutcome::Freed {
            remote_key: entry.remote_key.clone(),
            paths: freed,
            bytes,
        })
    }
}

fn local_members(entry: &ArchiveEntry) -> Vec<(PathBuf, String)> {
    match entry.kind {
        EntryKind::File => vec![(PathBuf::from(&entry.origin_path), entry.digest.clone())],
        EntryKind::Bundle => entry
            .members
            .iter()
            .map(|member| {
                (
                    Path::new(&entry.origin_path).join(&member.name),
                    member.digest.clone(),
                )
            })
            .collect(),
    }
}

/// Append to the note in each directory that lost files.
async fn write_note(entry: &ArchiveEntry, freed: &[PathBuf]) -> Result<()> {
    let mut by_dir: BTreeMap<PathBuf, Vec<&Path>> = BTreeMap::new();
    for path in freed {
        if let Some(dir) = path.parent() {
            by_dir.entry(dir.to_path_buf()).or_default().push(path);
        }
    }

    for (dir, paths) in by_dir {
        let mut text = format!(
            "\n{}: the files below were archived to object storage and removed locally.\n\
             Remote key: {} ({})\n\
             To get them back run: glacio restore {}\n",
            format_timestamp(&timestamp_now()),
            entry.remote_key,
            entry.storage_class,
            entry.origin_path
        );
        for path in paths {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            text.push_str(&format!("  {}\n", name));
        }

        let mut note = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(WHERE_DID_THE_FILES_GO))
            .await?;
        note.write_all(text.as_bytes()).await?;
        note.flush().await?;
    }
    Ok(())
}
