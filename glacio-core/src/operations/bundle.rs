//! Transfer unit planning and tar bundles for small files.

use crate::checksum::StreamingDigest;
use crate::error::{GlacioError, Result};
use crate::model::{BundleMember, FileMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Name of the object a bundle is stored under, inside its directory's key.
pub const BUNDLE_OBJECT_NAME: &str = "glacio.bundle.tar";

fn default_bundle_threshold_bytes() -> u64 {
    1024 * 1024
}

fn default_max_bundle_bytes() -> u64 {
    1024 * 1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlingConfig {
    /// Files smaller than this are bundled per directory. Zero disables bundling.
    #[serde(default = "default_bundle_threshold_bytes")]
    pub bundle_threshold_bytes: u64,
    #[serde(default = "default_max_bundle_bytes")]
    pub max_bundle_bytes: u64,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        Self {
            bundle_threshold_bytes: default_bundle_threshold_bytes(),
            max_bundle_bytes: default_max_bundle_bytes(),
        }
    }
}

impl BundlingConfig {
    pub fn disabled() -> Self {
        Self {
            bundle_threshold_bytes: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUnit {
    File(FileMetadata),
    Bundle { dir: PathBuf, files: Vec<FileMetadata> },
}

impl TransferUnit {
    /// Path recorded as the entry's origin: the file, or the bundle's directory.
    pub fn origin_path(&self) -> &Path {
        match self {
            Self::File(file) => &file.path,
            Self::Bundle { dir, .. } => dir,
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            Self::File(file) => file.size,
            Self::Bundle { files, .. } => files.iter().map(|file| file.size).sum(),
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            Self::File(_) => 1,
            Self::Bundle { files, .. } => files.len(),
        }
    }
}

/// Split eligible files into transfer units.
///
/// Units come out in path order. Small files are grouped by parent directory;
/// a group is cut whenever adding the next file would exceed the bundle cap.
pub fn plan_units(mut files: Vec<FileMetadata>, config: &BundlingConfig) -> Vec<TransferUnit> {
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut units = Vec::new();
    let mut small: BTreeMap<PathBuf, Vec<FileMetadata>> = BTreeMap::new();

    for file in files {
        let parent = file.path.parent().map(Path::to_path_buf);
        match parent {
            Some(dir) if file.size < config.bundle_threshold_bytes => {
                small.entry(dir).or_default().push(file);
            }
            _ => units.push(TransferUnit::File(file)),
        }
    }

    let cap = config.max_bundle_bytes.max(1);
    for (dir, group) in small {
        let mut current: Vec<FileMetadata> = Vec::new();
        let mut current_size = 0u64;
        for file in group {
            if !current.is_empty() && current_size + file.size > cap {
                units.push(bundle_or_single(dir.clone(), std::mem::take(&mut current)));
                current_size = 0;
            }
            current_size += file.size;
            current.push(file);
        }
        if !current.is_empty() {
            units.push(bundle_or_single(dir, current));
        }
    }

    units.sort_by(|a, b| a.origin_path().cmp(b.origin_path()));
    units
}

fn bundle_or_single(dir: PathBuf, mut files: Vec<FileMetadata>) -> TransferUnit {
    if files.len() == 1 {
        if let Some(file) = files.pop() {
            return TransferUnit::File(file);
        }
    }
    TransferUnit::Bundle { dir, files }
}

/// Hashes bytes as the tar builder pulls them from disk.
struct HashingRead<R> {
    inner: R,
    digest: StreamingDigest,
}

impl<R: Read> Read for HashingRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.digest.update(&buf[..read]);
        Ok(read)
    }
}

/// Write a tar of `files` to `staged` and return the member records.
///
/// Member names are relative to `dir`. Blocking; run it off the async runtime.
pub fn build_bundle(dir: &Path, files: &[FileMetadata], staged: &Path) -> Result<Vec<BundleMember>> {
    if let Some(parent) = staged.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut builder = tar::Builder::new(File::create(staged)?);
    let mut members = Vec::with_capacity(files.len());

    for file in files {
        let name = file
            .path
            .strip_prefix(dir)
            .map_err(|_| {
                GlacioError::Internal(format!("{:?} is not inside bundle dir {:?}", file.path, dir))
            })?
            .to_string_lossy()
            .to_string();

        let source = File::open(&file.path)?;
        let metadata = source.metadata()?;

        let mut header = tar::Header::new_gnu();
        header.set_metadata(&metadata);
        header.set_size(metadata.len());

        let mut reader = HashingRead {
            inner: source.take(metadata.len()),
            digest: StreamingDigest::new(),
        };
        builder.append_data(&mut header, &name, &mut reader)?;

        let size_bytes = reader.digest.len();
        if size_bytes != metadata.len() {
            return Err(GlacioError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{:?} shrank while bundling", file.path),
            )));
        }

        members.push(BundleMember {
            name,
            size_bytes,
            digest: reader.digest.finish(),
        });
    }

    builder.into_inner()?.sync_all()?;
    Ok(members)
}

/// Unpack a verified bundle into `dest_dir`. Blocking.
pub fn unpack_bundle(bundle: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let mut archive = tar::Archive::new(File::open(bundle)?);
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);
    archive.unpack(dest_dir)?;
    Ok(())
}
