use super::{MemoryTierClient, ObjectStoreTierClient, S3Options, TierClient};
use crate::error::{GlacioError, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TierClientBuilder {
    backend: Option<String>,
    storage_class: Option<String>,
    local_root: Option<PathBuf>,
    s3: Option<S3Options>,
    readback_digest: Option<bool>,
}

impl TierClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    pub fn s3(mut self, options: S3Options) -> Self {
        self.s3 = Some(options);
        self
    }

    pub fn readback_digest(mut self, enabled: bool) -> Self {
        self.readback_digest = Some(enabled);
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(GlacioError::Config(
                "storage backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    fn resolve_storage_class(&self) -> Result<String> {
        let class = self
            .storage_class
            .as_deref()
            .unwrap_or("DEEP_ARCHIVE")
            .trim()
            .to_ascii_uppercase();

        if class.is_empty() {
            return Err(GlacioError::Config(
                "storage class cannot be empty".to_string(),
            ));
        }

        Ok(class)
    }

    pub fn build(&self) -> Result<Arc<dyn TierClient>> {
        let backend = self.resolve_backend()?;
        let storage_class = self.resolve_storage_class()?;

        match backend.as_str() {
            "local" => {
                let root = self.local_root.as_ref().ok_or_else(|| {
                    GlacioError::Config("local root is required for local backend".to_string())
                })?;

                let mut client = ObjectStoreTierClient::local(root, &storage_class)?;
                if let Some(enabled) = self.readback_digest {
                    client = client.with_readback_digest(enabled);
                }
                Ok(Arc::new(client))
            }
            "s3" => {
                let options = self.s3.as_ref().ok_or_else(|| {
                    GlacioError::Config("s3 options are required for s3 backend".to_string())
                })?;

                let mut client = ObjectStoreTierClient::s3(options, &storage_class)?;
                if let Some(enabled) = self.readback_digest {
                    client = client.with_readback_digest(enabled);
                }
                Ok(Arc::new(client))
            }
            "memory" => Ok(Arc::new(MemoryTierClient::new(&storage_class))),
            other => Err(GlacioError::Config(format!(
                "unsupported storage backend: {}",
                other
            ))),
        }
    }
}
