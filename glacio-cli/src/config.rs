use glacio_core::{
    ArchiveOptions, BundlingConfig, GlacioError, GlacioOptions, PolicyConfig, RestoreOptions,
    RestoreSpeed, Result, RetryPolicy, S3Options, TierClientBuilder,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub bundling: BundlingConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("glacio.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    /// Read objects back after upload to compare digests. Defaults to on for readable classes.
    #[serde(default)]
    pub readback_digest: Option<bool>,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            storage_class: default_storage_class(),
            key_prefix: default_key_prefix(),
            local_root: None,
            readback_digest: None,
            s3: None,
        }
    }
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_storage_class() -> String {
    "DEEP_ARCHIVE".to_string()
}

fn default_key_prefix() -> String {
    "glacio".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: Option<S3Credentials>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub supersede: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            staging_dir: None,
            supersede: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(default = "default_restore_days")]
    pub days: u32,
    #[serde(default)]
    pub speed: RestoreSpeed,
    #[serde(default = "default_poll_initial_secs")]
    pub poll_initial_secs: u64,
    #[serde(default = "default_poll_max_secs")]
    pub poll_max_secs: u64,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            days: default_restore_days(),
            speed: RestoreSpeed::default(),
            poll_initial_secs: default_poll_initial_secs(),
            poll_max_secs: default_poll_max_secs(),
            timeout_hours: default_timeout_hours(),
        }
    }
}

fn default_restore_days() -> u32 {
    30
}

fn default_poll_initial_secs() -> u64 {
    60
}

fn default_poll_max_secs() -> u64 {
    900
}

fn default_timeout_hours() -> u64 {
    48
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("GLACIO").separator("__"))
            .build()
            .map_err(|e| GlacioError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| GlacioError::Config(e.to_string()))?;

        // The in-memory tier forgets every object on exit.
        if config.storage.backend.trim().eq_ignore_ascii_case("memory") {
            return Err(GlacioError::Config(
                "storage backend 'memory' is for tests only; use 'local' or 's3'".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn tier_builder(&self) -> TierClientBuilder {
        let mut builder = TierClientBuilder::new()
            .backend(&self.storage.backend)
            .storage_class(&self.storage.storage_class);

        if let Some(root) = self.storage.local_root.as_ref() {
            builder = builder.local_root(root);
        }
        if let Some(enabled) = self.storage.readback_digest {
            builder = builder.readback_digest(enabled);
        }
        if let Some(s3) = self.storage.s3.as_ref() {
            builder = builder.s3(S3Options {
                bucket: s3.bucket.clone(),
                region: s3.region.clone(),
                endpoint: s3.endpoint.clone(),
                access_key_id: s3.credentials.as_ref().map(|c| c.access_key_id.clone()),
                secret_access_key: s3
                    .credentials
                    .as_ref()
                    .map(|c| c.secret_access_key.clone()),
                allow_http: s3.allow_http,
                timeout_secs: s3.timeout_secs,
            });
        }

        builder
    }

    pub fn glacio_options(&self) -> GlacioOptions {
        let defaults = ArchiveOptions::default();
        GlacioOptions {
            policy: self.policy.clone(),
            bundling: self.bundling.clone(),
            archive: ArchiveOptions {
                key_prefix: self.storage.key_prefix.clone(),
                concurrency: self.transfer.concurrency.max(1),
                retry: self.transfer.retry,
                staging_dir: self
                    .transfer
                    .staging_dir
                    .clone()
                    .unwrap_or(defaults.staging_dir),
                supersede: self.transfer.supersede,
                archived_by: std::env::var("USER").ok(),
            },
            restore: RestoreOptions {
                days: self.restore.days,
                speed: self.restore.speed,
                poll_initial_ms: self.restore.poll_initial_secs.saturating_mul(1000),
                poll_max_ms: self.restore.poll_max_secs.saturating_mul(1000),
                timeout_secs: self.restore.timeout_hours.saturating_mul(3600),
                retry: self.transfer.retry,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_with_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("glacio.yaml");
        std::fs::write(
            &path,
            format!(
                "index:\n  path: /var/lib/glacio/index.db\n\
                 storage:\n  backend: local\n  local_root: {}\n  storage_class: glacier\n\
                 policy:\n  min_size_bytes: 1024\n  exclude_globs: ['*.tmp']\n\
                 restore:\n  speed: expedited\n  days: 3\n",
                temp_dir.path().join("objects").display()
            ),
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.index.path, PathBuf::from("/var/lib/glacio/index.db"));
        assert_eq!(config.policy.min_size_bytes, 1024);
        assert_eq!(config.transfer.concurrency, 4);

        let options = config.glacio_options();
        assert_eq!(options.restore.speed, RestoreSpeed::Expedited);
        assert_eq!(options.restore.days, 3);
        assert_eq!(options.archive.key_prefix, "glacio");

        let tier = config.tier_builder().build().unwrap();
        assert_eq!(tier.storage_class(), "GLACIER");
    }

    #[test]
    fn test_memory_backend_is_refused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("glacio.yaml");
        std::fs::write(&path, "storage:\n  backend: memory\n").unwrap();

        let err = Config::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, GlacioError::Config(ref m) if m.contains("memory")));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/nonexistent/glacio.yaml").unwrap_err();
        assert!(matches!(err, GlacioError::Config(_)));
    }
}
