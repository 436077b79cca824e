use super::s3_restore::S3RestoreClient;
use super::{
    ByteStream, ObjectHead, ProviderRestoreStatus, RestoreSpeed, TierClient, TierError,
    TierResult, is_cold_class, tier_for_class,
};
use crate::checksum::StreamingDigest;
use crate::error::{GlacioError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, Checksum};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, WriteMultipart};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Objects up to this size go up in a single PUT.
const SINGLE_PUT_LIMIT: usize = 8 * 1024 * 1024;
const READ_CHUNK_SIZE: usize = 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

const STORAGE_CLASS_HEADER: &str = "x-amz-storage-class";

#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub timeout_secs: Option<u64>,
}

/// `TierClient` over any `object_store` backend.
///
/// The storage class is fixed per client. On S3, cold classes are thawed with
/// `RestoreObject` and watched through `HeadObject`, and uploads carry a
/// SHA-256 checksum that `head` reports back without reading the object.
/// Other backends have no restore call; a cold object there counts as
/// restored once the store serves its first byte.
pub struct ObjectStoreTierClient {
    name: String,
    store: Arc<dyn ObjectStore>,
    storage_class: String,
    readback_digest: bool,
    restore: Option<S3RestoreClient>,
}

impl ObjectStoreTierClient {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        storage_class: impl Into<String>,
    ) -> Self {
        let storage_class = storage_class.into().trim().to_ascii_uppercase();
        Self {
            name: name.into(),
            readback_digest: !is_cold_class(&storage_class),
            store,
            storage_class,
            restore: None,
        }
    }

    /// Store objects as plain files under `root`.
    pub fn local(root: &Path, storage_class: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
            GlacioError::Config(format!("invalid local store root {:?}: {}", root, e))
        })?;
        Ok(Self::new("local", Arc::new(store), storage_class))
    }

    pub fn s3(options: &S3Options, storage_class: &str) -> Result<Self> {
        if options.bucket.trim().is_empty() {
            return Err(GlacioError::Config(
                "s3 bucket is required for s3 backend".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let class = HeaderValue::from_str(&storage_class.trim().to_ascii_uppercase())
            .map_err(|e| GlacioError::Config(format!("invalid storage class: {}", e)))?;
        headers.insert(HeaderName::from_static(STORAGE_CLASS_HEADER), class);

        let mut client_options = ClientOptions::new().with_default_headers(headers);
        if let Some(timeout_secs) = options.timeout_secs {
            client_options = client_options.with_timeout(Duration::from_secs(timeout_secs));
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&options.bucket)
            .with_checksum_algorithm(Checksum::SHA256)
            .with_client_options(client_options);

        if let Some(region) = options.region.as_deref() {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = options.endpoint.as_deref() {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if let (Some(key_id), Some(secret)) = (
            options.access_key_id.as_deref(),
            options.secret_access_key.as_deref(),
        ) {
            builder = builder
                .with_access_key_id(key_id)
                .with_secret_access_key(secret);
        }
        if options.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder
            .build()
            .map_err(|e| GlacioError::Config(format!("failed to build s3 client: {}", e)))?;
        let mut client = Self::new("s3", Arc::new(store), storage_class);
        client.restore = Some(S3RestoreClient::new(options.clone()));
        Ok(client)
    }

    /// Whether `head` reads the object back to compute its digest.
    pub fn with_readback_digest(mut self, enabled: bool) -> Self {
        self.readback_digest = enabled && !self.is_cold();
        self
    }

    fn is_cold(&self) -> bool {
        is_cold_class(&self.storage_class)
    }

    fn location(key: &str) -> ObjectPath {
        ObjectPath::from(key)
    }

    async fn upload_multipart(
        &self,
        location: &ObjectPath,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> TierResult<Option<String>> {
        let upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(classify_error)?;
        let mut writer = WriteMultipart::new(upload);
        writer.write(&first);

        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(TierError::Permanent(format!("failed to read source: {}", e)));
                }
            };
            if read == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await {
                let _ = writer.abort().await;
                return Err(classify_error(e));
            }
            writer.write(&buffer[..read]);
        }

        let result = writer.finish().await.map_err(classify_error)?;
        Ok(result.e_tag)
    }

    /// Succeeds once the provider serves the object's bytes.
    async fn check_readable(&self, location: &ObjectPath) -> TierResult<()> {
        let meta = self.store.head(location).await.map_err(classify_error)?;
        if meta.size == 0 {
            return Ok(());
        }
        self.store
            .get_range(location, 0..1)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }
}

#[async_trait]
impl TierClient for ObjectStoreTierClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_class(&self) -> &str {
        &self.storage_class
    }

    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> TierResult<Option<String>> {
        let location = Self::location(key);

        // Buffer up to the single-put limit; anything larger switches to multipart.
        let mut first = Vec::with_capacity(READ_CHUNK_SIZE);
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|e| TierError::Permanent(format!("failed to read source: {}", e)))?;
            if read == 0 {
                let result = self
                    .store
                    .put(&location, PutPayload::from(Bytes::from(first)))
                    .await
                    .map_err(classify_error)?;
                tracing::debug!("Uploaded {} to {} in a single put", key, self.name);
                return Ok(result.e_tag);
            }

            first.extend_from_slice(&buffer[..read]);
            if first.len() > SINGLE_PUT_LIMIT {
                break;
            }
        }

        tracing::debug!("Uploading {} to {} in parts", key, self.name);
        self.upload_multipart(&location, first, reader).await
    }

    async fn download(&self, key: &str) -> TierResult<ByteStream> {
        let result = self
            .store
            .get(&Self::location(key))
            .await
            .map_err(classify_error)?;
        Ok(result.into_stream().map_err(classify_error).boxed())
    }

    async fn head(&self, key: &str) -> TierResult<ObjectHead> {
        let location = Self::location(key);
        let meta = self.store.head(&location).await.map_err(classify_error)?;

        let remote_digest = if self.readback_digest {
            let mut stream = self
                .store
                .get(&location)
                .await
                .map_err(classify_error)?
                .into_stream();
            let mut digest = StreamingDigest::new();
            while let Some(chunk) = stream.next().await {
                digest.update(&chunk.map_err(classify_error)?);
            }
            Some(digest.finish())
        } else if let Some(restore) = &self.restore {
            restore.sha256(key).await?
        } else {
            None
        };

        Ok(ObjectHead {
            size: meta.size as u64,
            remote_digest,
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
        let location = Self::location(key);
        if !self.is_cold() {
            self.store.head(&location).await.map_err(classify_error)?;
            return Ok(format!("{}:readable", key));
        }
        if let Some(restore) = &self.restore {
            return restore.request_restore(key, days, speed).await;
        }

        match self.check_readable(&location).await {
            Ok(()) => {
                tracing::info!(
                    "Object {} is already readable, no restore needed ({} days, {})",
                    key,
                    days,
                    speed
                );
                Ok(format!("{}:readable", key))
            }
            Err(TierError::NotFound(message)) => Err(TierError::NotFound(message)),
            Err(e) => Err(TierError::Permanent(format!(
                "{} cannot issue restore requests for {} objects: {}",
                self.name, self.storage_class, e
            ))),
        }
    }

    async fn poll_restore(&self, key: &str) -> TierResult<ProviderRestoreStatus> {
        let location = Self::location(key);
        if !self.is_cold() {
            self.store.head(&location).await.map_err(classify_error)?;
            return Ok(ProviderRestoreStatus::Ready { expires_at: None });
        }
        if let Some(restore) = &self.restore {
            return restore.restore_status(key).await;
        }

        self.check_readable(&location)
            .await
            .map(|()| ProviderRestoreStatus::Ready { expires_at: None })
    }

    async fn delete(&self, key: &str) -> TierResult<()> {
        self.store
            .delete(&Self::location(key))
            .await
            .map_err(classify_error)
    }
}

fn classify_error(error: object_store::Error) -> TierError {
    let message = error.to_string();
    match error {
        object_store::Error::NotFound { path, .. } => TierError::NotFound(path),
        object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. }
        | object_store::Error::UnknownConfigurationKey { .. } => TierError::Permanent(message),
        _ if is_refusal(&message) => TierError::Permanent(message),
        _ => TierError::Transient(message),
    }
}

/// Provider answers that will not change on retry.
fn is_refusal(message: &str) -> bool {
    ["InvalidObjectState", "AccessDenied", "403 Forbidden", "401 Unauthorized"]
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_hash;
    use futures_util::TryStreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_local_upload_head_download() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreTierClient::local(temp_dir.path(), "STANDARD").unwrap();

        let payload = b"archived bytes".to_vec();
        client
            .upload("glacio/01/data/a.bin", &mut &payload[..])
            .await
            .unwrap();

        let head = client.head("glacio/01/data/a.bin").await.unwrap();
        assert_eq!(head.size, payload.len() as u64);
        assert_eq!(head.remote_digest, Some(compute_hash(&payload)));
        assert_eq!(head.tier, crate::StorageTier::Standard);

        let stream = client.download("glacio/01/data/a.bin").await.unwrap();
        assert_eq!(collect(stream).await, payload);
    }

    #[tokio::test]
    async fn test_large_upload_goes_multipart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreTierClient::local(temp_dir.path(), "STANDARD").unwrap();

        let payload: Vec<u8> = (0..SINGLE_PUT_LIMIT + 3 * READ_CHUNK_SIZE + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        client.upload("big/object", &mut &payload[..]).await.unwrap();

        let head = client.head("big/object").await.unwrap();
        assert_eq!(head.size, payload.len() as u64);
        assert_eq!(head.remote_digest, Some(compute_hash(&payload)));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreTierClient::local(temp_dir.path(), "STANDARD").unwrap();

        assert!(matches!(
            client.head("nope").await,
            Err(TierError::NotFound(_))
        ));
        assert!(matches!(
            client.download("nope").await,
            Err(TierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cold_class_skips_readback_and_reports_ready_when_served() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreTierClient::local(temp_dir.path(), "deep_archive").unwrap();
        assert_eq!(client.storage_class(), "DEEP_ARCHIVE");

        client.upload("cold/key", &mut &b"frozen"[..]).await.unwrap();
        let head = client.head("cold/key").await.unwrap();
        assert_eq!(head.remote_digest, None);
        assert_eq!(head.tier, crate::StorageTier::Cold);

        // Without a restore call the store serving the bytes is the signal.
        client
            .request_restore("cold/key", 1, RestoreSpeed::Bulk)
            .await
            .unwrap();
        assert_eq!(
            client.poll_restore("cold/key").await.unwrap(),
            ProviderRestoreStatus::Ready { expires_at: None }
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreTierClient::local(temp_dir.path(), "STANDARD").unwrap();
        client.upload("k", &mut &b"x"[..]).await.unwrap();
        client.delete("k").await.unwrap();
        assert!(matches!(client.head("k").await, Err(TierError::NotFound(_))));
    }
}
