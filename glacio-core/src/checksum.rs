//! SHA-256 content digests.
//!
//! Every digest is the lowercase hex encoding of a SHA-256 over the exact bytes
//! that were (or will be) transferred. Hashing is incremental so that large
//! files and bundles never have to be buffered in memory.

use crate::error::{GlacioError, Result};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(key: &str, data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    check_digest(key, expected_hash, &actual_hash)
}

pub fn check_digest(key: &str, expected: &str, actual: &str) -> Result<()> {
    if !expected.eq_ignore_ascii_case(actual) {
        return Err(GlacioError::Integrity {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Incremental digest for data that arrives in pieces.
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Wraps a reader and hashes every byte handed to the consumer.
///
/// The uploader reads through this wrapper, so the resulting digest describes
/// precisely the bytes that went over the wire.
pub struct DigestReader<R> {
    inner: R,
    digest: StreamingDigest,
}

impl<R> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: StreamingDigest::new(),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.digest.len()
    }

    /// Returns the hex digest and the number of bytes read.
    pub fn finish(self) -> (String, u64) {
        let len = self.digest.len();
        (self.digest.finish(), len)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.digest.update(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Digest an arbitrary byte stream to the end.
pub async fn digest_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(String, u64)> {
    let mut digest = StreamingDigest::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
    }
    let len = digest.len();
    Ok((digest.finish(), len))
}

pub async fn digest_file(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    digest_reader(&mut file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_compute_hash() {
        let data = b"hello world";
        let hash = compute_hash(data);
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_hash_mismatch() {
        let err = verify_hash("k", b"abc", &compute_hash(b"abd")).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut digest = StreamingDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.len(), 11);
        assert_eq!(digest.finish(), compute_hash(b"hello world"));
    }

    #[tokio::test]
    async fn test_digest_reader_hashes_what_was_read() {
        let payload = vec![7u8; 700_000];
        let mut reader = DigestReader::new(&payload[..]);
        let mut sink = Vec::new();
        tokio::io::copy(&mut reader, &mut sink).await.unwrap();

        let (digest, len) = reader.finish();
        assert_eq!(len, payload.len() as u64);
        assert_eq!(digest, compute_hash(&payload));
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn test_digest_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("data.bin");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"cold data").await.unwrap();
        file.sync_all().await.unwrap();

        let (digest, len) = digest_file(&path).await.unwrap();
        assert_eq!(len, 9);
        assert_eq!(digest, compute_hash(b"cold data"));
    }
}
