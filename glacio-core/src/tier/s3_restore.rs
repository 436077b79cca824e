//! S3 calls that `object_store` does not expose.
//!
//! Archived storage classes need `RestoreObject` to thaw an object and the
//! `x-amz-restore` header of `HeadObject` to watch it. Both go through the AWS
//! SDK; bytes still move through `object_store`.

use super::object_store_client::S3Options;
use super::{ProviderRestoreStatus, RestoreSpeed, TierError, TierResult, is_cold_class};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::RequestId;
use aws_sdk_s3::types::{ChecksumMode, GlacierJobParameters, RestoreRequest, Tier};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::OnceCell;

const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "RequestTimeout",
    "Throttling",
];

pub struct S3RestoreClient {
    options: S3Options,
    client: OnceCell<Client>,
}

impl S3RestoreClient {
    /// The SDK client is built on first use.
    pub fn new(options: S3Options) -> Self {
        Self {
            options,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| build_client(&self.options))
            .await
    }

    /// Issue `RestoreObject`. A restore that is already running, or an object
    /// that is already readable, counts as accepted.
    pub async fn request_restore(
        &self,
        key: &str,
        days: u32,
        speed: RestoreSpeed,
    ) -> TierResult<String> {
        let job = GlacierJobParameters::builder()
            .tier(Tier::from(speed.as_str()))
            .build()
            .map_err(|e| TierError::Permanent(format!("invalid restore parameters: {}", e)))?;
        let request = RestoreRequest::builder()
            .days(i32::try_from(days).unwrap_or(i32::MAX))
            .glacier_job_parameters(job)
            .build();

        let result = self
            .client()
            .await
            .restore_object()
            .bucket(&self.options.bucket)
            .key(key)
            .restore_request(request)
            .send()
            .await;

        match result {
            Ok(output) => {
                tracing::info!(
                    "Requested restore of s3://{}/{} for {} days ({})",
                    self.options.bucket,
                    key,
                    days,
                    speed
                );
                Ok(output.request_id().unwrap_or(key).to_string())
            }
            Err(e) if e.code() == Some("RestoreAlreadyInProgress") => {
                tracing::debug!("Restore of {} is already in progress", key);
                Ok(format!("{}:in-progress", key))
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|s| s.is_object_already_in_active_tier_error()) =>
            {
                Ok(format!("{}:readable", key))
            }
            Err(e) => Err(classify_sdk_error("restore_object", key, e)),
        }
    }

    /// Read the restore state from `HeadObject`.
    pub async fn restore_status(&self, key: &str) -> TierResult<ProviderRestoreStatus> {
        let output = self
            .client()
            .await
            .head_object()
            .bucket(&self.options.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("head_object", key, e))?;

        // S3 omits the storage class header for STANDARD objects.
        let cold = output
            .storage_class()
            .is_some_and(|class| is_cold_class(class.as_str()));
        Ok(parse_restore_header(output.restore(), cold))
    }

    /// The SHA-256 S3 stored for the object, as hex. `None` when the object
    /// carries no checksum or only a composite multipart one.
    pub async fn sha256(&self, key: &str) -> TierResult<Option<String>> {
        let output = self
            .client()
            .await
            .head_object()
            .bucket(&self.options.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(|e| classify_sdk_error("head_object", key, e))?;
        Ok(output.checksum_sha256().and_then(decode_checksum))
    }
}

async fn build_client(options: &S3Options) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = options.region.as_deref() {
        loader = loader.region(aws_sdk_s3::config::Region::new(region.to_string()));
    }
    if let (Some(key_id), Some(secret)) = (
        options.access_key_id.as_deref(),
        options.secret_access_key.as_deref(),
    ) {
        loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
            key_id, secret, None, None, "glacio",
        ));
    }
    if let Some(timeout_secs) = options.timeout_secs {
        loader = loader.timeout_config(
            aws_config::timeout::TimeoutConfig::builder()
                .operation_timeout(Duration::from_secs(timeout_secs))
                .build(),
        );
    }
    let sdk_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = options.endpoint.as_deref() {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Client::from_conf(builder.build())
}

/// Interpret `x-amz-restore`, e.g.
/// `ongoing-request="false", expiry-date="Fri, 21 Dec 2012 00:00:00 GMT"`.
pub(crate) fn parse_restore_header(header: Option<&str>, cold: bool) -> ProviderRestoreStatus {
    let Some(header) = header else {
        return if cold {
            ProviderRestoreStatus::Pending
        } else {
            ProviderRestoreStatus::Ready { expires_at: None }
        };
    };

    match quoted_value(header, "ongoing-request") {
        Some("true") => ProviderRestoreStatus::InProgress,
        Some("false") => ProviderRestoreStatus::Ready {
            expires_at: quoted_value(header, "expiry-date")
                .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
                .map(|date| date.with_timezone(&Utc)),
        },
        _ => ProviderRestoreStatus::Pending,
    }
}

fn quoted_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{}=\"", name);
    let start = header.find(&marker)? + marker.len();
    let rest = &header[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Base64 SHA-256 to hex. Composite checksums look like `<base64>-<parts>`.
pub(crate) fn decode_checksum(value: &str) -> Option<String> {
    if value.contains('-') {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()?;
    (bytes.len() == 32).then(|| hex::encode(bytes))
}

fn classify_sdk_error<E, R>(operation: &str, key: &str, error: SdkError<E, R>) -> TierError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = error.code().map(str::to_string);
    let message = format!("s3 {} {}: {}", operation, key, DisplayErrorContext(&error));
    match (&error, code.as_deref()) {
        (_, Some("NoSuchKey" | "NotFound")) => TierError::NotFound(key.to_string()),
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_), _) => {
            TierError::Transient(message)
        }
        (_, Some(code)) if TRANSIENT_CODES.iter().any(|c| code.starts_with(c)) => {
            TierError::Transient(message)
        }
        _ => TierError::Permanent(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_hash;
    use chrono::TimeZone;

    #[test]
    fn test_restore_header_states() {
        assert_eq!(parse_restore_header(None, true), ProviderRestoreStatus::Pending);
        assert_eq!(
            parse_restore_header(None, false),
            ProviderRestoreStatus::Ready { expires_at: None }
        );
        assert_eq!(
            parse_restore_header(Some("ongoing-request=\"true\""), true),
            ProviderRestoreStatus::InProgress
        );
        assert_eq!(
            parse_restore_header(
                Some("ongoing-request=\"false\", expiry-date=\"Fri, 21 Dec 2012 00:00:00 GMT\""),
                true
            ),
            ProviderRestoreStatus::Ready {
                expires_at: Some(Utc.with_ymd_and_hms(2012, 12, 21, 0, 0, 0).unwrap())
            }
        );
    }

    #[test]
    fn test_restore_header_with_bad_date_is_still_ready() {
        assert_eq!(
            parse_restore_header(Some("ongoing-request=\"false\", expiry-date=\"soon\""), true),
            ProviderRestoreStatus::Ready { expires_at: None }
        );
        assert_eq!(
            parse_restore_header(Some("garbage"), true),
            ProviderRestoreStatus::Pending
        );
    }

    #[test]
    fn test_checksum_decoding() {
        let digest = compute_hash(b"hello");
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(hex::decode(&digest).unwrap());
        assert_eq!(decode_checksum(&encoded), Some(digest));

        assert_eq!(decode_checksum(&format!("{}-3", encoded)), None);
        assert_eq!(decode_checksum("not base64!"), None);
        assert_eq!(decode_checksum("aGVsbG8="), None);
    }

    #[test]
    fn test_speed_maps_to_job_tier() {
        assert_eq!(Tier::from(RestoreSpeed::Bulk.as_str()), Tier::Bulk);
        assert_eq!(Tier::from(RestoreSpeed::Standard.as_str()), Tier::Standard);
        assert_eq!(Tier::from(RestoreSpeed::Expedited.as_str()), Tier::Expedited);
    }
}
