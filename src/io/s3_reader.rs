use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::range_reader::check_range;
use super::RangeReader;
use crate::error::IoError;

/// S3-backed implementation of RangeReader.
///
/// Reads byte ranges from objects in S3 or S3-compatible storage (MinIO, GCS, etc.)
/// using HTTP range requests. The object size is fetched once on creation via HEAD.
#[derive(Clone)]
pub struct S3RangeReader {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
    identifier: String,
}

impl S3RangeReader {
    /// Create a new S3RangeReader for the given bucket and key.
    ///
    /// This performs a HEAD request to determine the object size.
    /// Returns an error if the object does not exist or is inaccessible.
    pub async fn new(client: Client, bucket: String, key: String) -> Result<Self, IoError> {
        let identifier = format!("s3://{}/{}", bucket, key);

        let head = client
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let is_not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);

                if is_not_found {
                    return IoError::NotFound(identifier.clone());
                }

                classify_sdk_error(&e, &identifier)
            })?;

        let size = head.content_length().unwrap_or(0).max(0) as u64;

        Ok(Self {
            client,
            bucket,
            key,
            size,
            identifier,
        })
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get the object key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl RangeReader for S3RangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size)?;

        if len == 0 {
            return Ok(Bytes::new());
        }

        // Build range header: "bytes=start-end" (inclusive on both ends)
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(range)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.identifier))?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| IoError::Connection(format!("{}: {}", self.identifier, e)))?
            .into_bytes();

        if data.len() != len {
            return Err(IoError::Connection(format!(
                "{}: short body, expected {} bytes, got {}",
                self.identifier,
                len,
                data.len()
            )));
        }

        Ok(data)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Map an SDK failure onto the adapter taxonomy.
///
/// Timeouts, dispatch failures, throttling and 5xx responses are transient;
/// everything else is surfaced as-is.
pub(crate) fn classify_sdk_error<E>(err: &SdkError<E, HttpResponse>, identifier: &str) -> IoError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{}: {}", identifier, DisplayErrorContext(err));

    match err {
        SdkError::TimeoutError(_) => IoError::Timeout(detail),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => IoError::Timeout(detail),
        SdkError::DispatchFailure(_) => IoError::Connection(detail),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            match (status, err.code()) {
                (Some(404), _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => {
                    IoError::NotFound(identifier.to_string())
                }
                (Some(429), _)
                | (Some(503), _)
                | (_, Some("SlowDown"))
                | (_, Some("Throttling"))
                | (_, Some("RequestLimitExceeded")) => IoError::Throttled(detail),
                (Some(500..=599), _) => IoError::Connection(detail),
                _ => IoError::S3(detail),
            }
        }
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
///
/// For AWS S3, pass `None` to use the default endpoint:
/// ```ignore
/// let client = create_s3_client(None, "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // For S3-compatible services, we often need to use path-style addressing
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}
