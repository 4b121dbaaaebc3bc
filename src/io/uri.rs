//! URI dispatch for the filesystem adapter.
//!
//! Local paths, `file://`, `s3://bucket/key` and `http(s)://` URIs all
//! resolve to an `Arc<dyn RangeReader>` with the same call surface. Remote
//! readers are wrapped in [`RetryingReader`] so transient failures are
//! absorbed here and nowhere else.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::{
    create_s3_client, ByteSink, HttpRangeReader, LocalRangeReader, LocalSink, RangeReader,
    RetryingReader, S3RangeReader, S3Sink,
};
use crate::config::ReaderConfig;
use crate::error::IoError;

/// A parsed source or destination location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUri {
    Local(PathBuf),
    S3 { bucket: String, key: String },
    Http(String),
}

impl SourceUri {
    /// Parse a path or URI.
    ///
    /// Anything without a recognised scheme is treated as a local path, which
    /// keeps Windows drive letters (`C:\...`) working.
    pub fn parse(input: &str) -> Result<Self, IoError> {
        let has_scheme = input.contains("://");
        if !has_scheme {
            return Ok(SourceUri::Local(PathBuf::from(input)));
        }

        let url = Url::parse(input).map_err(|e| IoError::InvalidUri(format!("{}: {}", input, e)))?;

        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(SourceUri::Local)
                .map_err(|_| IoError::InvalidUri(input.to_string())),
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| IoError::InvalidUri(format!("{}: missing bucket", input)))?
                    .to_string();
                let key = url.path().trim_start_matches('/').to_string();
                if key.is_empty() {
                    return Err(IoError::InvalidUri(format!("{}: missing key", input)));
                }
                Ok(SourceUri::S3 { bucket, key })
            }
            "http" | "https" => Ok(SourceUri::Http(input.to_string())),
            other => Err(IoError::InvalidUri(format!(
                "{}: unsupported scheme {:?}",
                input, other
            ))),
        }
    }

    /// The file name portion, used as an extension hint by the detector.
    pub fn file_name(&self) -> Option<String> {
        match self {
            SourceUri::Local(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            SourceUri::S3 { key, .. } => key.rsplit('/').next().map(str::to_string),
            SourceUri::Http(url) => Url::parse(url)
                .ok()
                .and_then(|u| u.path_segments()?.last().map(str::to_string)),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, SourceUri::Local(_))
    }
}

/// Open a random-access reader for a path or URI.
///
/// The open itself (a HEAD request for remote sources) runs under the same
/// retry policy as subsequent reads.
pub async fn open_reader(uri: &str, config: &ReaderConfig) -> Result<Arc<dyn RangeReader>, IoError> {
    let parsed = SourceUri::parse(uri)?;
    debug!(uri, ?parsed, "opening source");

    match parsed {
        SourceUri::Local(path) => {
            let reader = LocalRangeReader::open(&path).await?;
            Ok(Arc::new(reader))
        }
        SourceUri::S3 { bucket, key } => {
            let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
            let reader = config
                .retry
                .run(uri, || {
                    S3RangeReader::new(client.clone(), bucket.clone(), key.clone())
                })
                .await?;
            Ok(Arc::new(RetryingReader::new(reader, config.retry.clone())))
        }
        SourceUri::Http(url) => {
            let client = reqwest::Client::new();
            let reader = config
                .retry
                .run(uri, || HttpRangeReader::new(client.clone(), url.clone()))
                .await?;
            Ok(Arc::new(RetryingReader::new(reader, config.retry.clone())))
        }
    }
}

/// Open a byte sink for writing to a path or `s3://` URI.
pub async fn open_sink(uri: &str, config: &ReaderConfig) -> Result<Box<dyn ByteSink>, IoError> {
    match SourceUri::parse(uri)? {
        SourceUri::Local(path) => Ok(Box::new(LocalSink::create(&path).await?)),
        SourceUri::S3 { bucket, key } => {
            let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
            Ok(Box::new(S3Sink::new(client, bucket, key)))
        }
        SourceUri::Http(url) => Err(IoError::InvalidUri(format!(
            "{}: writing over HTTP is not supported",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_paths() {
        assert_eq!(
            SourceUri::parse("data/cells.czi").unwrap(),
            SourceUri::Local(PathBuf::from("data/cells.czi"))
        );
        assert_eq!(
            SourceUri::parse("file:///tmp/cells.lif").unwrap(),
            SourceUri::Local(PathBuf::from("/tmp/cells.lif"))
        );
    }

    #[test]
    fn test_parse_s3() {
        assert_eq!(
            SourceUri::parse("s3://lab-bucket/plates/a1.ome.tiff").unwrap(),
            SourceUri::S3 {
                bucket: "lab-bucket".to_string(),
                key: "plates/a1.ome.tiff".to_string()
            }
        );
        assert!(SourceUri::parse("s3://lab-bucket/").is_err());
    }

    #[test]
    fn test_parse_http_and_unknown() {
        assert!(matches!(
            SourceUri::parse("https://example.org/x.nd2").unwrap(),
            SourceUri::Http(_)
        ));
        assert!(matches!(
            SourceUri::parse("gs://bucket/x"),
            Err(IoError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_file_name_hint() {
        let s3 = SourceUri::parse("s3://b/dir/img.nd2").unwrap();
        assert_eq!(s3.file_name().as_deref(), Some("img.nd2"));
        assert!(s3.is_remote());

        let http = SourceUri::parse("https://host/data/img.lif?sig=1").unwrap();
        assert_eq!(http.file_name().as_deref(), Some("img.lif"));

        let local = SourceUri::parse("/data/img.dv").unwrap();
        assert_eq!(local.file_name().as_deref(), Some("img.dv"));
        assert!(!local.is_remote());
    }
}
