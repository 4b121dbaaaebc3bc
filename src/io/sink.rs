//! Append-only byte sinks used by the writers.
//!
//! Writers lay out their output strictly sequentially, so a sink only needs
//! to append and report how much has been written. This keeps object-store
//! multipart uploads and local files behind one trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::s3_reader::classify_sdk_error;
use crate::error::IoError;

/// Size of each S3 multipart part (S3 requires at least 5 MiB except the last).
pub const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// Sequential output target.
#[async_trait]
pub trait ByteSink: Send {
    /// Append bytes at the current position.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush and commit the output. Nothing is guaranteed visible before this.
    async fn finish(&mut self) -> Result<(), IoError>;

    /// Discard everything written so far after a failed write.
    ///
    /// # Errors
    ///
    /// Returns an error if partial output could not be released; the
    /// destination may then hold a partial file or pending upload.
    async fn abort(&mut self) -> Result<(), IoError>;

    /// Identifier of the destination, for logging.
    fn identifier(&self) -> &str;
}

// =============================================================================
// MemorySink
// =============================================================================

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn finish(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), IoError> {
        self.buffer.clear();
        Ok(())
    }

    fn identifier(&self) -> &str {
        "memory://"
    }
}

// =============================================================================
// LocalSink
// =============================================================================

/// Buffered local file sink.
pub struct LocalSink {
    writer: BufWriter<tokio::fs::File>,
    path: PathBuf,
    identifier: String,
    position: u64,
}

impl LocalSink {
    /// Create (or truncate) the destination file.
    pub async fn create(path: &Path) -> Result<Self, IoError> {
        let identifier = format!("file://{}", path.display());
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| IoError::Local(format!("{}: {}", identifier, e)))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            identifier,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSink for LocalSink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| IoError::Local(format!("{}: {}", self.identifier, e)))?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn finish(&mut self) -> Result<(), IoError> {
        self.writer
            .flush()
            .await
            .map_err(|e| IoError::Local(format!("{}: {}", self.identifier, e)))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| IoError::Local(format!("{}: {}", self.identifier, e)))
    }

    async fn abort(&mut self) -> Result<(), IoError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(identifier = %self.identifier, "removed partial output");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IoError::Local(format!("{}: {}", self.identifier, e))),
        }
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// S3Sink
// =============================================================================

/// S3 sink using multipart upload; small outputs go up in a single PUT.
pub struct S3Sink {
    client: Client,
    bucket: String,
    key: String,
    identifier: String,
    pending: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    position: u64,
}

impl S3Sink {
    pub fn new(client: Client, bucket: String, key: String) -> Self {
        let identifier = format!("s3://{}/{}", bucket, key);
        Self {
            client,
            bucket,
            key,
            identifier,
            pending: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
            position: 0,
        }
    }

    async fn ensure_upload(&mut self) -> Result<String, IoError> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.identifier))?;

        let id = created
            .upload_id()
            .ok_or_else(|| IoError::S3(format!("{}: no upload id returned", self.identifier)))?
            .to_string();

        debug!(identifier = %self.identifier, upload_id = %id, "started multipart upload");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, data: Bytes) -> Result<(), IoError> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;

        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.identifier))?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(resp.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl ByteSink for S3Sink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.pending.extend_from_slice(data);
        self.position += data.len() as u64;

        while self.pending.len() >= MULTIPART_PART_SIZE {
            let part = self.pending.split_to(MULTIPART_PART_SIZE).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn finish(&mut self) -> Result<(), IoError> {
        let remaining = std::mem::take(&mut self.pending).freeze();

        if self.upload_id.is_none() {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(remaining))
                .send()
                .await
                .map_err(|e| classify_sdk_error(&e, &self.identifier))?;
            return Ok(());
        }

        if !remaining.is_empty() {
            self.upload_part(remaining).await?;
        }

        let upload_id = self.ensure_upload().await?;
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.identifier))?;

        Ok(())
    }

    async fn abort(&mut self) -> Result<(), IoError> {
        self.pending.clear();
        self.parts.clear();
        let Some(upload_id) = self.upload_id.take() else {
            return Ok(());
        };

        debug!(identifier = %self.identifier, upload_id = %upload_id, "aborting multipart upload");
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.identifier))?;
        Ok(())
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
