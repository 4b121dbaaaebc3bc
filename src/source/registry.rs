//! Entry point that turns a URI into an [`ImageSource`].
//!
//! Opening runs the same pipeline for every input:
//! 1. open a range reader for the URI (local, S3 or HTTP)
//! 2. read a bounded prefix and detect the backend
//! 3. open the backend, parsing its structure through a block cache
//! 4. normalize scene 0 and build its lazy array
//!
//! No pixel data is read until the caller reads a selection.
//!
//! # Example
//!
//! ```no_run
//! use bioimage_streamer::array::Selection;
//! use bioimage_streamer::source::BioReader;
//!
//! # async fn run() -> Result<(), bioimage_streamer::error::ImageError> {
//! let reader = BioReader::default();
//! let source = reader.open("s3://bucket/cells.czi").await?;
//! let plane = source.read(&Selection::all().t(0).c(0).z(0)).await?;
//! println!("{:?}", plane.shape());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::array::ChunkCache;
use crate::config::{ConcurrencyScope, ReaderConfig};
use crate::error::ImageError;
use crate::format::{detect, Backend, DetectOptions, OpenOptions};
use crate::io::{open_reader, RangeReader};

use super::image::ImageSource;

/// Opens sources with one configuration.
///
/// With [`ConcurrencyScope::Shared`] every source opened by the same
/// `BioReader` draws from one fetch limiter.
pub struct BioReader {
    config: ReaderConfig,
    shared_limiter: Arc<Semaphore>,
}

impl Default for BioReader {
    fn default() -> Self {
        Self::new(ReaderConfig::default())
    }
}

impl BioReader {
    pub fn new(config: ReaderConfig) -> Self {
        let shared_limiter = Arc::new(Semaphore::new(config.max_concurrent_reads.max(1)));
        Self {
            config,
            shared_limiter,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Open a path or `file://`, `s3://` or `http(s)://` URI.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `UnreachableSource` when the source cannot be opened,
    /// `UnsupportedFormat` when no backend detects it, and `CorruptFile` or
    /// `UnsupportedVariant` when the backend rejects its structure.
    pub async fn open(&self, uri: &str) -> Result<ImageSource, ImageError> {
        let reader = open_reader(uri, &self.config)
            .await
            .map_err(|e| ImageError::from_io(e, uri))?;
        self.open_reader(reader).await
    }

    /// Open an already constructed range reader.
    ///
    /// The reader's identifier serves as the path hint for detection.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    #[instrument(skip(self, reader), fields(identifier = reader.identifier()))]
    pub async fn open_reader(
        &self,
        reader: Arc<dyn RangeReader>,
    ) -> Result<ImageSource, ImageError> {
        let source_id: Arc<str> = Arc::from(reader.identifier());

        let prefix_len = (reader.size() as usize).min(self.config.detect_prefix_len);
        let prefix = reader
            .read_exact_at(0, prefix_len)
            .await
            .map_err(|e| ImageError::from_io(e, &source_id))?;

        let options = DetectOptions {
            bridge_enabled: self.config.bridge.is_some(),
            generic_fallback: self.config.generic_fallback,
        };
        let tag = detect(&prefix, Some(&*source_id), options)
            .map_err(|e| e.into_image_error(&source_id))?;
        debug!(backend = %tag, prefix_len, "detected format");

        let backend = Backend::open(tag, reader, &OpenOptions::from_config(&self.config))
            .await
            .map_err(|e| e.into_image_error(&source_id))?;

        let limiter = match self.config.concurrency_scope {
            ConcurrencyScope::PerSource => {
                Arc::new(Semaphore::new(self.config.max_concurrent_reads.max(1)))
            }
            ConcurrencyScope::Shared => self.shared_limiter.clone(),
        };
        let cache = Arc::new(ChunkCache::new(self.config.cache_max_bytes));

        let source = ImageSource::new(source_id.clone(), Arc::new(backend), cache, limiter)?;
        info!(
            source = %source_id,
            format = %tag,
            scenes = source.scene_count(),
            shape = ?source.shape(),
            dtype = %source.dtype(),
            "opened image source"
        );
        Ok(source)
    }
}
