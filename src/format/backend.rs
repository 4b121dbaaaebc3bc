//! Dispatch over the concrete format backends.
//!
//! Every backend exposes the same four operations: scene count, native
//! layout, native metadata and chunk reads. [`Backend`] is a closed enum
//! over them; the set of formats is fixed at compile time.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::config::{BridgeConfig, ReaderConfig, DEFAULT_METADATA_BLOCK_CAPACITY};
use crate::error::FormatError;
use crate::io::{BlockCache, RangeReader, DEFAULT_BLOCK_SIZE};
use crate::metadata::{AxisMapping, NativeMetadata};

use super::bridge::{BridgeBackend, ProcessBridge};
use super::czi::CziBackend;
use super::detect::BackendTag;
use super::dv::DvBackend;
use super::generic::GenericBackend;
use super::layout::{ChunkRequest, NativeLayout};
use super::lif::LifBackend;
use super::nd2::Nd2Backend;
use super::tiff_backend::TiffBackend;

/// Settings a backend needs while opening.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Block size of the metadata read cache
    pub block_size: usize,

    /// Blocks kept by the metadata read cache
    pub block_capacity: usize,

    /// Legacy bridge process, when enabled
    pub bridge: Option<BridgeConfig>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_capacity: DEFAULT_METADATA_BLOCK_CAPACITY,
            bridge: None,
        }
    }
}

impl OpenOptions {
    pub fn from_config(config: &ReaderConfig) -> Self {
        Self {
            block_size: config.metadata_block_size,
            block_capacity: config.metadata_block_capacity,
            bridge: config.bridge.clone(),
        }
    }

    /// Block-cached view of `reader` for container parsing.
    pub(crate) fn metadata_reader(
        &self,
        reader: &Arc<dyn RangeReader>,
    ) -> BlockCache<Arc<dyn RangeReader>> {
        BlockCache::with_capacity(reader.clone(), self.block_size, self.block_capacity)
    }
}

/// An opened format backend.
pub enum Backend {
    Tiff(TiffBackend),
    Czi(CziBackend),
    Lif(LifBackend),
    Nd2(Nd2Backend),
    Dv(DvBackend),
    Bridge(BridgeBackend),
    Generic(GenericBackend),
}

impl Backend {
    /// Open `reader` with the backend named by `tag`.
    ///
    /// # Errors
    ///
    /// Returns the backend's open error, or `UnsupportedFormat` when the
    /// bridge tag is requested without a configured bridge.
    #[instrument(skip(reader, options), fields(identifier = reader.identifier()))]
    pub async fn open(
        tag: BackendTag,
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        debug!(backend = %tag, "opening backend");
        let backend = match tag {
            BackendTag::Tiff => Backend::Tiff(TiffBackend::open(reader, options).await?),
            BackendTag::Czi => Backend::Czi(CziBackend::open(reader, options).await?),
            BackendTag::Lif => Backend::Lif(LifBackend::open(reader, options).await?),
            BackendTag::Nd2 => Backend::Nd2(Nd2Backend::open(reader, options).await?),
            BackendTag::Dv => Backend::Dv(DvBackend::open(reader, options).await?),
            BackendTag::Generic => Backend::Generic(GenericBackend::open(reader).await?),
            BackendTag::Bridge => {
                let config = options.bridge.as_ref().ok_or_else(|| {
                    FormatError::UnsupportedFormat {
                        reason: "legacy bridge is not configured".to_string(),
                    }
                })?;
                let transport = ProcessBridge::spawn(config)?;
                Backend::Bridge(BridgeBackend::open(Arc::new(transport), reader.identifier()).await?)
            }
        };
        Ok(backend)
    }

    pub fn tag(&self) -> BackendTag {
        match self {
            Backend::Tiff(_) => BackendTag::Tiff,
            Backend::Czi(_) => BackendTag::Czi,
            Backend::Lif(_) => BackendTag::Lif,
            Backend::Nd2(_) => BackendTag::Nd2,
            Backend::Dv(_) => BackendTag::Dv,
            Backend::Bridge(_) => BackendTag::Bridge,
            Backend::Generic(_) => BackendTag::Generic,
        }
    }

    pub fn scene_count(&self) -> usize {
        match self {
            Backend::Tiff(b) => b.scene_count(),
            Backend::Czi(b) => b.scene_count(),
            Backend::Lif(b) => b.scene_count(),
            Backend::Nd2(b) => b.scene_count(),
            Backend::Dv(b) => b.scene_count(),
            Backend::Bridge(b) => b.scene_count(),
            Backend::Generic(b) => b.scene_count(),
        }
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        match self {
            Backend::Tiff(b) => b.scene_layout(scene),
            Backend::Czi(b) => b.scene_layout(scene),
            Backend::Lif(b) => b.scene_layout(scene),
            Backend::Nd2(b) => b.scene_layout(scene),
            Backend::Dv(b) => b.scene_layout(scene),
            Backend::Bridge(b) => b.scene_layout(scene),
            Backend::Generic(b) => b.scene_layout(scene),
        }
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        match self {
            Backend::Tiff(b) => b.native_metadata(scene),
            Backend::Czi(b) => b.native_metadata(scene),
            Backend::Lif(b) => b.native_metadata(scene),
            Backend::Nd2(b) => b.native_metadata(scene),
            Backend::Dv(b) => b.native_metadata(scene),
            Backend::Bridge(b) => b.native_metadata(scene),
            Backend::Generic(b) => b.native_metadata(scene),
        }
    }

    /// Read one chunk and check its length.
    ///
    /// # Errors
    ///
    /// Returns the backend's read error, or `Decode` when the backend
    /// produced a buffer of the wrong size.
    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        let data = match self {
            Backend::Tiff(b) => b.read_chunk(scene, mapping, request).await?,
            Backend::Czi(b) => b.read_chunk(scene, mapping, request).await?,
            Backend::Lif(b) => b.read_chunk(scene, mapping, request).await?,
            Backend::Nd2(b) => b.read_chunk(scene, mapping, request).await?,
            Backend::Dv(b) => b.read_chunk(scene, mapping, request).await?,
            Backend::Bridge(b) => b.read_chunk(scene, request).await?,
            Backend::Generic(b) => b.read_chunk(scene, request)?,
        };

        let dtype = self.scene_layout(scene)?.dtype;
        let expected = request.expected_len(dtype);
        if data.len() != expected {
            return Err(FormatError::Decode(format!(
                "{} backend returned {} bytes for a chunk of {}",
                self.tag(),
                data.len(),
                expected
            )));
        }
        Ok(data)
    }
}
