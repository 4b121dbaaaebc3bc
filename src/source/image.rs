//! An opened image source and its current scene.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use crate::array::{CacheStats, ChunkCache, ImageData, LazyArray, Selection};
use crate::error::{FormatError, ImageError};
use crate::format::{Backend, BackendTag};
use crate::metadata::{normalize, Dimensions, Metadata, NativeMetadata, PixelType, SceneInfo};

/// One opened file or object.
///
/// Owns the backend (and through it the range reader), the chunk cache and
/// the fetch limiter. Everything is released when the source is dropped.
pub struct ImageSource {
    source_id: Arc<str>,
    backend: Arc<Backend>,
    cache: Arc<ChunkCache>,
    limiter: Arc<Semaphore>,
    metadata: Metadata,
    native: NativeMetadata,
    array: LazyArray,
}

impl ImageSource {
    pub(crate) fn new(
        source_id: Arc<str>,
        backend: Arc<Backend>,
        cache: Arc<ChunkCache>,
        limiter: Arc<Semaphore>,
    ) -> Result<Self, ImageError> {
        let (metadata, native, array) = load_scene(&source_id, &backend, &cache, &limiter, 0)
            .map_err(|e| e.into_image_error(&source_id))?;
        Ok(Self {
            source_id,
            backend,
            cache,
            limiter,
            metadata,
            native,
            array,
        })
    }

    /// Identifier of the underlying reader, e.g. `file:///data/a.czi`.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn format(&self) -> BackendTag {
        self.backend.tag()
    }

    pub fn scene_count(&self) -> usize {
        self.backend.scene_count()
    }

    pub fn scenes(&self) -> &[SceneInfo] {
        &self.metadata.scenes
    }

    pub fn current_scene(&self) -> usize {
        self.metadata.current_scene
    }

    /// Switch to another scene and drop cached chunks of the others.
    ///
    /// # Errors
    ///
    /// Returns `SceneIndex` if `scene >= scene_count()`, or the open-time
    /// classification if the scene's layout cannot be normalized.
    pub async fn set_scene(&mut self, scene: usize) -> Result<(), ImageError> {
        let scene_count = self.scene_count();
        if scene >= scene_count {
            return Err(ImageError::SceneIndex {
                source_id: self.source_id.to_string(),
                requested: scene,
                scene_count,
            });
        }
        if scene == self.current_scene() {
            return Ok(());
        }

        let (metadata, native, array) = load_scene(
            &self.source_id,
            &self.backend,
            &self.cache,
            &self.limiter,
            scene,
        )
        .map_err(|e| e.into_image_error(&self.source_id))?;
        self.cache.retain_scene(scene).await;

        info!(
            source = %self.source_id,
            scene,
            name = metadata.scene_name().unwrap_or(""),
            "switched scene"
        );
        self.metadata = metadata;
        self.native = native;
        self.array = array;
        Ok(())
    }

    /// Normalized metadata of the current scene.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata of the current scene as the file stores it.
    pub fn native_metadata(&self) -> &NativeMetadata {
        &self.native
    }

    /// Raw description text of the file, e.g. the OME-XML or ImageJ header
    /// of a TIFF.
    pub fn description(&self) -> Option<&str> {
        self.native.description()
    }

    pub fn dims(&self) -> Dimensions {
        self.metadata.dims
    }

    pub fn shape(&self) -> [usize; 5] {
        self.metadata.dims.shape()
    }

    pub fn dtype(&self) -> PixelType {
        self.metadata.dtype
    }

    /// Lazy array of the current scene.
    pub fn array(&self) -> &LazyArray {
        &self.array
    }

    /// Shorthand for `array().read(selection)`.
    ///
    /// # Errors
    ///
    /// See [`LazyArray::read`].
    pub async fn read(&self, selection: &Selection) -> Result<ImageData, ImageError> {
        self.array.read(selection).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}

fn load_scene(
    source_id: &Arc<str>,
    backend: &Arc<Backend>,
    cache: &Arc<ChunkCache>,
    limiter: &Arc<Semaphore>,
    scene: usize,
) -> Result<(Metadata, NativeMetadata, LazyArray), FormatError> {
    let layout = backend.scene_layout(scene)?;
    let native = backend.native_metadata(scene)?;
    let (metadata, mapping) = normalize(&native, &layout)?;
    let array = LazyArray::new(
        backend.clone(),
        source_id.clone(),
        mapping,
        &layout,
        cache.clone(),
        limiter.clone(),
    );
    Ok((metadata, native, array))
}
