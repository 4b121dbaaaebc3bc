//! Lazy 5-D view over one scene of a backend.
//!
//! A [`LazyArray`] holds no pixels. Each [`read`](LazyArray::read) covers the
//! selection with chunks, fetches the missing ones concurrently through the
//! source's [`ChunkCache`], and copies row runs into a fresh buffer. The
//! result does not depend on the order in which fetches complete.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::ImageError;
use crate::format::{Backend, ChunkRequest, NativeLayout};
use crate::metadata::{AxisMapping, Dimensions, PixelType};

use super::chunk_cache::{CacheStats, ChunkCache, ChunkKey};
use super::data::ImageData;
use super::selection::Selection;

/// Deferred, chunk-cached view of one scene.
#[derive(Clone)]
pub struct LazyArray {
    backend: Arc<Backend>,
    source_id: Arc<str>,
    scene: usize,
    mapping: Arc<AxisMapping>,
    dims: Dimensions,
    dtype: PixelType,
    chunk_shape: [usize; 5],
    cache: Arc<ChunkCache>,
    limiter: Arc<Semaphore>,
}

impl LazyArray {
    /// Build the view. Performs no I/O.
    pub(crate) fn new(
        backend: Arc<Backend>,
        source_id: Arc<str>,
        mapping: AxisMapping,
        layout: &NativeLayout,
        cache: Arc<ChunkCache>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        let dims = mapping.dims();
        let chunk_shape = [
            1,
            mapping.channels_per_chunk().max(1),
            1,
            layout.chunk_y.clamp(1, layout.size_y.max(1)),
            layout.chunk_x.clamp(1, layout.size_x.max(1)),
        ];
        Self {
            backend,
            source_id,
            scene: layout.scene,
            mapping: Arc::new(mapping),
            dims,
            dtype: layout.dtype,
            chunk_shape,
            cache,
            limiter,
        }
    }

    pub fn shape(&self) -> [usize; 5] {
        self.dims.shape()
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn dtype(&self) -> PixelType {
        self.dtype
    }

    pub fn scene(&self) -> usize {
        self.scene
    }

    /// Extent of one chunk along T, C, Z, Y, X.
    pub fn chunk_shape(&self) -> [usize; 5] {
        self.chunk_shape
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Materialize a selection.
    ///
    /// Dropping the returned future aborts fetches still in flight; chunks
    /// that already completed stay cached.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSelection` if the selection does not fit the shape,
    /// and `ChunkRead` or `UnreachableSource` if a covering chunk fails.
    pub async fn read(&self, selection: &Selection) -> Result<ImageData, ImageError> {
        let ranges = selection
            .resolve(self.shape())
            .map_err(ImageError::InvalidSelection)?;
        let out_shape: [usize; 5] = std::array::from_fn(|i| ranges[i].len());
        let bps = self.dtype.bytes_per_sample();
        let total = out_shape.iter().product::<usize>() * bps;
        if total == 0 {
            return Ok(ImageData::new(out_shape, self.dtype, Bytes::new()));
        }

        let indices = covering_chunks(&ranges, self.chunk_shape);
        debug!(
            source = %self.source_id,
            scene = self.scene,
            chunks = indices.len(),
            "reading selection"
        );

        let mut tasks = JoinSet::new();
        for index in indices {
            let array = self.clone();
            tasks.spawn(async move { (index, array.fetch_chunk(index).await) });
        }

        let mut out = vec![0u8; total];
        while let Some(joined) = tasks.join_next().await {
            let (index, fetched) = joined.map_err(|e| self.chunk_error([0; 5], e.to_string()))?;
            let data = fetched?;
            let request = self.chunk_request(index);
            copy_chunk(&mut out, &ranges, &request, &data, bps);
        }

        Ok(ImageData::new(out_shape, self.dtype, Bytes::from(out)))
    }

    /// Canonical request for a chunk grid index.
    fn chunk_request(&self, index: [usize; 5]) -> ChunkRequest {
        let [_, cpc, _, cy, cx] = self.chunk_shape;
        let c = index[1] * cpc;
        let y = index[3] * cy;
        let x = index[4] * cx;
        ChunkRequest {
            t: index[0],
            c,
            channels: cpc.min(self.dims.c - c),
            z: index[2],
            y,
            x,
            height: cy.min(self.dims.y - y),
            width: cx.min(self.dims.x - x),
        }
    }

    async fn fetch_chunk(&self, index: [usize; 5]) -> Result<Bytes, ImageError> {
        let key = ChunkKey {
            scene: self.scene,
            index,
        };
        self.cache
            .get_or_fetch(key, || async {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|e| self.chunk_error(index, e.to_string()))?;
                let request = self.chunk_request(index);
                self.backend
                    .read_chunk(self.scene, &self.mapping, &request)
                    .await
                    .map_err(|e| ImageError::chunk_read(e, &self.source_id, self.scene, index))
            })
            .await
    }

    fn chunk_error(&self, coords: [usize; 5], reason: String) -> ImageError {
        ImageError::ChunkRead {
            source_id: self.source_id.to_string(),
            scene: self.scene,
            coords,
            reason,
        }
    }
}

/// Chunk grid indices covering non-empty `ranges`, in row-major order.
fn covering_chunks(ranges: &[Range<usize>; 5], chunk_shape: [usize; 5]) -> Vec<[usize; 5]> {
    let bounds: [Range<usize>; 5] = std::array::from_fn(|i| {
        let first = ranges[i].start / chunk_shape[i];
        let last = (ranges[i].end - 1) / chunk_shape[i];
        first..last + 1
    });

    let mut indices = Vec::new();
    for t in bounds[0].clone() {
        for c in bounds[1].clone() {
            for z in bounds[2].clone() {
                for y in bounds[3].clone() {
                    for x in bounds[4].clone() {
                        indices.push([t, c, z, y, x]);
                    }
                }
            }
        }
    }
    indices
}

/// Copy the part of one chunk that falls inside the selection.
///
/// `data` is laid out `[c][y][x]` over the request window; `out` is the
/// dense `TCZYX` buffer for `ranges`.
fn copy_chunk(
    out: &mut [u8],
    ranges: &[Range<usize>; 5],
    request: &ChunkRequest,
    data: &[u8],
    bps: usize,
) {
    let [_, oc, oz, oy, ox] = std::array::from_fn::<usize, 5, _>(|i| ranges[i].len());
    let ot = request.t - ranges[0].start;
    let ozi = request.z - ranges[2].start;

    let c_lo = request.c.max(ranges[1].start);
    let c_hi = (request.c + request.channels).min(ranges[1].end);
    let y_lo = request.y.max(ranges[3].start);
    let y_hi = (request.y + request.height).min(ranges[3].end);
    let x_lo = request.x.max(ranges[4].start);
    let x_hi = (request.x + request.width).min(ranges[4].end);
    if c_lo >= c_hi || y_lo >= y_hi || x_lo >= x_hi {
        return;
    }
    let run = (x_hi - x_lo) * bps;

    for c in c_lo..c_hi {
        for y in y_lo..y_hi {
            let src = (((c - request.c) * request.height + (y - request.y)) * request.width
                + (x_lo - request.x))
                * bps;
            let dst = ((((ot * oc + (c - ranges[1].start)) * oz + ozi) * oy
                + (y - ranges[3].start))
                * ox
                + (x_lo - ranges[4].start))
                * bps;
            out[dst..dst + run].copy_from_slice(&data[src..src + run]);
        }
    }
}
