//! Native layout description and chunk requests shared by all backends.

use crate::metadata::PixelType;

/// How one scene is stored natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLayout {
    pub scene: usize,

    /// Plane-stack axes, outermost first, drawn from `S T C Z`
    pub plane_axes: Vec<(char, usize)>,

    pub size_y: usize,
    pub size_x: usize,

    /// Interleaved components per pixel; mapped to C when greater than one
    pub samples_per_pixel: usize,

    pub dtype: PixelType,

    /// Chunk extent along Y and X
    pub chunk_y: usize,
    pub chunk_x: usize,
}

impl NativeLayout {
    /// Native dimension order, e.g. `"TCZYX"` or `"CTZYX"`.
    pub fn dimension_order(&self) -> String {
        let mut order: String = self.plane_axes.iter().map(|&(axis, _)| axis).collect();
        order.push_str("YX");
        order
    }

    /// Size of a plane axis, 1 when absent.
    pub fn axis_size(&self, axis: char) -> usize {
        self.plane_axes
            .iter()
            .find(|&&(a, _)| a == axis)
            .map(|&(_, n)| n)
            .unwrap_or(1)
    }

    pub fn chunks_along_y(&self) -> usize {
        self.size_y.div_ceil(self.chunk_y.max(1))
    }

    pub fn chunks_along_x(&self) -> usize {
        self.size_x.div_ceil(self.chunk_x.max(1))
    }
}

/// One chunk to read, in canonical coordinates.
///
/// The window `[y, y + height) x [x, x + width)` is aligned to the chunk grid
/// and already cropped at the image edge. The returned buffer holds
/// `channels` planes of `height * width` samples, native-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRequest {
    pub t: usize,
    pub c: usize,
    pub channels: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
    pub height: usize,
    pub width: usize,
}

impl ChunkRequest {
    pub fn expected_len(&self, dtype: PixelType) -> usize {
        self.channels * self.height * self.width * dtype.bytes_per_sample()
    }
}
