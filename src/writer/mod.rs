//! OME-TIFF writers.
//!
//! Two output formats share one streaming pipeline: planes are read from a
//! [`LazyArray`] one at a time in `XYZCT` order, encoded, and appended to a
//! [`ByteSink`].
//!
//! - `ome-tiff`: one stripped page per plane
//! - `ome-tiff-pyramid`: tiled pages with reduced resolutions as SubIFDs
//!
//! Only the selected scene is written, and native metadata beyond the
//! canonical record is dropped.

mod ome_tiff;
mod pyramid;
mod tiff_encoder;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::array::{LazyArray, Selection};
use crate::config::DEFAULT_TILE_SIZE;
use crate::error::ImageError;
use crate::format::pixels::to_native_endian;
use crate::format::tiff::Compression;
use crate::io::ByteSink;
use crate::metadata::{Dimensions, Metadata};

pub use pyramid::{decimate, default_level_count};
pub use tiff_encoder::{needs_bigtiff, ChunkLayout, EncodedPage, TiffEncoder, BIGTIFF_THRESHOLD};

/// `Creator` attribute and `Software` tag of written files.
pub const CREATOR: &str = concat!("bioimage-streamer ", env!("CARGO_PKG_VERSION"));

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    OmeTiff,
    OmeTiffPyramid,
}

impl OutputFormat {
    pub const fn name(self) -> &'static str {
        match self {
            OutputFormat::OmeTiff => "ome-tiff",
            OutputFormat::OmeTiffPyramid => "ome-tiff-pyramid",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ome-tiff" | "ome-tif" => Ok(OutputFormat::OmeTiff),
            "ome-tiff-pyramid" | "ome-tif-pyramid" => Ok(OutputFormat::OmeTiffPyramid),
            _ => Err(ImageError::UnsupportedOutputFormat(s.to_string())),
        }
    }
}

/// Pixel compression of written pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCompression {
    None,
    #[default]
    Deflate,
}

impl OutputCompression {
    fn tiff(self) -> Compression {
        match self {
            OutputCompression::None => Compression::None,
            OutputCompression::Deflate => Compression::Deflate,
        }
    }
}

impl FromStr for OutputCompression {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(OutputCompression::None),
            "deflate" | "zlib" => Ok(OutputCompression::Deflate),
            other => Err(ImageError::Write(format!(
                "unknown compression '{}' (expected none or deflate)",
                other
            ))),
        }
    }
}

/// Writer settings.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Tile edge of pyramidal pages; a multiple of 16
    pub tile_size: u32,

    /// Reduced levels below full resolution; `None` stops at one tile
    pub levels: Option<usize>,
    pub compression: OutputCompression,

    /// Force BigTIFF regardless of the size estimate
    pub force_bigtiff: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            levels: None,
            compression: OutputCompression::default(),
            force_bigtiff: false,
        }
    }
}

/// What a write produced.
#[derive(Debug, Clone, Serialize)]
pub struct WriteSummary {
    pub format: OutputFormat,
    pub destination: String,
    pub dims: Dimensions,
    pub pages: usize,

    /// Reduced levels per page
    pub levels: usize,
    pub bigtiff: bool,
    pub bytes_written: u64,
}

/// Stream a selection of `array` to `sink` in `format`.
///
/// `metadata` describes the whole scene; sizes and channels are cut down to
/// the selection before they are written.
///
/// # Errors
///
/// - `InvalidSelection` if the selection does not fit or is empty
/// - `IncompleteMetadata` if the format needs a field that is unknown
/// - `Write` if encoding or the sink fails
/// - any read error of the covering chunks
///
/// On any error the sink is aborted, so no partial output or pending upload
/// is left behind.
pub async fn write(
    array: &LazyArray,
    selection: &Selection,
    metadata: &Metadata,
    sink: &mut dyn ByteSink,
    format: OutputFormat,
    options: &WriteOptions,
) -> Result<WriteSummary, ImageError> {
    match write_to_sink(array, selection, metadata, &mut *sink, format, options).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            warn!(destination = sink.identifier(), error = %e, "write failed, discarding output");
            if let Err(abort_err) = sink.abort().await {
                warn!(
                    destination = sink.identifier(),
                    error = %abort_err,
                    "failed to discard partial output"
                );
            }
            Err(e)
        }
    }
}

async fn write_to_sink(
    array: &LazyArray,
    selection: &Selection,
    metadata: &Metadata,
    sink: &mut dyn ByteSink,
    format: OutputFormat,
    options: &WriteOptions,
) -> Result<WriteSummary, ImageError> {
    if options.tile_size == 0 || options.tile_size % 16 != 0 {
        return Err(ImageError::Write(format!(
            "tile size {} is not a positive multiple of 16",
            options.tile_size
        )));
    }

    let ranges = selection
        .resolve(array.shape())
        .map_err(ImageError::InvalidSelection)?;
    let planes = PlaneReader::new(array, ranges);
    let metadata = planes.subset_metadata(metadata);
    if metadata.dims.is_empty() {
        return Err(ImageError::InvalidSelection(
            "cannot write an empty selection".to_string(),
        ));
    }

    info!(
        source = array.source_id(),
        destination = sink.identifier(),
        %format,
        shape = ?metadata.dims.shape(),
        "writing image"
    );

    let summary = match format {
        OutputFormat::OmeTiff => ome_tiff::write_plain(&planes, &metadata, sink, options).await?,
        OutputFormat::OmeTiffPyramid => {
            pyramid::write_pyramid(&planes, &metadata, sink, options).await?
        }
    };

    info!(
        destination = %summary.destination,
        pages = summary.pages,
        levels = summary.levels,
        bigtiff = summary.bigtiff,
        bytes = summary.bytes_written,
        "finished writing"
    );
    Ok(summary)
}

/// Reads the planes of a selection in `XYZCT` order.
pub(crate) struct PlaneReader<'a> {
    array: &'a LazyArray,
    ranges: [Range<usize>; 5],
}

impl<'a> PlaneReader<'a> {
    fn new(array: &'a LazyArray, ranges: [Range<usize>; 5]) -> Self {
        Self { array, ranges }
    }

    fn dims(&self) -> Dimensions {
        let [t, c, z, y, x] = std::array::from_fn(|i| self.ranges[i].len());
        Dimensions::new(t, c, z, y, x)
    }

    pub(crate) fn plane_count(&self) -> usize {
        self.dims().plane_count()
    }

    pub(crate) fn width(&self) -> u32 {
        self.ranges[4].len() as u32
    }

    pub(crate) fn height(&self) -> u32 {
        self.ranges[3].len() as u32
    }

    /// Uncompressed bytes of one plane.
    pub(crate) fn plane_bytes(&self) -> u64 {
        let dims = self.dims();
        (dims.y * dims.x * self.array.dtype().bytes_per_sample()) as u64
    }

    /// Metadata restricted to the selection.
    fn subset_metadata(&self, metadata: &Metadata) -> Metadata {
        let mut subset = metadata.clone();
        subset.dims = self.dims();
        subset.dtype = self.array.dtype();
        subset.channels = metadata
            .channels
            .get(self.ranges[1].clone())
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        subset.channels.resize_with(subset.dims.c, Default::default);
        subset
    }

    /// Read page `index` as a little-endian plane.
    pub(crate) async fn read(&self, index: usize) -> Result<Vec<u8>, ImageError> {
        let dims = self.dims();
        let z = index % dims.z;
        let c = (index / dims.z) % dims.c;
        let t = index / (dims.z * dims.c);

        let selection = Selection::all()
            .t(self.ranges[0].start + t)
            .c(self.ranges[1].start + c)
            .z(self.ranges[2].start + z)
            .y(self.ranges[3].clone())
            .x(self.ranges[4].clone());
        let data = self.array.read(&selection).await?;

        let mut plane = data.into_bytes().to_vec();
        // Native to little-endian is the same swap as little-endian to native.
        to_native_endian(&mut plane, self.array.dtype().bytes_per_sample(), true);
        Ok(plane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_names() {
        assert_eq!(
            "ome-tiff".parse::<OutputFormat>().unwrap(),
            OutputFormat::OmeTiff
        );
        assert_eq!(
            "OME-TIFF-PYRAMID".parse::<OutputFormat>().unwrap(),
            OutputFormat::OmeTiffPyramid
        );
        assert!(matches!(
            "zarr".parse::<OutputFormat>(),
            Err(ImageError::UnsupportedOutputFormat(_))
        ));
    }

    #[test]
    fn test_compression_names() {
        assert_eq!(
            "none".parse::<OutputCompression>().unwrap(),
            OutputCompression::None
        );
        assert_eq!(
            "Deflate".parse::<OutputCompression>().unwrap(),
            OutputCompression::Deflate
        );
        assert!(matches!(
            "lzw".parse::<OutputCompression>(),
            Err(ImageError::Write(_))
        ));
    }
}
