//! # bioimage-streamer
//!
//! Lazy, chunked access to multi-dimensional microscopy images stored on
//! local disks, in S3-compatible object storage or behind HTTP.
//!
//! Every input is exposed the same way: a 5-D array in canonical
//! `T, C, Z, Y, X` order plus normalized metadata (physical pixel sizes,
//! channels, acquisition time, scenes). Pixels are fetched chunk by chunk
//! only when a selection is read.
//!
//! ## Features
//!
//! - **Format support**: OME-TIFF, ImageJ and plain TIFF/BigTIFF, CZI, LIF,
//!   ND2, DV, PNG/JPEG, and a JSON-lines bridge to an external reader
//! - **Range-based streaming**: only the bytes a chunk needs are read
//! - **Singleflight chunk cache**: concurrent readers of a chunk share one fetch
//! - **Bounded retry**: transient remote failures back off exponentially
//! - **OME-TIFF output**: plain multi-page and tiled pyramidal with SubIFDs
//!
//! ## Architecture
//!
//! - [`io`] - range readers, retry, block cache and output sinks
//! - [`mod@format`] - format detection and the backends
//! - [`metadata`] - canonical metadata and the axis mapping
//! - [`array`] - lazy arrays, selections and the chunk cache
//! - [`source`] - opening sources and switching scenes
//! - [`writer`] - OME-TIFF writers
//! - [`config`] - library settings and the CLI
//!
//! ## Example
//!
//! ```rust,no_run
//! use bioimage_streamer::{BioReader, ReaderConfig, Selection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bioimage_streamer::ImageError> {
//!     let reader = BioReader::new(ReaderConfig::default());
//!     let mut source = reader.open("s3://microscopy/run-12/cells.czi").await?;
//!     source.set_scene(1).await?;
//!
//!     // [0:1, 0:2, 2, :, :]
//!     let data = source.read(&Selection::all().t(0..1).c(0..2).z(2)).await?;
//!     let pixels = data.to_ndarray::<u16>()?;
//!     println!("{:?}", pixels.shape());
//!     Ok(())
//! }
//! ```

pub mod array;
pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod metadata;
pub mod source;
pub mod writer;

// Re-export commonly used types
pub use array::{AxisSelection, CacheStats, ImageData, LazyArray, Selection};
pub use config::{BridgeConfig, ConcurrencyScope, ReaderConfig};
pub use error::{FormatError, ImageError, IoError, TiffError};
pub use format::{detect, Backend, BackendTag, DetectOptions};
pub use io::{open_reader, open_sink, ByteSink, RangeReader, RetryPolicy};
pub use metadata::{
    normalize, Axis, AxisMapping, Channel, Dimensions, Metadata, PhysicalPixelSizes, PixelType,
    SceneInfo,
};
pub use source::{BioReader, ImageSource};
pub use writer::{write, OutputCompression, OutputFormat, WriteOptions, WriteSummary};
