//! TIFF and BigTIFF container parsing.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian, MM = big-endian)
//!   in the header. All multi-byte values must be read respecting this order.
//!
//! - **Classic TIFF vs BigTIFF**: Classic TIFF uses 32-bit offsets (max 4GB files),
//!   while BigTIFF uses 64-bit offsets. The parser handles both transparently.
//!
//! - **IFD (Image File Directory)**: One page of image data. Microscopy TIFFs
//!   store one plane per IFD; OME-TIFF pyramids hang reduced resolutions off
//!   each plane as SubIFDs.
//!
//! - **Inline vs offset values**: Small values are stored inline in the IFD entry,
//!   larger values are stored at an offset pointed to by the entry.

mod pages;
mod parser;
mod tags;
mod values;

pub use pages::{ImagePage, TiffFile};
pub use parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE};
pub use tags::{
    Compression, FieldType, Predictor, SampleFormat, TiffTag, PHOTOMETRIC_MIN_IS_BLACK,
    PHOTOMETRIC_RGB, PHOTOMETRIC_YCBCR, PLANAR_CHUNKY, PLANAR_SEPARATE,
    SUBFILE_REDUCED_RESOLUTION,
};
pub use values::{parse_u64_array, ValueReader};
