//! Format backends for microscopy containers.
//!
//! Every supported container is parsed by one backend module. Each module
//! implements the subset of its grammar needed to answer shape, metadata
//! and chunk queries; anything outside that subset is rejected with
//! [`FormatError::UnsupportedVariant`](crate::error::FormatError) rather
//! than guessed.
//!
//! # Format Detection
//!
//! Use [`detect::detect`] to identify the format from a byte prefix.
//! Supported formats:
//!
//! - **TIFF**: OME-TIFF, ImageJ hyperstacks and plain TIFF/BigTIFF
//! - **CZI**: Zeiss uncompressed subblocks
//! - **LIF**: Leica image file
//! - **ND2**: Nikon chunked files
//! - **DV**: Priism/DeltaVision
//! - **Legacy bridge**: anything an external reader process can open
//! - **Generic**: PNG and JPEG through the `image` crate
//!
//! All of them sit behind the [`Backend`] enum.

pub mod backend;
pub mod bridge;
pub mod compression;
pub mod czi;
pub mod detect;
pub mod dv;
pub mod generic;
pub mod layout;
pub mod lif;
pub mod nd2;
pub mod ome;
pub mod pixels;
pub mod tiff;
pub mod tiff_backend;
pub mod xml;

pub use backend::{Backend, OpenOptions};
pub use bridge::{BridgeTransport, ProcessBridge};
pub use detect::{detect, is_tiff_header, BackendTag, DetectOptions};
pub use layout::{ChunkRequest, NativeLayout};
