//! Opened image sources.
//!
//! [`BioReader`] detects and opens inputs; [`ImageSource`] holds one opened
//! input, its current scene and that scene's lazy array.

mod image;
mod registry;

pub use self::image::ImageSource;
pub use registry::BioReader;
