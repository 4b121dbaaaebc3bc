//! Generic PNG/JPEG fallback backend.
//!
//! The whole file is fetched at open so the header can be inspected; pixels
//! are decoded on the first chunk read. The image is one scene with a
//! single whole-image chunk and its components as interleaved channels.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::{ColorType, ImageDecoder, ImageReader};
use tracing::{debug, info};

use crate::error::FormatError;
use crate::io::RangeReader;
use crate::metadata::{numbered_scenes, GenericNative, NativeMetadata, PixelType};

use super::layout::{ChunkRequest, NativeLayout};
use super::pixels::{crop_window, deinterleave};

pub struct GenericBackend {
    data: Bytes,
    layout: NativeLayout,
    color_type: &'static str,
}

/// Sample type, component count and a name for a decoder color type.
fn describe(color: ColorType) -> Result<(PixelType, usize, &'static str), FormatError> {
    let described = match color {
        ColorType::L8 => (PixelType::Uint8, 1, "gray"),
        ColorType::La8 => (PixelType::Uint8, 2, "gray_alpha"),
        ColorType::Rgb8 => (PixelType::Uint8, 3, "rgb"),
        ColorType::Rgba8 => (PixelType::Uint8, 4, "rgba"),
        ColorType::L16 => (PixelType::Uint16, 1, "gray"),
        ColorType::La16 => (PixelType::Uint16, 2, "gray_alpha"),
        ColorType::Rgb16 => (PixelType::Uint16, 3, "rgb"),
        ColorType::Rgba16 => (PixelType::Uint16, 4, "rgba"),
        ColorType::Rgb32F => (PixelType::Float32, 3, "rgb"),
        ColorType::Rgba32F => (PixelType::Float32, 4, "rgba"),
        other => {
            return Err(FormatError::unsupported_variant(format!(
                "image color type {:?}",
                other
            )))
        }
    };
    Ok(described)
}

impl GenericBackend {
    /// Fetch the file and read its header.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` if the image crate does not recognize the
    /// data, `Decode` if the header is unreadable.
    pub async fn open(reader: Arc<dyn RangeReader>) -> Result<Self, FormatError> {
        let data = reader.read_exact_at(0, reader.size() as usize).await?;

        // The decoder borrows `data`; only its header fields outlive it.
        let ((width, height), color) = {
            let decoder = ImageReader::new(Cursor::new(data.as_ref()))
                .with_guessed_format()
                .map_err(|e| FormatError::Decode(e.to_string()))?
                .into_decoder()
                .map_err(|e| FormatError::UnsupportedFormat {
                    reason: e.to_string(),
                })?;
            (decoder.dimensions(), decoder.color_type())
        };
        let (dtype, samples, color_type) = describe(color)?;

        info!(
            identifier = reader.identifier(),
            width,
            height,
            color_type,
            "opened with generic image decoder"
        );

        Ok(Self {
            data,
            layout: NativeLayout {
                scene: 0,
                plane_axes: Vec::new(),
                size_y: height as usize,
                size_x: width as usize,
                samples_per_pixel: samples,
                dtype,
                chunk_y: height as usize,
                chunk_x: width as usize,
            },
            color_type,
        })
    }

    pub fn scene_count(&self) -> usize {
        1
    }

    fn check_scene(&self, scene: usize) -> Result<(), FormatError> {
        if scene == 0 {
            Ok(())
        } else {
            Err(FormatError::corrupt(format!(
                "scene {} requested from a single image",
                scene
            )))
        }
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        self.check_scene(scene)?;
        Ok(self.layout.clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        self.check_scene(scene)?;
        Ok(NativeMetadata::Generic(GenericNative {
            scenes: numbered_scenes(1),
            color_type: self.color_type.to_string(),
        }))
    }

    /// Decode the image and cut the requested window.
    pub fn read_chunk(
        &self,
        scene: usize,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        self.check_scene(scene)?;
        debug!(bytes = self.data.len(), "decoding generic image");
        let image = image::load_from_memory(&self.data)
            .map_err(|e| FormatError::Decode(e.to_string()))?;

        let bps = self.layout.dtype.bytes_per_sample();
        let samples = self.layout.samples_per_pixel;
        let window = crop_window(
            image.as_bytes(),
            self.layout.size_x,
            bps * samples,
            request.y,
            request.x,
            request.height,
            request.width,
        );
        if samples == 1 {
            return Ok(Bytes::from(window));
        }
        Ok(Bytes::from(deinterleave(
            &window,
            request.height * request.width,
            samples,
            bps,
            request.c,
            request.channels,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::metadata::normalize;
    use image::{ImageFormat, Rgb, RgbImage};

    fn png() -> Vec<u8> {
        let img = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8, y as u8, 200]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_rgb_png_as_channels() {
        let reader: Arc<dyn RangeReader> = Arc::new(MemoryReader::new(png(), "mem://a.png"));
        let backend = GenericBackend::open(reader).await.unwrap();
        let layout = backend.scene_layout(0).unwrap();
        assert_eq!(layout.dimension_order(), "YX");

        let (meta, _) = normalize(&backend.native_metadata(0).unwrap(), &layout).unwrap();
        assert_eq!(meta.dims.shape(), [1, 3, 1, 3, 4]);
        assert_eq!(meta.channels[2].name.as_deref(), Some("Blue"));

        let request = ChunkRequest {
            t: 0,
            c: 0,
            channels: 2,
            z: 0,
            y: 2,
            x: 1,
            height: 1,
            width: 2,
        };
        let data = backend.read_chunk(0, &request).unwrap();
        assert_eq!(data.to_vec(), vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_garbage_is_unsupported() {
        let reader: Arc<dyn RangeReader> =
            Arc::new(MemoryReader::new(vec![7u8; 64], "mem://a.bin"));
        assert!(GenericBackend::open(reader).await.is_err());
    }
}
