//! TIFF page (IFD) model and chunk decoding.
//!
//! Every IFD in the main chain becomes an [`ImagePage`] with its strip or
//! tile directory read eagerly at open. Reduced-resolution pages and SubIFD
//! trees are recorded but never exposed as data.
//!
//! A page's chunks are its tiles, or the whole plane when it is stored in
//! strips.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::debug;

use crate::error::{FormatError, TiffError};
use crate::format::compression::{decompress, undo_horizontal_predictor};
use crate::format::pixels::{crop_rows, deinterleave, to_native_endian};
use crate::io::RangeReader;
use crate::metadata::PixelType;

use super::parser::{ByteOrder, Ifd, TiffHeader, BIGTIFF_HEADER_SIZE};
use super::tags::{
    Compression, Predictor, SampleFormat, TiffTag, PLANAR_CHUNKY, PLANAR_SEPARATE,
    SUBFILE_REDUCED_RESOLUTION,
};
use super::values::ValueReader;

/// Upper bound on pages in the main IFD chain.
const MAX_IFDS: usize = 65_536;

// =============================================================================
// ImagePage
// =============================================================================

/// One image page with everything needed to decode its chunks.
#[derive(Debug, Clone)]
pub struct ImagePage {
    /// Position in the main IFD chain
    pub index: usize,

    pub width: usize,
    pub height: usize,
    pub samples_per_pixel: usize,
    pub dtype: PixelType,
    pub planar_configuration: u16,
    pub compression: Compression,
    pub predictor: Predictor,
    pub photometric: u16,
    pub new_subfile_type: u32,

    /// Tile size, or (RowsPerStrip, width) for stripped pages
    pub tiled: bool,
    pub block_height: usize,
    pub block_width: usize,

    pub offsets: Vec<u64>,
    pub byte_counts: Vec<u64>,
    pub jpeg_tables: Option<Bytes>,

    pub description: Option<String>,
    pub software: Option<String>,
    pub x_resolution: Option<f64>,
    pub y_resolution: Option<f64>,
    pub resolution_unit: u16,
    pub sub_ifds: Vec<u64>,
}

impl ImagePage {
    async fn from_ifd<R: RangeReader + ?Sized>(
        reader: &R,
        header: &TiffHeader,
        ifd: &Ifd,
        index: usize,
    ) -> Result<Self, TiffError> {
        let values = ValueReader::new(reader, header);

        let required = |tag: TiffTag| {
            ifd.get_entry_by_tag(tag)
                .ok_or(TiffError::MissingTag(tag.name()))
        };

        let width = values.read_u64(required(TiffTag::ImageWidth)?).await? as usize;
        let height = values.read_u64(required(TiffTag::ImageLength)?).await? as usize;

        let samples_per_pixel =
            read_scalar(&values, ifd, TiffTag::SamplesPerPixel, 1).await?.max(1) as usize;
        let compression_raw = read_scalar(&values, ifd, TiffTag::Compression, 1).await? as u16;
        let planar_configuration =
            read_scalar(&values, ifd, TiffTag::PlanarConfiguration, PLANAR_CHUNKY as u64).await?
                as u16;
        let predictor_raw = read_scalar(&values, ifd, TiffTag::Predictor, 1).await? as u16;
        let photometric =
            read_scalar(&values, ifd, TiffTag::PhotometricInterpretation, 1).await? as u16;
        let new_subfile_type = read_scalar(&values, ifd, TiffTag::NewSubfileType, 0).await? as u32;
        let resolution_unit = read_scalar(&values, ifd, TiffTag::ResolutionUnit, 2).await? as u16;

        let compression = Compression::from_u16(compression_raw)
            .filter(|c| c.is_supported())
            .ok_or_else(|| {
                TiffError::UnsupportedCompression(
                    Compression::from_u16(compression_raw)
                        .map(|c| c.name().to_string())
                        .unwrap_or_else(|| format!("code {}", compression_raw)),
                )
            })?;

        let predictor = match Predictor::from_u16(predictor_raw) {
            Some(p @ (Predictor::None | Predictor::Horizontal)) => p,
            _ => {
                return Err(TiffError::UnsupportedSampleLayout(format!(
                    "predictor {}",
                    predictor_raw
                )))
            }
        };

        if planar_configuration != PLANAR_CHUNKY && planar_configuration != PLANAR_SEPARATE {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::PlanarConfiguration.name(),
                message: format!("unknown value {}", planar_configuration),
            });
        }

        let bits = match ifd.get_entry_by_tag(TiffTag::BitsPerSample) {
            Some(entry) => values.read_u16_array(entry).await?,
            None => vec![1],
        };
        let formats = match ifd.get_entry_by_tag(TiffTag::SampleFormat) {
            Some(entry) => values.read_u16_array(entry).await?,
            None => vec![1],
        };
        let dtype = resolve_dtype(&bits, &formats)?;

        if compression == Compression::Jpeg && dtype != PixelType::Uint8 {
            return Err(TiffError::UnsupportedSampleLayout(format!(
                "JPEG with {} samples",
                dtype
            )));
        }

        let (tiled, block_height, block_width, offsets_tag, counts_tag) = if ifd.is_tiled() {
            let tw = values.read_u64(required(TiffTag::TileWidth)?).await? as usize;
            let th = values.read_u64(required(TiffTag::TileLength)?).await? as usize;
            (true, th, tw, TiffTag::TileOffsets, TiffTag::TileByteCounts)
        } else {
            let rows =
                read_scalar(&values, ifd, TiffTag::RowsPerStrip, u32::MAX as u64).await? as usize;
            (
                false,
                rows.clamp(1, height.max(1)),
                width,
                TiffTag::StripOffsets,
                TiffTag::StripByteCounts,
            )
        };

        if block_width == 0 || block_height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::TileWidth.name(),
                message: "zero block size".to_string(),
            });
        }

        let offsets = values.read_u64_array(required(offsets_tag)?).await?;
        let byte_counts = values.read_u64_array(required(counts_tag)?).await?;

        let mut page = ImagePage {
            index,
            width,
            height,
            samples_per_pixel,
            dtype,
            planar_configuration,
            compression,
            predictor,
            photometric,
            new_subfile_type,
            tiled,
            block_height,
            block_width,
            offsets,
            byte_counts,
            jpeg_tables: None,
            description: None,
            software: None,
            x_resolution: None,
            y_resolution: None,
            resolution_unit,
            sub_ifds: Vec::new(),
        };

        let expected = page.block_count();
        if page.offsets.len() < expected || page.byte_counts.len() < expected {
            return Err(TiffError::InvalidTagValue {
                tag: offsets_tag.name(),
                message: format!(
                    "page {} needs {} blocks, directory lists {} offsets and {} byte counts",
                    index,
                    expected,
                    page.offsets.len(),
                    page.byte_counts.len()
                ),
            });
        }

        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::JpegTables) {
            page.jpeg_tables = Some(values.read_bytes(entry).await?);
        }
        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::Software) {
            page.software = Some(values.read_string(entry).await?);
        }
        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::XResolution) {
            page.x_resolution = values.read_f64(entry).await.ok();
        }
        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::YResolution) {
            page.y_resolution = values.read_f64(entry).await.ok();
        }
        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::SubIfds) {
            page.sub_ifds = values.read_u64_array(entry).await?;
        }

        Ok(page)
    }

    /// Number of stored strips or tiles.
    pub fn block_count(&self) -> usize {
        let per_plane = self.blocks_down() * self.blocks_across();
        if self.planar_configuration == PLANAR_SEPARATE {
            per_plane * self.samples_per_pixel
        } else {
            per_plane
        }
    }

    fn blocks_across(&self) -> usize {
        self.width.div_ceil(self.block_width)
    }

    fn blocks_down(&self) -> usize {
        self.height.div_ceil(self.block_height)
    }

    /// Chunk extent exposed to the array layer: tiles, or whole planes.
    pub fn chunk_extent(&self) -> (usize, usize) {
        if self.tiled {
            (self.block_height, self.block_width)
        } else {
            (self.height, self.width)
        }
    }

    pub fn is_reduced_resolution(&self) -> bool {
        self.new_subfile_type & SUBFILE_REDUCED_RESOLUTION != 0
    }

    /// Shape, dtype and sample layout must agree for pages to stack.
    pub fn same_shape(&self, other: &ImagePage) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.samples_per_pixel == other.samples_per_pixel
            && self.dtype == other.dtype
            && self.planar_configuration == other.planar_configuration
    }

    /// Read one chunk as `[s][y][x]` for samples `first..first + count`.
    ///
    /// `(y, x)` must lie on the chunk grid; `height` and `width` are the
    /// window after cropping at the image edge.
    #[allow(clippy::too_many_arguments)]
    pub async fn read_chunk<R: RangeReader + ?Sized>(
        &self,
        reader: &R,
        byte_order: ByteOrder,
        y: usize,
        x: usize,
        height: usize,
        width: usize,
        first: usize,
        count: usize,
    ) -> Result<Vec<u8>, FormatError> {
        let (chunk_h, chunk_w) = self.chunk_extent();
        if y % chunk_h != 0 || x % chunk_w != 0 || y >= self.height || x >= self.width {
            return Err(FormatError::corrupt(format!(
                "chunk origin ({}, {}) is not on the {}x{} grid of page {}",
                y, x, chunk_h, chunk_w, self.index
            )));
        }
        if first + count > self.samples_per_pixel {
            return Err(FormatError::corrupt(format!(
                "samples {}..{} exceed {} per pixel",
                first,
                first + count,
                self.samples_per_pixel
            )));
        }

        let bps = self.dtype.bytes_per_sample();
        let spp = self.samples_per_pixel;

        if self.planar_configuration == PLANAR_SEPARATE {
            let mut out = Vec::with_capacity(count * height * width * bps);
            for s in first..first + count {
                let plane = self
                    .read_region(reader, byte_order, y, x, height, width, s, 1)
                    .await?;
                out.extend_from_slice(&plane);
            }
            Ok(out)
        } else {
            let interleaved = self
                .read_region(reader, byte_order, y, x, height, width, 0, spp)
                .await?;
            Ok(deinterleave(&interleaved, height * width, spp, bps, first, count))
        }
    }

    /// Decode the blocks covering one chunk for one sample plane (planar) or
    /// all samples (chunky), returning pixel-interleaved rows.
    #[allow(clippy::too_many_arguments)]
    async fn read_region<R: RangeReader + ?Sized>(
        &self,
        reader: &R,
        byte_order: ByteOrder,
        y: usize,
        x: usize,
        height: usize,
        width: usize,
        sample_plane: usize,
        samples: usize,
    ) -> Result<Vec<u8>, FormatError> {
        let bps = self.dtype.bytes_per_sample();
        let per_plane = self.blocks_down() * self.blocks_across();
        let plane_base = if self.planar_configuration == PLANAR_SEPARATE {
            sample_plane * per_plane
        } else {
            0
        };

        if self.tiled {
            let index = plane_base + (y / self.block_height) * self.blocks_across() + x / self.block_width;
            let tile = self
                .decode_block(reader, byte_order, index, self.block_height, self.block_width, samples)
                .await?;
            let row_bytes = self.block_width * samples * bps;
            return Ok(crop_rows(&tile, row_bytes, width * samples * bps, height));
        }

        let mut plane = Vec::with_capacity(height * width * samples * bps);
        for strip in 0..self.blocks_down() {
            let rows = self.block_height.min(self.height - strip * self.block_height);
            let block = self
                .decode_block(reader, byte_order, plane_base + strip, rows, self.width, samples)
                .await?;
            plane.extend_from_slice(&block);
        }
        Ok(plane)
    }

    async fn decode_block<R: RangeReader + ?Sized>(
        &self,
        reader: &R,
        byte_order: ByteOrder,
        index: usize,
        rows: usize,
        row_width: usize,
        samples: usize,
    ) -> Result<Vec<u8>, FormatError> {
        let bps = self.dtype.bytes_per_sample();
        let offset = self.offsets[index];
        let length = self.byte_counts[index] as usize;
        if length == 0 {
            return Err(FormatError::Decode(format!(
                "block {} of page {} has no data",
                index, self.index
            )));
        }

        let raw = reader.read_exact_at(offset, length).await?;
        let expected = rows * row_width * samples * bps;
        let mut decoded = decompress(
            self.compression,
            &raw,
            expected,
            self.jpeg_tables.as_deref(),
        )?;

        to_native_endian(&mut decoded, bps, byte_order == ByteOrder::LittleEndian);
        if self.predictor == Predictor::Horizontal {
            undo_horizontal_predictor(&mut decoded, row_width, samples, bps)?;
        }
        Ok(decoded)
    }
}

async fn read_scalar<R: RangeReader + ?Sized>(
    values: &ValueReader<'_, R>,
    ifd: &Ifd,
    tag: TiffTag,
    default: u64,
) -> Result<u64, TiffError> {
    match ifd.get_entry_by_tag(tag) {
        Some(entry) => values.read_u64(entry).await,
        None => Ok(default),
    }
}

fn resolve_dtype(bits: &[u16], formats: &[u16]) -> Result<PixelType, TiffError> {
    let first_bits = bits.first().copied().unwrap_or(1);
    if bits.iter().any(|&b| b != first_bits) {
        return Err(TiffError::UnsupportedSampleLayout(format!(
            "mixed bits per sample {:?}",
            bits
        )));
    }
    let format_raw = formats.first().copied().unwrap_or(1);
    let format = SampleFormat::from_u16(format_raw).unwrap_or_default();

    match (format, first_bits) {
        (SampleFormat::Uint, 8) => Ok(PixelType::Uint8),
        (SampleFormat::Uint, 16) => Ok(PixelType::Uint16),
        (SampleFormat::Uint, 32) => Ok(PixelType::Uint32),
        (SampleFormat::Int, 8) => Ok(PixelType::Int8),
        (SampleFormat::Int, 16) => Ok(PixelType::Int16),
        (SampleFormat::Int, 32) => Ok(PixelType::Int32),
        (SampleFormat::Float, 32) => Ok(PixelType::Float32),
        (SampleFormat::Float, 64) => Ok(PixelType::Float64),
        (format, bits) => Err(TiffError::UnsupportedSampleLayout(format!(
            "{:?} with {} bits per sample",
            format, bits
        ))),
    }
}

// =============================================================================
// TiffFile
// =============================================================================

/// A parsed TIFF: header plus every page of the main IFD chain.
#[derive(Debug, Clone)]
pub struct TiffFile {
    pub header: TiffHeader,
    pub pages: Vec<ImagePage>,
}

impl TiffFile {
    /// Parse the header and walk the main IFD chain.
    pub async fn parse<R: RangeReader + ?Sized>(reader: &R) -> Result<Self, TiffError> {
        let header_len = BIGTIFF_HEADER_SIZE.min(reader.size() as usize);
        let header_bytes = reader.read_exact_at(0, header_len).await?;
        let header = TiffHeader::parse(&header_bytes, reader.size())?;

        let ifds = Self::parse_all_ifds(reader, &header).await?;
        if ifds.is_empty() {
            return Err(TiffError::InvalidIfdOffset(header.first_ifd_offset));
        }

        let mut pages = Vec::with_capacity(ifds.len());
        for (index, ifd) in ifds.iter().enumerate() {
            pages.push(ImagePage::from_ifd(reader, &header, ifd, index).await?);
        }

        // Only the first page's description is meaningful for OME and ImageJ.
        if let Some(entry) = ifds[0].get_entry_by_tag(TiffTag::ImageDescription) {
            let values = ValueReader::new(reader, &header);
            pages[0].description = Some(values.read_string(entry).await?);
        }

        debug!(
            identifier = reader.identifier(),
            pages = pages.len(),
            bigtiff = header.is_bigtiff,
            "parsed TIFF structure"
        );

        Ok(TiffFile { header, pages })
    }

    async fn parse_all_ifds<R: RangeReader + ?Sized>(
        reader: &R,
        header: &TiffHeader,
    ) -> Result<Vec<Ifd>, TiffError> {
        let mut ifds = Vec::new();
        let mut visited = HashSet::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 {
            if !visited.insert(offset) {
                return Err(TiffError::IfdCycle(offset));
            }
            if ifds.len() >= MAX_IFDS {
                return Err(TiffError::InvalidTagValue {
                    tag: "IFD chain",
                    message: format!("more than {} pages", MAX_IFDS),
                });
            }
            if offset >= reader.size() {
                return Err(TiffError::InvalidIfdOffset(offset));
            }

            let count_bytes = reader.read_exact_at(offset, header.ifd_count_size()).await?;
            let entry_count = if header.is_bigtiff {
                header.byte_order.read_u64(&count_bytes)
            } else {
                header.byte_order.read_u16(&count_bytes) as u64
            };

            let ifd_size = Ifd::calculate_size(entry_count, header);
            let ifd_bytes = reader.read_exact_at(offset, ifd_size).await?;
            let ifd = Ifd::parse(&ifd_bytes, header)?;

            offset = ifd.next_ifd_offset;
            ifds.push(ifd);
        }

        Ok(ifds)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    pub fn description(&self) -> Option<&str> {
        self.pages.first().and_then(|p| p.description.as_deref())
    }
}
