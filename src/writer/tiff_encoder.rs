//! Sequential little-endian TIFF/BigTIFF encoder.
//!
//! Output is produced strictly front to back so it can stream into any
//! [`ByteSink`]. Each page is laid out as
//!
//! ```text
//! [IFD + out-of-line values][pixel chunks][sub-IFD][chunks]...[next page]
//! ```
//!
//! An IFD's size depends only on its tag counts, so every offset of a page
//! (its chunks, its SubIFDs and the next page) is known before the page's
//! first byte is written. Only one page and its reduced levels are held in
//! memory at a time.

use tracing::debug;

use crate::error::{FormatError, ImageError};
use crate::format::compression::deflate;
use crate::format::tiff::{
    Compression, FieldType, SampleFormat, TiffTag, PHOTOMETRIC_MIN_IS_BLACK, PLANAR_CHUNKY,
    SUBFILE_REDUCED_RESOLUTION,
};
use crate::io::ByteSink;
use crate::metadata::PixelType;

/// Largest classic TIFF we emit; beyond this BigTIFF is chosen.
pub const BIGTIFF_THRESHOLD: u64 = u32::MAX as u64 - 64 * 1024 * 1024;

/// Target uncompressed strip size for plain pages.
const STRIP_BYTES: usize = 256 * 1024;

/// Zlib level used for Deflate pages.
const DEFLATE_LEVEL: u32 = 6;

/// Whether an output of `estimated_bytes` needs BigTIFF offsets.
pub fn needs_bigtiff(estimated_bytes: u64) -> bool {
    estimated_bytes > BIGTIFF_THRESHOLD
}

/// How a page's pixels are divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLayout {
    Strips { rows_per_strip: u32 },
    Tiles { size: u32 },
}

/// One encoded image, ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    pub width: u32,
    pub height: u32,
    pub dtype: PixelType,
    pub compression: Compression,
    pub layout: ChunkLayout,
    pub chunks: Vec<Vec<u8>>,
    pub reduced: bool,
    pub description: Option<String>,
    pub software: Option<String>,
}

impl EncodedPage {
    /// Split a little-endian plane into strips.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if compression fails.
    pub fn strips(
        plane: &[u8],
        width: u32,
        height: u32,
        dtype: PixelType,
        compression: Compression,
    ) -> Result<Self, FormatError> {
        let row_bytes = width as usize * dtype.bytes_per_sample();
        let rows_per_strip = (STRIP_BYTES / row_bytes.max(1)).clamp(1, height.max(1) as usize);

        let chunks = plane
            .chunks(rows_per_strip * row_bytes)
            .map(|strip| compress(strip, compression))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            width,
            height,
            dtype,
            compression,
            layout: ChunkLayout::Strips {
                rows_per_strip: rows_per_strip as u32,
            },
            chunks,
            reduced: false,
            description: None,
            software: None,
        })
    }

    /// Cut a little-endian plane into square tiles, zero-padding edge tiles.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if compression fails.
    pub fn tiles(
        plane: &[u8],
        width: u32,
        height: u32,
        dtype: PixelType,
        tile: u32,
        compression: Compression,
    ) -> Result<Self, FormatError> {
        let bps = dtype.bytes_per_sample();
        let (w, h, t) = (width as usize, height as usize, tile as usize);
        let row_bytes = w * bps;
        let tile_row_bytes = t * bps;

        let mut chunks = Vec::with_capacity(w.div_ceil(t) * h.div_ceil(t));
        for ty in 0..h.div_ceil(t) {
            for tx in 0..w.div_ceil(t) {
                let mut buffer = vec![0u8; t * tile_row_bytes];
                let cols = t.min(w - tx * t) * bps;
                for row in 0..t.min(h - ty * t) {
                    let src = (ty * t + row) * row_bytes + tx * tile_row_bytes;
                    let dst = row * tile_row_bytes;
                    buffer[dst..dst + cols].copy_from_slice(&plane[src..src + cols]);
                }
                chunks.push(compress(&buffer, compression)?);
            }
        }

        Ok(Self {
            width,
            height,
            dtype,
            compression,
            layout: ChunkLayout::Tiles { size: tile },
            chunks,
            reduced: false,
            description: None,
            software: None,
        })
    }

    /// Bytes of pixel data including the trailing alignment pad.
    fn data_len(&self) -> u64 {
        let len: u64 = self.chunks.iter().map(|c| c.len() as u64).sum();
        len + len % 2
    }
}

fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>, FormatError> {
    match compression {
        Compression::Deflate | Compression::AdobeDeflate => deflate(data, DEFLATE_LEVEL),
        _ => Ok(data.to_vec()),
    }
}

// =============================================================================
// IFD entries
// =============================================================================

enum Value {
    Short(Vec<u16>),
    Long(Vec<u32>),
    /// LONG in classic TIFF, LONG8 in BigTIFF
    Offsets(Vec<u64>),
    Ascii(String),
}

struct Entry {
    tag: TiffTag,
    value: Value,
}

impl Entry {
    fn new(tag: TiffTag, value: Value) -> Self {
        Self { tag, value }
    }

    fn encode(&self, bigtiff: bool) -> Result<(FieldType, u64, Vec<u8>), FormatError> {
        let encoded = match &self.value {
            Value::Short(v) => (
                FieldType::Short,
                v.len() as u64,
                v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ),
            Value::Long(v) => (
                FieldType::Long,
                v.len() as u64,
                v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ),
            Value::Offsets(v) if bigtiff => (
                FieldType::Long8,
                v.len() as u64,
                v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ),
            Value::Offsets(v) => {
                let mut bytes = Vec::with_capacity(v.len() * 4);
                for &offset in v {
                    let narrow = u32::try_from(offset).map_err(|_| {
                        FormatError::corrupt(format!(
                            "{} value {} does not fit classic TIFF",
                            self.tag.name(),
                            offset
                        ))
                    })?;
                    bytes.extend_from_slice(&narrow.to_le_bytes());
                }
                (FieldType::Long, v.len() as u64, bytes)
            }
            Value::Ascii(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                (FieldType::Ascii, bytes.len() as u64, bytes)
            }
        };
        Ok(encoded)
    }
}

fn page_entries(page: &EncodedPage, data_start: u64, sub_ifds: &[u64]) -> Vec<Entry> {
    let mut offsets = Vec::with_capacity(page.chunks.len());
    let mut counts = Vec::with_capacity(page.chunks.len());
    let mut position = data_start;
    for chunk in &page.chunks {
        offsets.push(position);
        counts.push(chunk.len() as u64);
        position += chunk.len() as u64;
    }

    let sample_format = if page.dtype.is_float() {
        SampleFormat::Float
    } else if page.dtype.is_signed() {
        SampleFormat::Int
    } else {
        SampleFormat::Uint
    };
    let bits = (page.dtype.bytes_per_sample() * 8) as u16;

    let mut entries = vec![
        Entry::new(
            TiffTag::NewSubfileType,
            Value::Long(vec![if page.reduced {
                SUBFILE_REDUCED_RESOLUTION
            } else {
                0
            }]),
        ),
        Entry::new(TiffTag::ImageWidth, Value::Long(vec![page.width])),
        Entry::new(TiffTag::ImageLength, Value::Long(vec![page.height])),
        Entry::new(TiffTag::BitsPerSample, Value::Short(vec![bits])),
        Entry::new(
            TiffTag::Compression,
            Value::Short(vec![page.compression as u16]),
        ),
        Entry::new(
            TiffTag::PhotometricInterpretation,
            Value::Short(vec![PHOTOMETRIC_MIN_IS_BLACK]),
        ),
    ];
    if let Some(description) = &page.description {
        entries.push(Entry::new(
            TiffTag::ImageDescription,
            Value::Ascii(description.clone()),
        ));
    }

    match page.layout {
        ChunkLayout::Strips { rows_per_strip } => {
            entries.push(Entry::new(TiffTag::StripOffsets, Value::Offsets(offsets)));
            entries.push(Entry::new(TiffTag::SamplesPerPixel, Value::Short(vec![1])));
            entries.push(Entry::new(
                TiffTag::RowsPerStrip,
                Value::Long(vec![rows_per_strip]),
            ));
            entries.push(Entry::new(TiffTag::StripByteCounts, Value::Offsets(counts)));
            entries.push(Entry::new(
                TiffTag::PlanarConfiguration,
                Value::Short(vec![PLANAR_CHUNKY]),
            ));
            if let Some(software) = &page.software {
                entries.push(Entry::new(TiffTag::Software, Value::Ascii(software.clone())));
            }
        }
        ChunkLayout::Tiles { size } => {
            entries.push(Entry::new(TiffTag::SamplesPerPixel, Value::Short(vec![1])));
            entries.push(Entry::new(
                TiffTag::PlanarConfiguration,
                Value::Short(vec![PLANAR_CHUNKY]),
            ));
            if let Some(software) = &page.software {
                entries.push(Entry::new(TiffTag::Software, Value::Ascii(software.clone())));
            }
            entries.push(Entry::new(TiffTag::TileWidth, Value::Long(vec![size])));
            entries.push(Entry::new(TiffTag::TileLength, Value::Long(vec![size])));
            entries.push(Entry::new(TiffTag::TileOffsets, Value::Offsets(offsets)));
            entries.push(Entry::new(TiffTag::TileByteCounts, Value::Offsets(counts)));
        }
    }

    if !sub_ifds.is_empty() {
        entries.push(Entry::new(TiffTag::SubIfds, Value::Offsets(sub_ifds.to_vec())));
    }
    entries.push(Entry::new(
        TiffTag::SampleFormat,
        Value::Short(vec![sample_format.as_u16()]),
    ));

    entries.sort_by_key(|e| e.tag.as_u16());
    entries
}

/// Serialize an IFD placed at `position` with its out-of-line values after it.
fn serialize_ifd(
    entries: &[Entry],
    position: u64,
    next: u64,
    bigtiff: bool,
) -> Result<Vec<u8>, FormatError> {
    let (count_len, entry_len, offset_len) = if bigtiff { (8, 20, 8) } else { (2, 12, 4) };
    let inline = if bigtiff {
        FieldType::INLINE_THRESHOLD_BIGTIFF
    } else {
        FieldType::INLINE_THRESHOLD_TIFF
    };

    let table_len = count_len + entries.len() * entry_len + offset_len;
    let mut table = Vec::with_capacity(table_len);
    let mut extra = Vec::new();

    if bigtiff {
        table.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    } else {
        table.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    }

    for entry in entries {
        let (field_type, count, bytes) = entry.encode(bigtiff)?;
        table.extend_from_slice(&entry.tag.as_u16().to_le_bytes());
        table.extend_from_slice(&(field_type as u16).to_le_bytes());

        let mut slot = vec![0u8; offset_len];
        if bytes.len() <= inline {
            slot[..bytes.len()].copy_from_slice(&bytes);
        } else {
            let at = position + (table_len + extra.len()) as u64;
            if bigtiff {
                slot.copy_from_slice(&at.to_le_bytes());
            } else {
                let at = u32::try_from(at).map_err(|_| {
                    FormatError::corrupt("IFD value offset does not fit classic TIFF")
                })?;
                slot.copy_from_slice(&at.to_le_bytes());
            }
            extra.extend_from_slice(&bytes);
            if extra.len() % 2 == 1 {
                extra.push(0);
            }
        }

        if bigtiff {
            table.extend_from_slice(&count.to_le_bytes());
        } else {
            table.extend_from_slice(&(count as u32).to_le_bytes());
        }
        table.extend_from_slice(&slot);
    }

    if bigtiff {
        table.extend_from_slice(&next.to_le_bytes());
    } else {
        let next = u32::try_from(next)
            .map_err(|_| FormatError::corrupt("next IFD offset does not fit classic TIFF"))?;
        table.extend_from_slice(&next.to_le_bytes());
    }

    table.extend_from_slice(&extra);
    Ok(table)
}

// =============================================================================
// Encoder
// =============================================================================

fn encode_error(e: FormatError) -> ImageError {
    ImageError::Write(e.to_string())
}

/// Writes a TIFF page by page into a sink.
pub struct TiffEncoder<'a, S: ByteSink + ?Sized> {
    sink: &'a mut S,
    bigtiff: bool,
    pages_written: usize,
}

impl<'a, S: ByteSink + ?Sized> TiffEncoder<'a, S> {
    /// Write the file header; the first IFD follows it directly.
    ///
    /// # Errors
    ///
    /// Returns `Write` if the sink rejects the header.
    pub async fn start(sink: &'a mut S, bigtiff: bool) -> Result<Self, ImageError> {
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(b"II");
        if bigtiff {
            header.extend_from_slice(&43u16.to_le_bytes());
            header.extend_from_slice(&8u16.to_le_bytes());
            header.extend_from_slice(&0u16.to_le_bytes());
            header.extend_from_slice(&16u64.to_le_bytes());
        } else {
            header.extend_from_slice(&42u16.to_le_bytes());
            header.extend_from_slice(&8u32.to_le_bytes());
        }
        let mut encoder = Self {
            sink,
            bigtiff,
            pages_written: 0,
        };
        encoder.put(&header).await?;
        Ok(encoder)
    }

    pub fn is_bigtiff(&self) -> bool {
        self.bigtiff
    }

    pub fn position(&self) -> u64 {
        self.sink.position()
    }

    /// Write one top-level page and its reduced levels as SubIFDs.
    ///
    /// # Errors
    ///
    /// Returns `Write` if the sink fails or an offset does not fit the
    /// chosen TIFF flavour.
    pub async fn write_page(
        &mut self,
        page: &EncodedPage,
        reduced: &[EncodedPage],
        last: bool,
    ) -> Result<(), ImageError> {
        let start = self.sink.position();

        // Block lengths do not depend on offset values, so measure with zeros.
        let placeholder_subs = vec![0u64; reduced.len()];
        let main_len = self.block_len(page, &placeholder_subs)?;
        let mut sub_positions = Vec::with_capacity(reduced.len());
        let mut cursor = start + main_len + page.data_len();
        for level in reduced {
            sub_positions.push(cursor);
            cursor += self.block_len(level, &[])? + level.data_len();
        }
        let next = if last { 0 } else { cursor };

        let main = page_entries(page, start + main_len, &sub_positions);
        let block = serialize_ifd(&main, start, next, self.bigtiff).map_err(encode_error)?;
        self.put(&block).await?;
        self.write_chunks(page).await?;

        for (level, &position) in reduced.iter().zip(&sub_positions) {
            let entries = page_entries(level, position + self.block_len(level, &[])?, &[]);
            let block = serialize_ifd(&entries, position, 0, self.bigtiff).map_err(encode_error)?;
            self.put(&block).await?;
            self.write_chunks(level).await?;
        }

        debug!(
            page = self.pages_written,
            width = page.width,
            height = page.height,
            levels = reduced.len(),
            bytes = self.sink.position() - start,
            "wrote TIFF page"
        );
        self.pages_written += 1;
        Ok(())
    }

    /// IFD block length of a page; independent of the offset values.
    fn block_len(&self, page: &EncodedPage, sub_ifds: &[u64]) -> Result<u64, ImageError> {
        let block = serialize_ifd(&page_entries(page, 0, sub_ifds), 0, 0, self.bigtiff)
            .map_err(encode_error)?;
        Ok(block.len() as u64)
    }

    async fn write_chunks(&mut self, page: &EncodedPage) -> Result<(), ImageError> {
        let mut written = 0u64;
        for chunk in &page.chunks {
            self.put(chunk).await?;
            written += chunk.len() as u64;
        }
        if written % 2 == 1 {
            self.put(&[0]).await?;
        }
        Ok(())
    }

    async fn put(&mut self, bytes: &[u8]) -> Result<(), ImageError> {
        self.sink
            .write_all(bytes)
            .await
            .map_err(|e| ImageError::Write(format!("{}: {}", self.sink.identifier(), e)))
    }

    pub fn pages_written(&self) -> usize {
        self.pages_written
    }
}
