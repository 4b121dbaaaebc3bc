//! Codecs for TIFF strip and tile payloads.
//!
//! Every decoder returns exactly `expected_len` bytes or a `Decode` error;
//! a short payload is never padded.
//!
//! JPEG-compressed TIFFs often use abbreviated streams: each tile lacks the
//! quantization and Huffman tables, which are stored once in the
//! `JPEGTables` tag and must be spliced in front of the tile's scan data.

use std::io::{Cursor, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use image::ImageFormat;
use weezl::decode::Decoder as LzwDecoder;
use weezl::{BitOrder, LzwStatus};

use super::tiff::Compression;
use crate::error::{FormatError, TiffError};

/// Start Of Image marker
const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Decode one strip or tile.
pub fn decompress(
    compression: Compression,
    data: &[u8],
    expected_len: usize,
    jpeg_tables: Option<&[u8]>,
) -> Result<Vec<u8>, FormatError> {
    let mut out = match compression {
        Compression::None => data.to_vec(),
        Compression::Lzw => lzw_decode(data, expected_len)?,
        Compression::Deflate | Compression::AdobeDeflate => inflate(data, expected_len)?,
        Compression::PackBits => packbits_decode(data, expected_len)?,
        Compression::Jpeg => jpeg_decode(data, jpeg_tables)?,
        other => {
            return Err(TiffError::UnsupportedCompression(other.name().to_string()).into());
        }
    };

    if out.len() < expected_len {
        return Err(FormatError::Decode(format!(
            "{} payload decoded to {} bytes, expected {}",
            compression.name(),
            out.len(),
            expected_len
        )));
    }
    out.truncate(expected_len);
    Ok(out)
}

/// Zlib-compress a buffer for the writers.
pub fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, FormatError> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::new(level),
    );
    encoder
        .write_all(data)
        .map_err(|e| FormatError::Decode(format!("deflate: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| FormatError::Decode(format!("deflate: {}", e)))
}

fn inflate(data: &[u8], expected_len: usize) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(expected_len);
    ZlibDecoder::new(Cursor::new(data))
        .take(expected_len as u64)
        .read_to_end(&mut out)
        .map_err(|e| FormatError::Decode(format!("deflate: {}", e)))?;
    Ok(out)
}

// =============================================================================
// PackBits
// =============================================================================

fn packbits_decode(data: &[u8], expected_len: usize) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut pos = 0;

    while pos < data.len() && out.len() < expected_len {
        let n = data[pos] as i8;
        pos += 1;

        if n >= 0 {
            let run = n as usize + 1;
            let literal = data
                .get(pos..pos + run)
                .ok_or_else(|| FormatError::Decode("packbits literal overruns input".into()))?;
            out.extend_from_slice(literal);
            pos += run;
        } else if n != -128 {
            let byte = *data
                .get(pos)
                .ok_or_else(|| FormatError::Decode("packbits run overruns input".into()))?;
            let run = (1 - n as isize) as usize;
            out.extend(std::iter::repeat(byte).take(run));
            pos += 1;
        }
    }

    Ok(out)
}

// =============================================================================
// LZW
// =============================================================================

fn lzw_decode(data: &[u8], expected_len: usize) -> Result<Vec<u8>, FormatError> {
    if data.len() >= 2 && data[0] == 0x00 && data[1] == 0x01 {
        return Err(FormatError::unsupported_variant("old-style LZW"));
    }

    // TIFF switches code width one entry early.
    let mut decoder = LzwDecoder::with_tiff_size_switch(BitOrder::Msb, 8);
    let mut out = vec![0u8; expected_len];
    let mut read = 0;
    let mut written = 0;

    while written < expected_len {
        let result = decoder.decode_bytes(&data[read..], &mut out[written..]);
        read += result.consumed_in;
        written += result.consumed_out;
        match result.status {
            Ok(LzwStatus::Ok) if result.consumed_in > 0 || result.consumed_out > 0 => {}
            Ok(_) => break,
            Err(e) => return Err(FormatError::Decode(format!("lzw: {}", e))),
        }
    }

    out.truncate(written);
    Ok(out)
}

// =============================================================================
// JPEG
// =============================================================================

/// Splice `JPEGTables` in front of an abbreviated tile stream.
///
/// Result: SOI + tables content + tile content (without its SOI) + EOI.
pub fn merge_jpeg_tables(tables: &[u8], tile_data: &[u8]) -> Vec<u8> {
    if tables.is_empty() {
        return tile_data.to_vec();
    }

    let tables_end = if tables.ends_with(&EOI) {
        tables.len() - 2
    } else {
        tables.len()
    };
    let tile_start = if tile_data.starts_with(&SOI) { 2 } else { 0 };

    let mut merged = Vec::with_capacity(tables_end + tile_data.len() - tile_start);
    merged.extend_from_slice(&tables[..tables_end]);
    merged.extend_from_slice(&tile_data[tile_start..]);
    merged
}

/// Decode a JPEG tile to interleaved 8-bit samples.
fn jpeg_decode(data: &[u8], tables: Option<&[u8]>) -> Result<Vec<u8>, FormatError> {
    let merged;
    let stream = match tables {
        Some(tables) if !tables.is_empty() => {
            merged = merge_jpeg_tables(tables, data);
            merged.as_slice()
        }
        _ => data,
    };

    let decoded = image::load_from_memory_with_format(stream, ImageFormat::Jpeg)
        .map_err(|e| FormatError::Decode(format!("jpeg: {}", e)))?;

    Ok(match decoded.color().channel_count() {
        1 => decoded.into_luma8().into_raw(),
        _ => decoded.into_rgb8().into_raw(),
    })
}

// =============================================================================
// Predictor
// =============================================================================

/// Undo horizontal differencing (Predictor = 2) in place.
///
/// `buf` holds `rows` rows of `width * samples` native-endian values of
/// `bytes_per_sample` bytes each.
pub fn undo_horizontal_predictor(
    buf: &mut [u8],
    width: usize,
    samples: usize,
    bytes_per_sample: usize,
) -> Result<(), FormatError> {
    let row_len = width * samples * bytes_per_sample;
    if row_len == 0 {
        return Ok(());
    }
    let stride = samples * bytes_per_sample;

    for row in buf.chunks_exact_mut(row_len) {
        for i in stride..row_len {
            if (i % bytes_per_sample) != 0 {
                continue;
            }
            let prev = i - stride;
            match bytes_per_sample {
                1 => row[i] = row[i].wrapping_add(row[prev]),
                2 => {
                    let a = u16::from_ne_bytes([row[prev], row[prev + 1]]);
                    let b = u16::from_ne_bytes([row[i], row[i + 1]]);
                    row[i..i + 2].copy_from_slice(&b.wrapping_add(a).to_ne_bytes());
                }
                4 => {
                    let a = u32::from_ne_bytes([row[prev], row[prev + 1], row[prev + 2], row[prev + 3]]);
                    let b = u32::from_ne_bytes([row[i], row[i + 1], row[i + 2], row[i + 3]]);
                    row[i..i + 4].copy_from_slice(&b.wrapping_add(a).to_ne_bytes());
                }
                8 => {
                    let mut a = [0u8; 8];
                    let mut b = [0u8; 8];
                    a.copy_from_slice(&row[prev..prev + 8]);
                    b.copy_from_slice(&row[i..i + 8]);
                    let sum = u64::from_ne_bytes(b).wrapping_add(u64::from_ne_bytes(a));
                    row[i..i + 8].copy_from_slice(&sum.to_ne_bytes());
                }
                other => {
                    return Err(FormatError::unsupported_variant(format!(
                        "predictor with {}-byte samples",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lzw_encode(data: &[u8]) -> Vec<u8> {
        weezl::encode::Encoder::with_tiff_size_switch(BitOrder::Msb, 8)
            .encode(data)
            .unwrap()
    }

    #[test]
    fn test_lzw_repetitive_input() {
        let plain: Vec<u8> = (0..2000).map(|i| (i % 7) as u8 * 30).collect();
        let encoded = lzw_encode(&plain);
        assert!(encoded.len() < plain.len());
        let decoded = decompress(Compression::Lzw, &encoded, plain.len(), None).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn test_lzw_kwkwk_case() {
        let plain = b"aaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let decoded = lzw_decode(&lzw_encode(&plain), plain.len()).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn test_lzw_stops_at_expected_length() {
        let plain: Vec<u8> = (0..600).map(|i| (i / 3) as u8).collect();
        let decoded = lzw_decode(&lzw_encode(&plain), 512).unwrap();
        assert_eq!(decoded, &plain[..512]);
    }

    #[test]
    fn test_lzw_truncated_or_invalid_stream() {
        let plain: Vec<u8> = (0..1000).map(|i| (i * 7 % 253) as u8).collect();
        let encoded = lzw_encode(&plain);
        let truncated = &encoded[..encoded.len() / 2];
        assert!(matches!(
            decompress(Compression::Lzw, truncated, plain.len(), None),
            Err(FormatError::Decode(_))
        ));

        // Clear code, then code 511 while the table ends at 258
        assert!(decompress(Compression::Lzw, &[0x80, 0x7F, 0xC0], 4, None).is_err());
    }

    #[test]
    fn test_packbits_sample_from_tiff_docs() {
        let encoded = [
            0xFE, 0xAA, 0x02, 0x80, 0x00, 0x2A, 0xFD, 0xAA, 0x03, 0x80, 0x00, 0x2A, 0x22, 0xF7,
            0xAA,
        ];
        let expected = [
            0xAA, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0xAA, 0xAA, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0x22,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];
        let decoded = decompress(Compression::PackBits, &encoded, expected.len(), None).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_deflate_then_inflate() {
        let plain: Vec<u8> = (0..4096u32).map(|i| (i / 16) as u8).collect();
        let packed = deflate(&plain, 6).unwrap();
        let unpacked = decompress(Compression::AdobeDeflate, &packed, plain.len(), None).unwrap();
        assert_eq!(unpacked, plain);
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let result = decompress(Compression::None, &[1, 2, 3], 8, None);
        assert!(matches!(result, Err(FormatError::Decode(_))));
    }

    #[test]
    fn test_unsupported_compression() {
        let result = decompress(Compression::Jpeg2000, &[0; 4], 4, None);
        assert!(matches!(
            result,
            Err(FormatError::Tiff(TiffError::UnsupportedCompression(_)))
        ));
    }

    #[test]
    fn test_merge_jpeg_tables() {
        let tables = [0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x02, 0xFF, 0xD9];
        let tile = [0xFF, 0xD8, 0xFF, 0xDA, 0x01, 0xFF, 0xD9];
        let merged = merge_jpeg_tables(&tables, &tile);
        assert_eq!(
            merged,
            vec![0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x02, 0xFF, 0xDA, 0x01, 0xFF, 0xD9]
        );
    }

    #[test]
    fn test_jpeg_tile_decodes_to_gray_samples() {
        let gray = image::GrayImage::from_pixel(16, 8, image::Luma([128u8]));
        let mut encoded = Vec::new();
        image::DynamicImage::ImageLuma8(gray)
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Jpeg)
            .unwrap();

        let decoded = decompress(Compression::Jpeg, &encoded, 16 * 8, None).unwrap();
        assert_eq!(decoded.len(), 128);
        assert!(decoded.iter().all(|&v| (v as i32 - 128).abs() <= 2));
    }

    #[test]
    fn test_undo_predictor_u16() {
        let values: [u16; 4] = [100, 5, 5, 65535];
        let mut buf: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        undo_horizontal_predictor(&mut buf, 4, 1, 2).unwrap();
        let restored: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(restored, vec![100, 105, 110, 109]);
    }

    #[test]
    fn test_undo_predictor_rgb8() {
        let mut buf = vec![10, 20, 30, 1, 1, 1, 2, 2, 2];
        undo_horizontal_predictor(&mut buf, 3, 3, 1).unwrap();
        assert_eq!(buf, vec![10, 20, 30, 11, 21, 31, 13, 23, 33]);
    }
}
