//! TIFF tag value reading.
//!
//! Values can be stored either inline in the IFD entry (for small values)
//! or at an offset in the file (for larger values like arrays). Arrays such
//! as StripOffsets are fetched with one range request each.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file, respecting its byte order and format.
pub struct ValueReader<'a, R: RangeReader + ?Sized> {
    reader: &'a R,
    header: &'a TiffHeader,
}

impl<'a, R: RangeReader + ?Sized> ValueReader<'a, R> {
    pub fn new(reader: &'a R, header: &'a TiffHeader) -> Self {
        Self { reader, header }
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    pub async fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.header.byte_order);
            let bytes = self.reader.read_exact_at(offset, size as usize).await?;
            Ok(bytes)
        }
    }

    /// Read a single unsigned integer value.
    pub async fn read_u64(&self, entry: &IfdEntry) -> Result<u64, TiffError> {
        if let Some(value) = entry.inline_u64(self.header.byte_order) {
            return Ok(value);
        }

        let values = self.read_u64_array(entry).await?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(TiffError::InvalidTagValue {
                tag: tag_name(entry),
                message: format!("expected count 1, got {}", entry.count),
            }),
        }
    }

    /// Read an array of unsigned integers, widening Short/Long/Long8 to u64.
    pub async fn read_u64_array(&self, entry: &IfdEntry) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry).await?;
        parse_u64_array(&bytes, entry.count as usize, field_type, self.header.byte_order)
            .ok_or_else(|| TiffError::InvalidTagValue {
                tag: tag_name(entry),
                message: format!("expected an unsigned integer type, got {:?}", field_type),
            })
    }

    /// Read an array of small unsigned values (BitsPerSample, SampleFormat).
    pub async fn read_u16_array(&self, entry: &IfdEntry) -> Result<Vec<u16>, TiffError> {
        let values = self.read_u64_array(entry).await?;
        values
            .into_iter()
            .map(|v| {
                u16::try_from(v).map_err(|_| TiffError::InvalidTagValue {
                    tag: tag_name(entry),
                    message: format!("value {} does not fit in 16 bits", v),
                })
            })
            .collect()
    }

    /// Read a single Rational, Float or Double value as f64.
    pub async fn read_f64(&self, entry: &IfdEntry) -> Result<f64, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        let bytes = self.read_bytes(entry).await?;
        let byte_order = self.header.byte_order;

        match field_type {
            FieldType::Rational if bytes.len() >= 8 => {
                let num = byte_order.read_u32(&bytes[0..4]);
                let den = byte_order.read_u32(&bytes[4..8]);
                if den == 0 {
                    return Err(TiffError::InvalidTagValue {
                        tag: tag_name(entry),
                        message: "zero denominator".to_string(),
                    });
                }
                Ok(num as f64 / den as f64)
            }
            FieldType::Float if bytes.len() >= 4 => Ok(byte_order.read_f32(&bytes) as f64),
            FieldType::Double if bytes.len() >= 8 => Ok(byte_order.read_f64(&bytes)),
            _ => match entry.inline_u64(byte_order) {
                Some(v) => Ok(v as f64),
                None => Err(TiffError::InvalidTagValue {
                    tag: tag_name(entry),
                    message: format!("expected a numeric scalar, got {:?}", field_type),
                }),
            },
        }
    }

    /// Read an ASCII value, stripping the trailing NUL.
    pub async fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if !matches!(field_type, FieldType::Ascii | FieldType::Undefined | FieldType::Byte) {
            return Err(TiffError::InvalidTagValue {
                tag: tag_name(entry),
                message: format!("expected Ascii type for string, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

fn tag_name(entry: &IfdEntry) -> &'static str {
    super::tags::TiffTag::from_u16(entry.tag_id)
        .map(|t| t.name())
        .unwrap_or("unknown")
}

// =============================================================================
// Convenience functions for reading from bytes directly
// =============================================================================

/// Parse an array of unsigned integers from raw bytes.
///
/// Returns `None` when the field type is not an unsigned integer type or the
/// buffer is shorter than `count` values.
pub fn parse_u64_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Option<Vec<u64>> {
    let width = match field_type {
        FieldType::Byte | FieldType::Undefined => 1,
        FieldType::Short => 2,
        FieldType::Long | FieldType::Ifd => 4,
        FieldType::Long8 | FieldType::Ifd8 => 8,
        _ => return None,
    };

    if bytes.len() < count.checked_mul(width)? {
        return None;
    }

    let values = bytes
        .chunks_exact(width)
        .take(count)
        .map(|chunk| match width {
            1 => chunk[0] as u64,
            2 => byte_order.read_u16(chunk) as u64,
            4 => byte_order.read_u32(chunk) as u64,
            _ => byte_order.read_u64(chunk),
        })
        .collect();
    Some(values)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    fn le_header() -> TiffHeader {
        TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        }
    }

    fn entry(tag_id: u16, field_type: FieldType, count: u64, value: [u8; 4], is_inline: bool) -> IfdEntry {
        IfdEntry {
            tag_id,
            field_type: Some(field_type),
            field_type_raw: field_type as u16,
            count,
            value_offset_bytes: value.to_vec(),
            is_inline,
        }
    }

    #[test]
    fn test_parse_u64_array_widths() {
        let shorts = [0x64, 0x00, 0xC8, 0x00];
        assert_eq!(
            parse_u64_array(&shorts, 2, FieldType::Short, ByteOrder::LittleEndian),
            Some(vec![100, 200])
        );

        let longs = [0x00, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x07, 0xD0];
        assert_eq!(
            parse_u64_array(&longs, 2, FieldType::Long, ByteOrder::BigEndian),
            Some(vec![1000, 2000])
        );

        let long8 = [0, 0, 0, 0, 1, 0, 0, 0];
        assert_eq!(
            parse_u64_array(&long8, 1, FieldType::Long8, ByteOrder::LittleEndian),
            Some(vec![1 << 32])
        );
    }

    #[test]
    fn test_parse_u64_array_rejects_short_buffer_and_floats() {
        assert_eq!(
            parse_u64_array(&[1, 0], 2, FieldType::Short, ByteOrder::LittleEndian),
            None
        );
        assert_eq!(
            parse_u64_array(&[0; 8], 2, FieldType::Float, ByteOrder::LittleEndian),
            None
        );
    }

    #[tokio::test]
    async fn test_read_strip_offsets_from_file() {
        let mut data = vec![0u8; 64];
        for (i, v) in [1000u32, 2000, 3000].iter().enumerate() {
            data[40 + i * 4..44 + i * 4].copy_from_slice(&v.to_le_bytes());
        }
        let reader = MemoryReader::new(data, "mem://offsets");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let offsets = entry(273, FieldType::Long, 3, 40u32.to_le_bytes(), false);
        assert_eq!(values.read_u64_array(&offsets).await.unwrap(), vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_read_inline_bits_per_sample() {
        let reader = MemoryReader::new(vec![0u8; 16], "mem://bps");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let bps = entry(258, FieldType::Short, 2, [16, 0, 16, 0], true);
        assert_eq!(values.read_u16_array(&bps).await.unwrap(), vec![16, 16]);
    }

    #[tokio::test]
    async fn test_read_rational_resolution() {
        let mut data = vec![0u8; 32];
        data[16..20].copy_from_slice(&30000u32.to_le_bytes());
        data[20..24].copy_from_slice(&10u32.to_le_bytes());
        let reader = MemoryReader::new(data, "mem://res");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let res = entry(282, FieldType::Rational, 1, 16u32.to_le_bytes(), false);
        assert_eq!(values.read_f64(&res).await.unwrap(), 3000.0);
    }

    #[tokio::test]
    async fn test_read_description_string() {
        let mut data = vec![0u8; 64];
        let desc = b"ImageJ=1.53t\nimages=4\0";
        data[20..20 + desc.len()].copy_from_slice(desc);
        let reader = MemoryReader::new(data, "mem://desc");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let e = entry(270, FieldType::Ascii, desc.len() as u64, 20u32.to_le_bytes(), false);
        assert_eq!(values.read_string(&e).await.unwrap(), "ImageJ=1.53t\nimages=4");
    }

    #[tokio::test]
    async fn test_truncated_value_is_io_error() {
        let reader = MemoryReader::new(vec![0u8; 10], "mem://short");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let offsets = entry(273, FieldType::Long, 8, 4u32.to_le_bytes(), false);
        let result = values.read_u64_array(&offsets).await;
        assert!(matches!(result, Err(TiffError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_field_type() {
        let reader = MemoryReader::new(vec![0u8; 10], "mem://x");
        let header = le_header();
        let values = ValueReader::new(&reader, &header);

        let e = IfdEntry {
            tag_id: 256,
            field_type: None,
            field_type_raw: 99,
            count: 1,
            value_offset_bytes: vec![0; 4],
            is_inline: false,
        };
        assert!(matches!(
            values.read_bytes(&e).await,
            Err(TiffError::UnknownFieldType(99))
        ));
    }
}
