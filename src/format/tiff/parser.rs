//! TIFF header and IFD parsing.
//!
//! This module handles parsing of TIFF and BigTIFF file headers and the
//! Image File Directories that follow them.
//!
//! # TIFF Header Structure
//!
//! ## Classic TIFF (8 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! ## BigTIFF (16 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (43 = 0x002B)
//! Bytes 4-5: Offset byte size (must be 8)
//! Bytes 6-7: Reserved (must be 0)
//! Bytes 8-15: Offset to first IFD (8 bytes)
//! ```

use std::collections::HashMap;

use crate::error::TiffError;
use crate::io::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le};

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
const VERSION_TIFF: u16 = 42;

/// Version number for BigTIFF
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file must be read respecting this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    /// Read a u64 from a byte slice using this byte order.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }

    #[inline]
    pub fn read_i16(self, bytes: &[u8]) -> i16 {
        self.read_u16(bytes) as i16
    }

    #[inline]
    pub fn read_i32(self, bytes: &[u8]) -> i32 {
        self.read_u32(bytes) as i32
    }

    #[inline]
    pub fn read_f32(self, bytes: &[u8]) -> f32 {
        f32::from_bits(self.read_u32(bytes))
    }

    #[inline]
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        f64::from_bits(self.read_u64(bytes))
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
///
/// Contains the essential information needed to begin parsing IFDs:
/// - Byte order for reading all subsequent values
/// - Whether this is classic TIFF or BigTIFF (affects entry sizes and offset widths)
/// - Location of the first IFD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Whether this is a BigTIFF file (64-bit offsets)
    pub is_bigtiff: bool,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// The input must contain at least 8 bytes for classic TIFF or 16 bytes for BigTIFF.
    /// The function first reads enough to determine the format, then validates the rest.
    ///
    /// # Arguments
    /// * `bytes` - Raw header bytes (at least 8 bytes, preferably 16 for BigTIFF support)
    /// * `file_size` - Total file size (used to validate IFD offset)
    ///
    /// # Errors
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42 or 43
    /// - `InvalidBigTiffOffsetSize` if BigTIFF offset size is not 8
    /// - `FileTooSmall` if there aren't enough bytes for the header
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        // Need at least 8 bytes to read the basic header
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // Read byte order (bytes 0-1)
        // We read this as little-endian because we're checking for specific byte patterns
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        // Read version (bytes 2-3) using the detected byte order
        let version = byte_order.read_u16(&bytes[2..4]);

        match version {
            VERSION_TIFF => {
                // Classic TIFF: 4-byte offset at bytes 4-7
                let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;

                // Validate offset
                if first_ifd_offset >= file_size {
                    return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: false,
                    first_ifd_offset,
                })
            }
            VERSION_BIGTIFF => {
                // BigTIFF: need 16 bytes total
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }

                // Bytes 4-5: offset byte size (must be 8)
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }

                // Bytes 6-7: reserved (should be 0, but we don't strictly require it)

                // Bytes 8-15: first IFD offset (8 bytes)
                let first_ifd_offset = byte_order.read_u64(&bytes[8..16]);

                // Validate offset
                if first_ifd_offset >= file_size {
                    return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: true,
                    first_ifd_offset,
                })
            }
            _ => Err(TiffError::InvalidVersion(version)),
        }
    }

    /// Size of an IFD entry in bytes.
    ///
    /// Classic TIFF: 12 bytes (2 tag + 2 type + 4 count + 4 value/offset)
    /// BigTIFF: 20 bytes (2 tag + 2 type + 8 count + 8 value/offset)
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Size of the entry count field at the start of an IFD.
    ///
    /// Classic TIFF: 2 bytes (u16)
    /// BigTIFF: 8 bytes (u64)
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Size of the next IFD offset field at the end of an IFD.
    ///
    /// Classic TIFF: 4 bytes (u32)
    /// BigTIFF: 8 bytes (u64)
    #[inline]
    pub const fn ifd_next_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }

    /// Size of the value/offset field in an IFD entry.
    ///
    /// This determines the inline value threshold:
    /// Classic TIFF: 4 bytes
    /// BigTIFF: 8 bytes
    #[inline]
    pub const fn value_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single 12-byte (TIFF) or 20-byte (BigTIFF) IFD entry.
///
/// The value/offset field is kept raw; whether it holds the value itself or
/// a pointer to it depends on the field type and count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    pub tag_id: u16,

    /// Parsed field type, `None` if the type code is unknown
    pub field_type: Option<FieldType>,

    pub field_type_raw: u16,

    pub count: u64,

    /// Raw value/offset bytes (4 for TIFF, 8 for BigTIFF)
    pub value_offset_bytes: Vec<u8>,

    /// Whether the value is stored in `value_offset_bytes`
    pub is_inline: bool,
}

impl IfdEntry {
    /// Total size of the value in bytes, `None` for unknown field types.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|t| t.size_in_bytes() as u64)
            .and_then(|size| size.checked_mul(self.count))
    }

    /// Interpret the value/offset field as an offset into the file.
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        if self.value_offset_bytes.len() >= 8 {
            byte_order.read_u64(&self.value_offset_bytes)
        } else {
            byte_order.read_u32(&self.value_offset_bytes) as u64
        }
    }

    /// Read a single inline Short or Long value.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u32),
            FieldType::Long | FieldType::Ifd => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }

    /// Read a single inline Short, Long or Long8 value.
    pub fn inline_u64(&self, byte_order: ByteOrder) -> Option<u64> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Long8 | FieldType::Ifd8 => {
                Some(byte_order.read_u64(&self.value_offset_bytes))
            }
            _ => self.inline_u32(byte_order).map(u64::from),
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, Default)]
pub struct Ifd {
    pub entries: Vec<IfdEntry>,

    /// Index into `entries` by tag ID
    entries_by_tag: HashMap<u16, usize>,

    /// Offset of the next IFD in the chain (0 = last)
    pub next_ifd_offset: u64,
}

impl Ifd {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bytes occupied by an IFD with `entry_count` entries, including the
    /// count field and the trailing next-IFD offset.
    pub fn calculate_size(entry_count: u64, header: &TiffHeader) -> usize {
        header.ifd_count_size()
            + entry_count as usize * header.ifd_entry_size()
            + header.ifd_next_offset_size()
    }

    /// Parse an IFD from bytes starting at its entry count.
    pub fn parse(bytes: &[u8], header: &TiffHeader) -> Result<Self, TiffError> {
        let byte_order = header.byte_order;
        let count_size = header.ifd_count_size();

        if bytes.len() < count_size {
            return Err(TiffError::FileTooSmall {
                required: count_size as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_count = if header.is_bigtiff {
            byte_order.read_u64(bytes)
        } else {
            byte_order.read_u16(bytes) as u64
        };

        let required = Self::calculate_size(entry_count, header);
        if bytes.len() < required {
            return Err(TiffError::FileTooSmall {
                required: required as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_size = header.ifd_entry_size();
        let value_size = header.value_offset_size();
        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut entries_by_tag = HashMap::with_capacity(entry_count as usize);

        for i in 0..entry_count as usize {
            let start = count_size + i * entry_size;
            let raw = &bytes[start..start + entry_size];

            let tag_id = byte_order.read_u16(&raw[0..2]);
            let field_type_raw = byte_order.read_u16(&raw[2..4]);
            let (count, value_start) = if header.is_bigtiff {
                (byte_order.read_u64(&raw[4..12]), 12)
            } else {
                (byte_order.read_u32(&raw[4..8]) as u64, 8)
            };
            let value_offset_bytes = raw[value_start..value_start + value_size].to_vec();

            let field_type = FieldType::from_u16(field_type_raw);
            let is_inline = field_type
                .map(|t| t.fits_inline(count, header.is_bigtiff))
                .unwrap_or(false);

            entries_by_tag.entry(tag_id).or_insert(entries.len());
            entries.push(IfdEntry {
                tag_id,
                field_type,
                field_type_raw,
                count,
                value_offset_bytes,
                is_inline,
            });
        }

        let next_start = count_size + entry_count as usize * entry_size;
        let next_ifd_offset = if header.is_bigtiff {
            byte_order.read_u64(&bytes[next_start..])
        } else {
            byte_order.read_u32(&bytes[next_start..]) as u64
        };

        Ok(Ifd {
            entries,
            entries_by_tag,
            next_ifd_offset,
        })
    }

    pub fn get_entry(&self, tag_id: u16) -> Option<&IfdEntry> {
        self.entries_by_tag.get(&tag_id).map(|&i| &self.entries[i])
    }

    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.get_entry(tag.as_u16())
    }

    /// Inline scalar value of a tag, if present and inline.
    pub fn get_u32(&self, tag: TiffTag, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(tag)?.inline_u32(byte_order)
    }

    pub fn image_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_u32(TiffTag::ImageWidth, byte_order)
    }

    pub fn image_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_u32(TiffTag::ImageLength, byte_order)
    }

    pub fn tile_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_u32(TiffTag::TileWidth, byte_order)
    }

    pub fn tile_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_u32(TiffTag::TileLength, byte_order)
    }

    pub fn compression(&self, byte_order: ByteOrder) -> Option<u16> {
        self.get_u32(TiffTag::Compression, byte_order)
            .map(|v| v as u16)
    }

    pub fn is_tiled(&self) -> bool {
        self.get_entry_by_tag(TiffTag::TileWidth).is_some()
            && self.get_entry_by_tag(TiffTag::TileOffsets).is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // ByteOrder Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_byte_order_read_u16() {
        let bytes = [0x01, 0x02];
        assert_eq!(ByteOrder::LittleEndian.read_u16(&bytes), 0x0201);
        assert_eq!(ByteOrder::BigEndian.read_u16(&bytes), 0x0102);
    }

    #[test]
    fn test_byte_order_read_u32() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(ByteOrder::LittleEndian.read_u32(&bytes), 0x04030201);
        assert_eq!(ByteOrder::BigEndian.read_u32(&bytes), 0x01020304);
    }

    #[test]
    fn test_byte_order_read_u64() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(
            ByteOrder::LittleEndian.read_u64(&bytes),
            0x0807060504030201
        );
        assert_eq!(ByteOrder::BigEndian.read_u64(&bytes), 0x0102030405060708);
    }

    // -------------------------------------------------------------------------
    // TiffHeader Parsing Tests - Classic TIFF
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_tiff_little_endian() {
        // Little-endian TIFF with first IFD at offset 8
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2A, 0x00, // Version 42 (little-endian)
            0x08, 0x00, 0x00, 0x00, // First IFD offset = 8 (little-endian)
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::LittleEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_tiff_big_endian() {
        // Big-endian TIFF with first IFD at offset 8
        let header = [
            0x4D, 0x4D, // MM (big-endian)
            0x00, 0x2A, // Version 42 (big-endian)
            0x00, 0x00, 0x00, 0x08, // First IFD offset = 8 (big-endian)
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::BigEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_tiff_larger_offset() {
        // Little-endian TIFF with first IFD at offset 1000
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2A, 0x00, // Version 42
            0xE8, 0x03, 0x00, 0x00, // First IFD offset = 1000 (little-endian)
        ];

        let result = TiffHeader::parse(&header, 2000).unwrap();
        assert_eq!(result.first_ifd_offset, 1000);
    }

    // -------------------------------------------------------------------------
    // TiffHeader Parsing Tests - BigTIFF
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_bigtiff_little_endian() {
        // Little-endian BigTIFF with first IFD at offset 16
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x08, 0x00, // Offset size = 8
            0x00, 0x00, // Reserved
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // First IFD offset = 16
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::LittleEndian);
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 16);
    }

    #[test]
    fn test_parse_bigtiff_big_endian() {
        // Big-endian BigTIFF with first IFD at offset 16
        let header = [
            0x4D, 0x4D, // MM (big-endian)
            0x00, 0x2B, // Version 43 (BigTIFF)
            0x00, 0x08, // Offset size = 8
            0x00, 0x00, // Reserved
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, // First IFD offset = 16
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::BigEndian);
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 16);
    }

    #[test]
    fn test_parse_bigtiff_large_offset() {
        // BigTIFF with 64-bit offset beyond 4GB
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x08, 0x00, // Offset size = 8
            0x00, 0x00, // Reserved
            0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, // First IFD offset = 4GB
        ];

        let result = TiffHeader::parse(&header, 10_000_000_000).unwrap();
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 0x0000_0001_0000_0000); // 4GB
    }

    // -------------------------------------------------------------------------
    // TiffHeader Parsing Tests - Error Cases
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_invalid_magic() {
        let header = [
            0x00, 0x00, // Invalid magic
            0x2A, 0x00, 0x08, 0x00, 0x00, 0x00,
        ];

        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::InvalidMagic(0x0000))));
    }

    #[test]
    fn test_parse_invalid_version() {
        let header = [
            0x49, 0x49, // II
            0x00, 0x00, // Invalid version 0
            0x08, 0x00, 0x00, 0x00,
        ];

        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::InvalidVersion(0))));
    }

    #[test]
    fn test_parse_bigtiff_invalid_offset_size() {
        let header = [
            0x49, 0x49, // II
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x04, 0x00, // Invalid offset size = 4 (should be 8)
            0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(
            result,
            Err(TiffError::InvalidBigTiffOffsetSize(4))
        ));
    }

    #[test]
    fn test_parse_file_too_small_tiff() {
        let header = [0x49, 0x49, 0x2A, 0x00]; // Only 4 bytes

        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(
            result,
            Err(TiffError::FileTooSmall {
                required: 8,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_parse_file_too_small_bigtiff() {
        // Valid TIFF header but BigTIFF needs 16 bytes
        let header = [
            0x49, 0x49, // II
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x08, 0x00, // Offset size = 8
            0x00, 0x00, // Only 8 bytes total
        ];

        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(
            result,
            Err(TiffError::FileTooSmall {
                required: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_parse_invalid_ifd_offset() {
        // IFD offset beyond file size
        let header = [
            0x49, 0x49, // II
            0x2A, 0x00, // Version 42
            0xE8, 0x03, 0x00, 0x00, // First IFD offset = 1000
        ];

        let result = TiffHeader::parse(&header, 500); // File is only 500 bytes
        assert!(matches!(result, Err(TiffError::InvalidIfdOffset(1000))));
    }

    // -------------------------------------------------------------------------
    // TiffHeader Helper Methods Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ifd_entry_size() {
        let tiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        };
        assert_eq!(tiff.ifd_entry_size(), 12);

        let bigtiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: true,
            first_ifd_offset: 16,
        };
        assert_eq!(bigtiff.ifd_entry_size(), 20);
    }

    #[test]
    fn test_ifd_count_size() {
        let tiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        };
        assert_eq!(tiff.ifd_count_size(), 2);

        let bigtiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: true,
            first_ifd_offset: 16,
        };
        assert_eq!(bigtiff.ifd_count_size(), 8);
    }

    #[test]
    fn test_value_offset_size() {
        let tiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        };
        assert_eq!(tiff.value_offset_size(), 4);

        let bigtiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: true,
            first_ifd_offset: 16,
        };
        assert_eq!(bigtiff.value_offset_size(), 8);
    }

    // -------------------------------------------------------------------------
    // Ifd Parsing Tests
    // -------------------------------------------------------------------------

    fn le_header() -> TiffHeader {
        TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        }
    }

    fn classic_entry(tag: u16, ty: u16, count: u32, value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
        out
    }

    #[test]
    fn test_ifd_parse_classic() {
        let mut bytes = 3u16.to_le_bytes().to_vec();
        bytes.extend(classic_entry(256, 3, 1, 640));
        bytes.extend(classic_entry(257, 4, 1, 480));
        bytes.extend(classic_entry(273, 4, 4, 200));
        bytes.extend_from_slice(&500u32.to_le_bytes());

        let header = le_header();
        assert_eq!(Ifd::calculate_size(3, &header), bytes.len());

        let ifd = Ifd::parse(&bytes, &header).unwrap();
        assert_eq!(ifd.entries.len(), 3);
        assert_eq!(ifd.next_ifd_offset, 500);
        assert_eq!(ifd.image_width(ByteOrder::LittleEndian), Some(640));
        assert_eq!(ifd.image_height(ByteOrder::LittleEndian), Some(480));

        let offsets = ifd.get_entry_by_tag(TiffTag::StripOffsets).unwrap();
        assert!(!offsets.is_inline);
        assert_eq!(offsets.value_offset(ByteOrder::LittleEndian), 200);
        assert_eq!(offsets.value_byte_size(), Some(16));
        assert!(!ifd.is_tiled());
    }

    #[test]
    fn test_ifd_parse_bigtiff() {
        let header = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: true,
            first_ifd_offset: 16,
        };
        let mut bytes = 1u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&256u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&70_000u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());

        let ifd = Ifd::parse(&bytes, &header).unwrap();
        let entry = ifd.get_entry(256).unwrap();
        assert!(entry.is_inline);
        assert_eq!(entry.inline_u64(ByteOrder::LittleEndian), Some(70_000));
        assert_eq!(entry.inline_u32(ByteOrder::LittleEndian), None);
        assert_eq!(ifd.next_ifd_offset, 0);
    }

    #[test]
    fn test_ifd_parse_truncated() {
        let mut bytes = 2u16.to_le_bytes().to_vec();
        bytes.extend(classic_entry(256, 3, 1, 1));
        let result = Ifd::parse(&bytes, &le_header());
        assert!(matches!(result, Err(TiffError::FileTooSmall { .. })));
    }

    #[test]
    fn test_unknown_field_type_is_not_inline() {
        let mut bytes = 1u16.to_le_bytes().to_vec();
        bytes.extend(classic_entry(700, 99, 1, 0));
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let ifd = Ifd::parse(&bytes, &le_header()).unwrap();
        let entry = ifd.get_entry(700).unwrap();
        assert_eq!(entry.field_type, None);
        assert_eq!(entry.value_byte_size(), None);
        assert!(!entry.is_inline);
    }

    #[test]
    fn test_signed_and_float_reads() {
        let bytes = (-2i16).to_le_bytes();
        assert_eq!(ByteOrder::LittleEndian.read_i16(&bytes), -2);
        let bytes = 1.5f32.to_be_bytes();
        assert_eq!(ByteOrder::BigEndian.read_f32(&bytes), 1.5);
        let bytes = 0.25f64.to_le_bytes();
        assert_eq!(ByteOrder::LittleEndian.read_f64(&bytes), 0.25);
    }
}
