//! Format detection over a bounded byte prefix.
//!
//! Detection is a pure function of the first few kilobytes of a source plus
//! an optional file name hint. Predicates run in a fixed order, most
//! specific signature first:
//!
//! 1. **CZI**: `ZISRAWFILE` segment id at offset 0
//! 2. **LIF**: test value `0x70` then memory marker `0x2A` at offset 8
//! 3. **ND2**: chunk magic `0x0ABECEDA`, or a JPEG 2000 signature with an
//!    `.nd2` name (legacy files, rejected later on open)
//! 4. **TIFF / BigTIFF**: strict header check
//! 5. **DV**: Priism magic `0xC0A0` at byte 96 in either byte order
//! 6. **Legacy bridge**: extension match, only when a bridge is configured
//! 7. **Generic**: PNG or JPEG, when the fallback is enabled
//!
//! A recognised signature always wins over a contradicting extension.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

use super::dv::dv_byte_order;
use super::nd2::{JP2_SIGNATURE, ND2_CHUNK_MAGIC};
use super::tiff::{ByteOrder, TIFF_HEADER_SIZE};

// =============================================================================
// BackendTag
// =============================================================================

/// Which backend reads a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTag {
    Tiff,
    Czi,
    Lif,
    Nd2,
    Dv,
    Bridge,
    Generic,
}

impl BackendTag {
    pub const fn name(&self) -> &'static str {
        match self {
            BackendTag::Tiff => "TIFF",
            BackendTag::Czi => "CZI",
            BackendTag::Lif => "LIF",
            BackendTag::Nd2 => "ND2",
            BackendTag::Dv => "DV",
            BackendTag::Bridge => "legacy bridge",
            BackendTag::Generic => "generic image",
        }
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Extensions handed to the legacy bridge when one is configured.
pub const BRIDGE_EXTENSIONS: [&str; 9] = [
    "vsi", "ims", "oib", "oif", "oir", "zvi", "lei", "sld", "mvd2",
];

const CZI_MAGIC: &[u8] = b"ZISRAWFILE";
const LIF_TEST_VALUE: u32 = 0x70;
const LIF_MEMORY_MARKER: u8 = 0x2A;

/// Switches that make detection depend on configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectOptions {
    pub bridge_enabled: bool,
    pub generic_fallback: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            bridge_enabled: false,
            generic_fallback: true,
        }
    }
}

/// Pick a backend from the first bytes of a source.
pub fn detect(
    prefix: &[u8],
    path_hint: Option<&str>,
    options: DetectOptions,
) -> Result<BackendTag, FormatError> {
    let extension = path_hint.and_then(extension_of);

    if prefix.starts_with(CZI_MAGIC) {
        return Ok(BackendTag::Czi);
    }
    if is_lif_header(prefix) {
        return Ok(BackendTag::Lif);
    }
    if read_u32_le(prefix, 0) == Some(ND2_CHUNK_MAGIC) {
        return Ok(BackendTag::Nd2);
    }
    if prefix.starts_with(&JP2_SIGNATURE) && extension.as_deref() == Some("nd2") {
        return Ok(BackendTag::Nd2);
    }
    if is_tiff_header(prefix) {
        return Ok(BackendTag::Tiff);
    }
    if is_dv_header(prefix) {
        return Ok(BackendTag::Dv);
    }
    if options.bridge_enabled {
        if let Some(ext) = extension.as_deref() {
            if BRIDGE_EXTENSIONS.contains(&ext) {
                return Ok(BackendTag::Bridge);
            }
        }
    }
    if options.generic_fallback
        && matches!(
            image::guess_format(prefix),
            Ok(image::ImageFormat::Png | image::ImageFormat::Jpeg)
        )
    {
        return Ok(BackendTag::Generic);
    }

    Err(FormatError::UnsupportedFormat {
        reason: match extension {
            Some(ext) => format!("no backend recognises this .{} file", ext),
            None => "no backend recognises the file signature".to_string(),
        },
    })
}

fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit(['/', '\\']).next()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn is_lif_header(bytes: &[u8]) -> bool {
    read_u32_le(bytes, 0) == Some(LIF_TEST_VALUE) && bytes.get(8) == Some(&LIF_MEMORY_MARKER)
}

fn is_dv_header(bytes: &[u8]) -> bool {
    dv_byte_order(bytes).is_some()
}

/// Strict TIFF/BigTIFF header check.
///
/// Classic TIFF needs version 42 and a nonzero first IFD offset. BigTIFF
/// needs version 43, offset size 8, zero reserved bytes and a nonzero offset.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < TIFF_HEADER_SIZE {
        return false;
    }

    let byte_order = match &bytes[0..2] {
        b"II" => ByteOrder::LittleEndian,
        b"MM" => ByteOrder::BigEndian,
        _ => return false,
    };

    match byte_order.read_u16(&bytes[2..4]) {
        42 => byte_order.read_u32(&bytes[4..8]) != 0,
        43 => {
            bytes.len() >= 16
                && byte_order.read_u16(&bytes[4..6]) == 8
                && byte_order.read_u16(&bytes[6..8]) == 0
                && byte_order.read_u64(&bytes[8..16]) != 0
        }
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
