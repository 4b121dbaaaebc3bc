//! Zeiss CZI backend.
//!
//! # File Structure
//!
//! A CZI file is a sequence of segments, each with a 32-byte header
//! (16-byte ASCII id, allocated size, used size):
//!
//! - `ZISRAWFILE` at offset 0 holds the positions of the directory and the
//!   metadata segment
//! - `ZISRAWDIRECTORY` lists one entry per subblock with its pixel type,
//!   compression, pyramid type and dimension coordinates
//! - `ZISRAWSUBBLOCK` holds one stored plane (or tile) after a padded header
//! - `ZISRAWMETADATA` holds the `ImageDocument` XML
//!
//! Only uncompressed, full-resolution subblocks are read, and every plane
//! must be stored as a single subblock. Mosaics are rejected.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::FormatError;
use crate::io::{read_u32_le, read_u64_le, RangeReader};
use crate::metadata::{
    numbered_scenes, AxisMapping, CziNative, NativeChannel, NativeMetadata, PixelType, SceneInfo,
};

use super::backend::OpenOptions;
use super::layout::{ChunkRequest, NativeLayout};
use super::pixels::{crop_window, deinterleave, to_native_endian};
use super::xml::Element;

const SEGMENT_HEADER_SIZE: u64 = 32;
const FILE_DIRECTORY_POSITION: u64 = 84;
const FILE_METADATA_POSITION: u64 = 92;
const DIRECTORY_HEADER_SIZE: u64 = 128;
const ENTRY_FIXED_SIZE: usize = 32;
const DIMENSION_ENTRY_SIZE: usize = 20;
const SUBBLOCK_MIN_HEADER: u64 = 256;
const METADATA_HEADER_SIZE: u64 = 256;

/// Upper bound on directory entries accepted from a file.
const MAX_DIRECTORY_ENTRIES: usize = 1 << 22;

/// Dimensions that may only ever be 0 in readable files.
const UNSUPPORTED_DIMENSIONS: [&str; 6] = ["B", "H", "R", "I", "V", "A"];

// =============================================================================
// Directory
// =============================================================================

/// Pixel layout of a subblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CziPixelType {
    dtype: PixelType,
    samples: usize,
    bgr: bool,
}

impl CziPixelType {
    fn from_code(code: i32) -> Result<Self, FormatError> {
        let (dtype, samples, bgr) = match code {
            0 => (PixelType::Uint8, 1, false),
            1 => (PixelType::Uint16, 1, false),
            2 => (PixelType::Float32, 1, false),
            3 => (PixelType::Uint8, 3, true),
            4 => (PixelType::Uint16, 3, true),
            12 => (PixelType::Int32, 1, false),
            13 => (PixelType::Float64, 1, false),
            other => {
                return Err(FormatError::unsupported_variant(format!(
                    "CZI pixel type {}",
                    other
                )))
            }
        };
        Ok(Self {
            dtype,
            samples,
            bgr,
        })
    }
}

/// One directory entry, reduced to what reading needs.
#[derive(Debug, Clone)]
struct DirectoryEntry {
    pixel_type: i32,
    file_position: u64,
    compression: i32,
    pyramid_type: u8,
    entry_len: usize,

    /// Dimension id → (start, size, stored size)
    dims: HashMap<String, (i64, i64, i64)>,
}

impl DirectoryEntry {
    fn start(&self, dim: &str) -> i64 {
        self.dims.get(dim).map(|d| d.0).unwrap_or(0)
    }

    fn size(&self, dim: &str) -> i64 {
        self.dims.get(dim).map(|d| d.1).unwrap_or(1)
    }

    fn is_downsampled(&self) -> bool {
        self.pyramid_type != 0
            || ["X", "Y"]
                .iter()
                .any(|d| self.dims.get(*d).is_some_and(|(_, size, stored)| size != stored))
    }
}

fn parse_entry(bytes: &[u8]) -> Result<(DirectoryEntry, usize), FormatError> {
    if bytes.len() < ENTRY_FIXED_SIZE || &bytes[0..2] != b"DV" {
        return Err(FormatError::corrupt("CZI directory entry is not a DV entry"));
    }
    let dim_count = read_u32_le(&bytes[28..32]) as usize;
    let entry_len = ENTRY_FIXED_SIZE + dim_count * DIMENSION_ENTRY_SIZE;
    if bytes.len() < entry_len {
        return Err(FormatError::corrupt("CZI directory entry is truncated"));
    }

    let mut dims = HashMap::with_capacity(dim_count);
    for k in 0..dim_count {
        let d = &bytes[ENTRY_FIXED_SIZE + k * DIMENSION_ENTRY_SIZE..][..DIMENSION_ENTRY_SIZE];
        let name: String = d[0..4]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        let start = read_u32_le(&d[4..8]) as i32 as i64;
        let size = read_u32_le(&d[8..12]) as i32 as i64;
        let stored = read_u32_le(&d[16..20]) as i32 as i64;
        dims.insert(name, (start, size, stored));
    }

    Ok((
        DirectoryEntry {
            pixel_type: read_u32_le(&bytes[2..6]) as i32,
            file_position: read_u64_le(&bytes[6..14]),
            compression: read_u32_le(&bytes[18..22]) as i32,
            pyramid_type: bytes[22],
            entry_len,
            dims,
        },
        entry_len,
    ))
}

async fn read_segment_id<R: RangeReader + ?Sized>(
    reader: &R,
    position: u64,
    expected: &str,
) -> Result<(), FormatError> {
    let id = reader.read_exact_at(position, 16).await?;
    let name: String = id
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    if name != expected {
        return Err(FormatError::corrupt(format!(
            "expected {} segment at offset {}, found {:?}",
            expected, position, name
        )));
    }
    Ok(())
}

// =============================================================================
// CziBackend
// =============================================================================

#[derive(Debug, Clone)]
struct CziScene {
    layout: NativeLayout,
    pixel_type: CziPixelType,

    /// Subblock for each plane in `T C Z` row-major order
    planes: Vec<Option<DirectoryEntry>>,
}

pub struct CziBackend {
    reader: Arc<dyn RangeReader>,
    scenes: Vec<CziScene>,
    native: CziNative,
}

impl CziBackend {
    /// Parse the file header, subblock directory and metadata XML.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A segment id or directory entry is malformed
    /// - Subblocks are compressed or use an unsupported pixel type
    /// - The file is a mosaic, or uses dimensions beyond `S T C Z`
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        let cached = options.metadata_reader(&reader);

        read_segment_id(&cached, 0, "ZISRAWFILE").await?;
        let header = cached.read_exact_at(FILE_DIRECTORY_POSITION, 16).await?;
        let directory_position = read_u64_le(&header[0..8]);
        let metadata_at = (FILE_METADATA_POSITION - FILE_DIRECTORY_POSITION) as usize;
        let metadata_position = read_u64_le(&header[metadata_at..metadata_at + 8]);

        let entries = read_directory(&cached, directory_position).await?;
        let document = read_metadata(&cached, metadata_position).await?;

        let scene_ids: Vec<i64> = entries
            .iter()
            .map(|e| e.start("S"))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut scenes = Vec::with_capacity(scene_ids.len());
        for (index, &scene_id) in scene_ids.iter().enumerate() {
            let members: Vec<&DirectoryEntry> =
                entries.iter().filter(|e| e.start("S") == scene_id).collect();
            scenes.push(build_scene(index, &members)?);
        }

        if scenes.is_empty() {
            return Err(FormatError::corrupt("CZI directory lists no subblocks"));
        }

        let native = native_metadata(document.as_ref(), scenes.len());

        info!(
            identifier = reader.identifier(),
            subblocks = entries.len(),
            scenes = scenes.len(),
            "opened CZI"
        );

        Ok(Self {
            reader,
            scenes,
            native,
        })
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    fn scene(&self, scene: usize) -> Result<&CziScene, FormatError> {
        self.scenes.get(scene).ok_or_else(|| {
            FormatError::corrupt(format!(
                "scene {} requested from a CZI with {} scenes",
                scene,
                self.scenes.len()
            ))
        })
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        Ok(self.scene(scene)?.layout.clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        self.scene(scene)?;
        Ok(NativeMetadata::Czi(self.native.clone()))
    }

    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        let czi_scene = self.scene(scene)?;
        let plane = mapping.plane_index(scene, request.t, request.c, request.z);
        let entry = czi_scene
            .planes
            .get(plane)
            .and_then(|e| e.as_ref())
            .ok_or_else(|| {
                FormatError::corrupt(format!("no subblock stores plane {} of scene {}", plane, scene))
            })?;

        let layout = &czi_scene.layout;
        let pixel_type = czi_scene.pixel_type;
        let bps = pixel_type.dtype.bytes_per_sample();
        let pixel_bytes = bps * pixel_type.samples;
        let plane_bytes = layout.size_y * layout.size_x * pixel_bytes;

        let sizes = self.reader.read_exact_at(entry.file_position, 48).await?;
        if &sizes[0..14] != b"ZISRAWSUBBLOCK" {
            return Err(FormatError::corrupt(format!(
                "no subblock segment at offset {}",
                entry.file_position
            )));
        }
        let metadata_size = read_u32_le(&sizes[32..36]) as u64;
        let data_size = read_u64_le(&sizes[40..48]);
        if data_size < plane_bytes as u64 {
            return Err(FormatError::Decode(format!(
                "subblock at {} holds {} bytes, plane needs {}",
                entry.file_position, data_size, plane_bytes
            )));
        }

        let header_len = SUBBLOCK_MIN_HEADER.max(16 + entry.entry_len as u64);
        let data_offset = entry.file_position + SEGMENT_HEADER_SIZE + header_len + metadata_size;

        debug!(scene, plane, offset = data_offset, "reading CZI subblock");
        let data = self.reader.read_exact_at(data_offset, plane_bytes).await?;

        let mut window = crop_window(
            &data,
            layout.size_x,
            pixel_bytes,
            request.y,
            request.x,
            request.height,
            request.width,
        );
        to_native_endian(&mut window, bps, true);

        if pixel_type.samples == 1 {
            return Ok(Bytes::from(window));
        }

        // Stored BGR; canonical channel k is stored sample 2 - k.
        let pixels = request.height * request.width;
        let mut out = Vec::with_capacity(pixels * request.channels * bps);
        for k in request.c..request.c + request.channels {
            let stored = if pixel_type.bgr { 2 - k } else { k };
            out.extend(deinterleave(&window, pixels, pixel_type.samples, bps, stored, 1));
        }
        Ok(Bytes::from(out))
    }
}

async fn read_directory<R: RangeReader + ?Sized>(
    reader: &R,
    position: u64,
) -> Result<Vec<DirectoryEntry>, FormatError> {
    read_segment_id(reader, position, "ZISRAWDIRECTORY").await?;
    let header = reader.read_exact_at(position + 16, 16 + 4).await?;
    let allocated = read_u64_le(&header[0..8]);
    let used = match read_u64_le(&header[8..16]) {
        0 => allocated,
        used => used,
    };
    let count = read_u32_le(&header[16..20]) as usize;
    if count > MAX_DIRECTORY_ENTRIES {
        return Err(FormatError::corrupt(format!(
            "CZI directory claims {} entries",
            count
        )));
    }

    let start = position + SEGMENT_HEADER_SIZE + DIRECTORY_HEADER_SIZE;
    let available = reader.size().saturating_sub(start);
    let len = used.saturating_sub(DIRECTORY_HEADER_SIZE).min(available) as usize;
    let bytes = reader.read_exact_at(start, len).await?;

    let mut entries = Vec::with_capacity(count);
    let mut cursor = 0usize;
    for _ in 0..count {
        let (entry, len) = parse_entry(&bytes[cursor.min(bytes.len())..])?;
        cursor += len;
        entries.push(entry);
    }
    debug!(entries = entries.len(), "parsed CZI directory");
    Ok(entries)
}

async fn read_metadata<R: RangeReader + ?Sized>(
    reader: &R,
    position: u64,
) -> Result<Option<Element>, FormatError> {
    if position == 0 {
        return Ok(None);
    }
    read_segment_id(reader, position, "ZISRAWMETADATA").await?;
    let size_bytes = reader.read_exact_at(position + SEGMENT_HEADER_SIZE, 4).await?;
    let xml_size = read_u32_le(&size_bytes) as usize;
    let xml = reader
        .read_exact_at(position + SEGMENT_HEADER_SIZE + METADATA_HEADER_SIZE, xml_size)
        .await?;
    let text = String::from_utf8_lossy(&xml);
    Element::parse(text.trim_end_matches('\0')).map(Some)
}

fn build_scene(index: usize, members: &[&DirectoryEntry]) -> Result<CziScene, FormatError> {
    let full: Vec<&DirectoryEntry> = members
        .iter()
        .copied()
        .filter(|e| !e.is_downsampled())
        .collect();
    let first = full
        .first()
        .ok_or_else(|| FormatError::corrupt(format!("CZI scene {} has no full-resolution subblock", index)))?;

    for entry in &full {
        if entry.compression != 0 {
            return Err(FormatError::unsupported_variant(format!(
                "compressed CZI subblocks (mode {})",
                entry.compression
            )));
        }
        if entry.start("M") > 0 || entry.size("M") > 1 {
            return Err(FormatError::unsupported_variant("CZI mosaic"));
        }
        if let Some(dim) = UNSUPPORTED_DIMENSIONS.iter().find(|d| entry.start(d) > 0) {
            return Err(FormatError::unsupported_variant(format!(
                "CZI dimension {} beyond index 0",
                dim
            )));
        }
        if entry.pixel_type != first.pixel_type {
            return Err(FormatError::unsupported_variant("mixed CZI pixel types"));
        }
        if entry.size("X") != first.size("X") || entry.size("Y") != first.size("Y") {
            return Err(FormatError::unsupported_variant(
                "CZI subblocks of different extents in one scene",
            ));
        }
    }

    let pixel_type = CziPixelType::from_code(first.pixel_type)?;
    let range = |dim: &str| {
        let lo = full.iter().map(|e| e.start(dim)).min().unwrap_or(0);
        let hi = full.iter().map(|e| e.start(dim)).max().unwrap_or(0);
        (lo, (hi - lo + 1) as usize)
    };
    let (t0, nt) = range("T");
    let (c0, nc) = range("C");
    let (z0, nz) = range("Z");

    let mut planes = vec![None; nt * nc * nz];
    for entry in &full {
        let t = (entry.start("T") - t0) as usize;
        let c = (entry.start("C") - c0) as usize;
        let z = (entry.start("Z") - z0) as usize;
        let slot = &mut planes[(t * nc + c) * nz + z];
        if slot.is_some() {
            return Err(FormatError::unsupported_variant(format!(
                "several CZI subblocks for T={} C={} Z={}",
                t, c, z
            )));
        }
        *slot = Some((*entry).clone());
    }

    let size_x = first.size("X").max(0) as usize;
    let size_y = first.size("Y").max(0) as usize;

    Ok(CziScene {
        layout: NativeLayout {
            scene: index,
            plane_axes: vec![('T', nt), ('C', nc), ('Z', nz)],
            size_y,
            size_x,
            samples_per_pixel: pixel_type.samples,
            dtype: pixel_type.dtype,
            chunk_y: size_y,
            chunk_x: size_x,
        },
        pixel_type,
        planes,
    })
}

fn native_metadata(document: Option<&Element>, scene_count: usize) -> CziNative {
    let mut native = CziNative {
        scenes: numbered_scenes(scene_count),
        scaling_m: [None, None, None],
        channels: Vec::new(),
        acquisition_time: None,
    };
    let Some(root) = document else {
        return native;
    };
    let Some(meta) = root.child("Metadata") else {
        return native;
    };

    if let Some(items) = meta.find("Scaling/Items") {
        for distance in items.children_named("Distance") {
            let value = distance.find_text("Value").and_then(|v| v.parse::<f64>().ok());
            match distance.attr("Id") {
                Some("Z") => native.scaling_m[0] = value,
                Some("Y") => native.scaling_m[1] = value,
                Some("X") => native.scaling_m[2] = value,
                _ => {}
            }
        }
    }

    let image = meta.find("Information/Image");
    native.acquisition_time = image
        .and_then(|i| i.find_text("AcquisitionDateAndTime"))
        .map(str::to_string);

    let info_channels: Vec<&Element> = image
        .and_then(|i| i.find("Dimensions/Channels"))
        .map(|c| c.children_named("Channel").collect())
        .unwrap_or_default();
    let display_channels: Vec<&Element> = meta
        .find("DisplaySetting/Channels")
        .map(|c| c.children_named("Channel").collect())
        .unwrap_or_default();

    let count = info_channels.len().max(display_channels.len());
    native.channels = (0..count)
        .map(|k| {
            let info = info_channels.get(k);
            let display = display_channels.get(k);
            NativeChannel {
                name: info
                    .and_then(|c| c.attr("Name"))
                    .or_else(|| display.and_then(|c| c.attr("Name")))
                    .map(str::to_string),
                color: display
                    .and_then(|c| c.find_text("Color"))
                    .or_else(|| info.and_then(|c| c.find_text("Color")))
                    .map(str::to_string),
                emission_wavelength: info
                    .and_then(|c| c.find_text("EmissionWavelength"))
                    .and_then(|w| w.parse::<f64>().ok())
                    .map(|w| (w, "nm".to_string())),
            }
        })
        .collect();

    let scene_names: Vec<&Element> = image
        .and_then(|i| i.find("Dimensions/S/Scenes"))
        .map(|s| s.children_named("Scene").collect())
        .unwrap_or_default();
    if scene_names.len() == scene_count {
        native.scenes = scene_names
            .iter()
            .enumerate()
            .map(|(index, s)| SceneInfo {
                index,
                id: s.attr("Index").map(|i| format!("Scene:{}", i)),
                name: s.attr("Name").map(str::to_string),
            })
            .collect();
    }

    native
}
