//! Nikon ND2 backend (modern chunked layout).
//!
//! # File Structure
//!
//! ```text
//! chunk := u32 0x0ABECEDA | u32 name length | u64 data length | name | data
//! tail  := "ND2 CHUNK MAP SIGNATURE 0000001!" | u64 chunk map offset
//! ```
//!
//! The chunk map lists every chunk as `name!` followed by its offset and
//! size. Image attributes, the experiment loops, calibration and per-plane
//! metadata are CLX-Lite variant trees. Frames are `ImageDataSeq|N!` chunks
//! holding an 8-byte timestamp followed by row-padded interleaved pixels.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use tracing::{debug, info, warn};

use crate::error::FormatError;
use crate::io::{read_u32_le, read_u64_le, RangeReader};
use crate::metadata::{AxisMapping, NativeChannel, NativeMetadata, Nd2Native, PixelType, SceneInfo};

use super::backend::OpenOptions;
use super::layout::{ChunkRequest, NativeLayout};
use super::pixels::{crop_window, deinterleave, to_native_endian};

pub const ND2_CHUNK_MAGIC: u32 = 0x0ABE_CEDA;
pub const JP2_SIGNATURE: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
];
const CHUNK_MAP_SIGNATURE: &[u8; 32] = b"ND2 CHUNK MAP SIGNATURE 0000001!";
const CHUNK_HEADER_SIZE: usize = 16;
const FRAME_TIMESTAMP_SIZE: usize = 8;

const ATTRIBUTES_CHUNK: &str = "ImageAttributesLV!";
const EXPERIMENT_CHUNK: &str = "ImageMetadataLV!";
const CALIBRATION_CHUNK: &str = "ImageCalibrationLV|0!";
const PLANE_METADATA_CHUNK: &str = "ImageMetadataSeqLV|0!";

/// Experiment loop types.
const LOOP_TIME: u64 = 1;
const LOOP_XY: u64 = 2;
const LOOP_Z: u64 = 4;
const LOOP_NE_TIME: u64 = 8;

/// Julian day of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JDN: f64 = 2_440_587.5;

// =============================================================================
// CLX-Lite variant
// =============================================================================

/// A decoded CLX-Lite value.
#[derive(Debug, Clone, PartialEq)]
pub enum ClxValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Level(Vec<(String, ClxValue)>),
}

impl ClxValue {
    pub fn get(&self, name: &str) -> Option<&ClxValue> {
        match self {
            ClxValue::Level(items) => items.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Follow a `/`-separated path of item names.
    pub fn find(&self, path: &str) -> Option<&ClxValue> {
        path.split('/').try_fold(self, |node, part| node.get(part))
    }

    /// Child values of a level, in order.
    pub fn items(&self) -> &[(String, ClxValue)] {
        match self {
            ClxValue::Level(items) => items,
            _ => &[],
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            ClxValue::Uint(v) => Some(v),
            ClxValue::Int(v) => u64::try_from(v).ok(),
            ClxValue::Bool(v) => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ClxValue::Double(v) => Some(v),
            ClxValue::Uint(v) => Some(v as f64),
            ClxValue::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ClxValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// First value named `name` anywhere below this one, depth first.
    pub fn find_descendant(&self, name: &str) -> Option<&ClxValue> {
        self.items().iter().find_map(|(n, v)| {
            if n == name {
                Some(v)
            } else {
                v.find_descendant(name)
            }
        })
    }
}

struct ClxCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClxCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| FormatError::corrupt("CLX-Lite value runs past its chunk"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(read_u32_le(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, FormatError> {
        Ok(read_u64_le(self.take(8)?))
    }

    fn utf16_units(&mut self, units: usize) -> Result<String, FormatError> {
        let raw = self.take(units * 2)?;
        let text: Vec<u16> = raw
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Ok(String::from_utf16_lossy(&text))
    }

    fn utf16_until_nul(&mut self) -> Result<String, FormatError> {
        let mut units = Vec::new();
        loop {
            let pair = self.take(2)?;
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0 {
                return Ok(String::from_utf16_lossy(&units));
            }
            units.push(unit);
        }
    }
}

/// Decode a CLX-Lite buffer into one level holding its top-level items.
pub fn parse_clx(data: &[u8]) -> Result<ClxValue, FormatError> {
    let mut cursor = ClxCursor { data, pos: 0 };
    parse_items(&mut cursor, None).map(ClxValue::Level)
}

fn parse_items(
    cursor: &mut ClxCursor<'_>,
    count: Option<usize>,
) -> Result<Vec<(String, ClxValue)>, FormatError> {
    let mut items = Vec::new();
    while count.map_or(cursor.pos < cursor.data.len(), |n| items.len() < n) {
        let start = cursor.pos;
        let kind = cursor.u8()?;
        let name_units = cursor.u8()? as usize;
        let name = cursor.utf16_units(name_units)?;

        let value = match kind {
            1 => ClxValue::Bool(cursor.u8()? != 0),
            2 => ClxValue::Int(cursor.u32()? as i32 as i64),
            3 => ClxValue::Uint(cursor.u32()? as u64),
            4 => ClxValue::Int(cursor.u64()? as i64),
            5 | 7 => ClxValue::Uint(cursor.u64()?),
            6 => ClxValue::Double(f64::from_bits(cursor.u64()?)),
            8 => ClxValue::String(cursor.utf16_until_nul()?),
            9 => {
                let len = cursor.u64()? as usize;
                ClxValue::Bytes(cursor.take(len)?.to_vec())
            }
            11 => {
                let item_count = cursor.u32()? as usize;
                let length = cursor.u64()? as usize;
                let end = start
                    .checked_add(length)
                    .filter(|&end| end >= cursor.pos && end <= cursor.data.len())
                    .ok_or_else(|| FormatError::corrupt("CLX-Lite level length out of range"))?;
                let mut nested = ClxCursor {
                    data: &cursor.data[..end],
                    pos: cursor.pos,
                };
                let children = parse_items(&mut nested, Some(item_count))?;
                // Skip the per-item offset table that follows the level.
                cursor.pos = end;
                cursor.take(item_count * 8)?;
                ClxValue::Level(children)
            }
            76 => {
                cursor.take(10)?;
                let mut inflated = Vec::new();
                ZlibDecoder::new(cursor.take(cursor.data.len() - cursor.pos)?)
                    .read_to_end(&mut inflated)
                    .map_err(|e| FormatError::Decode(format!("CLX-Lite deflate: {}", e)))?;
                parse_clx(&inflated)?
            }
            other => {
                return Err(FormatError::corrupt(format!(
                    "CLX-Lite value type {} for {}",
                    other, name
                )))
            }
        };
        items.push((name, value));
    }
    Ok(items)
}

// =============================================================================
// Backend
// =============================================================================

/// Attributes needed to locate pixels inside a frame.
#[derive(Debug, Clone, Copy)]
struct FrameGeometry {
    width: usize,
    height: usize,
    components: usize,
    bytes_per_sample: usize,
    row_bytes: usize,
}

pub struct Nd2Backend {
    reader: Arc<dyn RangeReader>,
    chunks: HashMap<String, (u64, u64)>,
    geometry: FrameGeometry,
    layout: NativeLayout,
    scene_count: usize,
    native: Nd2Native,
}

impl Nd2Backend {
    /// Read the chunk map and decode image attributes and experiment loops.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file is a legacy JPEG 2000 ND2
    /// - The chunk map signature or a chunk header is damaged
    /// - Loop sizes disagree with the number of stored frames
    /// - The pixel depth is not 8, 16 or 32 bits
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        let cached = options.metadata_reader(&reader);
        let size = reader.size();

        let head = cached.read_exact_at(0, JP2_SIGNATURE.len().min(size as usize)).await?;
        if head[..] == JP2_SIGNATURE {
            return Err(FormatError::unsupported_variant(
                "legacy JPEG 2000 ND2 files are not supported",
            ));
        }

        let chunks = read_chunk_map(&cached).await?;
        let chunk = |name: &str| chunks.get(name).copied();

        let attributes = match chunk(ATTRIBUTES_CHUNK) {
            Some(location) => parse_clx(&read_chunk_data(&cached, location).await?)?,
            None => return Err(FormatError::corrupt("ND2 has no image attributes")),
        };
        let attributes = attributes
            .get("SLxImageAttributes")
            .cloned()
            .unwrap_or(attributes);

        let attr = |name: &str| {
            attributes
                .get(name)
                .and_then(ClxValue::as_u64)
                .map(|v| v as usize)
        };
        let width = attr("uiWidth").unwrap_or(0);
        let height = attr("uiHeight").unwrap_or(0);
        let components = attr("uiComp").unwrap_or(1).max(1);
        let bits = attr("uiBpcInMemory").unwrap_or(0);
        let sequence_count = attr("uiSequenceCount").unwrap_or(0);
        let is_float = attr("ePixelType") == Some(3);
        if width == 0 || height == 0 || sequence_count == 0 {
            return Err(FormatError::corrupt("ND2 image attributes incomplete"));
        }

        let dtype = match (bits, is_float) {
            (8, false) => PixelType::Uint8,
            (16, false) => PixelType::Uint16,
            (32, false) => PixelType::Uint32,
            (32, true) => PixelType::Float32,
            _ => {
                return Err(FormatError::unsupported_variant(format!(
                    "ND2 with {} bits per component",
                    bits
                )))
            }
        };
        let bytes_per_sample = dtype.bytes_per_sample();
        let row_bytes = attr("uiWidthBytes")
            .filter(|&w| w > 0)
            .unwrap_or(width * components * bytes_per_sample);
        if row_bytes < width * components * bytes_per_sample {
            return Err(FormatError::corrupt(format!(
                "ND2 row stride {} shorter than a row",
                row_bytes
            )));
        }

        let experiment = match chunk(EXPERIMENT_CHUNK) {
            Some(location) => Some(parse_clx(&read_chunk_data(&cached, location).await?)?),
            None => None,
        };
        let loops = experiment
            .as_ref()
            .and_then(|e| e.get("SLxExperiment"))
            .map(collect_loops)
            .unwrap_or_default();

        let (plane_axes, z_step_um) = loop_axes(&loops, sequence_count)?;
        let scene_count = plane_axes
            .iter()
            .find(|&&(axis, _)| axis == 'S')
            .map(|&(_, n)| n)
            .unwrap_or(1);

        let calibration_um = match chunk(CALIBRATION_CHUNK) {
            Some(location) => parse_clx(&read_chunk_data(&cached, location).await?)?
                .find_descendant("dCalibration")
                .and_then(ClxValue::as_f64),
            None => None,
        };

        let (channels, acquisition_time) = match chunk(PLANE_METADATA_CHUNK) {
            Some(location) => {
                plane_metadata(&parse_clx(&read_chunk_data(&cached, location).await?)?)
            }
            None => (Vec::new(), None),
        };

        let scenes = (0..scene_count)
            .map(|index| SceneInfo {
                index,
                id: Some(format!("XYPos:{}", index)),
                name: None,
            })
            .collect();

        let layout = NativeLayout {
            scene: 0,
            plane_axes,
            size_y: height,
            size_x: width,
            samples_per_pixel: components,
            dtype,
            chunk_y: height,
            chunk_x: width,
        };

        info!(
            identifier = reader.identifier(),
            chunks = chunks.len(),
            order = %layout.dimension_order(),
            scenes = scene_count,
            "opened ND2"
        );

        Ok(Self {
            reader,
            chunks,
            geometry: FrameGeometry {
                width,
                height,
                components,
                bytes_per_sample,
                row_bytes,
            },
            layout,
            scene_count,
            native: Nd2Native {
                scenes,
                calibration_um,
                z_step_um,
                channels,
                acquisition_time,
            },
        })
    }

    pub fn scene_count(&self) -> usize {
        self.scene_count
    }

    fn check_scene(&self, scene: usize) -> Result<(), FormatError> {
        if scene < self.scene_count {
            Ok(())
        } else {
            Err(FormatError::corrupt(format!(
                "scene {} requested from an ND2 with {} positions",
                scene, self.scene_count
            )))
        }
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        self.check_scene(scene)?;
        Ok(NativeLayout {
            scene,
            ..self.layout.clone()
        })
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        self.check_scene(scene)?;
        Ok(NativeMetadata::Nd2(self.native.clone()))
    }

    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        self.check_scene(scene)?;
        let frame = mapping.plane_index(scene, request.t, request.c, request.z);
        let name = format!("ImageDataSeq|{}!", frame);
        let &(offset, _) = self
            .chunks
            .get(&name)
            .ok_or_else(|| FormatError::corrupt(format!("ND2 frame {} missing", name)))?;

        let g = self.geometry;
        let header = self.reader.read_exact_at(offset, CHUNK_HEADER_SIZE).await?;
        check_chunk_magic(&header, offset)?;
        let name_len = read_u32_le(&header[4..8]) as u64;
        let data_offset = offset + CHUNK_HEADER_SIZE as u64 + name_len;

        // Only the rows covering the request are fetched.
        let first_row = data_offset + FRAME_TIMESTAMP_SIZE as u64 + (request.y * g.row_bytes) as u64;
        let len = (request.height - 1) * g.row_bytes + g.width * g.components * g.bytes_per_sample;
        debug!(frame, rows = request.height, "reading ND2 frame");
        let data = self.reader.read_exact_at(first_row, len).await?;

        let pixel_bytes = g.components * g.bytes_per_sample;
        let row_pixels = g.row_bytes / pixel_bytes;
        let mut window = if g.row_bytes % pixel_bytes == 0 {
            crop_window(&data, row_pixels, pixel_bytes, 0, request.x, request.height, request.width)
        } else {
            let mut out = Vec::with_capacity(request.height * request.width * pixel_bytes);
            for row in 0..request.height {
                let start = row * g.row_bytes + request.x * pixel_bytes;
                out.extend_from_slice(&data[start..start + request.width * pixel_bytes]);
            }
            out
        };
        to_native_endian(&mut window, g.bytes_per_sample, true);

        if g.components == 1 {
            return Ok(Bytes::from(window));
        }
        Ok(Bytes::from(deinterleave(
            &window,
            request.height * request.width,
            g.components,
            g.bytes_per_sample,
            request.c,
            request.channels,
        )))
    }
}

fn check_chunk_magic(header: &[u8], offset: u64) -> Result<(), FormatError> {
    if read_u32_le(&header[0..4]) != ND2_CHUNK_MAGIC {
        return Err(FormatError::corrupt(format!(
            "ND2 chunk at offset {} has a bad magic",
            offset
        )));
    }
    Ok(())
}

/// Map of chunk name → (offset of the chunk header, size).
async fn read_chunk_map<R: RangeReader + ?Sized>(
    reader: &R,
) -> Result<HashMap<String, (u64, u64)>, FormatError> {
    let size = reader.size();
    let tail_len = CHUNK_MAP_SIGNATURE.len() as u64 + 8;
    if size < tail_len {
        return Err(FormatError::corrupt("ND2 file too short for a chunk map"));
    }
    let tail = reader.read_exact_at(size - tail_len, tail_len as usize).await?;
    if &tail[..32] != CHUNK_MAP_SIGNATURE {
        return Err(FormatError::corrupt("ND2 chunk map signature missing"));
    }
    let map_offset = read_u64_le(&tail[32..40]);
    let data = read_chunk_data(reader, (map_offset, 0)).await?;

    let mut chunks = HashMap::new();
    let mut pos = 0;
    while pos < data.len() {
        let Some(end) = data[pos..].iter().position(|&b| b == b'!') else {
            break;
        };
        let name = String::from_utf8_lossy(&data[pos..pos + end + 1]).into_owned();
        pos += end + 1;
        if name.as_bytes() == CHUNK_MAP_SIGNATURE {
            break;
        }
        if pos + 16 > data.len() {
            return Err(FormatError::corrupt("ND2 chunk map entry truncated"));
        }
        let offset = read_u64_le(&data[pos..pos + 8]);
        let len = read_u64_le(&data[pos + 8..pos + 16]);
        pos += 16;
        chunks.insert(name, (offset, len));
    }

    debug!(chunks = chunks.len(), "read ND2 chunk map");
    Ok(chunks)
}

async fn read_chunk_data<R: RangeReader + ?Sized>(
    reader: &R,
    (offset, _): (u64, u64),
) -> Result<Bytes, FormatError> {
    let header = reader.read_exact_at(offset, CHUNK_HEADER_SIZE).await?;
    check_chunk_magic(&header, offset)?;
    let name_len = read_u32_le(&header[4..8]) as u64;
    let data_len = read_u64_le(&header[8..16]);
    let start = offset + CHUNK_HEADER_SIZE as u64 + name_len;
    if start + data_len > reader.size() {
        return Err(FormatError::corrupt(format!(
            "ND2 chunk at offset {} runs past the end of the file",
            offset
        )));
    }
    Ok(reader.read_exact_at(start, data_len as usize).await?)
}

/// One experiment loop, outermost first.
#[derive(Debug, Clone, PartialEq)]
struct ExperimentLoop {
    kind: u64,
    count: usize,
    z_step: Option<f64>,
}

fn collect_loops(experiment: &ClxValue) -> Vec<ExperimentLoop> {
    let mut loops = Vec::new();
    let mut level = Some(experiment);
    while let Some(node) = level {
        let Some(kind) = node.get("uiLoopType").and_then(ClxValue::as_u64) else {
            break;
        };
        let pars = node.get("uLoopPars");
        let count = pars
            .and_then(|p| p.get("uiCount"))
            .and_then(ClxValue::as_u64)
            .unwrap_or(1) as usize;
        loops.push(ExperimentLoop {
            kind,
            count,
            z_step: pars.and_then(|p| p.get("dZStep")).and_then(ClxValue::as_f64),
        });
        level = node
            .get("ppNextLevelEx")
            .and_then(|next| next.items().first())
            .map(|(_, child)| child);
    }
    loops
}

fn loop_axes(
    loops: &[ExperimentLoop],
    sequence_count: usize,
) -> Result<(Vec<(char, usize)>, Option<f64>), FormatError> {
    let mut axes: Vec<(char, usize)> = Vec::new();
    let mut z_step = None;
    for lp in loops.iter().filter(|lp| lp.count > 1) {
        let axis = match lp.kind {
            LOOP_TIME | LOOP_NE_TIME => 'T',
            LOOP_XY => 'S',
            LOOP_Z => {
                z_step = lp.z_step.map(f64::abs);
                'Z'
            }
            other => {
                return Err(FormatError::unsupported_variant(format!(
                    "ND2 experiment loop type {}",
                    other
                )))
            }
        };
        if axes.iter().any(|&(a, _)| a == axis) {
            return Err(FormatError::unsupported_variant(format!(
                "ND2 with two {} loops",
                axis
            )));
        }
        axes.push((axis, lp.count));
    }

    let planned: usize = axes.iter().map(|&(_, n)| n).product();
    if axes.is_empty() && sequence_count > 1 {
        warn!(frames = sequence_count, "ND2 without loops, treating frames as time");
        axes.push(('T', sequence_count));
    } else if planned != sequence_count {
        return Err(FormatError::corrupt(format!(
            "ND2 loops describe {} frames, file holds {}",
            planned, sequence_count
        )));
    }
    Ok((axes, z_step))
}

/// Channel descriptions and start time from `SLxPictureMetadata`.
fn plane_metadata(metadata: &ClxValue) -> (Vec<NativeChannel>, Option<String>) {
    let picture = metadata.get("SLxPictureMetadata").unwrap_or(metadata);
    let channels = picture
        .find("sPicturePlanes/sPlaneNew")
        .or_else(|| picture.find("sPicturePlanes/sPlane"))
        .map(|planes| {
            planes
                .items()
                .iter()
                .map(|(_, plane)| NativeChannel {
                    name: plane
                        .get("sDescription")
                        .and_then(ClxValue::as_str)
                        .map(str::to_string),
                    color: plane
                        .get("uiColor")
                        .and_then(ClxValue::as_u64)
                        .map(|bgr| bgr_to_ome_color(bgr as u32).to_string()),
                    emission_wavelength: plane
                        .find_descendant("dEmissionWL")
                        .and_then(ClxValue::as_f64)
                        .filter(|w| *w > 0.0)
                        .map(|w| (w, "nm".to_string())),
                })
                .collect()
        })
        .unwrap_or_default();

    let acquisition_time = picture
        .get("dTimeAbsolute")
        .and_then(ClxValue::as_f64)
        .filter(|jdn| *jdn > UNIX_EPOCH_JDN)
        .map(julian_to_iso);
    (channels, acquisition_time)
}

/// `0x00BBGGRR` to OME's signed RGBA integer.
fn bgr_to_ome_color(bgr: u32) -> i32 {
    let (r, g, b) = (bgr & 0xFF, (bgr >> 8) & 0xFF, (bgr >> 16) & 0xFF);
    ((r << 24) | (g << 16) | (b << 8) | 0xFF) as i32
}

/// Julian day number to an ISO 8601 UTC timestamp.
fn julian_to_iso(jdn: f64) -> String {
    let seconds = ((jdn - UNIX_EPOCH_JDN) * 86_400.0).round() as i64;
    let days = seconds.div_euclid(86_400);
    let secs = seconds.rem_euclid(86_400);

    // Civil date from days since 1970-01-01.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        year,
        month,
        day,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}
