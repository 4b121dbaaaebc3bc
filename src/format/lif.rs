//! Leica LIF backend.
//!
//! # File Structure
//!
//! ```text
//! u32 0x70 | u32 block length | u8 0x2A | u32 chars | UTF-16LE XML
//! then per memory block:
//! u32 0x70 | u32 length | u8 0x2A | u32/u64 size | u8 0x2A | u32 chars | UTF-16LE id | data
//! ```
//!
//! Memory block sizes are 32-bit in version 1 headers and 64-bit from
//! version 2 on. Every XML `Element` with an `Image` and a non-empty
//! `Memory` is a scene; its pixels are one compact memory block whose
//! axis strides come from `BytesInc`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::FormatError;
use crate::io::{read_u32_le, read_u64_le, RangeReader};
use crate::metadata::{AxisMapping, LifNative, NativeChannel, NativeMetadata, PixelType, SceneInfo};

use super::backend::OpenOptions;
use super::layout::{ChunkRequest, NativeLayout};
use super::pixels::{crop_window, deinterleave, to_native_endian};
use super::xml::Element;

const LIF_MAGIC: u32 = 0x70;
const LIF_MARKER: u8 = 0x2A;

/// Upper bound on the XML header length, in UTF-16 units.
const MAX_XML_CHARS: usize = 64 * 1024 * 1024;

/// LIF `DimID` values.
const DIM_X: u32 = 1;
const DIM_Y: u32 = 2;
const DIM_Z: u32 = 3;
const DIM_T: u32 = 4;

#[derive(Debug, Clone)]
struct LifScene {
    layout: NativeLayout,
    native: LifNative,
    data_offset: u64,
    plane_bytes: usize,
}

pub struct LifBackend {
    reader: Arc<dyn RangeReader>,
    scenes: Vec<LifScene>,
}

impl LifBackend {
    /// Parse the XML header, locate memory blocks and derive scene layouts.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A block header lacks its test value or marker bytes
    /// - An image uses dimensions other than X, Y, Z and T
    /// - Axis strides are not compact
    /// - An image's memory block is missing or too small
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        let cached = options.metadata_reader(&reader);

        let head = cached.read_exact_at(0, 13).await?;
        if read_u32_le(&head[0..4]) != LIF_MAGIC || head[8] != LIF_MARKER {
            return Err(FormatError::corrupt("LIF header test value missing"));
        }
        let chars = read_u32_le(&head[9..13]) as usize;
        if chars > MAX_XML_CHARS {
            return Err(FormatError::corrupt(format!("LIF XML header of {} chars", chars)));
        }
        let xml_bytes = cached.read_exact_at(13, chars * 2).await?;
        let root = Element::parse(&decode_utf16(&xml_bytes))?;
        let version: u32 = root.attr_parse("Version").unwrap_or(1);

        let blocks = read_memory_blocks(&cached, 13 + chars as u64 * 2, version).await?;

        let mut images = Vec::new();
        if let Some(element) = root.child("Element") {
            collect_images(element, "", &mut images);
        }

        let scene_infos: Vec<SceneInfo> = images
            .iter()
            .enumerate()
            .map(|(index, (path, _))| SceneInfo {
                index,
                id: Some(path.clone()),
                name: path.rsplit('/').next().map(str::to_string),
            })
            .collect();

        let mut scenes = Vec::with_capacity(images.len());
        for (index, (path, element)) in images.iter().enumerate() {
            let scene = build_scene(index, element, &blocks, &scene_infos)
                .map_err(|e| with_context(e, path))?;
            scenes.push(scene);
        }

        if scenes.is_empty() {
            return Err(FormatError::corrupt("LIF file contains no image"));
        }

        info!(
            identifier = reader.identifier(),
            version,
            blocks = blocks.len(),
            scenes = scenes.len(),
            "opened LIF"
        );

        Ok(Self { reader, scenes })
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    fn scene(&self, scene: usize) -> Result<&LifScene, FormatError> {
        self.scenes.get(scene).ok_or_else(|| {
            FormatError::corrupt(format!(
                "scene {} requested from a LIF with {} scenes",
                scene,
                self.scenes.len()
            ))
        })
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        Ok(self.scene(scene)?.layout.clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        Ok(NativeMetadata::Lif(self.scene(scene)?.native.clone()))
    }

    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        let lif_scene = self.scene(scene)?;
        let layout = &lif_scene.layout;
        let plane = mapping.plane_index(scene, request.t, request.c, request.z);
        let offset = lif_scene.data_offset + (plane * lif_scene.plane_bytes) as u64;

        debug!(scene, plane, offset, "reading LIF plane");
        let data = self
            .reader
            .read_exact_at(offset, lif_scene.plane_bytes)
            .await?;

        let bps = layout.dtype.bytes_per_sample();
        let samples = layout.samples_per_pixel;
        let mut window = crop_window(
            &data,
            layout.size_x,
            bps * samples,
            request.y,
            request.x,
            request.height,
            request.width,
        );
        to_native_endian(&mut window, bps, true);

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

fn with_context(err: FormatError, path: &str) -> FormatError {
    match err {
        FormatError::Corrupt { reason } => FormatError::corrupt(format!("{}: {}", path, reason)),
        FormatError::UnsupportedVariant { reason } => {
            FormatError::unsupported_variant(format!("{}: {}", path, reason))
        }
        other => other,
    }
}

fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Map of memory block id → (data offset, size).
async fn read_memory_blocks<R: RangeReader + ?Sized>(
    reader: &R,
    mut offset: u64,
    version: u32,
) -> Result<HashMap<String, (u64, u64)>, FormatError> {
    let size_len = if version >= 2 { 8 } else { 4 };
    let fixed = 9 + size_len + 1 + 4;
    let mut blocks = HashMap::new();

    while offset + fixed as u64 <= reader.size() {
        let head = reader.read_exact_at(offset, fixed).await?;
        if read_u32_le(&head[0..4]) != LIF_MAGIC
            || head[8] != LIF_MARKER
            || head[9 + size_len] != LIF_MARKER
        {
            return Err(FormatError::corrupt(format!(
                "LIF memory block at offset {} has no test value",
                offset
            )));
        }
        let size = if size_len == 8 {
            read_u64_le(&head[9..17])
        } else {
            read_u32_le(&head[9..13]) as u64
        };
        let id_chars = read_u32_le(&head[fixed - 4..fixed]) as usize;
        let id_bytes = reader
            .read_exact_at(offset + fixed as u64, id_chars * 2)
            .await?;
        let id = decode_utf16(&id_bytes);

        let data_offset = offset + fixed as u64 + id_chars as u64 * 2;
        if data_offset + size > reader.size() {
            return Err(FormatError::corrupt(format!(
                "LIF memory block {} runs past the end of the file",
                id
            )));
        }
        blocks.insert(id, (data_offset, size));
        offset = data_offset + size;
    }

    debug!(blocks = blocks.len(), "indexed LIF memory blocks");
    Ok(blocks)
}

/// Depth-first walk collecting `(path, element)` for image elements.
fn collect_images<'a>(element: &'a Element, parent: &str, out: &mut Vec<(String, &'a Element)>) {
    let name = element.attr("Name").unwrap_or("");
    let path = if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    };

    let has_image = element.find("Data/Image").is_some();
    let has_memory = element
        .child("Memory")
        .and_then(|m| m.attr_parse::<u64>("Size"))
        .is_some_and(|size| size > 0);
    if has_image && has_memory {
        out.push((path.clone(), element));
    }

    if let Some(children) = element.child("Children") {
        for child in children.children_named("Element") {
            collect_images(child, &path, out);
        }
    }
}

/// One strided axis of a memory block.
#[derive(Debug, Clone, Copy)]
struct StridedAxis {
    axis: char,
    size: usize,
    stride: u64,
}

fn build_scene(
    index: usize,
    element: &Element,
    blocks: &HashMap<String, (u64, u64)>,
    scene_infos: &[SceneInfo],
) -> Result<LifScene, FormatError> {
    let description = element
        .find("Data/Image/ImageDescription")
        .ok_or_else(|| FormatError::corrupt("image has no ImageDescription"))?;
    let channels: Vec<&Element> = description
        .find("Channels")
        .map(|c| c.children_named("ChannelDescription").collect())
        .unwrap_or_default();
    let first_channel = channels
        .first()
        .ok_or_else(|| FormatError::corrupt("image has no channels"))?;

    let resolution: u32 = first_channel.attr_parse("Resolution").unwrap_or(8);
    let data_type: u32 = first_channel.attr_parse("DataType").unwrap_or(0);
    let dtype = match (data_type, resolution) {
        (0, 1..=8) => PixelType::Uint8,
        (0, 9..=16) => PixelType::Uint16,
        (0, 17..=32) => PixelType::Uint32,
        (1, 32) => PixelType::Float32,
        _ => {
            return Err(FormatError::unsupported_variant(format!(
                "LIF data type {} with {} bits",
                data_type, resolution
            )))
        }
    };
    let bps = dtype.bytes_per_sample() as u64;

    let mut axes = Vec::new();
    let mut lengths: [Option<(f64, String, usize)>; 3] = [None, None, None];
    for dim in description
        .find("Dimensions")
        .map(|d| d.children_named("DimensionDescription").collect::<Vec<_>>())
        .unwrap_or_default()
    {
        let id: u32 = dim.attr_parse("DimID").unwrap_or(0);
        let size: usize = dim.attr_parse("NumberOfElements").unwrap_or(1);
        let stride: u64 = dim.attr_parse("BytesInc").unwrap_or(0);
        let axis = match id {
            DIM_X => 'X',
            DIM_Y => 'Y',
            DIM_Z => 'Z',
            DIM_T => 'T',
            other if size <= 1 => {
                debug!(dim = other, "ignoring singleton LIF dimension");
                continue;
            }
            other => {
                return Err(FormatError::unsupported_variant(format!(
                    "LIF dimension id {}",
                    other
                )))
            }
        };

        let length = dim
            .attr_parse::<f64>("Length")
            .map(|l| (l, dim.attr("Unit").unwrap_or("m").to_string(), size));
        match axis {
            'Z' => lengths[0] = length,
            'Y' => lengths[1] = length,
            'X' => lengths[2] = length,
            _ => {}
        }
        axes.push(StridedAxis { axis, size, stride });
    }

    let size_x = axes.iter().find(|a| a.axis == 'X').map(|a| a.size).unwrap_or(1);
    let size_y = axes.iter().find(|a| a.axis == 'Y').map(|a| a.size).unwrap_or(1);

    // Channels are either interleaved samples or a strided plane axis.
    let channel_stride = channels
        .get(1)
        .and_then(|c| c.attr_parse::<u64>("BytesInc"))
        .unwrap_or(0)
        .saturating_sub(first_channel.attr_parse::<u64>("BytesInc").unwrap_or(0));
    let interleaved = channels.len() > 1 && channel_stride == bps;
    let samples = if interleaved { channels.len() } else { 1 };
    if channels.len() > 1 && !interleaved {
        axes.push(StridedAxis {
            axis: 'C',
            size: channels.len(),
            stride: channel_stride,
        });
    }

    // Singleton axes carry no stride information.
    axes.retain(|a| a.size > 1 || a.axis == 'X' || a.axis == 'Y');
    axes.sort_by_key(|a| a.stride);

    let pixel_bytes = bps * samples as u64;
    let mut expected = pixel_bytes;
    for (position, axis) in axes.iter().enumerate() {
        let required = match position {
            0 => 'X',
            1 => 'Y',
            _ => axis.axis,
        };
        let stride = if axis.stride == 0 && axis.size <= 1 {
            expected
        } else {
            axis.stride
        };
        if axis.axis != required || stride != expected {
            return Err(FormatError::unsupported_variant(format!(
                "non-compact LIF layout: {} has stride {}, expected {}",
                axis.axis, axis.stride, expected
            )));
        }
        expected *= axis.size as u64;
    }

    let plane_axes: Vec<(char, usize)> = axes
        .iter()
        .skip(2)
        .rev()
        .map(|a| (a.axis, a.size))
        .collect();
    let plane_count: usize = plane_axes.iter().map(|&(_, n)| n).product();
    let plane_bytes = size_x * size_y * pixel_bytes as usize;

    let block_id = element
        .child("Memory")
        .and_then(|m| m.attr("MemoryBlockID"))
        .ok_or_else(|| FormatError::corrupt("image has no MemoryBlockID"))?;
    let &(data_offset, block_size) = blocks
        .get(block_id)
        .ok_or_else(|| FormatError::corrupt(format!("memory block {} not found", block_id)))?;
    if block_size < (plane_bytes * plane_count) as u64 {
        return Err(FormatError::corrupt(format!(
            "memory block {} holds {} bytes, image needs {}",
            block_id,
            block_size,
            plane_bytes * plane_count
        )));
    }

    let native = LifNative {
        scenes: scene_infos.to_vec(),
        lengths,
        channels: channels
            .iter()
            .map(|c| NativeChannel {
                name: None,
                color: c.attr("LUTName").map(str::to_string),
                emission_wavelength: None,
            })
            .collect(),
    };

    Ok(LifScene {
        layout: NativeLayout {
            scene: index,
            plane_axes,
            size_y,
            size_x,
            samples_per_pixel: samples,
            dtype,
            chunk_y: size_y,
            chunk_x: size_x,
        },
        native,
        data_offset,
        plane_bytes,
    })
}
