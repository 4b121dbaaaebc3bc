//! TIFF backend: OME-TIFF, ImageJ hyperstacks and plain TIFF stacks.
//!
//! The container is parsed once on open. The page 0 description decides
//! the dialect:
//!
//! - **OME-TIFF**: every OME `Image` is a scene; `TiffData` blocks place its
//!   planes on IFDs (sequentially when absent)
//! - **ImageJ**: one scene whose planes are stored `TZC`, channel fastest
//! - **Plain**: consecutive full-resolution pages of equal shape form a
//!   series; every series is a scene stacked along Z
//!
//! Reduced-resolution pages and SubIFD trees are never exposed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::FormatError;
use crate::io::RangeReader;
use crate::metadata::{numbered_scenes, AxisMapping, NativeMetadata, SceneInfo, TiffFlavor, TiffNative};

use super::backend::OpenOptions;
use super::layout::{ChunkRequest, NativeLayout};
use super::ome::{parse_ome, OmeImage};
use super::tiff::{ByteOrder, Compression, ImagePage, TiffFile, PLANAR_CHUNKY};

/// One scene: its layout, plane → page table and native metadata.
#[derive(Debug, Clone)]
struct TiffScene {
    layout: NativeLayout,

    /// Page index for every native plane; `None` when no IFD holds it
    planes: Vec<Option<usize>>,
    native: TiffNative,
}

/// Reader for every TIFF dialect.
pub struct TiffBackend {
    reader: Arc<dyn RangeReader>,
    byte_order: ByteOrder,
    flavor: TiffFlavor,
    pages: Vec<ImagePage>,
    scenes: Vec<TiffScene>,
}

impl TiffBackend {
    /// Parse the IFD chain and resolve scenes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The IFD chain is damaged, cyclic or truncated
    /// - A page uses an unsupported compression or sample layout
    /// - OME `TiffData` points at IFDs that do not exist or disagree in shape
    /// - Planes are spread over several files
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        let cached = options.metadata_reader(&reader);
        let file = TiffFile::parse(&cached).await?;
        let byte_order = file.byte_order();
        let mut pages = file.pages;

        let description = pages.first().and_then(|p| p.description.clone());
        let (flavor, mut scenes) = match description.as_deref() {
            Some(text) if is_ome_description(text) => match parse_ome(text) {
                Ok(images) => {
                    let own_name = file_name_of(reader.identifier());
                    (TiffFlavor::Ome, ome_scenes(&images, &pages, own_name)?)
                }
                Err(e) => {
                    warn!(
                        identifier = reader.identifier(),
                        error = %e,
                        "unreadable OME-XML, reading as plain TIFF"
                    );
                    (TiffFlavor::Plain, plain_scenes(&pages)?)
                }
            },
            Some(text) if text.starts_with("ImageJ=") => {
                match imagej_scene(text, &mut pages, reader.size())? {
                    Some(scene) => (TiffFlavor::ImageJ, vec![scene]),
                    None => (TiffFlavor::Plain, plain_scenes(&pages)?),
                }
            }
            _ => (TiffFlavor::Plain, plain_scenes(&pages)?),
        };

        if scenes.is_empty() {
            return Err(FormatError::corrupt("TIFF holds no full-resolution image"));
        }
        for scene in &mut scenes {
            scene.native.description = description.clone();
        }

        info!(
            identifier = reader.identifier(),
            ?flavor,
            pages = pages.len(),
            scenes = scenes.len(),
            "opened TIFF"
        );

        Ok(Self {
            reader,
            byte_order,
            flavor,
            pages,
            scenes,
        })
    }

    pub fn flavor(&self) -> TiffFlavor {
        self.flavor
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    fn scene(&self, scene: usize) -> Result<&TiffScene, FormatError> {
        self.scenes.get(scene).ok_or_else(|| {
            FormatError::corrupt(format!(
                "scene {} requested from a TIFF with {} scenes",
                scene,
                self.scenes.len()
            ))
        })
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        Ok(self.scene(scene)?.layout.clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        Ok(NativeMetadata::Tiff(self.scene(scene)?.native.clone()))
    }

    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        let tiff_scene = self.scene(scene)?;
        let plane = mapping.plane_index(scene, request.t, request.c, request.z);
        let page_index = tiff_scene
            .planes
            .get(plane)
            .copied()
            .flatten()
            .ok_or_else(|| {
                FormatError::corrupt(format!("plane {} of scene {} is not stored", plane, scene))
            })?;
        let page = &self.pages[page_index];

        let (first, count) = if mapping.samples_as_channels() {
            (request.c, request.channels)
        } else {
            (0, 1)
        };

        debug!(
            scene,
            plane,
            page = page_index,
            y = request.y,
            x = request.x,
            "reading TIFF chunk"
        );

        let data = page
            .read_chunk(
                self.reader.as_ref(),
                self.byte_order,
                request.y,
                request.x,
                request.height,
                request.width,
                first,
                count,
            )
            .await?;
        Ok(Bytes::from(data))
    }
}

fn is_ome_description(text: &str) -> bool {
    text.trim_start().starts_with('<') && (text.contains("<OME") || text.contains(":OME"))
}

fn file_name_of(identifier: &str) -> &str {
    identifier
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(identifier)
}

fn layout_for(scene: usize, plane_axes: Vec<(char, usize)>, page: &ImagePage) -> NativeLayout {
    let (chunk_y, chunk_x) = page.chunk_extent();
    NativeLayout {
        scene,
        plane_axes,
        size_y: page.height,
        size_x: page.width,
        samples_per_pixel: page.samples_per_pixel,
        dtype: page.dtype,
        chunk_y,
        chunk_x,
    }
}

fn empty_native(flavor: TiffFlavor, scenes: Vec<SceneInfo>) -> TiffNative {
    TiffNative {
        flavor,
        scenes,
        acquisition_date: None,
        ome_physical_sizes: [None, None, None],
        x_resolution: None,
        y_resolution: None,
        resolution_unit: 1,
        imagej_spacing: None,
        imagej_unit: None,
        channels: Vec::new(),
        description: None,
    }
}

/// Every page referenced by a scene must agree with its first page.
fn check_pages(
    pages: &[ImagePage],
    planes: &[Option<usize>],
    what: &str,
) -> Result<usize, FormatError> {
    let missing = |index: usize| {
        FormatError::corrupt(format!(
            "{} references IFD {} but the file has {}",
            what,
            index,
            pages.len()
        ))
    };

    let mut used = planes.iter().flatten().copied();
    let first = used
        .next()
        .ok_or_else(|| FormatError::corrupt(format!("{} maps no plane to any IFD", what)))?;
    let reference = pages.get(first).ok_or_else(|| missing(first))?;

    for index in used {
        let page = pages.get(index).ok_or_else(|| missing(index))?;
        if !page.same_shape(reference) || page.chunk_extent() != reference.chunk_extent() {
            return Err(FormatError::corrupt(format!(
                "{}: IFD {} differs in shape from IFD {}",
                what, index, first
            )));
        }
    }
    Ok(first)
}

// =============================================================================
// OME-TIFF
// =============================================================================

fn ome_scenes(
    images: &[OmeImage],
    pages: &[ImagePage],
    own_name: &str,
) -> Result<Vec<TiffScene>, FormatError> {
    let scene_infos: Vec<SceneInfo> = images
        .iter()
        .enumerate()
        .map(|(index, image)| SceneInfo {
            index,
            id: image.id.clone(),
            name: image.name.clone(),
        })
        .collect();

    let mut scenes = Vec::with_capacity(images.len());
    let mut next_sequential = 0usize;

    for (index, image) in images.iter().enumerate() {
        let pixels = &image.pixels;
        let what = format!("OME Image {}", index);

        // The page decides how many samples are interleaved.
        let first_ifd = pixels
            .tiff_data
            .first()
            .map(|td| td.ifd.unwrap_or(0))
            .unwrap_or(next_sequential);
        let spp = pages
            .get(first_ifd)
            .map(|p| p.samples_per_pixel)
            .unwrap_or_else(|| pixels.samples_per_pixel());

        let plane_axes = pixels.plane_axes(spp)?;
        let plane_count: usize = plane_axes.iter().map(|&(_, n)| n).product();

        let mut planes = vec![None; plane_count];
        if pixels.tiff_data.is_empty() {
            for (k, slot) in planes.iter_mut().enumerate() {
                *slot = Some(next_sequential + k);
            }
            next_sequential += plane_count;
        } else {
            for td in &pixels.tiff_data {
                if let Some(name) = &td.file_name {
                    if name != own_name {
                        return Err(FormatError::unsupported_variant(format!(
                            "{} stores planes in another file ({})",
                            what, name
                        )));
                    }
                }

                let start = plane_axes.iter().try_fold(0usize, |acc, &(axis, size)| {
                    let coord = match axis {
                        'T' => td.first_t,
                        'C' => td.first_c / spp,
                        _ => td.first_z,
                    };
                    (coord < size.max(1)).then_some(acc * size + coord)
                });
                let start = start.ok_or_else(|| {
                    FormatError::corrupt(format!(
                        "{}: TiffData starts outside the image (T={}, C={}, Z={})",
                        what, td.first_t, td.first_c, td.first_z
                    ))
                })?;

                let count = td.plane_count.unwrap_or(if td.ifd.is_some() {
                    1
                } else {
                    plane_count.saturating_sub(start)
                });
                let ifd = td.ifd.unwrap_or(0);
                for k in 0..count {
                    let slot = planes.get_mut(start + k).ok_or_else(|| {
                        FormatError::corrupt(format!(
                            "{}: TiffData covers more than {} planes",
                            what, plane_count
                        ))
                    })?;
                    *slot = Some(ifd + k);
                }
            }
        }

        let first = check_pages(pages, &planes, &what)?;
        let page = &pages[first];
        if page.width != pixels.size_x || page.height != pixels.size_y {
            return Err(FormatError::corrupt(format!(
                "{}: declared {}x{} but IFD {} is {}x{}",
                what, pixels.size_x, pixels.size_y, first, page.width, page.height
            )));
        }
        if page.dtype != pixels.dtype {
            warn!(
                declared = %pixels.dtype,
                stored = %page.dtype,
                "OME pixel type disagrees with the TIFF sample format, using the TIFF one"
            );
        }

        let native = TiffNative {
            acquisition_date: image.acquisition_date.clone(),
            ome_physical_sizes: pixels.physical_sizes.clone(),
            channels: pixels.channels.iter().map(|c| c.channel.clone()).collect(),
            ..empty_native(TiffFlavor::Ome, scene_infos.clone())
        };

        scenes.push(TiffScene {
            layout: layout_for(index, plane_axes, page),
            planes,
            native,
        });
    }

    Ok(scenes)
}

// =============================================================================
// ImageJ
// =============================================================================

/// Key/value pairs of an ImageJ description.
fn parse_imagej_description(text: &str) -> HashMap<&str, &str> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Build the single ImageJ scene, or `None` when the header is inconsistent
/// and the file should be read as a plain stack instead.
fn imagej_scene(
    text: &str,
    pages: &mut Vec<ImagePage>,
    file_size: u64,
) -> Result<Option<TiffScene>, FormatError> {
    let header = parse_imagej_description(text);
    let count = |key: &str| -> usize {
        header
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
            .max(1)
    };

    let channels = count("channels");
    let slices = count("slices");
    let frames = count("frames");
    let images = count("images");

    if channels * slices * frames != images {
        warn!(
            images,
            channels, slices, frames, "ImageJ header counts disagree, reading as plain TIFF"
        );
        return Ok(None);
    }

    let full: Vec<usize> = (0..pages.len())
        .filter(|&i| !pages[i].is_reduced_resolution())
        .collect();
    if full.len() < images {
        extend_contiguous_pages(pages, images, file_size)?;
    }
    let full: Vec<usize> = (0..pages.len())
        .filter(|&i| !pages[i].is_reduced_resolution())
        .take(images)
        .collect();
    let planes: Vec<Option<usize>> = full.into_iter().map(Some).collect();

    let first = check_pages(pages, &planes, "ImageJ stack")?;
    let page = &pages[first];
    let plane_axes = vec![('T', frames), ('Z', slices), ('C', channels)];

    let native = TiffNative {
        x_resolution: page.x_resolution,
        y_resolution: page.y_resolution,
        resolution_unit: page.resolution_unit,
        imagej_spacing: header.get("spacing").and_then(|v| v.parse().ok()),
        imagej_unit: header.get("unit").map(|u| normalize_imagej_unit(u)),
        ..empty_native(TiffFlavor::ImageJ, numbered_scenes(1))
    };

    Ok(Some(TiffScene {
        layout: layout_for(0, plane_axes, page),
        planes,
        native,
    }))
}

fn normalize_imagej_unit(unit: &str) -> String {
    match unit {
        "\\u00B5m" | "micron" | "microns" => "µm".to_string(),
        other => other.to_string(),
    }
}

/// Large ImageJ stacks describe every image but only write the first IFD;
/// the remaining planes follow the first one contiguously.
fn extend_contiguous_pages(
    pages: &mut Vec<ImagePage>,
    images: usize,
    file_size: u64,
) -> Result<(), FormatError> {
    let first = pages
        .first()
        .cloned()
        .ok_or_else(|| FormatError::corrupt("ImageJ file has no pages"))?;

    let contiguous = first
        .offsets
        .windows(2)
        .zip(&first.byte_counts)
        .all(|(pair, &count)| pair[0] + count == pair[1]);
    if first.compression != Compression::None
        || first.planar_configuration != PLANAR_CHUNKY
        || !contiguous
    {
        return Err(FormatError::unsupported_variant(format!(
            "ImageJ stack declares {} images but stores {} pages",
            images,
            pages.len()
        )));
    }

    let plane_bytes = (first.width * first.height * first.samples_per_pixel
        * first.dtype.bytes_per_sample()) as u64;
    let start = first.offsets.first().copied().unwrap_or(0);
    let end = start + plane_bytes * images as u64;
    if end > file_size {
        return Err(FormatError::corrupt(format!(
            "ImageJ stack of {} images needs {} bytes, file has {}",
            images, end, file_size
        )));
    }

    debug!(images, plane_bytes, "synthesizing contiguous ImageJ planes");
    pages.truncate(1);
    for k in 1..images {
        let mut page = first.clone();
        page.index = k;
        page.description = None;
        for offset in &mut page.offsets {
            *offset += plane_bytes * k as u64;
        }
        pages.push(page);
    }
    Ok(())
}

// =============================================================================
// Plain TIFF
// =============================================================================

fn plain_scenes(pages: &[ImagePage]) -> Result<Vec<TiffScene>, FormatError> {
    let mut series: Vec<Vec<usize>> = Vec::new();
    for (index, page) in pages.iter().enumerate() {
        if page.is_reduced_resolution() {
            continue;
        }
        let joins_last = series.last().is_some_and(|last| {
            let prev = &pages[last[last.len() - 1]];
            last.last() == Some(&(index.wrapping_sub(1)))
                && prev.same_shape(page)
                && prev.chunk_extent() == page.chunk_extent()
        });
        match series.last_mut() {
            Some(last) if joins_last => last.push(index),
            _ => series.push(vec![index]),
        }
    }

    if series.len() > 1 {
        let first = &pages[series[0][0]];
        let consistent = series
            .iter()
            .all(|s| pages[s[0]].width == first.width && pages[s[0]].height == first.height);
        if !consistent {
            info!(
                series = series.len(),
                "TIFF series differ in shape; each series is read as its own scene"
            );
        }
    }

    let scene_infos = numbered_scenes(series.len());
    Ok(series
        .iter()
        .enumerate()
        .map(|(index, members)| {
            let page = &pages[members[0]];
            let native = TiffNative {
                x_resolution: page.x_resolution,
                y_resolution: page.y_resolution,
                resolution_unit: page.resolution_unit,
                ..empty_native(TiffFlavor::Plain, scene_infos.clone())
            };
            TiffScene {
                layout: layout_for(index, vec![('Z', members.len())], page),
                planes: members.iter().copied().map(Some).collect(),
                native,
            }
        })
        .collect())
}
