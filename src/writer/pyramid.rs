//! Tiled pyramidal OME-TIFF.
//!
//! Every plane is written as a tiled page. Its reduced resolutions follow
//! it as SubIFDs marked `NewSubfileType = 1`, each made by keeping every
//! second row and column of the level above.

use tracing::debug;

use crate::error::{FormatError, ImageError};
use crate::format::ome::build_ome_xml;
use crate::io::ByteSink;
use crate::metadata::Metadata;

use super::tiff_encoder::{needs_bigtiff, EncodedPage, TiffEncoder};
use super::{OutputFormat, PlaneReader, WriteOptions, WriteSummary, CREATOR};

/// Per-page allowance for IFDs and tile tables in the size estimate.
const PAGE_OVERHEAD: u64 = 16 * 1024;

/// Halve a plane by nearest-neighbour decimation.
///
/// Returns the reduced plane and its width and height, `ceil(n / 2)` each.
pub fn decimate(plane: &[u8], width: usize, height: usize, bps: usize) -> (Vec<u8>, usize, usize) {
    let (w2, h2) = (width.div_ceil(2), height.div_ceil(2));
    let mut out = Vec::with_capacity(w2 * h2 * bps);
    for y in 0..h2 {
        let row = &plane[(2 * y) * width * bps..(2 * y + 1) * width * bps];
        for x in 0..w2 {
            out.extend_from_slice(&row[2 * x * bps..(2 * x + 1) * bps]);
        }
    }
    (out, w2, h2)
}

/// Reduced levels needed until the image fits in one tile.
pub fn default_level_count(width: usize, height: usize, tile: usize) -> usize {
    let (mut w, mut h) = (width, height);
    let mut levels = 0;
    while w.max(h) > tile && w.max(h) > 1 {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        levels += 1;
    }
    levels
}

/// Levels that still have at least one pixel along each axis.
fn clamp_levels(width: usize, height: usize, requested: usize) -> usize {
    let (mut w, mut h) = (width, height);
    let mut levels = 0;
    while levels < requested && (w > 1 || h > 1) {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        levels += 1;
    }
    levels
}

pub(crate) async fn write_pyramid(
    planes: &PlaneReader<'_>,
    metadata: &Metadata,
    sink: &mut dyn ByteSink,
    options: &WriteOptions,
) -> Result<WriteSummary, ImageError> {
    let sizes = metadata.physical_pixel_sizes;
    if sizes.x.is_none() || sizes.y.is_none() {
        return Err(ImageError::IncompleteMetadata(
            "pyramidal OME-TIFF needs physical pixel sizes along X and Y".to_string(),
        ));
    }

    let (width, height) = (planes.width() as usize, planes.height() as usize);
    let tile = options.tile_size as usize;
    let levels = match options.levels {
        Some(requested) => clamp_levels(width, height, requested),
        None => default_level_count(width, height, tile),
    };

    let xml = build_ome_xml(metadata, CREATOR).map_err(|e| ImageError::Write(e.to_string()))?;
    let count = planes.plane_count();
    // Reduced levels add at most a third of the full-resolution size.
    let per_plane = planes.plane_bytes() + planes.plane_bytes() / 3;
    let estimate = (per_plane + PAGE_OVERHEAD * (levels as u64 + 1)) * count as u64
        + xml.len() as u64;
    let bigtiff = options.force_bigtiff || needs_bigtiff(estimate);
    let destination = sink.identifier().to_string();
    debug!(estimate, bigtiff, pages = count, levels, tile, "planning pyramid");

    let bps = metadata.dtype.bytes_per_sample();
    let compression = options.compression.tiff();
    let encode_err = |e: FormatError| ImageError::Write(e.to_string());

    let mut encoder = TiffEncoder::start(&mut *sink, bigtiff).await?;
    for index in 0..count {
        let plane = planes.read(index).await?;
        let mut page = EncodedPage::tiles(
            &plane,
            width as u32,
            height as u32,
            metadata.dtype,
            options.tile_size,
            compression,
        )
        .map_err(encode_err)?;
        if index == 0 {
            page.description = Some(xml.clone());
            page.software = Some(CREATOR.to_string());
        }

        let mut reduced = Vec::with_capacity(levels);
        let (mut current, mut w, mut h) = (plane, width, height);
        for _ in 0..levels {
            let (next, w2, h2) = decimate(&current, w, h, bps);
            let mut level = EncodedPage::tiles(
                &next,
                w2 as u32,
                h2 as u32,
                metadata.dtype,
                options.tile_size,
                compression,
            )
            .map_err(encode_err)?;
            level.reduced = true;
            reduced.push(level);
            (current, w, h) = (next, w2, h2);
        }

        encoder
            .write_page(&page, &reduced, index + 1 == count)
            .await?;
    }
    let pages = encoder.pages_written();

    sink.finish()
        .await
        .map_err(|e| ImageError::Write(format!("{}: {}", destination, e)))?;

    Ok(WriteSummary {
        format: OutputFormat::OmeTiffPyramid,
        destination,
        dims: metadata.dims,
        pages,
        levels,
        bigtiff,
        bytes_written: sink.position(),
    })
}
