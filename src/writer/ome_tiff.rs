//! Plain multi-page OME-TIFF: one stripped page per plane.

use tracing::debug;

use crate::error::ImageError;
use crate::format::ome::build_ome_xml;
use crate::io::ByteSink;
use crate::metadata::Metadata;

use super::tiff_encoder::{needs_bigtiff, EncodedPage, TiffEncoder};
use super::{OutputFormat, PlaneReader, WriteOptions, WriteSummary, CREATOR};

/// Per-page allowance for IFDs and strip tables in the size estimate.
const PAGE_OVERHEAD: u64 = 4096;

pub(crate) async fn write_plain(
    planes: &PlaneReader<'_>,
    metadata: &Metadata,
    sink: &mut dyn ByteSink,
    options: &WriteOptions,
) -> Result<WriteSummary, ImageError> {
    let xml = build_ome_xml(metadata, CREATOR).map_err(|e| ImageError::Write(e.to_string()))?;
    let count = planes.plane_count();
    let estimate =
        (planes.plane_bytes() + PAGE_OVERHEAD) * count as u64 + xml.len() as u64;
    let bigtiff = options.force_bigtiff || needs_bigtiff(estimate);
    let destination = sink.identifier().to_string();
    debug!(estimate, bigtiff, pages = count, "planning OME-TIFF");

    let mut encoder = TiffEncoder::start(&mut *sink, bigtiff).await?;
    for index in 0..count {
        let plane = planes.read(index).await?;
        let mut page = EncodedPage::strips(
            &plane,
            planes.width(),
            planes.height(),
            metadata.dtype,
            options.compression.tiff(),
        )
        .map_err(|e| ImageError::Write(e.to_string()))?;
        if index == 0 {
            page.description = Some(xml.clone());
            page.software = Some(CREATOR.to_string());
        }
        encoder.write_page(&page, &[], index + 1 == count).await?;
    }
    let pages = encoder.pages_written();

    sink.finish()
        .await
        .map_err(|e| ImageError::Write(format!("{}: {}", destination, e)))?;

    Ok(WriteSummary {
        format: OutputFormat::OmeTiff,
        destination,
        dims: metadata.dims,
        pages,
        levels: 0,
        bigtiff,
        bytes_written: sink.position(),
    })
}
