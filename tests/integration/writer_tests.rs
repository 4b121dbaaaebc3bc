//! OME-TIFF writer integration tests.
//!
//! Tests verify:
//! - Plain OME-TIFF output reopens with the same pixels and metadata
//! - Pyramidal output carries tiled pages with reduced SubIFDs
//! - Writers reject empty selections and metadata they cannot express
//! - BigTIFF can be forced and still reads back
//! - Local files written through the sink reopen by path
//! - A failed write aborts its sink

use std::sync::Arc;

use async_trait::async_trait;
use bioimage_streamer::array::Selection;
use bioimage_streamer::config::ReaderConfig;
use bioimage_streamer::error::{ImageError, IoError};
use bioimage_streamer::format::tiff::{
    ByteOrder, Compression, Ifd, TiffFile, TiffHeader, TiffTag, SUBFILE_REDUCED_RESOLUTION,
};
use bioimage_streamer::format::BackendTag;
use bioimage_streamer::io::{open_sink, ByteSink, MemoryReader, MemorySink, RangeReader};
use bioimage_streamer::source::{BioReader, ImageSource};
use bioimage_streamer::writer::{write, OutputCompression, OutputFormat, WriteOptions};

use super::test_utils::{build_czi, create_test_png, czi_value};

async fn open_bytes(bytes: Vec<u8>, name: &str) -> ImageSource {
    let reader: Arc<dyn RangeReader> = Arc::new(MemoryReader::new(bytes, name));
    BioReader::default().open_reader(reader).await.unwrap()
}

async fn write_to_memory(
    source: &ImageSource,
    selection: &Selection,
    format: OutputFormat,
    options: &WriteOptions,
) -> Result<Vec<u8>, ImageError> {
    let mut sink = MemorySink::new();
    let summary = write(
        source.array(),
        selection,
        source.metadata(),
        &mut sink,
        format,
        options,
    )
    .await?;
    assert_eq!(summary.bytes_written, sink.as_slice().len() as u64);
    Ok(sink.into_bytes().to_vec())
}

/// Parse the IFD at `offset` of an in-memory TIFF.
fn read_ifd(bytes: &[u8], header: &TiffHeader, offset: u64) -> Ifd {
    let at = offset as usize;
    let count = if header.is_bigtiff {
        header.byte_order.read_u64(&bytes[at..at + 8])
    } else {
        header.byte_order.read_u16(&bytes[at..at + 2]) as u64
    };
    let size = Ifd::calculate_size(count, header);
    Ifd::parse(&bytes[at..at + size], header).unwrap()
}

// =============================================================================
// Plain OME-TIFF
// =============================================================================

#[tokio::test]
async fn test_plain_round_trip() {
    let mut source = open_bytes(build_czi(2, 2, 3, 2, 40, 30), "mem://in.czi").await;
    source.set_scene(1).await.unwrap();

    let mut sink = MemorySink::new();
    let summary = write(
        source.array(),
        &Selection::all(),
        source.metadata(),
        &mut sink,
        OutputFormat::OmeTiff,
        &WriteOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(summary.pages, 12);
    assert_eq!(summary.levels, 0);
    assert!(!summary.bigtiff);

    let written = open_bytes(sink.into_bytes().to_vec(), "mem://out.ome.tif").await;
    assert_eq!(written.format(), BackendTag::Tiff);
    assert_eq!(written.shape(), [2, 3, 2, 30, 40]);
    assert_eq!(written.scene_count(), 1);

    let meta = written.metadata();
    let original = source.metadata();
    assert_eq!(meta.dtype, original.dtype);
    assert_eq!(meta.channels[0].name.as_deref(), Some("DAPI"));
    assert_eq!(meta.channels[2].name.as_deref(), Some("AF647"));
    assert!((meta.physical_pixel_sizes.x.unwrap() - 0.25).abs() < 1e-9);
    assert!((meta.physical_pixel_sizes.z.unwrap() - 1.0).abs() < 1e-9);

    for (t, c, z) in [(0, 0, 0), (1, 2, 1), (0, 1, 1), (1, 0, 0)] {
        let plane = written
            .read(&Selection::all().t(t).c(c).z(z))
            .await
            .unwrap();
        assert_eq!(plane.bytes().to_vec(), vec![czi_value(1, t, c, z); 1200]);
    }

    let full_in = source.read(&Selection::all()).await.unwrap();
    let full_out = written.read(&Selection::all()).await.unwrap();
    assert_eq!(full_in.bytes(), full_out.bytes());
}

#[tokio::test]
async fn test_plain_writes_selection_subset() {
    let source = open_bytes(build_czi(1, 1, 3, 4, 16, 8), "mem://in.czi").await;
    let selection = Selection::all().c(1..3).z(2).x(4..12);

    let bytes = write_to_memory(
        &source,
        &selection,
        OutputFormat::OmeTiff,
        &WriteOptions {
            compression: OutputCompression::None,
            ..WriteOptions::default()
        },
    )
    .await
    .unwrap();

    let written = open_bytes(bytes, "mem://subset.ome.tif").await;
    assert_eq!(written.shape(), [1, 2, 1, 8, 8]);
    assert_eq!(written.metadata().channels[0].name.as_deref(), Some("AF488"));

    let plane = written.read(&Selection::all().c(1)).await.unwrap();
    assert_eq!(plane.bytes().to_vec(), vec![czi_value(0, 0, 2, 2); 64]);
}

#[tokio::test]
async fn test_forced_bigtiff() {
    let source = open_bytes(build_czi(1, 1, 1, 2, 8, 8), "mem://in.czi").await;

    let bytes = write_to_memory(
        &source,
        &Selection::all(),
        OutputFormat::OmeTiff,
        &WriteOptions {
            force_bigtiff: true,
            ..WriteOptions::default()
        },
    )
    .await
    .unwrap();

    let header = TiffHeader::parse(&bytes[..16], bytes.len() as u64).unwrap();
    assert!(header.is_bigtiff);
    assert_eq!(header.byte_order, ByteOrder::LittleEndian);

    let written = open_bytes(bytes, "mem://big.ome.tif").await;
    assert_eq!(written.shape(), [1, 1, 2, 8, 8]);
    let plane = written.read(&Selection::all().z(1)).await.unwrap();
    assert_eq!(plane.bytes()[0], czi_value(0, 0, 0, 1));
}

// =============================================================================
// Pyramidal OME-TIFF
// =============================================================================

#[tokio::test]
async fn test_pyramid_layout() {
    let source = open_bytes(build_czi(1, 1, 2, 1, 300, 200), "mem://in.czi").await;
    let options = WriteOptions {
        tile_size: 128,
        ..WriteOptions::default()
    };

    let mut sink = MemorySink::new();
    let summary = write(
        source.array(),
        &Selection::all(),
        source.metadata(),
        &mut sink,
        OutputFormat::OmeTiffPyramid,
        &options,
    )
    .await
    .unwrap();
    // 300 -> 150 -> 75 fits in one 128 tile.
    assert_eq!(summary.levels, 2);
    assert_eq!(summary.pages, 2);

    let bytes = sink.into_bytes().to_vec();
    let reader = MemoryReader::new(bytes.clone(), "mem://pyramid.ome.tif");
    let tiff = TiffFile::parse(&reader).await.unwrap();
    assert_eq!(tiff.pages.len(), 2);
    for page in &tiff.pages {
        assert!(page.tiled);
        assert_eq!((page.block_width, page.block_height), (128, 128));
        assert_eq!(page.compression, Compression::Deflate);
        assert!(!page.is_reduced_resolution());
        assert_eq!(page.sub_ifds.len(), 2);
    }
    assert!(tiff.description().unwrap().contains("<OME"));

    let header = tiff.header;
    let first = read_ifd(&bytes, &header, tiff.pages[0].sub_ifds[0]);
    assert_eq!(first.image_width(header.byte_order), Some(150));
    assert_eq!(first.image_height(header.byte_order), Some(100));
    assert_eq!(
        first.get_u32(TiffTag::NewSubfileType, header.byte_order),
        Some(SUBFILE_REDUCED_RESOLUTION)
    );
    let second = read_ifd(&bytes, &header, tiff.pages[0].sub_ifds[1]);
    assert_eq!(second.image_width(header.byte_order), Some(75));
    assert_eq!(second.image_height(header.byte_order), Some(50));

    // Reading back exposes full resolution only.
    let written = open_bytes(bytes, "mem://pyramid.ome.tif").await;
    assert_eq!(written.shape(), [1, 2, 1, 200, 300]);
    let plane = written.read(&Selection::all().c(1)).await.unwrap();
    assert_eq!(plane.bytes().to_vec(), vec![czi_value(0, 0, 1, 0); 60_000]);
}

#[tokio::test]
async fn test_pyramid_requested_levels() {
    let source = open_bytes(build_czi(1, 1, 1, 1, 64, 64), "mem://in.czi").await;
    let bytes = write_to_memory(
        &source,
        &Selection::all(),
        OutputFormat::OmeTiffPyramid,
        &WriteOptions {
            tile_size: 16,
            levels: Some(1),
            ..WriteOptions::default()
        },
    )
    .await
    .unwrap();

    let reader = MemoryReader::new(bytes, "mem://one-level.ome.tif");
    let tiff = TiffFile::parse(&reader).await.unwrap();
    assert_eq!(tiff.pages[0].sub_ifds.len(), 1);
}

#[tokio::test]
async fn test_pyramid_needs_physical_sizes() {
    let source = open_bytes(create_test_png(32, 32), "mem://rgb.png").await;
    assert_eq!(source.metadata().physical_pixel_sizes.x, None);

    let result = write_to_memory(
        &source,
        &Selection::all(),
        OutputFormat::OmeTiffPyramid,
        &WriteOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(ImageError::IncompleteMetadata(_))));

    // Plain output has no such requirement.
    let bytes = write_to_memory(
        &source,
        &Selection::all(),
        OutputFormat::OmeTiff,
        &WriteOptions::default(),
    )
    .await
    .unwrap();
    let written = open_bytes(bytes, "mem://rgb.ome.tif").await;
    assert_eq!(written.shape(), [1, 3, 1, 32, 32]);
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn test_empty_selection_rejected() {
    let source = open_bytes(build_czi(1, 1, 1, 3, 8, 8), "mem://in.czi").await;
    let result = write_to_memory(
        &source,
        &Selection::all().z(1..1),
        OutputFormat::OmeTiff,
        &WriteOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(ImageError::InvalidSelection(_))));
}

#[tokio::test]
async fn test_bad_tile_size_rejected() {
    let source = open_bytes(build_czi(1, 1, 1, 1, 8, 8), "mem://in.czi").await;
    let result = write_to_memory(
        &source,
        &Selection::all(),
        OutputFormat::OmeTiffPyramid,
        &WriteOptions {
            tile_size: 100,
            ..WriteOptions::default()
        },
    )
    .await;
    assert!(matches!(result, Err(ImageError::Write(_))));
}

/// Sink that refuses writes past `capacity` bytes and records aborts.
struct FullDiskSink {
    capacity: u64,
    written: u64,
    finished: bool,
    aborted: bool,
}

impl FullDiskSink {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            written: 0,
            finished: false,
            aborted: false,
        }
    }
}

#[async_trait]
impl ByteSink for FullDiskSink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        if self.written + data.len() as u64 > self.capacity {
            return Err(IoError::Local("no space left on device".to_string()));
        }
        self.written += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.written
    }

    async fn finish(&mut self) -> Result<(), IoError> {
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), IoError> {
        self.aborted = true;
        Ok(())
    }

    fn identifier(&self) -> &str {
        "test://full-disk"
    }
}

#[tokio::test]
async fn test_failed_write_aborts_sink() {
    let source = open_bytes(build_czi(1, 1, 2, 4, 32, 32), "mem://in.czi").await;

    for format in [OutputFormat::OmeTiff, OutputFormat::OmeTiffPyramid] {
        let mut sink = FullDiskSink::new(1024);
        let options = WriteOptions {
            tile_size: 16,
            levels: Some(1),
            compression: OutputCompression::None,
            force_bigtiff: false,
        };
        let result = write(
            source.array(),
            &Selection::all(),
            source.metadata(),
            &mut sink,
            format,
            &options,
        )
        .await;

        assert!(matches!(result, Err(ImageError::Write(_))), "{:?}", format);
        assert!(sink.aborted);
        assert!(!sink.finished);
    }
}

#[tokio::test]
async fn test_rejected_write_aborts_sink() {
    let source = open_bytes(build_czi(1, 1, 1, 1, 8, 8), "mem://in.czi").await;
    let mut sink = FullDiskSink::new(u64::MAX);
    let result = write(
        source.array(),
        &Selection::all().z(1..1),
        source.metadata(),
        &mut sink,
        OutputFormat::OmeTiff,
        &WriteOptions::default(),
    )
    .await;

    assert!(matches!(result, Err(ImageError::InvalidSelection(_))));
    assert!(sink.aborted);
}

// =============================================================================
// Local Files
// =============================================================================

#[tokio::test]
async fn test_local_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cells.ome.tif");
    let path = path.to_str().unwrap();

    let config = ReaderConfig::default();
    let source = open_bytes(build_czi(1, 1, 2, 3, 24, 12), "mem://in.czi").await;
    let mut sink = open_sink(path, &config).await.unwrap();
    write(
        source.array(),
        &Selection::all(),
        source.metadata(),
        sink.as_mut(),
        OutputFormat::OmeTiff,
        &WriteOptions::default(),
    )
    .await
    .unwrap();

    let written = BioReader::new(config).open(path).await.unwrap();
    assert_eq!(written.format(), BackendTag::Tiff);
    assert_eq!(written.shape(), [1, 2, 3, 12, 24]);
    let plane = written.read(&Selection::all().c(1).z(2)).await.unwrap();
    assert_eq!(plane.bytes()[0], czi_value(0, 0, 1, 2));
}
