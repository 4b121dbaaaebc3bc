//! Format-specific integration tests.
//!
//! Tests verify:
//! - detection by signature, and rejection of unknown bytes after one read
//! - TIFF parsing in both byte orders and as BigTIFF
//! - ImageJ hyperstacks map their planes onto TCZYX
//! - CZI scenes, channels and physical sizes are normalized
//! - PNG files open through the generic fallback

use std::sync::Arc;

use bioimage_streamer::array::Selection;
use bioimage_streamer::config::ReaderConfig;
use bioimage_streamer::error::ImageError;
use bioimage_streamer::format::BackendTag;
use bioimage_streamer::io::{MemoryReader, RangeReader};
use bioimage_streamer::metadata::PixelType;
use bioimage_streamer::source::{BioReader, ImageSource};

use super::test_utils::{build_czi, create_test_png, czi_value, TiffBuilder, TiffPage, TrackingReader};

async fn open_bytes(bytes: Vec<u8>, name: &str) -> Result<ImageSource, ImageError> {
    let reader: Arc<dyn RangeReader> = Arc::new(MemoryReader::new(bytes, name));
    BioReader::default().open_reader(reader).await
}

// =============================================================================
// Detection
// =============================================================================

#[tokio::test]
async fn test_unknown_bytes_rejected_after_one_read() {
    let reader = TrackingReader::new(b"definitely-not!!".to_vec(), "mem://blob.bin");
    let handle = reader.clone();

    let result = BioReader::default().open_reader(Arc::new(reader)).await;

    match result {
        Err(ImageError::UnsupportedFormat { source_id, .. }) => {
            assert_eq!(source_id, "mem://blob.bin");
        }
        Err(other) => panic!("expected UnsupportedFormat, got {other:?}"),
        Ok(_) => panic!("expected UnsupportedFormat, got a source"),
    }
    assert_eq!(handle.request_count(), 1);
    assert_eq!(handle.get_requests().await, vec![(0, 16)]);
}

#[tokio::test]
async fn test_signature_wins_over_extension() {
    let source = open_bytes(build_czi(1, 1, 1, 1, 4, 4), "mem://mislabelled.tif")
        .await
        .unwrap();
    assert_eq!(source.format(), BackendTag::Czi);
}

#[tokio::test]
async fn test_png_needs_generic_fallback() {
    let png = create_test_png(5, 4);

    let source = open_bytes(png.clone(), "mem://rgb.png").await.unwrap();
    assert_eq!(source.format(), BackendTag::Generic);
    assert_eq!(source.shape(), [1, 3, 1, 4, 5]);

    let data = source.read(&Selection::all()).await.unwrap();
    let array = data.to_ndarray::<u8>().unwrap();
    assert_eq!(array[[0, 0, 0, 2, 3]], 3);
    assert_eq!(array[[0, 1, 0, 2, 3]], 2);
    assert_eq!(array[[0, 2, 0, 2, 3]], 200);

    let config = ReaderConfig {
        generic_fallback: false,
        ..ReaderConfig::default()
    };
    let reader: Arc<dyn RangeReader> = Arc::new(MemoryReader::new(png, "mem://rgb.png"));
    let result = BioReader::new(config).open_reader(reader).await;
    assert!(matches!(result, Err(ImageError::UnsupportedFormat { .. })));
}

#[tokio::test]
async fn test_truncated_czi_is_corrupt() {
    let mut bytes = build_czi(1, 1, 1, 2, 8, 8);
    bytes.truncate(bytes.len() - 200);

    let result = open_bytes(bytes, "mem://cut.czi").await;
    assert!(
        matches!(result, Err(ImageError::CorruptFile { .. })),
        "got {:?}",
        result.err()
    );
}

// =============================================================================
// TIFF Byte Order Tests
// =============================================================================

async fn assert_gray16_stack(bytes: Vec<u8>) {
    let source = open_bytes(bytes, "mem://stack.tif").await.unwrap();
    assert_eq!(source.format(), BackendTag::Tiff);
    assert_eq!(source.dtype(), PixelType::Uint16);
    assert_eq!(source.shape(), [1, 1, 2, 3, 4]);

    let data = source.read(&Selection::all().z(1)).await.unwrap();
    let array = data.to_ndarray::<u16>().unwrap();
    assert_eq!(array.shape(), &[1, 1, 1, 3, 4]);
    // Plane 1 starts at 1000; pixel (y=2, x=3) is index 11.
    assert_eq!(array[[0, 0, 0, 2, 3]], 1011);
    assert_eq!(array[[0, 0, 0, 0, 0]], 1000);
}

#[tokio::test]
async fn test_little_endian_tiff() {
    let bytes = TiffBuilder::new()
        .page(TiffPage::gray16(4, 3, 0, false))
        .page(TiffPage::gray16(4, 3, 1000, false))
        .build();
    assert_eq!(&bytes[..2], b"II");
    assert_gray16_stack(bytes).await;
}

#[tokio::test]
async fn test_big_endian_tiff() {
    let bytes = TiffBuilder::new()
        .big_endian()
        .page(TiffPage::gray16(4, 3, 0, true))
        .page(TiffPage::gray16(4, 3, 1000, true))
        .build();
    assert_eq!(&bytes[..2], b"MM");
    assert_gray16_stack(bytes).await;
}

#[tokio::test]
async fn test_bigtiff() {
    let bytes = TiffBuilder::new()
        .bigtiff()
        .page(TiffPage::gray16(4, 3, 0, false))
        .page(TiffPage::gray16(4, 3, 1000, false))
        .build();
    assert_eq!(bytes[2], 43);
    assert_gray16_stack(bytes).await;
}

#[tokio::test]
async fn test_imagej_hyperstack() {
    let text = "ImageJ=1.54f\nimages=6\nchannels=2\nslices=3\nhyperstack=true\nunit=micron\nspacing=0.75\n";
    let mut builder = TiffBuilder::new();
    for k in 0..6u8 {
        let mut page = TiffPage::gray8(3, 2, k);
        if k == 0 {
            page = page.with_description(text);
        }
        builder = builder.page(page);
    }

    let source = open_bytes(builder.build(), "mem://hyper.tif").await.unwrap();
    assert_eq!(source.shape(), [1, 2, 3, 2, 3]);
    assert_eq!(source.metadata().physical_pixel_sizes.z, Some(0.75));
    assert_eq!(source.description(), Some(text));
    assert_eq!(source.native_metadata().tag(), BackendTag::Tiff);

    // Channels vary fastest: (c=1, z=2) is page 5.
    let data = source.read(&Selection::all().c(1).z(2)).await.unwrap();
    assert_eq!(data.bytes().to_vec(), vec![5u8; 6]);
}

// =============================================================================
// CZI
// =============================================================================

#[tokio::test]
async fn test_czi_metadata() {
    let mut source = open_bytes(build_czi(2, 1, 3, 2, 6, 5), "mem://cells.czi")
        .await
        .unwrap();
    assert_eq!(source.format(), BackendTag::Czi);
    assert_eq!(source.scene_count(), 2);

    let meta = source.metadata();
    assert_eq!(meta.dims.shape(), [1, 3, 2, 5, 6]);
    assert_eq!(meta.dtype, PixelType::Uint8);
    assert_eq!(meta.channels.len(), 3);
    assert_eq!(meta.channels[0].name.as_deref(), Some("DAPI"));
    assert_eq!(meta.channels[0].emission_wavelength, Some(465.0));
    assert!((meta.physical_pixel_sizes.x.unwrap() - 0.25).abs() < 1e-9);
    assert!((meta.physical_pixel_sizes.z.unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(meta.acquisition_time.as_deref(), Some("2019-05-06T11:12:13Z"));

    source.set_scene(1).await.unwrap();
    assert_eq!(source.metadata().current_scene, 1);
    let data = source.read(&Selection::all().c(2).z(1)).await.unwrap();
    assert_eq!(data.bytes()[0], czi_value(1, 0, 2, 1));
}
