//! Lazy array and chunk cache integration tests.
//!
//! Tests verify:
//! - A selection fetches only the chunks that cover it
//! - Concurrent and repeated reads share fetched chunks
//! - Scene switching validates its index and keeps reads scene-local
//! - A bounded cache evicts but still answers every read
//! - An abandoned read keeps the chunks it completed

use std::sync::Arc;
use std::time::Duration;

use bioimage_streamer::array::Selection;
use bioimage_streamer::config::{ConcurrencyScope, ReaderConfig};
use bioimage_streamer::error::ImageError;
use bioimage_streamer::source::{BioReader, ImageSource};

use super::test_utils::{build_czi, czi_value, SlowReader, TrackingReader};

const WIDTH: usize = 512;
const HEIGHT: usize = 512;

/// Three scenes of T=2, C=3, Z=5.
async fn open_czi(config: ReaderConfig) -> (ImageSource, TrackingReader) {
    let reader = TrackingReader::new(build_czi(3, 2, 3, 5, WIDTH, HEIGHT), "mem://scenes.czi");
    let handle = reader.clone();
    let source = BioReader::new(config)
        .open_reader(Arc::new(reader))
        .await
        .unwrap();
    (source, handle)
}

// =============================================================================
// Chunk Selection
// =============================================================================

#[tokio::test]
async fn test_selection_fetches_covering_chunks_only() {
    let (mut source, reader) = open_czi(ReaderConfig::default()).await;
    source.set_scene(1).await.unwrap();
    assert_eq!(source.shape(), [2, 3, 5, HEIGHT, WIDTH]);

    reader.reset_tracking().await;
    let data = source
        .read(&Selection::all().t(0..1).c(0..2).z(2))
        .await
        .unwrap();

    assert_eq!(data.shape(), [1, 2, 1, HEIGHT, WIDTH]);
    let stats = source.cache_stats().await;
    assert_eq!(stats.fetches, 2);
    assert_eq!(stats.resident_chunks, 2);
    assert!(reader.request_count() > 0);

    let array = data.to_ndarray::<u8>().unwrap();
    assert_eq!(array[[0, 0, 0, 0, 0]], czi_value(1, 0, 0, 2));
    assert_eq!(array[[0, 1, 0, HEIGHT - 1, WIDTH - 1]], czi_value(1, 0, 1, 2));
}

#[tokio::test]
async fn test_sub_region_of_one_chunk() {
    let (source, _) = open_czi(ReaderConfig::default()).await;

    let data = source
        .read(&Selection::all().t(1).c(2).z(4).y(10..20).x(..7))
        .await
        .unwrap();

    assert_eq!(data.shape(), [1, 1, 1, 10, 7]);
    assert_eq!(data.bytes().to_vec(), vec![czi_value(0, 1, 2, 4); 70]);
    assert_eq!(source.cache_stats().await.fetches, 1);
}

#[tokio::test]
async fn test_repeated_read_is_served_from_cache() {
    let (source, reader) = open_czi(ReaderConfig::default()).await;
    let selection = Selection::all().t(1).z(0..3);

    let first = source.read(&selection).await.unwrap();
    let requests = reader.request_count();
    let second = source.read(&selection).await.unwrap();

    assert_eq!(first.bytes(), second.bytes());
    assert_eq!(reader.request_count(), requests);

    let stats = source.cache_stats().await;
    assert_eq!(stats.fetches, 9);
    assert_eq!(stats.hits, 9);
}

#[tokio::test]
async fn test_parallel_readers_share_fetches() {
    let (source, _) = open_czi(ReaderConfig::default()).await;
    let array = source.array().clone();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let array = array.clone();
        tasks.push(tokio::spawn(async move {
            array.read(&Selection::all().t(0).c(1)).await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    for data in &results[1..] {
        assert_eq!(data.bytes(), results[0].bytes());
    }
    // One chunk per Z plane, fetched once no matter how many readers.
    assert_eq!(source.cache_stats().await.fetches, 5);
}

#[tokio::test]
async fn test_single_fetch_slot_still_completes() {
    let config = ReaderConfig {
        max_concurrent_reads: 1,
        concurrency_scope: ConcurrencyScope::Shared,
        ..ReaderConfig::default()
    };
    let (source, _) = open_czi(config).await;

    let data = source.read(&Selection::all().t(0)).await.unwrap();
    assert_eq!(data.shape(), [1, 3, 5, HEIGHT, WIDTH]);
    assert_eq!(source.cache_stats().await.fetches, 15);
}

// =============================================================================
// Selection Edge Cases
// =============================================================================

#[tokio::test]
async fn test_empty_selection_reads_nothing() {
    let (source, reader) = open_czi(ReaderConfig::default()).await;
    reader.reset_tracking().await;

    let data = source.read(&Selection::all().z(2..2)).await.unwrap();

    assert_eq!(data.shape(), [2, 3, 0, HEIGHT, WIDTH]);
    assert!(data.is_empty());
    assert_eq!(reader.request_count(), 0);
    assert_eq!(source.cache_stats().await.fetches, 0);
}

#[tokio::test]
async fn test_out_of_range_selection() {
    let (source, _) = open_czi(ReaderConfig::default()).await;

    let result = source.read(&Selection::all().z(5)).await;
    assert!(matches!(result, Err(ImageError::InvalidSelection(_))));

    let result = source.read(&Selection::all().x(0..WIDTH + 1)).await;
    assert!(matches!(result, Err(ImageError::InvalidSelection(_))));
}

#[tokio::test]
async fn test_ndarray_dtype_mismatch() {
    let (source, _) = open_czi(ReaderConfig::default()).await;
    let data = source.read(&Selection::all().t(0).c(0).z(0)).await.unwrap();
    assert!(matches!(
        data.to_ndarray::<u16>(),
        Err(ImageError::InvalidSelection(_))
    ));
}

// =============================================================================
// Scenes
// =============================================================================

#[tokio::test]
async fn test_scene_index_out_of_range() {
    let (mut source, _) = open_czi(ReaderConfig::default()).await;

    match source.set_scene(3).await {
        Err(ImageError::SceneIndex {
            requested,
            scene_count,
            ..
        }) => {
            assert_eq!(requested, 3);
            assert_eq!(scene_count, 3);
        }
        other => panic!("expected SceneIndex, got {other:?}"),
    }
    assert_eq!(source.current_scene(), 0);
}

#[tokio::test]
async fn test_scene_switch_drops_other_scene_chunks() {
    let (mut source, _) = open_czi(ReaderConfig::default()).await;
    source.read(&Selection::all().t(0).c(0)).await.unwrap();
    assert_eq!(source.cache_stats().await.resident_chunks, 5);

    source.set_scene(2).await.unwrap();
    assert_eq!(source.cache_stats().await.resident_chunks, 0);

    let data = source.read(&Selection::all().t(1).c(0).z(3)).await.unwrap();
    assert_eq!(data.bytes()[0], czi_value(2, 1, 0, 3));

    // Selecting the current scene again keeps its chunks.
    source.set_scene(2).await.unwrap();
    assert_eq!(source.cache_stats().await.resident_chunks, 1);
}

// =============================================================================
// Bounded Cache
// =============================================================================

#[tokio::test]
async fn test_bounded_cache_evicts_and_refetches() {
    let plane = WIDTH * HEIGHT;
    let config = ReaderConfig {
        cache_max_bytes: Some(plane * 2),
        ..ReaderConfig::default()
    };
    let (source, _) = open_czi(config).await;

    let data = source.read(&Selection::all().t(0).c(0)).await.unwrap();
    for z in 0..5 {
        assert_eq!(data.bytes()[z * plane], czi_value(0, 0, 0, z));
    }

    let stats = source.cache_stats().await;
    assert!(stats.resident_bytes <= plane * 2);
    assert_eq!(stats.resident_chunks + stats.evictions as usize, 5);

    // At most two planes stayed resident, so a second pass refetches the rest.
    let again = source.read(&Selection::all().t(0).c(0)).await.unwrap();
    assert_eq!(again.bytes(), data.bytes());
    assert!(source.cache_stats().await.fetches >= 8);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_abandoned_read_keeps_completed_chunks() {
    let reader = SlowReader::new(build_czi(1, 1, 1, 4, 64, 64), "mem://slow.czi");
    let handle = reader.clone();
    let source = BioReader::default()
        .open_reader(Arc::new(reader))
        .await
        .unwrap();

    source.read(&Selection::all().z(0)).await.unwrap();
    assert_eq!(source.cache_stats().await.fetches, 1);

    // The uncached planes stall; the read is dropped while they are in flight.
    handle.set_delay(Duration::from_secs(30));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), source.read(&Selection::all().z(0..3)))
            .await;
    assert!(abandoned.is_err());

    let stats = source.cache_stats().await;
    assert_eq!(stats.resident_chunks, 1);
    let fetches_before = stats.fetches;

    handle.set_delay(Duration::ZERO);
    let data = source.read(&Selection::all().z(0..3)).await.unwrap();
    assert_eq!(data.shape(), [1, 1, 3, 64, 64]);
    let array = data.to_ndarray::<u8>().unwrap();
    for z in 0..3 {
        assert_eq!(array[[0, 0, z, 63, 63]], czi_value(0, 0, 0, z));
    }

    // Only the two planes that never completed are fetched again.
    let stats = source.cache_stats().await;
    assert_eq!(stats.fetches - fetches_before, 2);
    assert_eq!(stats.resident_chunks, 3);
}
