//! Retry behavior of remote sources.
//!
//! Tests verify:
//! - Transient failures are retried and the open succeeds
//! - An attempt that stalls past its timeout is retried
//! - Exhausted retries surface as `UnreachableSource`
//! - Permanent failures are not retried

use std::sync::Arc;
use std::time::Duration;

use bioimage_streamer::array::Selection;
use bioimage_streamer::error::{ImageError, IoError};
use bioimage_streamer::io::{RetryPolicy, RetryingReader};
use bioimage_streamer::source::BioReader;

use super::test_utils::{build_czi, czi_value, Failure, FlakyReader};

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        multiplier: 2.0,
        max_backoff: Duration::from_millis(5),
        attempt_timeout: Some(Duration::from_millis(50)),
    }
}

#[tokio::test]
async fn test_two_timeouts_then_success() {
    let flaky = FlakyReader::new(
        build_czi(1, 1, 1, 2, 8, 8),
        "s3://bucket/cells.czi",
        2,
        Failure::Error(IoError::Timeout("slow store".into())),
    );
    let reader = Arc::new(RetryingReader::new(flaky.clone(), fast_policy(4)));

    let source = BioReader::default().open_reader(reader).await.unwrap();
    assert_eq!(source.shape(), [1, 1, 2, 8, 8]);

    let plane = source.read(&Selection::all().z(1)).await.unwrap();
    assert_eq!(plane.bytes()[0], czi_value(0, 0, 0, 1));
    // Two failed attempts on the first read, then everything succeeded.
    assert!(flaky.calls() >= 3);
}

#[tokio::test]
async fn test_stalled_attempts_time_out_and_retry() {
    let flaky = FlakyReader::new(
        build_czi(1, 1, 1, 1, 4, 4),
        "https://example.org/cells.czi",
        2,
        Failure::Stall(Duration::from_millis(500)),
    );
    let reader = Arc::new(RetryingReader::new(flaky.clone(), fast_policy(3)));

    let source = BioReader::default().open_reader(reader).await.unwrap();
    assert_eq!(source.shape(), [1, 1, 1, 4, 4]);
}

#[tokio::test]
async fn test_retry_exhaustion_is_unreachable() {
    let flaky = FlakyReader::new(
        build_czi(1, 1, 1, 1, 4, 4),
        "s3://bucket/down.czi",
        usize::MAX,
        Failure::Error(IoError::Connection("connection reset".into())),
    );
    let reader = Arc::new(RetryingReader::new(flaky.clone(), fast_policy(3)));

    match BioReader::default().open_reader(reader).await {
        Err(ImageError::UnreachableSource {
            identifier,
            attempts,
            message,
        }) => {
            assert_eq!(identifier, "s3://bucket/down.czi");
            assert_eq!(attempts, 3);
            assert!(message.contains("connection reset"));
        }
        Err(other) => panic!("expected UnreachableSource, got {other:?}"),
        Ok(_) => panic!("expected UnreachableSource, got a source"),
    }
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let flaky = FlakyReader::new(
        build_czi(1, 1, 1, 1, 4, 4),
        "s3://bucket/gone.czi",
        usize::MAX,
        Failure::Error(IoError::NotFound("s3://bucket/gone.czi".into())),
    );
    let reader = Arc::new(RetryingReader::new(flaky.clone(), fast_policy(5)));

    let result = BioReader::default().open_reader(reader).await;
    assert!(matches!(
        result,
        Err(ImageError::Io {
            error: IoError::NotFound(_),
            ..
        })
    ));
    assert_eq!(flaky.calls(), 1);
}
