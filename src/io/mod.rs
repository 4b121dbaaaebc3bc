//! Filesystem access adapter.
//!
//! Random-access range reads over local files, S3 objects and HTTP
//! resources, bounded retry for transient remote failures, and sequential
//! sinks for writers.

mod block_cache;
mod http_reader;
mod local_reader;
mod memory_reader;
mod range_reader;
mod retry;
mod s3_reader;
mod sink;
mod uri;

pub use block_cache::{BlockCache, DEFAULT_BLOCK_SIZE};
pub use http_reader::HttpRangeReader;
pub use local_reader::LocalRangeReader;
pub use memory_reader::MemoryReader;
pub use range_reader::{
    check_range, read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le,
    RangeReader,
};
pub use retry::{
    RetryPolicy, RetryingReader, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
};
pub use s3_reader::{create_s3_client, S3RangeReader};
pub use sink::{ByteSink, LocalSink, MemorySink, S3Sink, MULTIPART_PART_SIZE};
pub use uri::{open_reader, open_sink, SourceUri};
