//! Configuration management for bioimage-streamer.
//!
//! Two layers live here:
//! - [`ReaderConfig`], a plain struct consumed by the library
//! - the clap CLI ([`Cli`]), whose options can also be set through
//!   environment variables with the `BIOIO_` prefix
//!
//! # Environment Variables
//!
//! - `BIOIO_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `BIOIO_S3_REGION` - AWS region (default: us-east-1)
//! - `BIOIO_CACHE_MAX` - Chunk cache ceiling per source, e.g. `512MB` (default: unbounded)
//! - `BIOIO_MAX_CONCURRENT_READS` - Parallel chunk fetches (default: 16)
//! - `BIOIO_CONCURRENCY_SCOPE` - `per-source` or `shared` (default: per-source)
//! - `BIOIO_RETRY_ATTEMPTS` - Attempts per remote read (default: 4)
//! - `BIOIO_RETRY_BACKOFF_MS` - First backoff delay (default: 100)
//! - `BIOIO_RETRY_MAX_BACKOFF_MS` - Backoff ceiling (default: 5000)
//! - `BIOIO_REQUEST_TIMEOUT_SECS` - Per-attempt timeout (default: 30)
//! - `BIOIO_BRIDGE_COMMAND` - Legacy bridge executable (default: disabled)

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::io::{RetryPolicy, DEFAULT_BLOCK_SIZE};

// =============================================================================
// Default Values
// =============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default number of chunk fetches allowed in flight.
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 16;

/// Default number of leading bytes handed to the detector.
pub const DEFAULT_DETECT_PREFIX_LEN: usize = 4096;

/// Default number of metadata blocks kept while a backend opens.
pub const DEFAULT_METADATA_BLOCK_CAPACITY: usize = 64;

/// Default tile edge for the pyramid writer.
pub const DEFAULT_TILE_SIZE: u32 = 256;

// =============================================================================
// Library configuration
// =============================================================================

/// How the chunk-fetch concurrency ceiling is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConcurrencyScope {
    /// Every opened source gets its own ceiling.
    #[default]
    PerSource,
    /// All sources opened by one reader share a single ceiling.
    Shared,
}

/// Settings for the external legacy bridge process.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Settings used when opening and reading sources.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Chunk cache ceiling per source in bytes; `None` keeps every chunk.
    pub cache_max_bytes: Option<usize>,
    pub max_concurrent_reads: usize,
    pub concurrency_scope: ConcurrencyScope,
    pub retry: RetryPolicy,
    pub detect_prefix_len: usize,
    pub metadata_block_size: usize,
    pub metadata_block_capacity: usize,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub bridge: Option<BridgeConfig>,
    /// Fall back to the `image` crate for PNG/JPEG inputs.
    pub generic_fallback: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: None,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            concurrency_scope: ConcurrencyScope::PerSource,
            retry: RetryPolicy::default(),
            detect_prefix_len: DEFAULT_DETECT_PREFIX_LEN,
            metadata_block_size: DEFAULT_BLOCK_SIZE,
            metadata_block_capacity: DEFAULT_METADATA_BLOCK_CAPACITY,
            s3_endpoint: None,
            s3_region: DEFAULT_REGION.to_string(),
            bridge: None,
            generic_fallback: true,
        }
    }
}

impl ReaderConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_reads == 0 {
            return Err("max_concurrent_reads must be greater than 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry multiplier must be at least 1.0".to_string());
        }
        if self.detect_prefix_len < 1024 {
            return Err("detect_prefix_len must be at least 1KB".to_string());
        }
        if self.metadata_block_size < 1024 || self.metadata_block_size > 16 * 1024 * 1024 {
            return Err("metadata_block_size must be between 1KB and 16MB".to_string());
        }
        if self.metadata_block_capacity == 0 {
            return Err("metadata_block_capacity must be greater than 0".to_string());
        }
        if let Some(0) = self.cache_max_bytes {
            return Err("cache ceiling must be greater than 0 (omit it for unbounded)".to_string());
        }
        if let Some(bridge) = &self.bridge {
            if bridge.command.trim().is_empty() {
                return Err("bridge command must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Parse a human byte size such as `512MB`, `2GiB` or `1048576`.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid byte size: {:?}", input))?;

    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" | "K" | "KIB" => 1024.0,
        "MB" | "M" | "MIB" => 1024.0 * 1024.0,
        "GB" | "G" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("unknown byte size unit: {:?}", other)),
    };

    Ok((value * multiplier) as usize)
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// bioimage-streamer - lazy access to microscopy images on disk and in object storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "bioimage-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print normalized metadata for an image.
    Info(InfoConfig),
    /// Convert an image to OME-TIFF.
    Convert(ConvertConfig),
}

/// Options shared by every command that opens a source.
#[derive(Args, Debug, Clone)]
pub struct ReaderArgs {
    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "BIOIO_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "BIOIO_S3_REGION")]
    pub s3_region: String,

    /// Chunk cache ceiling per source (e.g. 512MB). Unbounded when omitted.
    #[arg(long, env = "BIOIO_CACHE_MAX")]
    pub cache_max: Option<String>,

    /// Maximum chunk fetches in flight.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_READS, env = "BIOIO_MAX_CONCURRENT_READS")]
    pub max_concurrent_reads: usize,

    /// Whether the fetch ceiling applies per source or across all sources.
    #[arg(long, value_enum, default_value_t = ConcurrencyScope::PerSource, env = "BIOIO_CONCURRENCY_SCOPE")]
    pub concurrency_scope: ConcurrencyScope,

    /// Attempts per remote read before the source counts as unreachable.
    #[arg(long, default_value_t = crate::io::DEFAULT_MAX_ATTEMPTS, env = "BIOIO_RETRY_ATTEMPTS")]
    pub retry_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, default_value_t = 100, env = "BIOIO_RETRY_BACKOFF_MS")]
    pub retry_backoff_ms: u64,

    /// Ceiling for a single retry delay, in milliseconds.
    #[arg(long, default_value_t = 5000, env = "BIOIO_RETRY_MAX_BACKOFF_MS")]
    pub retry_max_backoff_ms: u64,

    /// Per-attempt timeout in seconds (0 disables it).
    #[arg(long, default_value_t = 30, env = "BIOIO_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Executable for the legacy format bridge. Disabled when omitted.
    #[arg(long, env = "BIOIO_BRIDGE_COMMAND")]
    pub bridge_command: Option<String>,

    /// Arguments passed to the bridge executable.
    #[arg(long, env = "BIOIO_BRIDGE_ARGS", value_delimiter = ',')]
    pub bridge_args: Vec<String>,

    /// Do not fall back to the generic PNG/JPEG reader.
    #[arg(long, default_value_t = false)]
    pub no_generic_fallback: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ReaderArgs {
    /// Build the library configuration from CLI options.
    pub fn to_reader_config(&self) -> Result<ReaderConfig, String> {
        let cache_max_bytes = self.cache_max.as_deref().map(parse_byte_size).transpose()?;

        let retry = RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            attempt_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        };

        let bridge = self.bridge_command.as_ref().map(|command| BridgeConfig {
            command: command.clone(),
            args: self.bridge_args.clone(),
        });

        let config = ReaderConfig {
            cache_max_bytes,
            max_concurrent_reads: self.max_concurrent_reads,
            concurrency_scope: self.concurrency_scope,
            retry,
            s3_endpoint: self.s3_endpoint.clone(),
            s3_region: self.s3_region.clone(),
            bridge,
            generic_fallback: !self.no_generic_fallback,
            ..ReaderConfig::default()
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration for the `info` command.
#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Path or URI of the image (local path, file://, s3://, http(s)://).
    pub uri: String,

    /// Scene to describe.
    #[arg(long, default_value_t = 0)]
    pub scene: usize,

    /// Print metadata as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[command(flatten)]
    pub reader: ReaderArgs,
}

/// Configuration for the `convert` command.
#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    /// Path or URI of the input image.
    pub input: String,

    /// Destination path or s3:// URI.
    pub output: String,

    /// Output format (ome-tiff or ome-tiff-pyramid).
    #[arg(long, default_value = "ome-tiff")]
    pub format: String,

    /// Scene to convert.
    #[arg(long, default_value_t = 0)]
    pub scene: usize,

    /// Tile edge for pyramidal output (multiple of 16).
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_size: u32,

    /// Number of reduced-resolution levels (default: until one tile remains).
    #[arg(long)]
    pub levels: Option<usize>,

    /// Pixel compression (none or deflate).
    #[arg(long, default_value = "deflate")]
    pub compression: String,

    #[command(flatten)]
    pub reader: ReaderArgs,
}

impl ConvertConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size == 0 || self.tile_size % 16 != 0 {
            return Err("tile_size must be a positive multiple of 16".to_string());
        }
        if self.input == self.output {
            return Err("input and output must differ".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
