use thiserror::Error;

/// I/O errors that can occur when reading from local or remote storage
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Non-success HTTP status that is not worth retrying
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A single attempt did not complete in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The remote store asked us to slow down
    #[error("Request throttled: {0}")]
    Throttled(String),

    /// Local filesystem error
    #[error("Local I/O error: {0}")]
    Local(String),

    /// URI could not be parsed or uses an unknown scheme
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Transient failures persisted through every retry attempt
    #[error("Source unreachable after {attempts} attempts: {identifier}: {message}")]
    Unreachable {
        identifier: String,
        attempts: u32,
        message: String,
    },
}

impl IoError {
    /// Whether the retry layer should try this operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IoError::Timeout(_) | IoError::Throttled(_) | IoError::Connection(_)
        )
    }
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// The IFD chain loops back on itself
    #[error("IFD chain revisits offset {0}")]
    IfdCycle(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Unsupported combination of bits per sample and sample format
    #[error("Unsupported sample layout: {0}")]
    UnsupportedSampleLayout(String),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),
}

/// Errors raised by format backends while detecting, opening or decoding.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF parsing error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// No backend recognizes the input
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Structure is damaged or truncated
    #[error("Corrupt file: {reason}")]
    Corrupt { reason: String },

    /// Structure is valid but uses a feature this backend does not read
    #[error("Unsupported variant: {reason}")]
    UnsupportedVariant { reason: String },

    /// Embedded XML could not be parsed
    #[error("XML error: {0}")]
    Xml(String),

    /// Pixel payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The legacy bridge process failed or answered with an error
    #[error("Bridge error: {0}")]
    Bridge(String),
}

impl FormatError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        FormatError::Corrupt {
            reason: reason.into(),
        }
    }

    pub fn unsupported_variant(reason: impl Into<String>) -> Self {
        FormatError::UnsupportedVariant {
            reason: reason.into(),
        }
    }

    /// The adapter-level cause, when this error came from I/O.
    pub fn io_cause(&self) -> Option<&IoError> {
        match self {
            FormatError::Io(e) | FormatError::Tiff(TiffError::Io(e)) => Some(e),
            _ => None,
        }
    }

    /// Classify an error raised while opening a source.
    pub fn into_image_error(self, source_id: &str) -> ImageError {
        if let Some(io) = self.io_cause() {
            return ImageError::from_io(io.clone(), source_id);
        }

        let source_id = source_id.to_string();
        match self {
            FormatError::UnsupportedFormat { reason } => {
                ImageError::UnsupportedFormat { source_id, reason }
            }
            FormatError::UnsupportedVariant { reason } => {
                ImageError::UnsupportedVariant { source_id, reason }
            }
            FormatError::Tiff(
                e @ (TiffError::UnsupportedCompression(_) | TiffError::UnsupportedSampleLayout(_)),
            ) => ImageError::UnsupportedVariant {
                source_id,
                reason: e.to_string(),
            },
            other => ImageError::CorruptFile {
                source_id,
                reason: other.to_string(),
            },
        }
    }
}

/// Errors surfaced to callers of the reader/writer API.
///
/// Every variant carries enough context (source identity, scene, chunk
/// coordinates) to diagnose the failure without re-running it.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// No backend detects the input
    #[error("Unsupported format for {source_id}: {reason}")]
    UnsupportedFormat { source_id: String, reason: String },

    /// Structural validation failed while opening
    #[error("Corrupt file {source_id}: {reason}")]
    CorruptFile { source_id: String, reason: String },

    /// The file is well formed but uses a variant that is not readable
    #[error("Unsupported variant in {source_id}: {reason}")]
    UnsupportedVariant { source_id: String, reason: String },

    /// A chunk could not be read or decoded
    #[error("Chunk read failed for {source_id} (scene {scene}, chunk {coords:?}): {reason}")]
    ChunkRead {
        source_id: String,
        scene: usize,
        coords: [usize; 5],
        reason: String,
    },

    /// Remote I/O exhausted its retries
    #[error("Source unreachable: {identifier} after {attempts} attempts: {message}")]
    UnreachableSource {
        identifier: String,
        attempts: u32,
        message: String,
    },

    /// Requested scene is outside [0, scene_count)
    #[error("Scene index {requested} out of range for {source_id} ({scene_count} scenes)")]
    SceneIndex {
        source_id: String,
        requested: usize,
        scene_count: usize,
    },

    /// A writer needs a metadata field that is unknown
    #[error("Incomplete metadata: {0}")]
    IncompleteMetadata(String),

    /// No writer exists for the requested format
    #[error("Unsupported output format: {0}")]
    UnsupportedOutputFormat(String),

    /// Selection does not fit the array shape
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// Non-transient adapter failure (missing object, bad URI, local error)
    #[error("I/O error for {source_id}: {error}")]
    Io { source_id: String, error: IoError },

    /// Writing output failed
    #[error("Write failed: {0}")]
    Write(String),
}

impl ImageError {
    /// Classify an adapter error for a given source.
    pub fn from_io(error: IoError, source_id: &str) -> Self {
        match error {
            IoError::Unreachable {
                identifier,
                attempts,
                message,
            } => ImageError::UnreachableSource {
                identifier,
                attempts,
                message,
            },
            IoError::RangeOutOfBounds { .. } => ImageError::CorruptFile {
                source_id: source_id.to_string(),
                reason: format!("truncated: {}", error),
            },
            error => ImageError::Io {
                source_id: source_id.to_string(),
                error,
            },
        }
    }

    /// Classify an error raised by a backend while reading one chunk.
    pub fn chunk_read(err: FormatError, source_id: &str, scene: usize, coords: [usize; 5]) -> Self {
        if let Some(IoError::Unreachable {
            identifier,
            attempts,
            message,
        }) = err.io_cause()
        {
            return ImageError::UnreachableSource {
                identifier: identifier.clone(),
                attempts: *attempts,
                message: message.clone(),
            };
        }

        ImageError::ChunkRead {
            source_id: source_id.to_string(),
            scene,
            coords,
            reason: err.to_string(),
        }
    }
}
