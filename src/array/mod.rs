//! Lazy chunked arrays.
//!
//! - [`LazyArray`]: deferred `TCZYX` view over one scene
//! - [`ChunkCache`]: per-source singleflight cache of decoded chunks
//! - [`Selection`]: per-axis index/range selections
//! - [`ImageData`]: materialized result, convertible to `ndarray`

mod chunk_cache;
mod data;
mod lazy;
mod selection;

pub use chunk_cache::{CacheStats, ChunkCache, ChunkKey};
pub use data::{ImageData, Sample};
pub use lazy::LazyArray;
pub use selection::{AxisSelection, Selection};
