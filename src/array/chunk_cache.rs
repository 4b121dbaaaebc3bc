//! Singleflight chunk cache owned by one image source.
//!
//! Every chunk lives in a [`Slot`] holding a `OnceCell`. The first caller
//! for a chunk runs the fetch; concurrent callers await the same cell. When
//! the fetch fails the cell stays empty and the next waiter runs its own
//! fetch, so failures are never cached. An empty slot nobody waits on is
//! removed.
//!
//! # Eviction
//!
//! The cache is unbounded by default. With a byte ceiling, completed chunks
//! are evicted least-recently-used first once `resident_bytes` exceeds the
//! ceiling. Slots whose fetch is still in flight are never evicted.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// Chunk identity within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub scene: usize,

    /// Chunk grid index along T, C, Z, Y, X
    pub index: [usize; 5],
}

/// Counters describing cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from a completed slot
    pub hits: u64,

    /// Lookups that had to wait for or perform a fetch
    pub misses: u64,

    /// Backend reads actually issued
    pub fetches: u64,
    pub evictions: u64,
    pub resident_bytes: usize,
    pub resident_chunks: usize,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Bytes>,

    /// Whether the slot's bytes are counted in `resident_bytes`
    charged: AtomicBool,
}

struct CacheState {
    slots: LruCache<ChunkKey, Arc<Slot>>,
    resident_bytes: usize,
    resident_chunks: usize,
}

pub struct ChunkCache {
    state: Mutex<CacheState>,
    max_bytes: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

impl ChunkCache {
    /// Create a cache; `None` keeps every chunk.
    pub fn new(max_bytes: Option<usize>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: LruCache::unbounded(),
                resident_bytes: 0,
                resident_chunks: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }

    /// Return the cached chunk or run `fetch` once across concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns the fetch error to the caller whose fetch failed. Waiting
    /// callers retry with their own `fetch`.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: ChunkKey, fetch: F) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let slot = {
            let mut state = self.state.lock().await;
            match state.slots.get(&key) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(Slot::default());
                    state.slots.put(key, slot.clone());
                    slot
                }
            }
        };

        if let Some(data) = slot.cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fetched = slot
            .cell
            .get_or_try_init(|| {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(scene = key.scene, index = ?key.index, "fetching chunk");
                fetch()
            })
            .await;
        let data = match fetched {
            Ok(data) => data.clone(),
            Err(e) => {
                self.discard_empty(key, slot).await;
                return Err(e);
            }
        };

        self.charge(key, &slot, data.len()).await;
        Ok(data)
    }

    /// Remove a slot left empty by a failed fetch unless another caller
    /// still holds it.
    async fn discard_empty(&self, key: ChunkKey, slot: Arc<Slot>) {
        let mut state = self.state.lock().await;
        // Clones are only taken under the lock: the map and `slot` make two.
        let unshared = state
            .slots
            .peek(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
            && Arc::strong_count(&slot) <= 2;
        if unshared && slot.cell.get().is_none() {
            state.slots.pop(&key);
        }
    }

    /// Account for a completed slot and evict down to the ceiling.
    async fn charge(&self, key: ChunkKey, slot: &Arc<Slot>, len: usize) {
        let mut state = self.state.lock().await;

        // A slot dropped by `retain_scene` while fetching is not resident.
        let resident = state
            .slots
            .peek(&key)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        // `charged` is only touched under the state lock.
        if !resident || slot.charged.swap(true, Ordering::AcqRel) {
            return;
        }
        state.resident_bytes += len;
        state.resident_chunks += 1;

        let Some(max_bytes) = self.max_bytes else {
            return;
        };
        if state.resident_bytes <= max_bytes {
            return;
        }

        // Least recently used first, skipping the new chunk and unfinished slots.
        let mut excess = state.resident_bytes - max_bytes;
        let mut victims = Vec::new();
        for (candidate, s) in state.slots.iter().rev() {
            if excess == 0 {
                break;
            }
            if *candidate == key || !s.charged.load(Ordering::Acquire) {
                continue;
            }
            if let Some(data) = s.cell.get() {
                victims.push(*candidate);
                excess = excess.saturating_sub(data.len());
            }
        }

        for victim in victims {
            if let Some(evicted) = state.slots.pop(&victim) {
                let bytes = evicted.cell.get().map_or(0, Bytes::len);
                state.resident_bytes -= bytes;
                state.resident_chunks -= 1;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(scene = victim.scene, index = ?victim.index, bytes, "evicted chunk");
            }
        }
    }

    /// Drop every chunk that does not belong to `scene`.
    pub async fn retain_scene(&self, scene: usize) {
        let mut state = self.state.lock().await;
        let stale: Vec<ChunkKey> = state
            .slots
            .iter()
            .filter(|(key, _)| key.scene != scene)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            if let Some(slot) = state.slots.pop(key) {
                if slot.charged.load(Ordering::Acquire) {
                    let bytes = slot.cell.get().map_or(0, Bytes::len);
                    state.resident_bytes -= bytes;
                    state.resident_chunks -= 1;
                }
            }
        }
        debug!(scene, dropped = stale.len(), "dropped chunks of other scenes");
    }

    /// Number of keys tracked, completed or not.
    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_bytes: state.resident_bytes,
            resident_chunks: state.resident_chunks,
        }
    }
}
