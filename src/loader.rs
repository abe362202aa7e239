//! The [Loader] ties the tiers together.
//!
//! A [Loader::load] looks in three places, in order:
//!
//! - The [MemoryStore], which returns immediately on a hit.
//! - The [DiskStore], whose hits are put back into memory.
//! - The [ImageSource].  Its images go into memory before `load` returns, and are queued for a background write to
//!   disk.
//!
//! Failures in any tier are logged and treated as a miss, so the only way `load` fails is by returning `None`.  Two
//! callers missing on the same key at once will both decode it and both queue a write; the last write wins, and both
//! writes are the same image.
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::*;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct LoaderConfig {
    /// Directory holding the raw pixel files.  Created if missing.
    #[builder(setter(into))]
    pub cache_dir: PathBuf,
    /// Maximum total cost of the memory tier, in bytes of pixels.
    #[builder(default = "DEFAULT_MEMORY_COST_LIMIT")]
    pub memory_cost_limit: u64,
    /// How many disk writes may be waiting before new ones are dropped.
    #[builder(default = "64")]
    pub write_queue_capacity: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("unable to set up the disk cache: {0}")]
    Io(#[from] std::io::Error),
}

/// Counts of how `load` calls were answered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoaderStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub source_decodes: u64,
    pub misses: u64,
    pub dropped_writes: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    source_decodes: AtomicU64,
    misses: AtomicU64,
    dropped_writes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Loader<SourceImpl: ImageSource> {
    memory: MemoryStore,
    disk: Arc<DiskStore>,
    writer: WriteBackQueue,
    source: SourceImpl,
    counters: Counters,
}

impl<SourceImpl: ImageSource> Loader<SourceImpl> {
    pub fn new(source: SourceImpl, config: LoaderConfig) -> Result<Loader<SourceImpl>, LoaderError> {
        let disk = Arc::new(DiskStore::new(config.cache_dir)?);
        let writer = WriteBackQueue::start(disk.clone(), config.write_queue_capacity)?;
        debug!(dir = %disk.dir().display(), memory_cost_limit = config.memory_cost_limit, "image loader ready");

        Ok(Loader {
            memory: MemoryStore::new(config.memory_cost_limit),
            disk,
            writer,
            source,
            counters: Default::default(),
        })
    }

    /// Get an image from whichever tier has it first, populating the faster tiers on the way back.
    pub fn load(&self, key: &str) -> Option<Arc<DecodedImage>> {
        if let Some(x) = self.memory.get(key) {
            bump(&self.counters.memory_hits);
            return Some(x);
        }

        if let Some(x) = self.disk.read(key) {
            debug!(key, "disk cache hit");
            bump(&self.counters.disk_hits);
            let x = Arc::new(x);
            self.memory.put(key, x.clone(), x.cost());
            return Some(x);
        }

        let decoded = match self.source.decode(key) {
            Ok(Some(x)) => x,
            Ok(None) => {
                debug!(key, "image not found in any tier");
                bump(&self.counters.misses);
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "image source failed");
                bump(&self.counters.misses);
                return None;
            }
        };

        debug!(key, "decoded image from source");
        bump(&self.counters.source_decodes);
        let decoded = Arc::new(decoded);
        // Memory first, so that the next load is a hit regardless of how far behind the writer is.
        self.memory.put(key, decoded.clone(), decoded.cost());
        if !self.writer.submit(key, decoded.clone()) {
            bump(&self.counters.dropped_writes);
        }
        Some(decoded)
    }

    /// Look only in the memory tier.
    pub fn cached_image(&self, key: &str) -> Option<Arc<DecodedImage>> {
        self.memory.get(key)
    }

    /// Look only in the disk tier, without populating memory.
    pub fn saved_image(&self, key: &str) -> Option<DecodedImage> {
        self.disk.read(key)
    }

    /// Empty the memory tier and delete every cache file.
    ///
    /// Writes still queued when this is called may land afterwards.  Call [Loader::flush] first to rule that out.
    pub fn purge_cache(&self) {
        self.memory.clear();
        self.disk.purge();
    }

    /// Respond to a low memory signal by shrinking the memory tier to half its limit.
    pub fn relieve_memory_pressure(&self) -> usize {
        let evicted = self.memory.trim_to(self.memory.limit() / 2);
        debug!(evicted, "trimmed memory tier under memory pressure");
        evicted
    }

    /// Wait for every disk write queued so far to finish.
    pub fn flush(&self) {
        self.writer.flush();
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.counters;
        LoaderStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            source_decodes: c.source_decodes.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            dropped_writes: c.dropped_writes.load(Ordering::Relaxed),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }
}
