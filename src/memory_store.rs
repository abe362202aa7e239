//! The in-memory tier: a thread-safe, cost-bounded map from key to [DecodedImage].
//!
//! Eviction is least-recently-used by cost, see [CostLru].  A lookup through [MemoryStore::get] counts as a use.
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::*;

/// Default capacity of the memory tier, in bytes of pixels.
pub const DEFAULT_MEMORY_COST_LIMIT: u64 = 10 * 1024 * 1024;

pub struct MemoryStore {
    images: Mutex<CostLru<DecodedImage>>,
}

impl MemoryStore {
    pub fn new(cost_limit: u64) -> MemoryStore {
        MemoryStore {
            images: Mutex::new(CostLru::new(cost_limit)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<DecodedImage>> {
        self.images.lock().unwrap().get(key)
    }

    /// Insert or replace `key`, evicting older entries if the total cost goes over the limit.
    pub fn put(&self, key: &str, image: Arc<DecodedImage>, cost: u64) {
        let mut guard = self.images.lock().unwrap();
        let before = guard.len();
        let replaced = guard.insert(key.into(), image, cost).is_some();
        let expected = if replaced { before } else { before + 1 };
        if guard.len() < expected {
            debug!(
                key,
                cost,
                total_cost = guard.total_cost(),
                "memory tier evicted to stay under its limit"
            );
        }
    }

    /// Evict down to at most `target` bytes, returning how many images were dropped.
    pub fn trim_to(&self, target: u64) -> usize {
        self.images.lock().unwrap().trim_to(target)
    }

    pub fn clear(&self) {
        self.images.lock().unwrap().clear();
    }

    pub fn total_cost(&self) -> u64 {
        self.images.lock().unwrap().total_cost()
    }

    pub fn limit(&self) -> u64 {
        self.images.lock().unwrap().limit()
    }

    pub fn len(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new(DEFAULT_MEMORY_COST_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(side: u32, fill: u8) -> Arc<DecodedImage> {
        let len = (side * side * 4) as usize;
        Arc::new(DecodedImage::new(side, side, vec![fill; len]).unwrap())
    }

    #[test]
    fn test_put_get_clear() {
        let store = MemoryStore::default();
        assert_eq!(store.limit(), 10 * 1024 * 1024);

        let a = image(2, 1);
        store.put("a", a.clone(), a.cost());
        assert_eq!(store.get("a").unwrap().pixels(), a.pixels());
        assert!(store.get("b").is_none());
        assert_eq!(store.total_cost(), 16);

        store.clear();
        assert!(store.get("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_keeps_cost_accurate() {
        let store = MemoryStore::new(1000);
        let small = image(2, 1);
        let big = image(4, 2);
        store.put("k", small.clone(), small.cost());
        store.put("k", big.clone(), big.cost());
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_cost(), 64);
        assert_eq!(store.get("k").unwrap().pixels()[0], 2);
    }

    #[test]
    fn test_stays_under_limit() {
        // Room for four 2x2 images.
        let store = MemoryStore::new(64);
        for i in 0..20u8 {
            let img = image(2, i);
            store.put(&i.to_string(), img.clone(), img.cost());
            assert!(store.total_cost() <= 64);
        }
        assert_eq!(store.len(), 4);
        assert!(store.get("19").is_some());
        assert!(store.get("0").is_none());
    }

    #[test]
    fn test_concurrent_put_get() {
        let store = Arc::new(MemoryStore::new(16 * 50));
        let handles = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let key = format!("{}-{}", t, i % 25);
                        let img = image(2, t as u8);
                        store.put(&key, img.clone(), img.cost());
                        if let Some(found) = store.get(&key) {
                            assert_eq!(found.pixels()[0], t as u8);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert!(store.total_cost() <= 16 * 50);
    }

    #[test]
    fn test_trim_to() {
        let store = MemoryStore::new(1000);
        for i in 0..10u8 {
            let img = image(2, i);
            store.put(&i.to_string(), img.clone(), img.cost());
        }
        assert_eq!(store.trim_to(80), 5);
        assert_eq!(store.total_cost(), 80);
    }
}
