//! A [CostLru] is an LRU map whose capacity is a total cost rather than an entry count.
//!
//! Storage is a `Vec` of slots threaded into a doubly linked recency list, with vacated slots chained into a free
//! list for reuse, plus an `ahash` index from key to slot.  Values are stored behind `Arc` so that callers can hold on
//! to them after eviction.
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

struct Live<V> {
    key: Arc<str>,
    value: Arc<V>,
    cost: u64,
    /// Towards the most recent end.
    newer: Option<usize>,
    /// Towards the least recent end.
    older: Option<usize>,
}

enum Slot<V> {
    Vacant { next_free: Option<usize> },
    Live(Live<V>),
}

impl<V> Slot<V> {
    fn live(&self) -> &Live<V> {
        match self {
            Slot::Live(x) => x,
            Slot::Vacant { .. } => panic!("Slot should be live"),
        }
    }

    fn live_mut(&mut self) -> &mut Live<V> {
        match self {
            Slot::Live(x) => x,
            Slot::Vacant { .. } => panic!("Slot should be live"),
        }
    }
}

pub struct CostLru<V> {
    slots: Vec<Slot<V>>,
    index: HashMap<Arc<str>, usize, RandomState>,
    newest: Option<usize>,
    oldest: Option<usize>,
    free_head: Option<usize>,
    limit: u64,
    total_cost: u64,
}

impl<V> CostLru<V> {
    pub fn new(limit: u64) -> CostLru<V> {
        CostLru {
            slots: Default::default(),
            index: Default::default(),
            newest: None,
            oldest: None,
            free_head: None,
            limit,
            total_cost: 0,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Take a live slot out of the recency list, leaving its own links stale.
    fn detach(&mut self, slot: usize) {
        let (newer, older) = {
            let l = self.slots[slot].live();
            (l.newer, l.older)
        };

        match newer {
            Some(n) => self.slots[n].live_mut().older = older,
            None => self.newest = older,
        }
        match older {
            Some(o) => self.slots[o].live_mut().newer = newer,
            None => self.oldest = newer,
        }
    }

    /// Link a detached live slot in as the most recent.
    fn attach_newest(&mut self, slot: usize) {
        let old_newest = self.newest;
        {
            let l = self.slots[slot].live_mut();
            l.newer = None;
            l.older = old_newest;
        }
        match old_newest {
            Some(n) => self.slots[n].live_mut().newer = Some(slot),
            None => self.oldest = Some(slot),
        }
        self.newest = Some(slot);
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<V>> {
        let slot = *self.index.get(key)?;
        self.detach(slot);
        self.attach_newest(slot);
        Some(self.slots[slot].live().value.clone())
    }

    /// Like [CostLru::get], but leaves recency alone.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        let slot = *self.index.get(key)?;
        Some(self.slots[slot].live().value.clone())
    }

    /// Free a live slot, returning its value.  The caller has already dropped it from the index.
    fn vacate(&mut self, slot: usize) -> Arc<V> {
        self.detach(slot);
        let old = std::mem::replace(
            &mut self.slots[slot],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(slot);
        let live = match old {
            Slot::Live(l) => l,
            Slot::Vacant { .. } => panic!("Slot should have been live"),
        };
        self.total_cost -= live.cost;
        live.value
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<V>> {
        let slot = self.index.remove(key)?;
        Some(self.vacate(slot))
    }

    fn take_free_slot(&mut self) -> usize {
        if let Some(s) = self.free_head {
            self.free_head = match self.slots[s] {
                Slot::Vacant { next_free } => next_free,
                Slot::Live(_) => panic!("Free list points at a live slot"),
            };
            return s;
        }

        self.slots.push(Slot::Vacant { next_free: None });
        self.slots.len() - 1
    }

    /// Insert or replace `key` as the most recent entry, then evict until back under the limit.
    ///
    /// Returns the previous value for `key`, if any.  If `cost` alone exceeds the limit, the new entry is itself
    /// evicted before this returns.
    pub fn insert(&mut self, key: Arc<str>, value: Arc<V>, cost: u64) -> Option<Arc<V>> {
        let previous = self.remove(&key);
        let slot = self.take_free_slot();
        self.slots[slot] = Slot::Live(Live {
            key: key.clone(),
            value,
            cost,
            newer: None,
            older: None,
        });
        self.attach_newest(slot);
        self.index.insert(key, slot);
        self.total_cost += cost;

        self.trim_to(self.limit);
        previous
    }

    /// Evict least recently used entries until the total cost is at most `target`.  Returns how many were evicted.
    pub fn trim_to(&mut self, target: u64) -> usize {
        let mut evicted = 0;
        while self.total_cost > target {
            let slot = self
                .oldest
                .expect("Total cost is nonzero, so there must be an entry");
            let key = self.slots[slot].live().key.clone();
            self.index.remove(&key);
            self.vacate(slot);
            evicted += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.newest = None;
        self.oldest = None;
        self.free_head = None;
        self.total_cost = 0;
    }

    /// Iterate from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        let mut cursor = self.newest;
        std::iter::from_fn(move || {
            let live = self.slots[cursor?].live();
            cursor = live.older;
            Some((&*live.key, &*live.value))
        })
    }
}
