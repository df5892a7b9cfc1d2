//! Builders for chain layers.
//!
//! Mirrors the teacher's `TierConfig`/`MultiTierCacheConfig` builder-with-
//! defaults pattern (`cache/tier.rs`, `cache/manager.rs`): a plain struct of
//! optional fields, consumed by value through chained setters, validated
//! only at `build()`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

use super::cache::CacheLayer;
use super::entry::Entry;
use super::store::BackingStore;
use super::Lower;

/// Bulk-seed shape for a fresh [`CacheLayer`]: either an already-ordered
/// sequence of pairs (oldest first) or an unordered map. Anything else is
/// rejected at `build()` with a configuration error, rather than accepted
/// silently, since key order at seed time determines initial LRU order.
pub enum InitValues<V> {
    Pairs(Vec<(String, V)>),
    Map(HashMap<String, V>),
}

impl<V> From<Vec<(String, V)>> for InitValues<V> {
    fn from(pairs: Vec<(String, V)>) -> Self {
        InitValues::Pairs(pairs)
    }
}

impl<V> From<HashMap<String, V>> for InitValues<V> {
    fn from(map: HashMap<String, V>) -> Self {
        InitValues::Map(map)
    }
}

/// Default capacity for a layer left unconfigured, matching spec.md §6.
const DEFAULT_CAPACITY: usize = 10;

/// Builder for a [`CacheLayer`], wired into an `Rc<RefCell<_>>` at `build()`
/// so the resulting handle can be shared as another layer's `lower`.
pub struct CacheLayerBuilder<V> {
    capacity: usize,
    init_values: Option<InitValues<V>>,
    lower: Option<Lower<V>>,
}

impl<V> Default for CacheLayerBuilder<V> {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            init_values: None,
            lower: None,
        }
    }
}

impl<V> CacheLayerBuilder<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn init_pairs(mut self, pairs: Vec<(String, V)>) -> Self {
        self.init_values = Some(InitValues::Pairs(pairs));
        self
    }

    pub fn init_map(mut self, map: HashMap<String, V>) -> Self {
        self.init_values = Some(InitValues::Map(map));
        self
    }

    pub fn lower(mut self, lower: Lower<V>) -> Self {
        self.lower = Some(lower);
        self
    }

    /// Validates capacity and seed shape, constructs the layer, inserts
    /// every seed pair dirty (per spec.md §6), and wires the new layer's
    /// `Rc` as the lower layer's `upper` back-pointer.
    pub fn build(self) -> Result<Rc<RefCell<CacheLayer<V>>>> {
        if self.capacity == 0 {
            return Err(Error::Configuration("capacity must be positive".into()));
        }

        let pairs: Vec<(String, V)> = match self.init_values {
            None => Vec::new(),
            Some(InitValues::Pairs(p)) => p,
            Some(InitValues::Map(m)) => m.into_iter().collect(),
        };
        if pairs.len() > self.capacity {
            return Err(Error::Configuration(format!(
                "init_values length {} exceeds capacity {}",
                pairs.len(),
                self.capacity
            )));
        }

        let mut entries = indexmap::IndexMap::with_capacity(self.capacity);
        for (k, v) in pairs {
            entries.insert(k, Entry::dirty(v));
        }

        let layer = Rc::new(RefCell::new(CacheLayer {
            capacity: self.capacity,
            entries,
            lower: self.lower.clone(),
            upper: None,
            pending_dirty_mark: None,
        }));

        match self.lower {
            Some(Lower::Cache(lower)) => {
                lower.borrow_mut().upper = Some(Rc::downgrade(&layer));
            }
            Some(Lower::Store(store)) => {
                store.borrow_mut().upper = Some(Rc::downgrade(&layer));
            }
            None => {}
        }

        Ok(layer)
    }
}

/// Builder for a [`BackingStore`]. The store starts closed; callers open it
/// explicitly (directly, or via [`super::scope::StoreScope`]).
pub struct BackingStoreBuilder {
    capacity: usize,
    dbname: Option<String>,
}

impl Default for BackingStoreBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            dbname: None,
        }
    }
}

impl BackingStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    pub fn build<V>(self) -> Result<Rc<RefCell<BackingStore<V>>>>
    where
        V: Clone + Serialize + DeserializeOwned + 'static,
    {
        if self.capacity == 0 {
            return Err(Error::Configuration("capacity must be positive".into()));
        }
        let dbname = self
            .dbname
            .ok_or_else(|| Error::Configuration("dbname is required".into()))?;

        Ok(Rc::new(RefCell::new(BackingStore {
            capacity: self.capacity,
            dbname,
            db: None,
            nondirty: HashMap::new(),
            upper: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rejects_non_positive_capacity() {
        let err = CacheLayerBuilder::<i32>::new().capacity(0).build().unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[test]
    fn rejects_oversized_init_values() {
        let pairs = vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)];
        let err = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(pairs)
            .build()
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[test]
    fn init_values_are_seeded_dirty() {
        let cache = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(vec![("a".to_string(), 1)])
            .build()
            .unwrap();
        // A seeded entry promoted via probe (removed+dirty) is indistinguishable
        // from a freshly stored one: popping it directly exposes the raw entry.
        let (k, v) = cache.borrow_mut().pop_item(false).unwrap();
        assert_eq!((k, v), ("a".to_string(), 1));
    }

    #[test]
    fn lower_backpointer_is_wired_on_build() {
        let lower = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let upper = CacheLayerBuilder::new()
            .capacity(1)
            .lower(Lower::Cache(Rc::clone(&lower)))
            .build()
            .unwrap();

        assert!(lower.borrow().upper.is_some());
        let upgraded = lower.borrow().upper.as_ref().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&upgraded, &upper));
    }
}
