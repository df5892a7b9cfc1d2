//! The LRU + write-back cache layer — the core of the chain.
//!
//! Ordering is tracked with an [`indexmap::IndexMap`], the same structure
//! the teacher's `ShardedLruTracker` (`cache/lru.rs`) uses for recency
//! bookkeeping: insertion order doubles as recency order, with the
//! least-recently-used entry at the front and the most-recently-used at
//! the back.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

use super::entry::Entry;
use super::store::BackingStore;
use super::Lower;

/// An in-memory, capacity-bounded, insertion-ordered mapping with LRU
/// semantics and per-entry dirty flags.
pub struct CacheLayer<V> {
    pub(crate) capacity: usize,
    pub(crate) entries: IndexMap<String, Entry<V>>,
    pub(crate) lower: Option<Lower<V>>,
    pub(crate) upper: Option<Weak<RefCell<CacheLayer<V>>>>,
    /// Single-slot buffer marking a key this layer must flip dirty on its
    /// next insertion (spec §4.3): set either by the backing store's
    /// notify-upward walk (a standalone store call with no cache layer
    /// borrowed) or directly by `insert_raw` when a demotion cascades into
    /// the store's notify branch from within an already-borrowed ancestor.
    pub(crate) pending_dirty_mark: Option<String>,
}

impl<V> CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    // =========================================================================
    // Observation (this layer only, insertion order = oldest first)
    // =========================================================================

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|e| &e.value)
    }

    pub fn items(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    /// Non-promoting, non-recursive lookup of this layer only.
    pub fn get_or(&self, key: &str, default: V) -> V {
        self.entries
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or(default)
    }

    // =========================================================================
    // Single-layer mutation
    // =========================================================================

    /// Removes the entry from this layer only. Does not cascade.
    pub fn delete(&mut self, key: &str) -> Result<V> {
        self.entries
            .shift_remove(key)
            .map(|e| e.value)
            .ok_or_else(|| Error::KeyMissing(key.to_string()))
    }

    pub fn pop(&mut self, key: &str) -> Result<V> {
        self.delete(key)
    }

    pub fn pop_or(&mut self, key: &str, default: V) -> V {
        self.entries
            .shift_remove(key)
            .map(|e| e.value)
            .unwrap_or(default)
    }

    /// Removes and returns the MRU entry (`last = true`) or the LRU entry
    /// (`last = false`) of this layer.
    pub fn pop_item(&mut self, last: bool) -> Result<(String, V)> {
        let popped = if last {
            self.entries.pop()
        } else {
            self.entries.shift_remove_index(0)
        };
        popped
            .map(|(k, e)| (k, e.value))
            .ok_or_else(|| Error::KeyMissing("<cache is empty>".into()))
    }

    /// Inserts pairs into this layer only, each via the standard
    /// single-layer insertion algorithm (ordering + eviction/demotion if it
    /// overflows). Unlike `Store`, it does not recursively invalidate stale
    /// copies held by lower layers.
    pub fn update<I: IntoIterator<Item = (String, V)>>(&mut self, other: I) -> Result<()> {
        for (k, v) in other {
            self.insert_raw(k, v, true)?;
        }
        Ok(())
    }

    /// Lowering capacity below the current length trims from the MRU end
    /// until the invariant `len <= capacity` holds again, demoting trimmed
    /// entries exactly as a capacity-triggered eviction would.
    pub fn set_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 {
            return Err(Error::Configuration("capacity must be positive".into()));
        }
        self.capacity = new_capacity;
        while self.entries.len() > self.capacity {
            if let Some((k, e)) = self.entries.pop() {
                if let Some(notify_key) = self.demote(k, e)? {
                    self.pending_dirty_mark = Some(notify_key);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Chain operations
    // =========================================================================

    /// Searches the chain starting at this layer. Found in a cache: removed
    /// from there and promoted to this layer's MRU end, marked dirty. Found
    /// only in the backing store: read (not removed) and promoted clean.
    /// Absent everywhere: `CacheMiss`.
    pub fn lookup(&mut self, key: &str) -> Result<V> {
        match self.probe(key)? {
            Some((value, from_store)) => {
                let dirty = !from_store;
                let extra = from_store.then(|| (key.to_string(), value.clone()));
                self.refresh_nondirty_snapshot(extra)?;
                self.insert_raw(key.to_string(), value.clone(), dirty)?;
                Ok(value)
            }
            None => Err(Error::CacheMiss {
                key: key.to_string(),
            }),
        }
    }

    /// Probes the chain to discard any stale copy of `key` in a lower cache
    /// (write-allocate + invalidate-lower), then inserts `(key, value)` at
    /// this layer's MRU end, dirty.
    pub fn store(&mut self, key: &str, value: V) -> Result<()> {
        self.probe(key)?;
        self.refresh_nondirty_snapshot(None)?;
        self.insert_raw(key.to_string(), value, true)?;
        Ok(())
    }

    pub fn set_default(&mut self, key: &str, default: V) -> Result<V> {
        match self.lookup(key) {
            Ok(v) => Ok(v),
            Err(Error::CacheMiss { .. }) => {
                self.store(key, default.clone())?;
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Recursive probe (spec §4.1): remove-and-return if found in any cache
    /// layer; a non-removing read if found only in the terminal store.
    /// Returns `(value, from_store)`.
    fn probe(&mut self, key: &str) -> Result<Option<(V, bool)>> {
        if let Some(entry) = self.entries.shift_remove(key) {
            return Ok(Some((entry.value, false)));
        }
        match &self.lower {
            None => Ok(None),
            Some(Lower::Cache(lower)) => lower.borrow_mut().probe(key),
            Some(Lower::Store(store)) => {
                let store = store.borrow();
                match store.get(key)? {
                    Some(v) => Ok(Some((v, true))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Primitive insert implementing spec §4.1's insertion algorithm in
    /// full: skip eviction when overwriting an existing key, otherwise
    /// evict-and-demote while at capacity, insert at the MRU end, then
    /// consume a matching pending dirty-mark.
    ///
    /// A demotion that cascades all the way into a full backing store can
    /// require marking *this* layer's own shadow of the evicted key dirty
    /// (spec §4.2 step 3). That can't be delivered by the store reaching
    /// back up through a `Weak` borrow — this layer is already `&mut
    /// self`-borrowed on the stack that called `demote` in the first place.
    /// Instead `demote` hands the key back as a return value, which this
    /// method applies directly, then forwards further up to its own caller
    /// (another layer's `insert_raw`, or `set_capacity`) the same way.
    fn insert_raw(&mut self, key: String, value: V, dirty: bool) -> Result<Option<String>> {
        let existed = self.entries.shift_remove(&key).is_some();
        let mut notify: Option<String> = None;
        if !existed {
            while self.entries.len() >= self.capacity {
                let Some((evicted_key, evicted)) = self.entries.shift_remove_index(0) else {
                    break;
                };
                if let Some(k) = self.demote(evicted_key, evicted)? {
                    notify = Some(k);
                }
            }
        }
        self.entries.insert(key, Entry::new(value, dirty));

        if let Some(pending) = self.pending_dirty_mark.take() {
            if let Some(entry) = self.entries.get_mut(&pending) {
                entry.dirty = true;
                tracing::trace!(key = %pending, "consumed pending dirty-mark");
            }
        }

        if let Some(k) = notify {
            self.pending_dirty_mark = Some(k.clone());
            return Ok(Some(k));
        }
        Ok(None)
    }

    /// Returns the key of an evicted entry that an ancestor cache layer must
    /// mark dirty, when demotion bottoms out in a backing store whose
    /// `PopItem` had to evict an already-shadowed key (see `insert_raw`).
    fn demote(&mut self, key: String, evicted: Entry<V>) -> Result<Option<String>> {
        match &self.lower {
            None => {
                tracing::trace!(key = %key, "discarded at bottom of chain");
                Ok(None)
            }
            Some(Lower::Cache(lower)) => {
                tracing::debug!(key = %key, dirty = evicted.dirty, "demoting to lower cache");
                lower
                    .borrow_mut()
                    .insert_raw(key, evicted.value, evicted.dirty)
            }
            Some(Lower::Store(store)) => {
                if evicted.dirty {
                    tracing::debug!(key = %key, "writing dirty entry back to store");
                    let notify_key = store.borrow_mut().set(&key, evicted.value)?;
                    Ok(notify_key)
                } else {
                    tracing::trace!(key = %key, "dropping clean entry, store already holds it");
                    Ok(None)
                }
            }
        }
    }

    /// Walks from this layer down to (not including) the backing store,
    /// collecting every clean pair, optionally unions in `extra`, and
    /// installs the result as the store's nondirty map. A no-op if no
    /// backing store terminates the chain.
    fn refresh_nondirty_snapshot(&self, extra: Option<(String, V)>) -> Result<()> {
        let Some(store) = self.find_terminal_store() else {
            return Ok(());
        };
        let mut snapshot = HashMap::new();
        self.collect_clean(&mut snapshot);
        if let Some((k, v)) = extra {
            snapshot.insert(k, v);
        }
        store.borrow_mut().nondirty = snapshot;
        Ok(())
    }

    fn collect_clean(&self, out: &mut HashMap<String, V>) {
        for (k, e) in &self.entries {
            if !e.dirty {
                out.insert(k.clone(), e.value.clone());
            }
        }
        if let Some(Lower::Cache(lower)) = &self.lower {
            lower.borrow().collect_clean(out);
        }
    }

    /// Lowest-memory resolution (spec §4.3): walks forward-references until
    /// reaching a layer with no lower neighbour, returning the terminal
    /// store if that is what terminates the chain.
    pub(crate) fn find_terminal_store(&self) -> Option<Rc<RefCell<BackingStore<V>>>> {
        match &self.lower {
            None => None,
            Some(Lower::Store(s)) => Some(Rc::clone(s)),
            Some(Lower::Cache(c)) => c.borrow().find_terminal_store(),
        }
    }
}

impl<V> PartialEq for CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq + 'static,
{
    /// Equal iff ordered entries match key/value/dirty pairwise, capacities
    /// match, and lower layers recursively compare equal (or both absent).
    fn eq(&self, other: &Self) -> bool {
        if self.capacity != other.capacity || self.entries.len() != other.entries.len() {
            return false;
        }
        let pairwise = self
            .entries
            .iter()
            .zip(other.entries.iter())
            .all(|((k1, e1), (k2, e2))| k1 == k2 && e1.value == e2.value && e1.dirty == e2.dirty);
        if !pairwise {
            return false;
        }
        match (&self.lower, &other.lower) {
            (None, None) => true,
            (Some(Lower::Cache(a)), Some(Lower::Cache(b))) => *a.borrow() == *b.borrow(),
            (Some(Lower::Store(a)), Some(Lower::Store(b))) => *a.borrow() == *b.borrow(),
            _ => false,
        }
    }
}

impl<V> fmt::Debug for CacheLayer<V>
where
    V: fmt::Debug,
{
    /// `(key, (dirty, value))` triples in insertion order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<(&String, (bool, &V))> = self
            .entries
            .iter()
            .map(|(k, e)| (k, (e.dirty, &e.value)))
            .collect();
        write!(
            f,
            "CacheLayer {{ capacity: {}, entries: {:?} }}",
            self.capacity, items
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builder::{BackingStoreBuilder, CacheLayerBuilder};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn ordered_pairs() -> Vec<(String, i32)> {
        vec![
            ("cherry".to_string(), 3),
            ("blueberry".to_string(), 1),
            ("strawberry".to_string(), 2),
        ]
    }

    #[test]
    fn single_layer_lru_scenario() {
        // Scenario 1 from spec §8.
        let cache = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(ordered_pairs())
            .build()
            .unwrap();

        {
            let mut c = cache.borrow_mut();
            c.set_capacity(4).unwrap();
            c.store("tangerine", 4).unwrap();
            c.store("mango", 5).unwrap();
            c.store("strawberry", 6).unwrap();
        }

        let c = cache.borrow();
        let items: Vec<_> = c.items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            items,
            vec![
                ("cherry".to_string(), 3),
                ("tangerine".to_string(), 4),
                ("mango".to_string(), 5),
                ("strawberry".to_string(), 6),
            ]
        );
    }

    #[test]
    fn two_layer_promotion_scenario() {
        // Scenario 2 from spec §8.
        let c2 = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(vec![("c".to_string(), 3), ("d".to_string(), 4)])
            .build()
            .unwrap();
        let c1 = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(vec![("a".to_string(), 1)])
            .lower(Lower::Cache(Rc::clone(&c2)))
            .build()
            .unwrap();

        let value = c1.borrow_mut().lookup("d").unwrap();
        assert_eq!(value, 4);

        let c1_items: Vec<_> = c1.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            c1_items,
            vec![("a".to_string(), 1), ("d".to_string(), 4)]
        );
        let c2_items: Vec<_> = c2.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(c2_items, vec![("c".to_string(), 3)]);
    }

    #[test]
    fn two_layer_demotion_scenario() {
        // Scenario 3 from spec §8: storing past C1's capacity demotes the
        // displaced entry down into C2 while C1 keeps only its two most
        // recent keys.
        let c2 = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(vec![("c".to_string(), 3), ("d".to_string(), 4)])
            .build()
            .unwrap();
        let c1 = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(vec![("a".to_string(), 1)])
            .lower(Lower::Cache(Rc::clone(&c2)))
            .build()
            .unwrap();

        {
            let mut c1 = c1.borrow_mut();
            c1.store("e", 5).unwrap();
            c1.store("f", 6).unwrap();
        }

        let c1_items: Vec<_> = c1.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(c1_items, vec![("e".to_string(), 5), ("f".to_string(), 6)]);

        let c2_items: Vec<_> = c2.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            c2_items,
            vec![
                ("c".to_string(), 3),
                ("d".to_string(), 4),
                ("a".to_string(), 1),
            ]
        );
    }

    #[test]
    fn three_layer_cascade_scenario() {
        // Scenario 4 from spec §8.
        let c3 = CacheLayerBuilder::new().capacity(3).build::<i32>().unwrap();
        let c2 = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(vec![("b".to_string(), 2)])
            .lower(Lower::Cache(Rc::clone(&c3)))
            .build()
            .unwrap();
        let c1 = CacheLayerBuilder::new()
            .capacity(1)
            .init_pairs(vec![("a".to_string(), 1)])
            .lower(Lower::Cache(Rc::clone(&c2)))
            .build()
            .unwrap();

        c1.borrow_mut().store("c", 3).unwrap();

        let c1_items: Vec<_> = c1.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(c1_items, vec![("c".to_string(), 3)]);
        let c2_items: Vec<_> = c2.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            c2_items,
            vec![("b".to_string(), 2), ("a".to_string(), 1)]
        );
        assert!(c3.borrow().is_empty());

        c1.borrow_mut().store("d", 4).unwrap();

        let c1_items: Vec<_> = c1.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(c1_items, vec![("d".to_string(), 4)]);
        let c2_items: Vec<_> = c2.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            c2_items,
            vec![("a".to_string(), 1), ("c".to_string(), 3)]
        );
        let c3_items: Vec<_> = c3.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(c3_items, vec![("b".to_string(), 2)]);
    }

    #[test]
    fn capacity_one_forces_demotion_on_every_store() {
        let c2 = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let c1 = CacheLayerBuilder::new()
            .capacity(1)
            .lower(Lower::Cache(Rc::clone(&c2)))
            .build()
            .unwrap();

        c1.borrow_mut().store("x", 1).unwrap();
        c1.borrow_mut().store("y", 2).unwrap();
        c1.borrow_mut().store("z", 3).unwrap();

        assert_eq!(c1.borrow().len(), 1);
        assert_eq!(c2.borrow().len(), 2);
    }

    #[test]
    fn lookup_of_missing_key_fails_with_cache_miss() {
        let cache = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let err = cache.borrow_mut().lookup("nope").unwrap_err();
        assert_matches!(err, Error::CacheMiss { .. });
    }

    #[test]
    fn repeated_lookup_is_idempotent_on_ordering() {
        let cache = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(ordered_pairs())
            .build()
            .unwrap();

        cache.borrow_mut().lookup("cherry").unwrap();
        let after_first: Vec<_> = cache.borrow().keys().cloned().collect();
        cache.borrow_mut().lookup("cherry").unwrap();
        let after_second: Vec<_> = cache.borrow().keys().cloned().collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn pop_item_last_vs_first() {
        let cache = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(ordered_pairs())
            .build()
            .unwrap();

        let (k, _) = cache.borrow_mut().pop_item(false).unwrap();
        assert_eq!(k, "cherry");
        let (k, _) = cache.borrow_mut().pop_item(true).unwrap();
        assert_eq!(k, "strawberry");
    }

    #[test]
    fn pop_item_on_empty_cache_is_key_missing() {
        let cache = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let err = cache.borrow_mut().pop_item(true).unwrap_err();
        assert_matches!(err, Error::KeyMissing(_));
    }

    #[test]
    fn set_default_stores_on_miss_and_returns_existing_on_hit() {
        let cache = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let v = cache.borrow_mut().set_default("k", 9).unwrap();
        assert_eq!(v, 9);
        let v = cache.borrow_mut().set_default("k", 1).unwrap();
        assert_eq!(v, 9);
    }

    #[test]
    fn capacity_reduction_trims_from_mru_end() {
        let lower = CacheLayerBuilder::new().capacity(4).build::<i32>().unwrap();
        let cache = CacheLayerBuilder::new()
            .capacity(4)
            .init_pairs(vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3),
            ])
            .lower(Lower::Cache(Rc::clone(&lower)))
            .build()
            .unwrap();

        cache.borrow_mut().set_capacity(2).unwrap();

        let items: Vec<_> = cache.borrow().items().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(items, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(lower.borrow().contains("c"));
    }

    #[test]
    fn equality_compares_order_value_dirty_and_lower_chain() {
        let a = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(vec![("x".to_string(), 1)])
            .build()
            .unwrap();
        let b = CacheLayerBuilder::new()
            .capacity(2)
            .init_pairs(vec![("x".to_string(), 1)])
            .build()
            .unwrap();
        assert!(*a.borrow() == *b.borrow());

        b.borrow_mut().store("x", 2).unwrap();
        assert!(*a.borrow() != *b.borrow());
    }

    /// A single cache layer directly on top of a backing store, both at
    /// capacity 1, is the minimal shape that forces a demotion to cascade
    /// all the way into the store's notify-upward eviction branch while the
    /// triggering layer is still on the call stack (no middle cache to
    /// "absorb" the cascade). Before the bubble-up fix this panicked with a
    /// double `RefCell` borrow instead of completing.
    #[test]
    fn store_to_store_cascade_does_not_double_borrow() {
        let dir = TempDir::new().unwrap();
        let dbname = dir.path().join("cascade").to_string_lossy().into_owned();
        let store = BackingStoreBuilder::new()
            .capacity(1)
            .dbname(dbname)
            .build::<i32>()
            .unwrap();
        let scope = crate::chain::scope::StoreScope::enter(Some(Rc::clone(&store))).unwrap();
        let top = CacheLayerBuilder::new()
            .capacity(1)
            .lower(Lower::Store(scope.store()))
            .build()
            .unwrap();

        top.borrow_mut().store("a", 1).unwrap();
        top.borrow_mut().store("b", 2).unwrap();
        assert!(top.borrow().contains("b"));
        assert!(scope.store().borrow().contains("a").unwrap());

        // Lookup promotes "a" clean, evicting dirty "b" back down into the
        // now-full store: the store's PopItem finds every key shadowed and
        // must notify upward while `top` sits borrowed on this same stack.
        let value = top.borrow_mut().lookup("a").unwrap();
        assert_eq!(value, 1);

        assert!(top.borrow().contains("a"));
        assert!(!scope.store().borrow().contains("a").unwrap());
        assert!(scope.store().borrow().contains("b").unwrap());

        let top_debug = format!("{:?}", top.borrow());
        assert!(top_debug.contains(r#"("a", (false, 1))"#));
    }
}
