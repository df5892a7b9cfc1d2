//! L-terminal persistent storage.
//!
//! `BackingStore` is the only layer permitted at the bottom of a chain. It
//! wraps a `sled::Db` (grounded on `harborgrid-justin-caddy`'s L2 disk tier,
//! which pairs `sled` with `bincode` the same way) behind an explicit
//! open/close lifecycle, per spec §4.2's state machine: `{Closed, Open}`,
//! all data operations permitted only in `Open`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

use super::cache::CacheLayer;

/// Terminal, persistent, capacity-bounded key-value layer.
///
/// At most one may appear in a chain, and only as the lowest layer.
pub struct BackingStore<V> {
    pub(crate) capacity: usize,
    pub(crate) dbname: String,
    pub(crate) db: Option<sled::Db>,
    /// Snapshot of clean `(key, value)` pairs held by higher caches,
    /// refreshed by the top cache before every Lookup/Store re-insertion.
    /// `PopItem` consults this to pick eviction victims that carry no
    /// upper-layer write-back obligation.
    pub(crate) nondirty: HashMap<String, V>,
    pub(crate) upper: Option<Weak<RefCell<CacheLayer<V>>>>,
}

impl<V> BackingStore<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    fn db(&self) -> Result<&sled::Db> {
        self.db.as_ref().ok_or(Error::BackingStoreClosed)
    }

    /// Acquire the underlying persistent handle. Idempotent. Trims to
    /// capacity immediately if the on-disk store is already oversized
    /// (drops are arbitrary).
    pub fn open(&mut self) -> Result<()> {
        if self.db.is_none() {
            let path = format!("{}.db", self.dbname);
            self.db = Some(sled::open(path)?);
        }
        while self.len()? > self.capacity {
            let (key, _, notify) = self.pop_item()?;
            if notify {
                self.notify_upward(&key);
            }
        }
        Ok(())
    }

    /// Release the handle. Idempotent when already closed.
    pub fn close(&mut self) {
        self.db = None;
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_none()
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        match self.db()?.get(key)? {
            Some(ivec) => Ok(Some(bincode::deserialize(&ivec)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.db()?.contains_key(key)?)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.db()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Triggers `PopItem` until `len < capacity` before inserting, so `Set`
    /// never grows the store beyond capacity. Returns the key of an evicted
    /// entry whose upper-layer shadow must be marked dirty, if `PopItem`
    /// took the all-shadowed branch — the caller (a cache layer already on
    /// the call stack via `demote`) applies it directly to itself, rather
    /// than this method reaching back up through a `Weak` borrow that may
    /// already be held by that very caller.
    pub fn set(&mut self, key: &str, value: V) -> Result<Option<String>> {
        let mut notify_key = None;
        while self.len()? >= self.capacity {
            let (evicted_key, _, notify) = self.pop_item()?;
            if notify {
                notify_key = Some(evicted_key);
            }
        }
        let bytes = bincode::serialize(&value)?;
        self.db()?.insert(key, bytes)?;
        Ok(notify_key)
    }

    fn delete_bytes(&mut self, key: &str) -> Result<Option<V>> {
        match self.db()?.remove(key)? {
            Some(ivec) => Ok(Some(bincode::deserialize(&ivec)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<Option<V>> {
        self.delete_bytes(key)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let db = self.db()?;
        let mut out = Vec::with_capacity(db.len());
        for kv in db.iter() {
            let (k, _) = kv?;
            out.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(out)
    }

    pub fn items(&self) -> Result<Vec<(String, V)>> {
        let db = self.db()?;
        let mut out = Vec::with_capacity(db.len());
        for kv in db.iter() {
            let (k, v) = kv?;
            let key = String::from_utf8_lossy(&k).into_owned();
            let value: V = bincode::deserialize(&v)?;
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.items()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn pop(&mut self, key: &str) -> Result<V> {
        self.delete_bytes(key)?
            .ok_or_else(|| Error::KeyMissing(key.to_string()))
    }

    pub fn pop_or(&mut self, key: &str, default: V) -> Result<V> {
        Ok(self.delete_bytes(key)?.unwrap_or(default))
    }

    pub fn update<I: IntoIterator<Item = (String, V)>>(&mut self, other: I) -> Result<()> {
        for (k, v) in other {
            if let Some(notify_key) = self.set(&k, v)? {
                self.notify_upward(&notify_key);
            }
        }
        Ok(())
    }

    pub fn set_default(&mut self, key: &str, default: V) -> Result<V> {
        if let Some(v) = self.get(key)? {
            Ok(v)
        } else {
            if let Some(notify_key) = self.set(key, default.clone())? {
                self.notify_upward(&notify_key);
            }
            Ok(default)
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.db()?.clear()?;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// If open and oversized, trims arbitrarily until within the new
    /// capacity.
    pub fn set_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 {
            return Err(Error::Configuration("capacity must be positive".into()));
        }
        self.capacity = new_capacity;
        if self.db.is_some() {
            while self.len()? > self.capacity {
                let (key, _, notify) = self.pop_item()?;
                if notify {
                    self.notify_upward(&key);
                }
            }
        }
        Ok(())
    }

    /// The distinguishing operation (spec §4.2): enumerate store keys; if
    /// any key carries no clean shadow in an upper cache, evict it directly
    /// with no notification (the returned flag is `false`). Otherwise evict
    /// an arbitrary key and flag it for upward notification (`true`) — the
    /// caller decides how to deliver that notification depending on whether
    /// it is safe to borrow the upper layers directly (see `set`).
    pub fn pop_item(&mut self) -> Result<(String, V, bool)> {
        let db = self.db()?;
        let mut unshadowed: Option<String> = None;
        let mut fallback: Option<String> = None;
        for kv in db.iter() {
            let (k, _) = kv?;
            let key = String::from_utf8_lossy(&k).into_owned();
            if fallback.is_none() {
                fallback = Some(key.clone());
            }
            if !self.nondirty.contains_key(&key) {
                unshadowed = Some(key);
                break;
            }
        }

        match unshadowed {
            Some(key) => {
                let value = self.delete_for_pop(&key)?;
                Ok((key, value, false))
            }
            None => {
                let key = fallback.ok_or_else(|| Error::KeyMissing("<store is empty>".into()))?;
                let value = self.delete_for_pop(&key)?;
                Ok((key, value, true))
            }
        }
    }

    fn delete_for_pop(&mut self, key: &str) -> Result<V> {
        self.delete_bytes(key)?
            .ok_or_else(|| Error::KeyMissing(key.to_string()))
    }

    /// Walks the upper chain marking every live cache layer's pending
    /// dirty-mark slot. Only safe to call when none of those layers can
    /// already be borrowed on the current stack — i.e. from a standalone
    /// store operation, never from within a cache layer's own `demote`
    /// cascade (see `set`, which hands the notify key back to its caller
    /// instead of calling this directly).
    fn notify_upward(&self, key: &str) {
        let mut current = self.upper.clone();
        while let Some(weak) = current {
            let Some(cache_rc) = weak.upgrade() else {
                break;
            };
            let mut cache = cache_rc.borrow_mut();
            cache.pending_dirty_mark = Some(key.to_string());
            current = cache.upper.clone();
        }
    }
}

impl<V> PartialEq for BackingStore<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq + 'static,
{
    /// Store contents and capacities equal — compared handle-to-handle, not
    /// handle-against-struct (see design note on the original's equality
    /// bug).
    fn eq(&self, other: &Self) -> bool {
        if self.capacity != other.capacity {
            return false;
        }
        match (&self.db, &other.db) {
            (None, None) => true,
            (Some(_), Some(_)) => match (self.items(), other.items()) {
                (Ok(mut a), Ok(mut b)) => {
                    a.sort_by(|x, y| x.0.cmp(&y.0));
                    b.sort_by(|x, y| x.0.cmp(&y.0));
                    a == b
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl<V> fmt::Debug for BackingStore<V>
where
    V: fmt::Debug + Clone + Serialize + DeserializeOwned + 'static,
{
    /// A closed store identifies itself as closed without attempting I/O.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db.is_none() {
            return write!(f, "BackingStore({:?}) [closed]", self.dbname);
        }
        let mut items = self.items().unwrap_or_default();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        write!(f, "BackingStore({:?}) {:?}", self.dbname, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builder::BackingStoreBuilder;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn temp_store(capacity: usize) -> (TempDir, Rc<RefCell<BackingStore<i32>>>) {
        let dir = TempDir::new().unwrap();
        let dbname = dir.path().join("scenario").to_string_lossy().into_owned();
        let store = BackingStoreBuilder::new()
            .capacity(capacity)
            .dbname(dbname)
            .build::<i32>()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn closed_store_rejects_operations() {
        let (_dir, store) = temp_store(4);
        let err = store.borrow().get("a").unwrap_err();
        assert_matches!(err, Error::BackingStoreClosed);
    }

    #[test]
    fn open_close_roundtrip() {
        let (_dir, store) = temp_store(4);
        store.borrow_mut().open().unwrap();
        assert!(!store.borrow().is_closed());
        store.borrow_mut().set("a", 1).unwrap();
        assert_eq!(store.borrow().get("a").unwrap(), Some(1));
        store.borrow_mut().close();
        assert!(store.borrow().is_closed());
        // idempotent
        store.borrow_mut().close();
        assert!(store.borrow().is_closed());
    }

    #[test]
    fn set_never_exceeds_capacity() {
        let (_dir, store) = temp_store(2);
        let mut s = store.borrow_mut();
        s.open().unwrap();
        s.set("a", 1).unwrap();
        s.set("b", 2).unwrap();
        s.set("c", 3).unwrap();
        assert_eq!(s.len().unwrap(), 2);
    }

    #[test]
    fn pop_item_prefers_unshadowed_key_without_notifying() {
        let (_dir, store) = temp_store(4);
        let mut s = store.borrow_mut();
        s.open().unwrap();
        s.set("shadowed", 1).unwrap();
        s.set("free", 2).unwrap();
        s.nondirty.insert("shadowed".to_string(), 1);

        let (key, _, notify) = s.pop_item().unwrap();
        assert_eq!(key, "free");
        assert!(!notify);
    }

    #[test]
    fn pop_item_flags_notify_when_every_key_is_shadowed() {
        let (_dir, store) = temp_store(2);
        let mut s = store.borrow_mut();
        s.open().unwrap();
        s.set("a", 1).unwrap();
        s.set("b", 2).unwrap();
        s.nondirty.insert("a".to_string(), 1);
        s.nondirty.insert("b".to_string(), 2);

        let (_, _, notify) = s.pop_item().unwrap();
        assert!(notify);
    }
}
