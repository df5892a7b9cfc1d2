//! RAII lifetime management for a backing store handle.
//!
//! Grounded on the teacher's acquisition-guard pattern for external
//! collaborators (`cache/storage/persistent.rs`'s connection lifecycle):
//! `enter()` opens the store, and closing happens in `Drop`, so a panic or
//! early return still releases the sled handle.

use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

use super::store::BackingStore;

/// Holds a store open for the scope's lifetime, closing it on drop.
pub struct StoreScope<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    store: Rc<RefCell<BackingStore<V>>>,
}

impl<V> StoreScope<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    /// Opens `store` for the duration of this guard. Fails if `store` is
    /// `None`, mirroring spec.md's `NoBackingStore` condition for chains
    /// that never terminate in a store.
    pub fn enter(store: Option<Rc<RefCell<BackingStore<V>>>>) -> Result<Self> {
        let store = store.ok_or(Error::NoBackingStore)?;
        store.borrow_mut().open()?;
        Ok(Self { store })
    }

    pub fn store(&self) -> Rc<RefCell<BackingStore<V>>> {
        Rc::clone(&self.store)
    }
}

impl<V> Drop for StoreScope<V>
where
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    fn drop(&mut self) {
        self.store.borrow_mut().close();
    }
}
