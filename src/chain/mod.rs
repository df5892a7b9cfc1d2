//! Multi-Level Write-Back Cache Hierarchy
//!
//! A chain of memory layers ordered from top (fastest, smallest) to bottom
//! (slowest, largest). Two layer kinds exist:
//!
//! - [`CacheLayer`] — an in-memory, capacity-bounded, insertion-ordered
//!   mapping with LRU semantics and per-entry dirty flags.
//! - [`BackingStore`] — a capacity-bounded persistent mapping keyed by
//!   string; at most one may appear, and only as the terminal layer.
//!
//! Data flows downward on eviction (demotion) and upward on lookup
//! (promotion). The backing store may additionally emit an upward
//! notification when it evicts a key, informing the chain to mark any
//! cached copy of that key dirty.
//!
//! # Example
//!
//! ```
//! use cache_chain::chain::{BackingStoreBuilder, CacheLayerBuilder, Lower};
//!
//! # fn main() -> cache_chain::Result<()> {
//! let top = CacheLayerBuilder::<i32>::new().capacity(4).build()?;
//! top.borrow_mut().store("a", 1)?;
//! assert_eq!(top.borrow_mut().lookup("a")?, 1);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod entry;
pub mod scope;
pub mod store;

pub use builder::{BackingStoreBuilder, CacheLayerBuilder, InitValues};
pub use cache::CacheLayer;
pub use entry::Entry;
pub use scope::StoreScope;
pub use store::BackingStore;

use std::cell::RefCell;
use std::rc::Rc;

/// The layer directly below a [`CacheLayer`]: either another cache or the
/// terminal backing store. Modeled as a two-variant tagged union (Design
/// Note §9) rather than a trait object, since every branch in the
/// insertion and probing algorithms matches explicitly on this kind.
pub enum Lower<V> {
    Cache(Rc<RefCell<CacheLayer<V>>>),
    Store(Rc<RefCell<BackingStore<V>>>),
}

impl<V> Clone for Lower<V> {
    fn clone(&self) -> Self {
        match self {
            Lower::Cache(c) => Lower::Cache(Rc::clone(c)),
            Lower::Store(s) => Lower::Store(Rc::clone(s)),
        }
    }
}
