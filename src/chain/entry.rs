//! Cached entry representation.
//!
//! An [`Entry`] pairs a value with a dirty flag. `dirty == true` iff the
//! value must eventually be written back to the backing store to make
//! persistent state consistent with cache state — this invariant is the
//! reason the rest of the chain exists.

use serde::{Deserialize, Serialize};

/// A value held by a cache layer, tagged with whether it still needs to be
/// written back to a backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<V> {
    pub value: V,
    pub dirty: bool,
}

impl<V> Entry<V> {
    pub fn new(value: V, dirty: bool) -> Self {
        Self { value, dirty }
    }

    /// A freshly stored or freshly mutated entry — always dirty.
    pub fn dirty(value: V) -> Self {
        Self::new(value, true)
    }

    /// A shadow of a value the backing store already holds.
    pub fn clean(value: V) -> Self {
        Self::new(value, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_and_clean_constructors() {
        assert!(Entry::dirty(1).dirty);
        assert!(!Entry::clean(1).dirty);
    }
}
