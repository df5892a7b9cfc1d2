//! cache-chain — a multi-level write-back LRU cache hierarchy
//!
//! A chain of in-memory [`chain::CacheLayer`]s, optionally terminated by a
//! persistent [`chain::BackingStore`]. Each cache layer is capacity-bounded,
//! insertion-ordered, and LRU; entries carry a dirty flag recording whether
//! they still need to be written back. Eviction recurses downward
//! (demotion); lookup recurses upward (promotion). When the backing store
//! evicts a key under pressure, it walks back up the chain so the next
//! write into any shadowing cache rewrites the now-gone persistent copy.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐      lookup/store        ┌───────────────┐      demotion      ┌───────────────┐
//! │  CacheLayer    │ ◄──────────────────────  │  CacheLayer    │ ─────────────────► │  BackingStore │
//! │  (top, MRU)    │ ────────────────────────►│  (middle)      │                    │  (terminal)   │
//! └───────────────┘        demotion           └───────────────┘                    └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`chain`]: the cache/store layer types, their builders, and the
//!   RAII store-acquisition scope
//! - [`error`]: error types and handling

pub mod chain;
pub mod error;

pub use chain::{
    BackingStore, BackingStoreBuilder, CacheLayer, CacheLayerBuilder, Lower, StoreScope,
};
pub use error::{Error, ErrorKind, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
