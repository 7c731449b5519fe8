//! Key/value context-cache memoization for batched tree-search inference.
//!
//! This crate re-exports the workspace members:
//! - [`kv`]: per-layer key/value storage and multi-layer contexts
//! - [`engine`]: the sequence-model and encoder traits
//! - [`models`]: a small reference world model and encoder
//! - [`cache`]: pools, indices, alignment and the cache engine

pub use latentkv_cache as cache;
pub use latentkv_engine as engine;
pub use latentkv_kv as kv;
pub use latentkv_models as models;

pub use latentkv_cache::{CacheConfig, CacheEngine, CacheError, CacheStats, SearchSession};
pub use latentkv_engine::{LatentEncoder, Positions, SequenceModel};
pub use latentkv_kv::{ContextCache, Device, KvShape};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
