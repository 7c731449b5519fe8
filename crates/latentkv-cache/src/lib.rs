//! # latentkv-cache
//!
//! Memoized, pooled context caches for tree-search inference over a
//! [`SequenceModel`](latentkv_engine::SequenceModel).
//!
//! Provides:
//! - **State hashing**: xxHash64 keys for latent state vectors
//! - **Pools**: fixed-capacity FIFO rings of context slots with write generations
//! - **Indices**: hash-to-slot maps per environment (roots) and shared (simulations)
//! - **Alignment**: trim-and-pad batching, window shrink with positional correction
//! - **CacheEngine**: the lookup/forward/store state machine
//! - **SearchSession**: encoder + engine facade for a search driver
//! - **Telemetry**: lookup/store/step hooks and counters
//!
//! ## Staleness
//! Pool slots are reused without invalidating index entries that point at
//! them, so a lookup can return a context built for a different state. This
//! is tolerated by default; [`CacheConfig::detect_stale_hits`] turns such
//! entries into misses.

pub mod align;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hash;
pub mod index;
pub mod pool;
pub mod posdelta;
pub mod stats;
pub mod telemetry;

pub use align::AlignmentEngine;
pub use config::CacheConfig;
pub use driver::SearchSession;
pub use engine::{CacheEngine, EnvState, InferenceOutput};
pub use error::{CacheError, CacheResult};
pub use hash::{hash_state, StateHash};
pub use index::{SlotRef, StateHashIndex};
pub use pool::{Pool, PoolClass};
pub use posdelta::PositionalDeltaTable;
pub use stats::CacheStats;
pub use telemetry::{
    LogTelemetry, LookupOutcome, NoopTelemetry, StepKind, StepMetrics, StepTimer, TelemetryHook,
};
