//! Content hash of latent state vectors.

use std::fmt;

use xxhash_rust::xxh64::Xxh64;

/// 64-bit key of a latent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHash(pub u64);

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// xxHash64 (seed 0) over the little-endian bytes of `latent`.
///
/// Bit-level: `0.0` and `-0.0` hash differently, as do distinct NaN payloads.
pub fn hash_state(latent: &[f32]) -> StateHash {
    let mut hasher = Xxh64::new(0);
    for value in latent {
        hasher.update(&value.to_le_bytes());
    }
    StateHash(hasher.digest())
}
