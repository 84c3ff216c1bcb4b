//! Cache tiers in front of the backing store.

mod cached_store;
mod source;
mod tier;

pub use cached_store::CachedStore;
pub use source::{CacheRead, CacheSource};
pub use tier::{TierKind, TierStats};
