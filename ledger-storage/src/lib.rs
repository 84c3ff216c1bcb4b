//! Ledger Storage - Store Trait, Cache Tiers and Block Controller
//!
//! Defines the backing-store abstraction, an in-memory backend, the tiered
//! cache that sits in front of any backend, and the [`Controller`] that
//! holds uncommitted revisions between commits.

pub mod cache;
pub mod change_set;
pub mod controller;
pub mod diagnostics;
pub mod memory;
pub mod placeholder;
pub mod store;

pub use cache::{CacheRead, CacheSource, CachedStore, TierKind, TierStats};
pub use change_set::{ChangeHistory, ChangeSet};
pub use controller::{CommitSummary, Controller, ListPage, Phase};
pub use diagnostics::{
    BucketCount, DiagnosticsSnapshot, HistogramSnapshot, Operation, TierSnapshot, TimingHistogram,
    Timings, ALL_ENTITIES, LATENCY_BUCKETS,
};
pub use memory::{MemoryStore, StoreStats, StoreStatsSnapshot};
pub use placeholder::PlaceholderSequence;
pub use store::Store;
