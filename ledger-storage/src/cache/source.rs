//! Read results tagged with the tier that answered them.

use serde::Serialize;

/// Where a read was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Pure-cache tier
    PureCache,
    /// LRU value tier
    Lru,
    /// Id-existence set proved the entity absent
    IdSet,
    /// Full-table tier
    FullTable,
    /// Backing store
    Persistent,
}

impl CacheSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheSource::PureCache => "pure_cache",
            CacheSource::Lru => "lru",
            CacheSource::IdSet => "id_set",
            CacheSource::FullTable => "full_table",
            CacheSource::Persistent => "persistent",
        }
    }

    pub fn is_cache(self) -> bool {
        self != CacheSource::Persistent
    }
}

/// Result of a cached read, carrying where it came from.
///
/// Values are always independent copies of what the tier holds.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    source: CacheSource,
}

impl<T> CacheRead<T> {
    /// Create a read answered by a cache tier.
    pub fn from_cache(value: T, source: CacheSource) -> Self {
        Self { value, source }
    }

    /// Create a read answered by the backing store.
    pub fn from_storage(value: T) -> Self {
        Self {
            value,
            source: CacheSource::Persistent,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> CacheSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source.is_cache()
    }

    /// Transform the value, keeping the source.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_reads_are_misses() {
        let read = CacheRead::from_storage(1);
        assert!(!read.was_cache_hit());
        assert_eq!(read.source(), CacheSource::Persistent);
        assert_eq!(read.into_value(), 1);
    }

    #[test]
    fn test_map_keeps_source() {
        let read = CacheRead::from_cache(2, CacheSource::IdSet).map(|v| v * 10);
        assert!(read.was_cache_hit());
        assert_eq!(read.source(), CacheSource::IdSet);
        assert_eq!(*read.value(), 20);
    }
}
