//! Configuration types

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, LedgerError, LedgerResult};

/// Cache tier sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept per entity type in the LRU value tier.
    pub lru_capacity: usize,
    /// Upper bound on `row count * estimated row size` for a full-table cache.
    pub full_table_budget_bytes: usize,
    /// Budget for pure-cache types that do not declare their own.
    pub pure_cache_default_budget_bytes: usize,
    /// Whether the LRU tier loads the full id set to answer misses cheaply.
    pub enable_id_set: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 10_000,
            full_table_budget_bytes: 64 * 1024 * 1024,
            pure_cache_default_budget_bytes: 16 * 1024 * 1024,
            enable_id_set: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the LRU capacity.
    pub fn with_lru_capacity(mut self, capacity: usize) -> Self {
        self.lru_capacity = capacity;
        self
    }

    /// Set the full-table budget.
    pub fn with_full_table_budget(mut self, bytes: usize) -> Self {
        self.full_table_budget_bytes = bytes;
        self
    }

    /// Set the fallback pure-cache budget.
    pub fn with_pure_cache_budget(mut self, bytes: usize) -> Self {
        self.pure_cache_default_budget_bytes = bytes;
        self
    }

    /// Enable or disable the id-existence set.
    pub fn with_id_set(mut self, enabled: bool) -> Self {
        self.enable_id_set = enabled;
        self
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.lru_capacity == 0 {
            return Err(LedgerError::Config(ConfigError::InvalidValue {
                field: "cache.lru_capacity".to_string(),
                value: self.lru_capacity.to_string(),
                reason: "lru_capacity must be greater than 0".to_string(),
            }));
        }

        if self.full_table_budget_bytes == 0 {
            return Err(LedgerError::Config(ConfigError::InvalidValue {
                field: "cache.full_table_budget_bytes".to_string(),
                value: self.full_table_budget_bytes.to_string(),
                reason: "full_table_budget_bytes must be greater than 0".to_string(),
            }));
        }

        if self.pure_cache_default_budget_bytes == 0 {
            return Err(LedgerError::Config(ConfigError::InvalidValue {
                field: "cache.pure_cache_default_budget_bytes".to_string(),
                value: self.pure_cache_default_budget_bytes.to_string(),
                reason: "pure_cache_default_budget_bytes must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }
}

/// Master configuration for a ledger session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub cache: CacheConfig,
    /// Prefix of provisional time-series ids handed out before commit.
    /// Must not start with a digit so placeholders never collide with final ids.
    pub time_series_placeholder_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            time_series_placeholder_prefix: "~ts".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_placeholder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.time_series_placeholder_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - cache capacities and budgets are positive
    /// - the placeholder prefix is non-empty and does not start with a digit
    pub fn validate(&self) -> LedgerResult<()> {
        self.cache.validate()?;

        let prefix = &self.time_series_placeholder_prefix;
        if prefix.is_empty() || prefix.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(LedgerError::Config(ConfigError::InvalidValue {
                field: "time_series_placeholder_prefix".to_string(),
                value: prefix.clone(),
                reason: "prefix must be non-empty and not start with a digit".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LedgerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_lru_capacity_rejected() {
        let config = LedgerConfig::new().with_cache(CacheConfig::new().with_lru_capacity(0));
        let err = config.validate().unwrap_err();
        match err {
            LedgerError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "cache.lru_capacity");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_budgets_rejected() {
        assert!(CacheConfig::new().with_full_table_budget(0).validate().is_err());
        assert!(CacheConfig::new().with_pure_cache_budget(0).validate().is_err());
    }

    #[test]
    fn test_numeric_placeholder_prefix_rejected() {
        assert!(LedgerConfig::new().with_placeholder_prefix("").validate().is_err());
        assert!(LedgerConfig::new().with_placeholder_prefix("9x").validate().is_err());
        assert!(LedgerConfig::new().with_placeholder_prefix("tmp-").validate().is_ok());
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = LedgerConfig::new()
            .with_cache(CacheConfig::new().with_lru_capacity(2).with_id_set(false));
        let json = serde_json::to_string(&config).unwrap();
        let back: LedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
