//! Error types for ledger operations

use thiserror::Error;

/// Errors raised while admitting, reading or filtering entities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityError {
    #[error("Invalid field {field} on entity {entity}: {reason}")]
    InvalidField {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("List filter on entity {entity} failed: {reason}")]
    InvalidListFilter { entity: String, reason: String },

    #[error("Cannot update immutable entity {entity} with id {id} on chain {chain}")]
    UpdateImmutable {
        entity: String,
        id: String,
        chain: String,
    },

    #[error("Invalid value for field {field} of {entity} {id}: {reason}")]
    InvalidFieldValue {
        entity: String,
        id: String,
        field: String,
        reason: String,
    },

    #[error("Unknown entity type: {entity}")]
    UnknownEntity { entity: String },

    #[error("Invalid cursor: {cursor:?}")]
    InvalidCursor { cursor: String },
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store operation {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Failures of the affine operator algebra.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperatorError {
    #[error("Arithmetic overflow while applying operator to {field}")]
    Overflow { field: String },

    #[error("Field {field} is not numeric")]
    NotNumeric { field: String },

    #[error("Value {value} cannot be represented as {field}")]
    NotRepresentable { field: String, value: String },
}

/// Master error type for all ledger errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_immutable_display_carries_context() {
        let err = EntityError::UpdateImmutable {
            entity: "Transfer".to_string(),
            id: "42".to_string(),
            chain: "1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Transfer"));
        assert!(msg.contains("42"));
        assert!(msg.contains("chain 1"));
    }

    #[test]
    fn test_invalid_field_value_display() {
        let err = EntityError::InvalidFieldValue {
            entity: "Account".to_string(),
            id: "0xabc".to_string(),
            field: "kind".to_string(),
            reason: "not a member of the enum".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("kind"));
        assert!(msg.contains("0xabc"));
        assert!(msg.contains("not a member"));
    }

    #[test]
    fn test_store_error_display_lock_poisoned() {
        let msg = format!("{}", StoreError::LockPoisoned);
        assert!(msg.contains("lock poisoned"));
    }

    #[test]
    fn test_ledger_error_from_variants() {
        let entity = LedgerError::from(EntityError::UnknownEntity {
            entity: "Nope".to_string(),
        });
        assert!(matches!(entity, LedgerError::Entity(_)));

        let store = LedgerError::from(StoreError::LockPoisoned);
        assert!(matches!(store, LedgerError::Store(_)));

        let config = LedgerError::from(ConfigError::InvalidValue {
            field: "lru_capacity".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
        assert!(matches!(config, LedgerError::Config(_)));
    }
}
