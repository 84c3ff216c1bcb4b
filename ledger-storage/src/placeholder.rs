//! Provisional ids for time-series entities.
//!
//! Time-series rows get their final numeric id at commit, once the store's
//! current maximum is known. Until then they carry a placeholder id drawn
//! from a [`PlaceholderSequence`]. The sequence is owned by whoever creates
//! it, so independent controllers (and tests) never share a counter unless
//! they share the `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct PlaceholderSequence {
    prefix: String,
    next: AtomicU64,
}

impl PlaceholderSequence {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }

    /// Issue order of a placeholder id, `None` for any other id.
    pub fn sequence_of(&self, id: &str) -> Option<u64> {
        id.strip_prefix(self.prefix.as_str())?.parse().ok()
    }

    pub fn is_placeholder(&self, id: &str) -> bool {
        self.sequence_of(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential_and_recognised() {
        let seq = PlaceholderSequence::new("~ts");
        let a = seq.next_id();
        let b = seq.next_id();
        assert_eq!(a, "~ts1");
        assert_eq!(b, "~ts2");
        assert_eq!(seq.sequence_of(&b), Some(2));
        assert!(seq.is_placeholder(&a));
        assert!(!seq.is_placeholder("12"));
        assert!(!seq.is_placeholder("~tsx"));
    }

    #[test]
    fn test_sequences_are_independent() {
        let one = PlaceholderSequence::new("p");
        let two = PlaceholderSequence::new("p");
        one.next_id();
        assert_eq!(two.next_id(), "p1");
    }
}
