//! Pagination cursors.
//!
//! A cursor is the last id returned on the previous page, tagged with where
//! the next page begins: `#id` may still include uncommitted revisions,
//! `@id` continues purely in the backing store. The empty string starts a
//! listing. Ids are exclusive lower bounds.

use std::fmt;

use crate::error::{EntityError, LedgerResult};

const UNCOMMITTED_PREFIX: char = '#';
const COMMITTED_PREFIX: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Cursor {
    #[default]
    Start,
    /// Next page merges uncommitted revisions after this id
    Uncommitted(String),
    /// Next page reads only the backing store after this id
    Committed(String),
}

impl Cursor {
    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let mut chars = raw.chars();
        match chars.next() {
            None => Ok(Cursor::Start),
            Some(UNCOMMITTED_PREFIX) => Ok(Cursor::Uncommitted(chars.as_str().to_string())),
            Some(COMMITTED_PREFIX) => Ok(Cursor::Committed(chars.as_str().to_string())),
            Some(_) => Err(EntityError::InvalidCursor {
                cursor: raw.to_string(),
            }
            .into()),
        }
    }

    /// Exclusive lower bound on ids for the next page.
    pub fn after(&self) -> Option<&str> {
        match self {
            Cursor::Start => None,
            Cursor::Uncommitted(id) | Cursor::Committed(id) => Some(id),
        }
    }

    /// Whether uncommitted revisions can still appear on the next page.
    pub fn includes_uncommitted(&self) -> bool {
        !matches!(self, Cursor::Committed(_))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => Ok(()),
            Cursor::Uncommitted(id) => write!(f, "{}{}", UNCOMMITTED_PREFIX, id),
            Cursor::Committed(id) => write!(f, "{}{}", COMMITTED_PREFIX, id),
        }
    }
}
