//! Null-aware filter evaluation.
//!
//! [`compare`] returns a [`Comparison`] rather than an `Ordering` so each
//! filter operator can spell out its own null semantics. Filters are compiled
//! against an entity type once ([`CompiledFilter::new`]) and then evaluated
//! against any number of revisions without failing.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entity::EntityBox;
use crate::error::{EntityError, LedgerResult};
use crate::schema::{EntityTypeDescription, ScalarKind};
use crate::value::Value;

static NULL_VALUE: Value = Value::Null;

// ============================================================================
// COMPARATOR
// ============================================================================

/// Outcome of comparing a stored value (left) with a query value (right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Equal,
    Less,
    Greater,
    /// Both present but not orderable: lists of different length, NaN,
    /// or values of unrelated kinds
    Unordered,
    BothNull,
    LeftNull,
    RightNull,
}

impl From<Ordering> for Comparison {
    fn from(ord: Ordering) -> Self {
        match ord {
            Ordering::Less => Comparison::Less,
            Ordering::Equal => Comparison::Equal,
            Ordering::Greater => Comparison::Greater,
        }
    }
}

impl Comparison {
    /// Equality as used by `EQ`, `IN` and set membership: two nulls match.
    pub fn is_match(self) -> bool {
        matches!(self, Comparison::Equal | Comparison::BothNull)
    }
}

/// Compare two values with explicit null handling.
pub fn compare(left: &Value, right: &Value) -> Comparison {
    match (left, right) {
        (Value::Null, Value::Null) => Comparison::BothNull,
        (Value::Null, _) => Comparison::LeftNull,
        (_, Value::Null) => Comparison::RightNull,
        (Value::List(l), Value::List(r)) => compare_lists(l, r),
        (Value::List(_), _) | (_, Value::List(_)) => Comparison::Unordered,
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r).into(),
        (Value::String(l), Value::String(r)) => l.cmp(r).into(),
        (Value::Bytes(l), Value::Bytes(r)) => l.cmp(r).into(),
        (Value::Timestamp(l), Value::Timestamp(r)) => l.cmp(r).into(),
        (l, r) if l.is_numeric() && r.is_numeric() => compare_numbers(l, r),
        _ => Comparison::Unordered,
    }
}

fn compare_lists(left: &[Value], right: &[Value]) -> Comparison {
    if left.len() != right.len() {
        return Comparison::Unordered;
    }
    for (l, r) in left.iter().zip(right) {
        match compare(l, r) {
            Comparison::Equal | Comparison::BothNull => continue,
            ord @ (Comparison::Less | Comparison::Greater) => return ord,
            _ => return Comparison::Unordered,
        }
    }
    Comparison::Equal
}

fn compare_numbers(left: &Value, right: &Value) -> Comparison {
    let ord = match (left, right) {
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        (Value::Int(l), Value::BigInt(r)) => Some(i128::from(*l).cmp(r)),
        (Value::BigInt(l), Value::Int(r)) => Some(l.cmp(&i128::from(*r))),
        (Value::BigInt(l), Value::BigInt(r)) => Some(l.cmp(r)),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            as_f64(left).and_then(|l| as_f64(right).and_then(|r| l.partial_cmp(&r)))
        }
        _ => match (left.as_decimal(), right.as_decimal()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => None,
        },
    };
    ord.map_or(Comparison::Unordered, Comparison::from)
}

fn as_f64(v: &Value) -> Option<f64> {
    use rust_decimal::prelude::ToPrimitive;
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::BigInt(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// Filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    #[serde(rename = "EQ")]
    Eq,
    #[serde(rename = "NE")]
    Ne,
    #[serde(rename = "GT")]
    Gt,
    #[serde(rename = "GE")]
    Ge,
    #[serde(rename = "LT")]
    Lt,
    #[serde(rename = "LE")]
    Le,
    In,
    NotIn,
    Like,
    NotLike,
    HasAll,
    HasAny,
}

impl FilterOperator {
    fn is_single_valued(self) -> bool {
        matches!(
            self,
            FilterOperator::Eq
                | FilterOperator::Ne
                | FilterOperator::Gt
                | FilterOperator::Ge
                | FilterOperator::Lt
                | FilterOperator::Le
                | FilterOperator::Like
                | FilterOperator::NotLike
        )
    }
}

/// One list predicate: `field operator values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub values: Vec<Value>,
    /// Precomputed ids for primary-key `IN`/`NOT_IN`; replaces `values` when set
    #[serde(skip)]
    pub id_set: Option<Arc<HashSet<String>>>,
}

impl EntityFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            values,
            id_set: None,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, vec![value.into()])
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Ne, vec![value.into()])
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Gt, vec![value.into()])
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Ge, vec![value.into()])
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Lt, vec![value.into()])
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Le, vec![value.into()])
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOperator::In, values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOperator::NotIn, values.into_iter().map(Into::into).collect())
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Like, vec![Value::String(pattern.into())])
    }

    pub fn not_like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::NotLike, vec![Value::String(pattern.into())])
    }

    pub fn has_all<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOperator::HasAll, values.into_iter().map(Into::into).collect())
    }

    pub fn has_any<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(field, FilterOperator::HasAny, values.into_iter().map(Into::into).collect())
    }

    /// Primary-key exclusion backed by a hash set.
    pub fn id_not_in(primary: impl Into<String>, ids: Arc<HashSet<String>>) -> Self {
        Self {
            field: primary.into(),
            operator: FilterOperator::NotIn,
            values: Vec::new(),
            id_set: Some(ids),
        }
    }

    /// Primary-key inclusion backed by a hash set.
    pub fn id_in(primary: impl Into<String>, ids: Arc<HashSet<String>>) -> Self {
        Self {
            field: primary.into(),
            operator: FilterOperator::In,
            values: Vec::new(),
            id_set: Some(ids),
        }
    }
}

/// A filter resolved against an entity type.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: EntityFilter,
    primary: bool,
    pattern: Option<Regex>,
}

impl CompiledFilter {
    pub fn new(filter: EntityFilter, ty: &dyn EntityTypeDescription) -> LedgerResult<Self> {
        let invalid_list = |reason: String| EntityError::InvalidListFilter {
            entity: ty.name().to_string(),
            reason: format!("{} {:?}: {}", filter.field, filter.operator, reason),
        };

        let Some(field) = ty.field(&filter.field) else {
            return Err(EntityError::InvalidField {
                entity: ty.name().to_string(),
                field: filter.field.clone(),
                reason: "no such field".to_string(),
            }
            .into());
        };
        if field.is_derived() {
            return Err(EntityError::InvalidField {
                entity: ty.name().to_string(),
                field: filter.field.clone(),
                reason: "derived relations cannot be filtered".to_string(),
            }
            .into());
        }
        let primary = field.kind == ScalarKind::Id;

        if filter.operator.is_single_valued() && filter.values.len() != 1 {
            return Err(invalid_list(format!("expects one value, got {}", filter.values.len())).into());
        }
        if filter.id_set.is_some() && !primary {
            return Err(invalid_list("id sets only apply to the primary key".to_string()).into());
        }

        let mut pattern = None;
        match filter.operator {
            FilterOperator::HasAll | FilterOperator::HasAny if field.list_depth != 1 => {
                return Err(invalid_list("requires a one-dimensional list field".to_string()).into());
            }
            FilterOperator::Like | FilterOperator::NotLike => {
                if field.is_list() {
                    return Err(invalid_list("cannot match patterns on a list field".to_string()).into());
                }
                let Some(raw) = filter.values[0].as_str() else {
                    return Err(invalid_list("pattern must be a string".to_string()).into());
                };
                let regex = like_to_regex(raw).map_err(|e| invalid_list(e.to_string()))?;
                pattern = Some(regex);
            }
            _ => {}
        }

        Ok(Self {
            filter,
            primary,
            pattern,
        })
    }

    pub fn filter(&self) -> &EntityFilter {
        &self.filter
    }

    /// Evaluate against a revision. Deleted revisions never match.
    pub fn matches(&self, entity: &EntityBox) -> bool {
        let Some(data) = entity.data.as_ref() else {
            return false;
        };

        if self.primary {
            if let Some(ids) = &self.filter.id_set {
                return match self.filter.operator {
                    FilterOperator::In => ids.contains(&entity.id),
                    FilterOperator::NotIn => !ids.contains(&entity.id),
                    _ => false,
                };
            }
        }

        let id_value;
        let left = if self.primary {
            id_value = Value::String(entity.id.clone());
            &id_value
        } else {
            data.get(&self.filter.field).unwrap_or(&NULL_VALUE)
        };
        let values = &self.filter.values;

        match self.filter.operator {
            FilterOperator::Eq => compare(left, &values[0]).is_match(),
            FilterOperator::Ne => matches!(
                compare(left, &values[0]),
                Comparison::Less | Comparison::Greater | Comparison::Unordered
            ),
            FilterOperator::Gt => compare(left, &values[0]) == Comparison::Greater,
            FilterOperator::Ge => matches!(
                compare(left, &values[0]),
                Comparison::Greater | Comparison::Equal
            ),
            FilterOperator::Lt => compare(left, &values[0]) == Comparison::Less,
            FilterOperator::Le => matches!(
                compare(left, &values[0]),
                Comparison::Less | Comparison::Equal
            ),
            FilterOperator::In => values.iter().any(|v| compare(left, v).is_match()),
            FilterOperator::NotIn => !values.iter().any(|v| compare(left, v).is_match()),
            FilterOperator::Like => self.like(left).unwrap_or(false),
            FilterOperator::NotLike => self.like(left).map(|m| !m).unwrap_or(false),
            FilterOperator::HasAll => {
                let items = left.as_list().unwrap_or(&[]);
                values
                    .iter()
                    .all(|v| items.iter().any(|item| compare(item, v).is_match()))
            }
            FilterOperator::HasAny => {
                let items = left.as_list().unwrap_or(&[]);
                values
                    .iter()
                    .any(|v| items.iter().any(|item| compare(item, v).is_match()))
            }
        }
    }

    fn like(&self, left: &Value) -> Option<bool> {
        let text = left.as_str()?;
        self.pattern.as_ref().map(|p| p.is_match(text))
    }
}

/// Compile a batch of filters against one type.
pub fn compile_filters(
    filters: &[EntityFilter],
    ty: &dyn EntityTypeDescription,
) -> LedgerResult<Vec<CompiledFilter>> {
    filters
        .iter()
        .cloned()
        .map(|f| CompiledFilter::new(f, ty))
        .collect()
}

/// Conjunction of compiled filters.
pub fn matches_all(filters: &[CompiledFilter], entity: &EntityBox) -> bool {
    !entity.is_deleted() && filters.iter().all(|f| f.matches(entity))
}

/// Translate a SQL `LIKE` pattern into an anchored regular expression.
///
/// `%` matches any run, `_` one character; `\%` and `\_` are literals.
pub fn like_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("^(?s:");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek().copied() {
                Some(escaped @ ('%' | '_')) => {
                    chars.next();
                    out.push(escaped);
                }
                _ => out.push_str(r"\\"),
            },
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    out.push_str(")$");
    Regex::new(&out)
}
