//! Query descriptor and result row types.
//!
//! The core never interprets a descriptor beyond its structure: filters are
//! kept as an ordered list of predicates so plugins can append to them, and
//! values are plain JSON so any driver can map them onto its own types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Rows returned by a driver and passed through the after-phase.
pub type Rows = Vec<Row>;

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
}

/// `field <op> value`; predicates in a descriptor are combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// One logical query against a collection.
///
/// Descriptors are values: transformation hooks build a new descriptor with
/// the `with_*` methods instead of mutating a shared one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub target: String,
    #[serde(default)]
    pub filter: Vec<Predicate>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub skip: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl QueryDescriptor {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Append a predicate after the existing ones.
    pub fn with_filter(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the structural invariants every driver relies on.
    pub fn is_well_formed(&self) -> bool {
        !self.target.trim().is_empty()
            && self.filter.iter().all(|p| !p.field.is_empty())
            && self.sort.iter().all(|s| !s.field.is_empty())
    }
}
