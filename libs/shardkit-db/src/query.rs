//! Backend-neutral query objects.
//!
//! A [`Query`] is what repositories hand to a driver: entity type, an optional
//! filter [`Expr`], ordering, a window and a projection. Queries are validated
//! when they are built so malformed field names never reach a backend.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DbError, Result};

#[allow(clippy::expect_used)]
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("static regex should not panic")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Filter expression over entity fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(String, CompareOperator, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

impl Expr {
    pub fn compare(field: impl Into<String>, op: CompareOperator, value: impl Into<Value>) -> Expr {
        Expr::Compare(field.into(), op, value.into())
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Ge, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOperator::Le, value)
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Expr {
        Expr::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: impl Into<String>) -> Expr {
        Expr::IsNull(field.into())
    }

    /// Combine two expressions with AND: `self and other`
    #[must_use]
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// Combine two expressions with OR: `self or other`
    #[must_use]
    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// AND together two optional expressions, `left` first.
    #[must_use]
    pub fn and_opt(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
        match (left, right) {
            (Some(l), Some(r)) => Some(l.and(r)),
            (l, None) => l,
            (None, r) => r,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.validate()?;
                b.validate()
            }
            Expr::Not(e) => e.validate(),
            Expr::Compare(field, _, _) | Expr::IsNull(field) => validate_field(field),
            Expr::In(field, values) => {
                validate_field(field)?;
                if values.is_empty() {
                    return Err(DbError::InvalidQuery(format!(
                        "empty IN list for field '{field}'"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Self::Output {
        Expr::Not(Box::new(self))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    #[serde(rename = "asc")]
    Asc,
    #[serde(rename = "desc")]
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub field: String,
    pub dir: SortDir,
}

impl OrderKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Desc,
        }
    }
}

/// What a query returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    /// Matching rows, windowed by offset/limit.
    Rows,
    /// Number of matching rows; ordering and windowing are ignored.
    Count,
}

/// A validated query against one entity type.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    entity_type: String,
    filter: Option<Expr>,
    order: Vec<OrderKey>,
    offset: u64,
    limit: Option<u64>,
    projection: Projection,
}

impl Query {
    /// Start building a row query for `entity_type`.
    pub fn builder(entity_type: impl Into<String>) -> QueryBuilder {
        QueryBuilder {
            entity_type: entity_type.into(),
            filter: None,
            order: Vec::new(),
            offset: 0,
            limit: None,
            projection: Projection::Rows,
        }
    }

    /// Row-count query over the same condition: ordering stripped, window removed.
    #[must_use]
    pub fn count_of(&self) -> Query {
        Query {
            entity_type: self.entity_type.clone(),
            filter: self.filter.clone(),
            order: Vec::new(),
            offset: 0,
            limit: None,
            projection: Projection::Count,
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn filter(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    #[must_use]
    pub fn order(&self) -> &[OrderKey] {
        &self.order
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    #[must_use]
    pub fn projection(&self) -> Projection {
        self.projection
    }
}

#[must_use]
pub struct QueryBuilder {
    entity_type: String,
    filter: Option<Expr>,
    order: Vec<OrderKey>,
    offset: u64,
    limit: Option<u64>,
    projection: Projection,
}

impl QueryBuilder {
    /// AND `expr` into the current filter.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Expr::and_opt(self.filter.take(), Some(expr));
        self
    }

    pub fn filter_opt(self, expr: Option<Expr>) -> Self {
        match expr {
            Some(e) => self.filter(e),
            None => self,
        }
    }

    pub fn order_by(mut self, keys: impl IntoIterator<Item = OrderKey>) -> Self {
        self.order.extend(keys);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn count(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    /// Validate and produce the query.
    ///
    /// # Errors
    /// Returns `DbError::InvalidQuery` for a blank entity type, a malformed field
    /// name in the filter or ordering, or an empty IN list.
    pub fn build(self) -> Result<Query> {
        if self.entity_type.trim().is_empty() {
            return Err(DbError::InvalidQuery("blank entity type".to_owned()));
        }
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for key in &self.order {
            validate_field(&key.field)?;
        }

        let (order, offset, limit) = match self.projection {
            Projection::Rows => (self.order, self.offset, self.limit),
            Projection::Count => (Vec::new(), 0, None),
        };

        Ok(Query {
            entity_type: self.entity_type,
            filter: self.filter,
            order,
            offset,
            limit,
            projection: self.projection,
        })
    }
}

fn validate_field(field: &str) -> Result<()> {
    if FIELD_RE.is_match(field) {
        Ok(())
    } else {
        Err(DbError::InvalidQuery(format!("malformed field name {field:?}")))
    }
}

/// One sub-result of a multi-query batch.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Rows(Vec<Value>),
    Count(u64),
}
