//! Query statement model
//!
//! The leaf receives an already parsed statement: a metric, a select list
//! of field expressions, an optional tag condition, a time range with its
//! intervals, and group-by tag keys.

use crate::error::{QueryError, Result};
use rusts_core::{FunctionType, TimeRange, Timestamp};
use rusts_index::{BinaryOp, TagFilter};
use serde::{Deserialize, Serialize};

/// Select expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Field reference
    Field(String),
    /// Function call, e.g. `max(usage)` or `quantile(0.99)`
    Call { function: FunctionType, args: Vec<Expr> },
    /// Numeric literal
    Number(f64),
    /// Parenthesized expression
    Paren(Box<Expr>),
    /// Arithmetic between expressions
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn call(function: FunctionType, args: Vec<Expr>) -> Self {
        Expr::Call { function, args }
    }

    pub fn quantile(p: f64) -> Self {
        Expr::call(FunctionType::Quantile, vec![Expr::Number(p)])
    }

    pub fn paren(inner: Expr) -> Self {
        Expr::Paren(Box::new(inner))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// One entry of the select list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// Query statement as seen by the leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub namespace: String,
    pub metric_name: String,
    pub select: Vec<SelectItem>,
    /// Tag condition; `None` selects every series of the metric
    pub condition: Option<TagFilter>,
    pub time_range: TimeRange,
    /// Result bucket width in milliseconds, 0 = storage interval
    pub interval: i64,
    /// Interval of the data families to scan, in milliseconds
    pub storage_interval: i64,
    pub group_by: Vec<String>,
    /// Return per-task execution costs with the result
    pub explain: bool,
}

impl Query {
    /// Create a new query builder
    pub fn builder(metric_name: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(metric_name)
    }

    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Validate the statement shape; the select list is checked at plan time
    pub fn validate(&self) -> Result<()> {
        if self.metric_name.is_empty() {
            return Err(QueryError::InvalidQuery("Empty metric name".to_string()));
        }
        if self.time_range.is_empty() {
            return Err(QueryError::InvalidQuery(format!(
                "Invalid time range: start {} >= end {}",
                self.time_range.start, self.time_range.end
            )));
        }
        if self.storage_interval <= 0 {
            return Err(QueryError::InvalidQuery(format!(
                "Storage interval must be positive, got {}",
                self.storage_interval
            )));
        }
        if self.interval < 0 {
            return Err(QueryError::InvalidQuery(format!(
                "Interval must not be negative, got {}",
                self.interval
            )));
        }
        Ok(())
    }
}

/// Query builder for fluent API
pub struct QueryBuilder {
    namespace: String,
    metric_name: String,
    select: Vec<SelectItem>,
    condition: Option<TagFilter>,
    time_range: TimeRange,
    interval: i64,
    storage_interval: i64,
    group_by: Vec<String>,
    explain: bool,
}

/// Default storage interval: 10 seconds
const DEFAULT_STORAGE_INTERVAL: i64 = 10_000;

impl QueryBuilder {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            namespace: "default-ns".to_string(),
            metric_name: metric_name.into(),
            select: Vec::new(),
            condition: None,
            time_range: TimeRange::default(),
            interval: 0,
            storage_interval: DEFAULT_STORAGE_INTERVAL,
            group_by: Vec::new(),
            explain: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Select a field with its type's default function
    pub fn select_field(self, name: impl Into<String>) -> Self {
        self.select(Expr::field(name))
    }

    /// Select `function(field)`
    pub fn select_call(self, function: FunctionType, field: impl Into<String>) -> Self {
        self.select(Expr::call(function, vec![Expr::field(field)]))
    }

    /// Select `quantile(p)` over the histogram of the metric
    pub fn select_quantile(self, p: f64) -> Self {
        self.select(Expr::quantile(p))
    }

    pub fn select(mut self, expr: Expr) -> Self {
        self.select.push(SelectItem { expr, alias: None });
        self
    }

    pub fn select_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.select.push(SelectItem {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    /// Set the condition, AND-ing it with any condition already set
    pub fn condition(mut self, filter: TagFilter) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => TagFilter::and(existing, filter),
            None => filter,
        });
        self
    }

    /// Add a `key = value` condition
    pub fn where_tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.condition(TagFilter::equals(key, value))
    }

    /// Add a `key != value` condition
    pub fn where_tag_not(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.condition(TagFilter::not_equals(key, value))
    }

    pub fn time_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.time_range = TimeRange::new(start, end);
        self
    }

    pub fn interval(mut self, interval: i64) -> Self {
        self.interval = interval;
        self
    }

    pub fn storage_interval(mut self, storage_interval: i64) -> Self {
        self.storage_interval = storage_interval;
        self
    }

    pub fn group_by_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    /// Build the query
    pub fn build(self) -> Result<Query> {
        let query = Query {
            namespace: self.namespace,
            metric_name: self.metric_name,
            select: self.select,
            condition: self.condition,
            time_range: self.time_range,
            interval: self.interval,
            storage_interval: self.storage_interval,
            group_by: self.group_by,
            explain: self.explain,
        };

        query.validate()?;
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = Query::builder("cpu")
            .namespace("ns")
            .time_range(0, 1_000_000)
            .where_tag("host", "h1")
            .where_tag_not("path", "p1")
            .select_field("usage")
            .select_call(FunctionType::Max, "idle")
            .group_by_tags(["host"])
            .interval(60_000)
            .build()
            .unwrap();

        assert_eq!(query.namespace, "ns");
        assert_eq!(query.metric_name, "cpu");
        assert_eq!(query.select.len(), 2);
        assert!(query.is_grouped());
        assert_eq!(
            query.condition.as_ref().map(|c| c.rewrite()),
            Some("host='h1' and not (path='p1')".to_string())
        );
    }

    #[test]
    fn test_query_validation() {
        assert!(Query::builder("").time_range(0, 1000).build().is_err());
        assert!(Query::builder("cpu").time_range(1000, 0).build().is_err());
        assert!(Query::builder("cpu").storage_interval(0).build().is_err());
        assert!(Query::builder("cpu").interval(-1).build().is_err());

        // an empty select list is rejected by the planner, not the builder
        let query = Query::builder("cpu").time_range(0, 1000).build().unwrap();
        assert!(query.select.is_empty());
        assert!(!query.has_condition());
    }

    #[test]
    fn test_query_serialization() {
        let query = Query::builder("cpu")
            .select_quantile(0.99)
            .where_tag("host", "h1")
            .build()
            .unwrap();
        let bytes = bincode::serialize(&query).unwrap();
        let decoded: Query = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, query);
    }
}
