//! Remote execution requests.
//!
//! A [`RemotePlan`] is what the planner hands to the execution core: a table
//! name plus the logical operations to run on every shard of that table. Names
//! in it have already been validated by the planner; the execution core only
//! resolves them.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::value::Value;
use crate::Error;

/// Aggregation functions understood by the execution core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum AggregateFunction {
    /// Number of rows in the group.
    Count,
    /// Sum of a numeric column.
    Sum,
    /// Arithmetic mean of a numeric column.
    Avg,
    /// Smallest value of a column.
    Min,
    /// Largest value of a column.
    Max,
    /// Approximate quantile of a numeric column; the quantile is the spec parameter.
    Quantile,
}

impl AggregateFunction {
    /// Lowercase function name as used in logs and results.
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Quantile => "quantile",
        }
    }
}

/// One aggregation of a remote plan.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct AggregationSpec {
    /// Function to apply.
    pub function: AggregateFunction,
    /// Input column; `None` only for `count`.
    pub column: Option<String>,
    /// Function parameter, e.g. the quantile in `[0, 1]`.
    pub parameter: Option<f64>,
    /// Name of the output value.
    pub output: String,
}

impl AggregationSpec {
    /// `count()` over all rows of the group.
    pub fn count(output: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            column: None,
            parameter: None,
            output: output.into(),
        }
    }

    /// A function over one column.
    pub fn over(function: AggregateFunction, column: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            function,
            column: Some(column.into()),
            parameter: None,
            output: output.into(),
        }
    }

    /// `quantile(column, q)`.
    pub fn quantile(column: impl Into<String>, q: f64, output: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Quantile,
            column: Some(column.into()),
            parameter: Some(q),
            output: output.into(),
        }
    }
}

/// Comparison operators for row filters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Apply the operator to an ordering of `lhs` relative to `rhs`.
    pub fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

/// `column <op> value` restriction on rows. Filters of a plan are ANDed.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl RowFilter {
    /// Create a filter.
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Arithmetic applied when deriving a temporary column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// A query-local column computed as `source <op> operand`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct DerivedColumn {
    /// Name of the temporary column.
    pub name: String,
    /// Persisted or previously derived input column.
    pub source: String,
    pub op: ArithmeticOp,
    /// Constant right-hand side (long or double).
    pub operand: Value,
}

impl DerivedColumn {
    /// Create a derived column definition.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        op: ArithmeticOp,
        operand: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            op,
            operand: operand.into(),
        }
    }
}

/// A logical plan to execute on every shard of one table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct RemotePlan {
    /// Query identifier, used for cancellation.
    pub query_id: u64,
    /// Table to run on.
    pub table: String,
    /// Columns whose values are returned row by row.
    pub projection: Vec<String>,
    /// Temporary columns, in dependency order.
    pub derived: Vec<DerivedColumn>,
    /// Row restrictions (conjunction).
    pub filters: Vec<RowFilter>,
    /// Grouping column for aggregations.
    pub group_by: Option<String>,
    /// Aggregations, producing one intermediary result per group each.
    pub aggregations: Vec<AggregationSpec>,
    /// Maximum number of projected rows to return; ignored when aggregating.
    #[serde(default)]
    pub limit: Option<u64>,
}

impl RemotePlan {
    /// Create an empty plan for a table.
    pub fn new(query_id: u64, table: impl Into<String>) -> Self {
        Self {
            query_id,
            table: table.into(),
            projection: vec![],
            derived: vec![],
            filters: vec![],
            group_by: None,
            aggregations: vec![],
            limit: None,
        }
    }

    /// Return values of these columns.
    pub fn with_projection(mut self, columns: Vec<String>) -> Self {
        self.projection = columns;
        self
    }

    /// Add a derived temporary column.
    pub fn derive(mut self, column: DerivedColumn) -> Self {
        self.derived.push(column);
        self
    }

    /// Add a row filter.
    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Group aggregations by a column.
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by = Some(column.into());
        self
    }

    /// Add an aggregation.
    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.aggregations.push(spec);
        self
    }

    /// Return at most `limit` rows.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the plan produces intermediary aggregation results.
    pub fn is_aggregating(&self) -> bool {
        !self.aggregations.is_empty()
    }

    /// Parse a plan from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Render the plan as pretty JSON.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_compare_op_matches() {
        assert!(CompareOp::Le.matches(Ordering::Equal));
        assert!(CompareOp::Le.matches(Ordering::Less));
        assert!(!CompareOp::Lt.matches(Ordering::Equal));
        assert!(CompareOp::Ne.matches(Ordering::Greater));
        assert!(!CompareOp::Ge.matches(Ordering::Less));
    }

    #[test]
    fn test_plan_builder() {
        let plan = RemotePlan::new(7, "people")
            .derive(DerivedColumn::new("age_doubled", "age", ArithmeticOp::Multiply, 2i64))
            .filter(RowFilter::new("age", CompareOp::Gt, 18i64))
            .group_by("city")
            .aggregate(AggregationSpec::count("n"))
            .aggregate(AggregationSpec::quantile("age_doubled", 0.5, "median"));

        assert!(plan.is_aggregating());
        assert_eq!(plan.derived[0].operand, Value::Long(2));
        assert_eq!(plan.aggregations[1].parameter, Some(0.5));
        assert_eq!(plan.group_by.as_deref(), Some("city"));
    }

    #[test]
    fn test_plan_json_roundtrip() {
        let plan = RemotePlan::new(1, "t")
            .with_projection(vec!["x".into()])
            .with_limit(10)
            .aggregate(AggregationSpec::over(AggregateFunction::Sum, "x", "total"));
        let json = plan.to_json().unwrap();
        assert!(json.contains("\"Sum\""));
        assert_eq!(RemotePlan::from_json(&json).unwrap(), plan);
        assert!(RemotePlan::from_json("{").is_err());
    }
}
