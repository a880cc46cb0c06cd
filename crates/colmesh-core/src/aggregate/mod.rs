//! Aggregation functions and their mergeable intermediary state.
//!
//! During distributed execution every function emits, per group, an
//! [`IntermediaryResult`] rather than a final value. The coordinator merges
//! intermediaries of the same group pairwise, in any order and grouping, and
//! only then calculates the final value.
//!
//! All functions write format version [`FORMAT_VERSION`]; state with another
//! version, or produced by a different function, is rejected with
//! [`Error::IncompatibleState`].

mod basic;
mod decimal;
mod quantile;

pub use basic::{CountFunction, ExtremeFunction};
pub use decimal::{AvgFunction, SumFunction, DECIMAL_PRECISION};
pub use quantile::{QuantileFunction, QuantileSketch, DEFAULT_RELATIVE_ACCURACY};

use colmesh_proto::{AggregateFunction, AggregationSpec, IntermediaryResult, Value};

use crate::error::Error;

/// Layout version of every intermediary this module writes.
pub const FORMAT_VERSION: u8 = 1;

/// A running aggregation for one group.
pub trait AggregationFunction: Send {
    /// Which function this is.
    fn function(&self) -> AggregateFunction;

    /// Fold one input value in. Nulls are ignored by every function except `count`.
    fn add_value(&mut self, value: &Value) -> Result<(), Error>;

    /// Fold the state of another instance of the same function in.
    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error>;

    /// Snapshot the current state.
    fn to_intermediary(&self) -> IntermediaryResult;

    /// Final value of the aggregation.
    fn calculate(&self) -> Value;
}

/// Create a fresh function for an aggregation spec.
pub fn create(spec: &AggregationSpec) -> Result<Box<dyn AggregationFunction>, Error> {
    if spec.function != AggregateFunction::Count && spec.column.is_none() {
        return Err(Error::PlanBuild(format!(
            "{}() of '{}' needs an input column",
            spec.function.name(),
            spec.output
        )));
    }

    Ok(match spec.function {
        AggregateFunction::Count => Box::new(CountFunction::new()),
        AggregateFunction::Sum => Box::new(SumFunction::new()),
        AggregateFunction::Avg => Box::new(AvgFunction::new()),
        AggregateFunction::Min => Box::new(ExtremeFunction::min()),
        AggregateFunction::Max => Box::new(ExtremeFunction::max()),
        AggregateFunction::Quantile => {
            let q = spec.parameter.ok_or_else(|| {
                Error::PlanBuild(format!("quantile '{}' needs a parameter", spec.output))
            })?;
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::PlanBuild(format!(
                    "quantile '{}' parameter {} outside [0, 1]",
                    spec.output, q
                )));
            }
            Box::new(QuantileFunction::new(q))
        }
    })
}

/// Merge two intermediaries of the same aggregation.
///
/// Associative and commutative for every function.
pub fn merge_intermediaries(
    spec: &AggregationSpec,
    a: &IntermediaryResult,
    b: &IntermediaryResult,
) -> Result<IntermediaryResult, Error> {
    let mut function = create(spec)?;
    function.merge(a)?;
    function.merge(b)?;
    Ok(function.to_intermediary())
}

/// Final value of a (merged) intermediary.
pub fn finalize(spec: &AggregationSpec, intermediary: &IntermediaryResult) -> Result<Value, Error> {
    let mut function = create(spec)?;
    function.merge(intermediary)?;
    Ok(function.calculate())
}

/// Reject state written by another function or in an unknown layout.
pub(crate) fn check_state(expected: AggregateFunction, state: &IntermediaryResult) -> Result<(), Error> {
    if state.function() != expected {
        return Err(Error::IncompatibleState(format!(
            "cannot merge {} state into {}",
            state.function().name(),
            expected.name()
        )));
    }
    if state.format_version() != FORMAT_VERSION {
        return Err(Error::IncompatibleState(format!(
            "{} state has format version {}, expected {}",
            expected.name(),
            state.format_version(),
            FORMAT_VERSION
        )));
    }
    Ok(())
}

pub(crate) fn malformed(function: AggregateFunction, what: &str) -> Error {
    Error::IncompatibleState(format!("malformed {} state: {}", function.name(), what))
}

/// Numeric input of sum, avg and quantile.
pub(crate) fn numeric_input(function: AggregateFunction, value: &Value) -> Result<Option<f64>, Error> {
    match value {
        Value::Null => Ok(None),
        Value::Long(v) => Ok(Some(*v as f64)),
        Value::Double(v) if v.is_finite() => Ok(Some(*v)),
        other => Err(Error::TypeMismatch {
            column: function.name().to_string(),
            expected: "finite number".to_string(),
            actual: crate::storage::describe_type(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn state_of(spec: &AggregationSpec, values: &[Value]) -> IntermediaryResult {
        let mut function = create(spec).unwrap();
        for value in values {
            function.add_value(value).unwrap();
        }
        function.to_intermediary()
    }

    fn random_values(rng: &mut impl Rng, n: usize) -> Vec<Value> {
        (0..n)
            .map(|_| {
                if rng.gen_bool(0.7) {
                    Value::Long(rng.gen_range(-1_000..1_000))
                } else {
                    Value::Double(rng.gen_range(-100i32..100) as f64 / 4.0)
                }
            })
            .collect()
    }

    fn specs() -> Vec<AggregationSpec> {
        vec![
            AggregationSpec::count("n"),
            AggregationSpec::over(AggregateFunction::Sum, "x", "sum"),
            AggregationSpec::over(AggregateFunction::Avg, "x", "avg"),
            AggregationSpec::over(AggregateFunction::Min, "x", "min"),
            AggregationSpec::over(AggregateFunction::Max, "x", "max"),
            AggregationSpec::quantile("x", 0.9, "p90"),
        ]
    }

    #[test]
    fn test_create_validates_specs() {
        let mut no_column = AggregationSpec::count("s");
        no_column.function = AggregateFunction::Sum;
        assert!(matches!(create(&no_column), Err(Error::PlanBuild(_))));

        let mut no_param = AggregationSpec::quantile("x", 0.5, "q");
        no_param.parameter = None;
        assert!(matches!(create(&no_param), Err(Error::PlanBuild(_))));
        assert!(create(&AggregationSpec::quantile("x", 1.5, "q")).is_err());
    }

    #[test]
    fn test_merge_is_associative_and_commutative() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let a_len = rng.gen_range(0..40);
            let a_values = random_values(&mut rng, a_len);
            let b_len = rng.gen_range(0..40);
            let b_values = random_values(&mut rng, b_len);
            let c_len = rng.gen_range(0..40);
            let c_values = random_values(&mut rng, c_len);

            for spec in specs() {
                let a = state_of(&spec, &a_values);
                let b = state_of(&spec, &b_values);
                let c = state_of(&spec, &c_values);

                let ab_c = merge_intermediaries(&spec, &merge_intermediaries(&spec, &a, &b).unwrap(), &c).unwrap();
                let a_bc = merge_intermediaries(&spec, &a, &merge_intermediaries(&spec, &b, &c).unwrap()).unwrap();
                let ac_b = merge_intermediaries(&spec, &merge_intermediaries(&spec, &a, &c).unwrap(), &b).unwrap();

                let expected = finalize(&spec, &ab_c).unwrap();
                assert_eq!(finalize(&spec, &a_bc).unwrap(), expected, "{}", spec.output);
                assert_eq!(finalize(&spec, &ac_b).unwrap(), expected, "{}", spec.output);
                if spec.function != AggregateFunction::Quantile {
                    assert_eq!(ab_c, a_bc, "{}", spec.output);
                    assert_eq!(ab_c, ac_b, "{}", spec.output);
                }
            }
        }
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let values: Vec<Value> = (1..=10).map(Value::Long).collect();
        for spec in specs() {
            let whole = state_of(&spec, &values);
            let merged = merge_intermediaries(&spec, &state_of(&spec, &values[..4]), &state_of(&spec, &values[4..]))
                .unwrap();
            assert_eq!(finalize(&spec, &merged).unwrap(), finalize(&spec, &whole).unwrap());
        }
    }

    #[test]
    fn test_foreign_state_is_rejected() {
        let count = state_of(&AggregationSpec::count("n"), &[Value::Long(1)]);
        let sum_spec = AggregationSpec::over(AggregateFunction::Sum, "x", "s");
        assert!(matches!(
            merge_intermediaries(&sum_spec, &count, &count),
            Err(Error::IncompatibleState(_))
        ));

        let mut future = IntermediaryResult::new(AggregateFunction::Count, FORMAT_VERSION + 1);
        future.push_value(Value::Long(3));
        assert!(matches!(
            finalize(&AggregationSpec::count("n"), &future),
            Err(Error::IncompatibleState(_))
        ));
    }

    #[test]
    fn test_empty_groups() {
        for spec in specs() {
            let empty = state_of(&spec, &[]);
            let expected = match spec.function {
                AggregateFunction::Count => Value::Long(0),
                _ => Value::Null,
            };
            assert_eq!(finalize(&spec, &empty).unwrap(), expected, "{}", spec.output);
        }
    }
}
