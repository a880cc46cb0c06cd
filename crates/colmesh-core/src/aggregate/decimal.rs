//! Sum and average over exact decimal accumulators.
//!
//! Every intermediate result is rounded to [`DECIMAL_PRECISION`] significant
//! digits, half-up, so a value does not depend on which node produced it or
//! in which order partial sums were merged.

use std::num::NonZeroU64;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use colmesh_proto::{AggregateFunction, IntermediaryResult, Value};

use super::{check_state, malformed, numeric_input, AggregationFunction, FORMAT_VERSION};
use crate::error::Error;

/// Significant digits kept by decimal accumulators.
pub const DECIMAL_PRECISION: u64 = 34;

const SAW_DOUBLE: i64 = 1;

fn round(value: BigDecimal) -> BigDecimal {
    let precision = NonZeroU64::new(DECIMAL_PRECISION).unwrap_or(NonZeroU64::MIN);
    value.with_precision_round(precision, RoundingMode::HalfUp).normalized()
}

fn add(a: &BigDecimal, b: &BigDecimal) -> BigDecimal {
    round(a + b)
}

fn to_double(value: &BigDecimal) -> Value {
    value.to_string().parse().map_or(Value::Null, Value::Double)
}

fn to_decimal(function: AggregateFunction, value: &Value) -> Result<Option<(BigDecimal, bool)>, Error> {
    if let Value::Long(v) = value {
        return Ok(Some((BigDecimal::from(*v), false)));
    }
    match numeric_input(function, value)? {
        None => Ok(None),
        // The shortest round-trip form keeps exactly the digits the double shows.
        Some(v) => BigDecimal::from_str(&format!("{:e}", v))
            .map(|d| Some((round(d), true)))
            .map_err(|e| Error::Overflow(format!("{} input {} is not a decimal: {}", function.name(), v, e))),
    }
}

fn read_decimal(function: AggregateFunction, value: Option<&Value>) -> Result<BigDecimal, Error> {
    let text = value
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(function, "missing decimal"))?;
    BigDecimal::from_str(text).map_err(|e| malformed(function, &e.to_string()))
}

fn read_long(function: AggregateFunction, value: Option<&Value>, what: &str) -> Result<i64, Error> {
    value
        .and_then(Value::as_long)
        .ok_or_else(|| malformed(function, what))
}

/// Sum of a numeric column. State: `[String sum, Long flags, Long count]`.
///
/// The result is a long while only longs were added and it fits, a double
/// otherwise, and null for an empty group.
#[derive(Debug, Default)]
pub struct SumFunction {
    sum: BigDecimal,
    saw_double: bool,
    count: i64,
}

impl SumFunction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregationFunction for SumFunction {
    fn function(&self) -> AggregateFunction {
        AggregateFunction::Sum
    }

    fn add_value(&mut self, value: &Value) -> Result<(), Error> {
        if let Some((d, is_double)) = to_decimal(AggregateFunction::Sum, value)? {
            self.sum = add(&self.sum, &d);
            self.saw_double |= is_double;
            self.count += 1;
        }
        Ok(())
    }

    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error> {
        check_state(AggregateFunction::Sum, intermediary)?;
        let mut values = intermediary.values();
        let sum = read_decimal(AggregateFunction::Sum, values.next())?;
        let flags = read_long(AggregateFunction::Sum, values.next(), "missing flags")?;
        let count = read_long(AggregateFunction::Sum, values.next(), "missing count")?;

        self.sum = add(&self.sum, &sum);
        self.saw_double |= flags & SAW_DOUBLE != 0;
        self.count += count;
        Ok(())
    }

    fn to_intermediary(&self) -> IntermediaryResult {
        let mut state = IntermediaryResult::new(AggregateFunction::Sum, FORMAT_VERSION);
        state.push_value(Value::String(self.sum.to_string()));
        state.push_value(Value::Long(if self.saw_double { SAW_DOUBLE } else { 0 }));
        state.push_value(Value::Long(self.count));
        state
    }

    fn calculate(&self) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        if !self.saw_double {
            if let Some(v) = self.sum.to_i64() {
                return Value::Long(v);
            }
        }
        to_double(&self.sum)
    }
}

/// Arithmetic mean. State: `[String sum, Long count]`. Null for an empty group.
#[derive(Debug, Default)]
pub struct AvgFunction {
    sum: BigDecimal,
    count: i64,
}

impl AvgFunction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregationFunction for AvgFunction {
    fn function(&self) -> AggregateFunction {
        AggregateFunction::Avg
    }

    fn add_value(&mut self, value: &Value) -> Result<(), Error> {
        if let Some((d, _)) = to_decimal(AggregateFunction::Avg, value)? {
            self.sum = add(&self.sum, &d);
            self.count += 1;
        }
        Ok(())
    }

    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error> {
        check_state(AggregateFunction::Avg, intermediary)?;
        let mut values = intermediary.values();
        let sum = read_decimal(AggregateFunction::Avg, values.next())?;
        let count = read_long(AggregateFunction::Avg, values.next(), "missing count")?;

        self.sum = add(&self.sum, &sum);
        self.count += count;
        Ok(())
    }

    fn to_intermediary(&self) -> IntermediaryResult {
        let mut state = IntermediaryResult::new(AggregateFunction::Avg, FORMAT_VERSION);
        state.push_value(Value::String(self.sum.to_string()));
        state.push_value(Value::Long(self.count));
        state
    }

    fn calculate(&self) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        to_double(&round(&self.sum / BigDecimal::from(self.count)))
    }
}
