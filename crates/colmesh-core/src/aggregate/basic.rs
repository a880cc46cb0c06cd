//! Count, min and max.

use std::cmp::Ordering;

use colmesh_proto::{AggregateFunction, IntermediaryResult, Value};

use super::{check_state, malformed, AggregationFunction, FORMAT_VERSION};
use crate::error::Error;

/// Number of rows. State: `[Long count]`.
#[derive(Debug, Default)]
pub struct CountFunction {
    count: i64,
}

impl CountFunction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregationFunction for CountFunction {
    fn function(&self) -> AggregateFunction {
        AggregateFunction::Count
    }

    fn add_value(&mut self, _value: &Value) -> Result<(), Error> {
        self.count += 1;
        Ok(())
    }

    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error> {
        check_state(AggregateFunction::Count, intermediary)?;
        let count = intermediary
            .values()
            .next()
            .and_then(Value::as_long)
            .ok_or_else(|| malformed(AggregateFunction::Count, "missing count"))?;
        self.count += count;
        Ok(())
    }

    fn to_intermediary(&self) -> IntermediaryResult {
        let mut state = IntermediaryResult::new(AggregateFunction::Count, FORMAT_VERSION);
        state.push_value(Value::Long(self.count));
        state
    }

    fn calculate(&self) -> Value {
        Value::Long(self.count)
    }
}

/// Smallest or largest value. State: `[]` or `[value]`.
///
/// Values compare by [`Value::total_cmp`]; when a long and a double compare
/// equal the long is kept, so the result does not depend on input order.
#[derive(Debug)]
pub struct ExtremeFunction {
    function: AggregateFunction,
    keep: Ordering,
    current: Option<Value>,
}

impl ExtremeFunction {
    pub fn min() -> Self {
        Self {
            function: AggregateFunction::Min,
            keep: Ordering::Less,
            current: None,
        }
    }

    pub fn max() -> Self {
        Self {
            function: AggregateFunction::Max,
            keep: Ordering::Greater,
            current: None,
        }
    }

    fn offer(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Null => return Ok(()),
            Value::Bytes(_) => {
                return Err(Error::TypeMismatch {
                    column: self.function.name().to_string(),
                    expected: "column value".to_string(),
                    actual: "bytes".to_string(),
                })
            }
            _ => {}
        }

        let replace = match &self.current {
            None => true,
            Some(current) => match value.total_cmp(current) {
                Ordering::Equal => matches!((value, current), (Value::Long(_), Value::Double(_))),
                ordering => ordering == self.keep,
            },
        };
        if replace {
            self.current = Some(value.clone());
        }
        Ok(())
    }
}

impl AggregationFunction for ExtremeFunction {
    fn function(&self) -> AggregateFunction {
        self.function
    }

    fn add_value(&mut self, value: &Value) -> Result<(), Error> {
        self.offer(value)
    }

    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error> {
        check_state(self.function, intermediary)?;
        match intermediary.values().next() {
            Some(value) => self.offer(value),
            None => Ok(()),
        }
    }

    fn to_intermediary(&self) -> IntermediaryResult {
        let mut state = IntermediaryResult::new(self.function, FORMAT_VERSION);
        if let Some(current) = &self.current {
            state.push_value(current.clone());
        }
        state
    }

    fn calculate(&self) -> Value {
        self.current.clone().unwrap_or(Value::Null)
    }
}
