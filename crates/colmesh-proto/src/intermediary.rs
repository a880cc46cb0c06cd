//! Partial aggregation state exchanged between shards and the coordinator.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::plan::AggregateFunction;
use crate::value::Value;

/// Mergeable partial state of one aggregation function for one group.
///
/// The state is an append-only sequence of opaque values whose meaning is
/// private to the function that produced it (a running count, a decimal sum,
/// a serialized sketch). Values can only be read front to back.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct IntermediaryResult {
    function: AggregateFunction,
    format_version: u8,
    values: Vec<Value>,
}

impl IntermediaryResult {
    /// Create empty state for a function.
    pub fn new(function: AggregateFunction, format_version: u8) -> Self {
        Self {
            function,
            format_version,
            values: Vec::new(),
        }
    }

    /// Append one value.
    ///
    /// Only the aggregation function owning this state (or its decoder) calls this.
    pub fn push_value(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Function that produced the state.
    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    /// Layout version of the state.
    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    /// Whether any value was pushed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Single pass over the pushed values.
    pub fn values(&self) -> IntermediaryValues<'_> {
        IntermediaryValues {
            inner: self.values.iter(),
        }
    }
}

/// Forward-only iterator over intermediary values.
#[derive(Debug)]
pub struct IntermediaryValues<'a> {
    inner: std::slice::Iter<'a, Value>,
}

impl<'a> Iterator for IntermediaryValues<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
