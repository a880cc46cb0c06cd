//! Approximate quantiles over a mergeable log-bucket sketch.
//!
//! Values are counted in buckets whose bounds grow geometrically by
//! `gamma = (1 + a) / (1 - a)`, which guarantees a relative error of at most
//! `a` for any quantile. Two sketches with the same accuracy merge by adding
//! bucket counts, so merging is exact, associative and commutative.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use colmesh_proto::{AggregateFunction, IntermediaryResult, Value};

use super::{check_state, malformed, numeric_input, AggregationFunction, FORMAT_VERSION};
use crate::error::Error;

/// Relative accuracy of sketches created by [`QuantileFunction`].
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;

const SKETCH_VERSION: u8 = 1;

/// Streaming quantile summary.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileSketch {
    accuracy: f64,
    gamma: f64,
    ln_gamma: f64,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
    zero_count: u64,
    count: u64,
    min: f64,
    max: f64,
}

impl QuantileSketch {
    /// Create an empty sketch. `accuracy` must lie in `(0, 1)`.
    pub fn new(accuracy: f64) -> Result<Self, Error> {
        if !(accuracy > 0.0 && accuracy < 1.0) {
            return Err(Error::IncompatibleState(format!(
                "sketch accuracy {} outside (0, 1)",
                accuracy
            )));
        }
        Ok(Self::empty(accuracy))
    }

    fn empty(accuracy: f64) -> Self {
        let gamma = (1.0 + accuracy) / (1.0 - accuracy);
        Self {
            accuracy,
            gamma,
            ln_gamma: gamma.ln(),
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zero_count: 0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn key(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.ln_gamma).ceil() as i32
    }

    fn bucket_value(&self, key: i32) -> f64 {
        2.0 * self.gamma.powi(key) / (self.gamma + 1.0)
    }

    /// Add one finite value.
    pub fn add(&mut self, value: f64) {
        if value.abs() < f64::MIN_POSITIVE {
            self.zero_count += 1;
        } else if value > 0.0 {
            *self.positive.entry(self.key(value)).or_default() += 1;
        } else {
            *self.negative.entry(self.key(-value)).or_default() += 1;
        }
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Fold another sketch in. Both must use the same accuracy.
    pub fn merge(&mut self, other: &QuantileSketch) -> Result<(), Error> {
        if self.accuracy.to_bits() != other.accuracy.to_bits() {
            return Err(Error::IncompatibleState(format!(
                "cannot merge sketches with accuracy {} and {}",
                self.accuracy, other.accuracy
            )));
        }
        for (key, count) in &other.positive {
            *self.positive.entry(*key).or_default() += count;
        }
        for (key, count) in &other.negative {
            *self.negative.entry(*key).or_default() += count;
        }
        self.zero_count += other.zero_count;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    /// Estimate the `q`-quantile. `None` for an empty sketch.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }

        let rank = (q * (self.count - 1) as f64).floor() as u64;
        let mut seen = 0u64;

        // ascending value order: large negative magnitudes first
        for (key, count) in self.negative.iter().rev() {
            seen += count;
            if seen > rank {
                return Some(self.clamp(-self.bucket_value(*key)));
            }
        }
        seen += self.zero_count;
        if seen > rank {
            return Some(0.0);
        }
        for (key, count) in &self.positive {
            seen += count;
            if seen > rank {
                return Some(self.clamp(self.bucket_value(*key)));
            }
        }
        Some(self.max)
    }

    fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    /// Serialize with a leading version tag.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            1 + 8 * 5 + 8 + (self.positive.len() + self.negative.len()) * 12,
        );
        buf.put_u8(SKETCH_VERSION);
        buf.put_f64_le(self.accuracy);
        buf.put_u64_le(self.count);
        buf.put_u64_le(self.zero_count);
        buf.put_f64_le(self.min);
        buf.put_f64_le(self.max);
        for buckets in [&self.positive, &self.negative] {
            buf.put_u32_le(buckets.len() as u32);
            for (key, count) in buckets {
                buf.put_i32_le(*key);
                buf.put_u64_le(*count);
            }
        }
        buf.to_vec()
    }

    /// Decode a sketch written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, Error> {
        need(data, 1)?;
        let version = data.get_u8();
        if version != SKETCH_VERSION {
            return Err(Error::IncompatibleState(format!(
                "unknown quantile sketch version {}",
                version
            )));
        }

        need(data, 40)?;
        let mut sketch = Self::new(data.get_f64_le())?;
        sketch.count = data.get_u64_le();
        sketch.zero_count = data.get_u64_le();
        sketch.min = data.get_f64_le();
        sketch.max = data.get_f64_le();

        let mut bucket_total = sketch.zero_count;
        for negative in [false, true] {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len.saturating_mul(12))?;
            let buckets = if negative { &mut sketch.negative } else { &mut sketch.positive };
            for _ in 0..len {
                let key = data.get_i32_le();
                let count = data.get_u64_le();
                bucket_total = bucket_total.saturating_add(count);
                buckets.insert(key, count);
            }
        }

        if data.has_remaining() {
            return Err(Error::Deserialization("trailing bytes after quantile sketch".into()));
        }
        if bucket_total != sketch.count {
            return Err(Error::Deserialization(format!(
                "quantile sketch buckets hold {} values, header says {}",
                bucket_total, sketch.count
            )));
        }
        Ok(sketch)
    }
}

fn need(data: &[u8], n: usize) -> Result<(), Error> {
    if data.remaining() < n {
        return Err(Error::Deserialization("truncated quantile sketch".into()));
    }
    Ok(())
}

/// `quantile(q)` of a numeric column. State: `[Bytes sketch]`.
#[derive(Debug)]
pub struct QuantileFunction {
    q: f64,
    sketch: QuantileSketch,
}

impl QuantileFunction {
    /// `q` must lie in `[0, 1]`; the factory checks it.
    pub fn new(q: f64) -> Self {
        Self {
            q,
            sketch: QuantileSketch::empty(DEFAULT_RELATIVE_ACCURACY),
        }
    }

    pub fn sketch(&self) -> &QuantileSketch {
        &self.sketch
    }
}

impl AggregationFunction for QuantileFunction {
    fn function(&self) -> AggregateFunction {
        AggregateFunction::Quantile
    }

    fn add_value(&mut self, value: &Value) -> Result<(), Error> {
        if let Some(v) = numeric_input(AggregateFunction::Quantile, value)? {
            self.sketch.add(v);
        }
        Ok(())
    }

    fn merge(&mut self, intermediary: &IntermediaryResult) -> Result<(), Error> {
        check_state(AggregateFunction::Quantile, intermediary)?;
        let bytes = intermediary
            .values()
            .next()
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed(AggregateFunction::Quantile, "missing sketch"))?;
        let other = QuantileSketch::from_bytes(bytes)?;
        self.sketch.merge(&other)
    }

    fn to_intermediary(&self) -> IntermediaryResult {
        let mut state = IntermediaryResult::new(AggregateFunction::Quantile, FORMAT_VERSION);
        state.push_value(Value::Bytes(self.sketch.to_bytes()));
        state
    }

    fn calculate(&self) -> Value {
        self.sketch.quantile(self.q).map_or(Value::Null, Value::Double)
    }
}
