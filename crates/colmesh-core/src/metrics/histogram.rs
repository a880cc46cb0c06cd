//! Lock-free bucketed histogram.

use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds, in microseconds, of [`Histogram::plan_latency`].
const PLAN_LATENCY_BOUNDS_US: [u64; 12] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 250_000, 1_000_000, 10_000_000,
];

/// Histogram with fixed upper bounds and an overflow bucket.
///
/// Bucket `i` counts observations `<= bounds[i]` that did not fit bucket
/// `i - 1`; the last bucket counts everything above the largest bound.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram over the given ascending upper bounds.
    pub fn with_bounds(mut bounds: Vec<u64>) -> Self {
        bounds.sort_unstable();
        bounds.dedup();
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to per-shard plan execution times.
    pub fn plan_latency() -> Self {
        Self::with_bounds(PLAN_LATENCY_BOUNDS_US.to_vec())
    }

    pub fn observe(&self, value: u64) {
        let slot = self.bounds.partition_point(|bound| *bound < value);
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> u64 {
        match self.count() {
            0 => 0,
            n => self.sum() / n,
        }
    }

    /// Upper bound of the bucket holding the `q`-quantile; the observed
    /// maximum when it falls in the overflow bucket.
    pub fn quantile(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (slot, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return self.bounds.get(slot).copied().unwrap_or_else(|| self.max());
            }
        }
        self.max()
    }

    /// Cumulative `(upper bound, count)` pairs; the overflow bucket has no bound.
    pub fn cumulative(&self) -> Vec<(Option<u64>, u64)> {
        let mut seen = 0;
        self.buckets
            .iter()
            .enumerate()
            .map(|(slot, bucket)| {
                seen += bucket.load(Ordering::Relaxed);
                (self.bounds.get(slot).copied(), seen)
            })
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::plan_latency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_quantiles() {
        let hist = Histogram::with_bounds(vec![10, 100, 1000]);
        for v in [5, 7, 50, 500, 5000] {
            hist.observe(v);
        }
        assert_eq!(hist.count(), 5);
        assert_eq!(hist.max(), 5000);
        assert_eq!(hist.mean(), 1112);
        assert_eq!(hist.quantile(0.4), 10);
        assert_eq!(hist.quantile(0.6), 100);
        assert_eq!(hist.quantile(1.0), 5000);
    }

    #[test]
    fn test_bound_is_inclusive() {
        let hist = Histogram::with_bounds(vec![10, 100]);
        hist.observe(10);
        assert_eq!(hist.cumulative(), vec![(Some(10), 1), (Some(100), 1), (None, 1)]);
    }

    #[test]
    fn test_empty() {
        let hist = Histogram::plan_latency();
        assert_eq!(hist.quantile(0.99), 0);
        assert_eq!(hist.mean(), 0);
    }
}
