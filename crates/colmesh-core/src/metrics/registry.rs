//! Counters of shard-level plan execution on one node.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::histogram::Histogram;
use crate::cache::CacheStats;

/// How a shard plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlanOutcome {
    Completed,
    NoShard,
    BuildFailed,
    ExecutionFailed,
    Cancelled,
}

impl PlanOutcome {
    fn label(&self) -> &'static str {
        match self {
            PlanOutcome::Completed => "completed",
            PlanOutcome::NoShard => "no_shard",
            PlanOutcome::BuildFailed => "build_failed",
            PlanOutcome::ExecutionFailed => "execution_failed",
            PlanOutcome::Cancelled => "cancelled",
        }
    }
}

/// Execution metrics of a node.
pub struct ExecutionMetrics {
    started_at: Instant,
    outcomes: RwLock<BTreeMap<PlanOutcome, AtomicU64>>,
    plans_by_table: RwLock<BTreeMap<String, AtomicU64>>,
    rows_returned: AtomicU64,
    groups_returned: AtomicU64,
    plan_latency: Histogram,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            outcomes: RwLock::new(BTreeMap::new()),
            plans_by_table: RwLock::new(BTreeMap::new()),
            rows_returned: AtomicU64::new(0),
            groups_returned: AtomicU64::new(0),
            plan_latency: Histogram::plan_latency(),
        }
    }

    /// Record one finished shard plan.
    pub fn record_plan(&self, table: &str, outcome: PlanOutcome, elapsed: Duration) {
        if let Some(counter) = self.outcomes.read().get(&outcome) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            self.outcomes
                .write()
                .entry(outcome)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        if let Some(counter) = self.plans_by_table.read().get(table) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plans_by_table
                .write()
                .entry(table.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        if outcome != PlanOutcome::NoShard {
            self.plan_latency.observe(elapsed.as_micros() as u64);
        }
    }

    /// Record the size of a completed shard payload.
    pub fn record_output(&self, rows: u64, groups: u64) {
        self.rows_returned.fetch_add(rows, Ordering::Relaxed);
        self.groups_returned.fetch_add(groups, Ordering::Relaxed);
    }

    pub fn plans(&self, outcome: PlanOutcome) -> u64 {
        self.outcomes
            .read()
            .get(&outcome)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn plans_by_table(&self) -> BTreeMap<String, u64> {
        self.plans_by_table
            .read()
            .iter()
            .map(|(table, c)| (table.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned.load(Ordering::Relaxed)
    }

    pub fn groups_returned(&self) -> u64 {
        self.groups_returned.load(Ordering::Relaxed)
    }

    pub fn plan_latency(&self) -> &Histogram {
        &self.plan_latency
    }

    /// Render in the Prometheus text format, with column cache counters.
    pub fn to_prometheus(&self, cache: Option<&CacheStats>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE colmesh_uptime_seconds gauge");
        let _ = writeln!(out, "colmesh_uptime_seconds {}", self.started_at.elapsed().as_secs());

        let _ = writeln!(out, "# TYPE colmesh_shard_plans_total counter");
        for (outcome, count) in self.outcomes.read().iter() {
            let _ = writeln!(
                out,
                "colmesh_shard_plans_total{{outcome=\"{}\"}} {}",
                outcome.label(),
                count.load(Ordering::Relaxed)
            );
        }
        for (table, count) in self.plans_by_table() {
            let _ = writeln!(out, "colmesh_table_plans_total{{table=\"{}\"}} {}", table, count);
        }

        let _ = writeln!(out, "# TYPE colmesh_rows_returned_total counter");
        let _ = writeln!(out, "colmesh_rows_returned_total {}", self.rows_returned());
        let _ = writeln!(out, "colmesh_groups_returned_total {}", self.groups_returned());

        let _ = writeln!(out, "# TYPE colmesh_plan_duration_us histogram");
        for (bound, count) in self.plan_latency.cumulative() {
            let le = bound.map_or_else(|| "+Inf".to_string(), |b| b.to_string());
            let _ = writeln!(out, "colmesh_plan_duration_us_bucket{{le=\"{}\"}} {}", le, count);
        }
        let _ = writeln!(out, "colmesh_plan_duration_us_sum {}", self.plan_latency.sum());
        let _ = writeln!(out, "colmesh_plan_duration_us_count {}", self.plan_latency.count());

        if let Some(cache) = cache {
            let _ = writeln!(out, "# TYPE colmesh_column_cache_hits_total counter");
            let _ = writeln!(out, "colmesh_column_cache_hits_total {}", cache.hits());
            let _ = writeln!(out, "colmesh_column_cache_misses_total {}", cache.misses());
            let _ = writeln!(out, "colmesh_column_cache_evictions_total {}", cache.evictions());
            let _ = writeln!(out, "colmesh_column_cache_rejected_total {}", cache.rejected());
        }
        out
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a node's execution metrics.
pub type SharedExecutionMetrics = Arc<ExecutionMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_and_tables() {
        let metrics = ExecutionMetrics::new();
        metrics.record_plan("people", PlanOutcome::Completed, Duration::from_micros(80));
        metrics.record_plan("people", PlanOutcome::Completed, Duration::from_micros(120));
        metrics.record_plan("orders", PlanOutcome::NoShard, Duration::ZERO);
        metrics.record_output(10, 2);

        assert_eq!(metrics.plans(PlanOutcome::Completed), 2);
        assert_eq!(metrics.plans(PlanOutcome::Cancelled), 0);
        assert_eq!(metrics.plans_by_table().get("people"), Some(&2));
        assert_eq!(metrics.plan_latency().count(), 2);
        assert_eq!(metrics.rows_returned(), 10);
    }

    #[test]
    fn test_prometheus_text() {
        let metrics = ExecutionMetrics::new();
        metrics.record_plan("people", PlanOutcome::ExecutionFailed, Duration::from_millis(2));
        let text = metrics.to_prometheus(None);

        assert!(text.contains("colmesh_shard_plans_total{outcome=\"execution_failed\"} 1"));
        assert!(text.contains("colmesh_plan_duration_us_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("colmesh_plan_duration_us_count 1"));
        assert!(!text.contains("column_cache"));
    }
}
