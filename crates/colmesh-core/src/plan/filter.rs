use std::collections::BTreeSet;
use std::sync::Arc;

use colmesh_proto::RowFilter;

use super::{require_column, ColumnGate, PortKind, Progress, Step, StepOutput};
use crate::env::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::ColumnShard;

/// Keeps the row ids whose value satisfies `column <op> value`.
pub struct RowIdFilter {
    name: String,
    filter: RowFilter,
    env: Arc<ExecutionEnvironment>,
    gate: ColumnGate,
    column: Option<Arc<ColumnShard>>,
    passed: u64,
    rejected: u64,
}

impl RowIdFilter {
    pub fn new(filter: RowFilter, env: Arc<ExecutionEnvironment>, derived: &BTreeSet<String>) -> Self {
        Self {
            name: format!("filter:{}", filter.column),
            gate: ColumnGate::new([filter.column.as_str()], derived),
            filter,
            env,
            column: None,
            passed: 0,
            rejected: 0,
        }
    }

    fn apply(&mut self, row_ids: Vec<u64>, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        let column = match &self.column {
            Some(column) => column.clone(),
            None => {
                let column = require_column(&self.env, &self.filter.column)?;
                self.column = Some(column.clone());
                column
            }
        };

        let mut kept = Vec::with_capacity(row_ids.len());
        for row_id in row_ids {
            let value = column.resolve(row_id)?;
            if self.filter.op.matches(value.total_cmp(&self.filter.value)) {
                kept.push(row_id);
            } else {
                self.rejected += 1;
            }
        }
        self.passed += kept.len() as u64;
        if !kept.is_empty() {
            out.push(StepOutput::RowIds(kept));
        }
        Ok(())
    }
}

impl Step for RowIdFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortKind> {
        let mut inputs = vec![PortKind::RowIds];
        if self.gate.needs_column_built() {
            inputs.push(PortKind::ColumnBuilt);
        }
        inputs
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::RowIds)
    }

    fn on_input(&mut self, input: StepOutput, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        for ready in self.gate.offer(input) {
            if let StepOutput::RowIds(row_ids) = ready {
                self.apply(row_ids, out)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, _out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        self.gate.ensure_drained(&self.name)?;
        tracing::debug!(
            step = %self.name,
            passed = self.passed,
            rejected = self.rejected,
            "Filter finished"
        );
        Ok(Progress::Done)
    }
}
