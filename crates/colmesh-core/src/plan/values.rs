use std::collections::BTreeSet;
use std::sync::Arc;

use super::{require_column, ColumnGate, PortKind, Progress, Step, StepOutput};
use crate::env::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::ColumnShard;

/// Resolves one column for each batch of row ids it receives.
pub struct ResolveColumnValues {
    name: String,
    column_name: String,
    env: Arc<ExecutionEnvironment>,
    gate: ColumnGate,
    column: Option<Arc<ColumnShard>>,
}

impl ResolveColumnValues {
    pub fn new(column: impl Into<String>, env: Arc<ExecutionEnvironment>, derived: &BTreeSet<String>) -> Self {
        let column_name = column.into();
        Self {
            name: format!("values:{}", column_name),
            gate: ColumnGate::new([column_name.as_str()], derived),
            column_name,
            env,
            column: None,
        }
    }

    fn resolve(&mut self, row_ids: Vec<u64>, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let column = match &self.column {
            Some(column) => column.clone(),
            None => {
                let column = require_column(&self.env, &self.column_name)?;
                self.column = Some(column.clone());
                column
            }
        };

        // batches are ascending; contiguous ones resolve page by page
        let first = row_ids[0];
        let last = row_ids[row_ids.len() - 1];
        let values = if last - first + 1 == row_ids.len() as u64 {
            column.resolve_range(first, last + 1)?
        } else {
            row_ids
                .iter()
                .map(|row_id| column.resolve(*row_id))
                .collect::<Result<Vec<_>, _>>()?
        };

        out.push(StepOutput::ColumnValues {
            column: self.column_name.clone(),
            row_ids,
            values,
        });
        Ok(())
    }
}

impl Step for ResolveColumnValues {
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
        Some(PortKind::ColumnValues)
    }

    fn on_input(&mut self, input: StepOutput, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        for ready in self.gate.offer(input) {
            if let StepOutput::RowIds(row_ids) = ready {
                self.resolve(row_ids, out)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, _out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        self.gate.ensure_drained(&self.name)?;
        Ok(Progress::Done)
    }
}
