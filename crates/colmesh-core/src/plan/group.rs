use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use colmesh_proto::{AggregationSpec, GroupIntermediaries, Value, ValueKey};
use tracing::debug;

use super::{require_column, ColumnGate, PortKind, Progress, Step, StepOutput};
use crate::aggregate::{self, AggregationFunction};
use crate::env::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::ColumnShard;

/// Splits row id batches by the value of the grouping column.
///
/// Without a grouping column every row belongs to the `Null` group.
pub struct GroupRows {
    name: String,
    group_by: Option<String>,
    env: Arc<ExecutionEnvironment>,
    gate: ColumnGate,
    column: Option<Arc<ColumnShard>>,
}

impl GroupRows {
    pub fn new(group_by: Option<String>, env: Arc<ExecutionEnvironment>, derived: &BTreeSet<String>) -> Self {
        Self {
            name: match &group_by {
                Some(column) => format!("group:{}", column),
                None => "group".to_string(),
            },
            gate: ColumnGate::new(group_by.as_deref(), derived),
            group_by,
            env,
            column: None,
        }
    }

    fn split(&mut self, row_ids: Vec<u64>, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let Some(group_by) = &self.group_by else {
            out.push(StepOutput::GroupedRowIds(vec![(Value::Null, row_ids)]));
            return Ok(());
        };

        let column = match &self.column {
            Some(column) => column.clone(),
            None => {
                let column = require_column(&self.env, group_by)?;
                self.column = Some(column.clone());
                column
            }
        };

        let mut index: HashMap<ValueKey, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<u64>)> = Vec::new();
        for row_id in row_ids {
            let key = ValueKey(column.resolve(row_id)?);
            let slot = match index.get(&key) {
                Some(slot) => *slot,
                None => {
                    groups.push((key.value().clone(), Vec::new()));
                    index.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[slot].1.push(row_id);
        }
        out.push(StepOutput::GroupedRowIds(groups));
        Ok(())
    }
}

impl Step for GroupRows {
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
        Some(PortKind::GroupedRowIds)
    }

    fn on_input(&mut self, input: StepOutput, out: &mut Vec<StepOutput>) -> Result<(), Error> {
        for ready in self.gate.offer(input) {
            if let StepOutput::RowIds(row_ids) = ready {
                self.split(row_ids, out)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, _out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        self.gate.ensure_drained(&self.name)?;
        Ok(Progress::Done)
    }
}

struct GroupState {
    key: Value,
    functions: Vec<Box<dyn AggregationFunction>>,
}

/// Runs every aggregation of the plan per group and emits intermediaries.
pub struct AggregateGroups {
    name: String,
    specs: Vec<AggregationSpec>,
    env: Arc<ExecutionEnvironment>,
    gate: ColumnGate,
    columns: HashMap<String, Arc<ColumnShard>>,
    index: HashMap<ValueKey, usize>,
    groups: Vec<GroupState>,
    rows: u64,
}

impl AggregateGroups {
    /// Fails if a spec cannot be turned into a function.
    pub fn new(
        specs: Vec<AggregationSpec>,
        grouped: bool,
        env: Arc<ExecutionEnvironment>,
        derived: &BTreeSet<String>,
    ) -> Result<Self, Error> {
        let gate = ColumnGate::new(specs.iter().filter_map(|s| s.column.as_deref()), derived);
        let mut step = Self {
            name: "aggregate".to_string(),
            specs,
            env,
            gate,
            columns: HashMap::new(),
            index: HashMap::new(),
            groups: Vec::new(),
            rows: 0,
        };
        // validate every spec up front
        step.new_group(Value::Null)?;
        if grouped {
            step.index.clear();
            step.groups.clear();
        }
        Ok(step)
    }

    fn new_group(&mut self, key: Value) -> Result<usize, Error> {
        let functions = self
            .specs
            .iter()
            .map(aggregate::create)
            .collect::<Result<Vec<_>, _>>()?;
        self.groups.push(GroupState {
            key: key.clone(),
            functions,
        });
        self.index.insert(ValueKey(key), self.groups.len() - 1);
        Ok(self.groups.len() - 1)
    }

    fn column(&mut self, name: &str) -> Result<Arc<ColumnShard>, Error> {
        if let Some(column) = self.columns.get(name) {
            return Ok(column.clone());
        }
        let column = require_column(&self.env, name)?;
        self.columns.insert(name.to_string(), column.clone());
        Ok(column)
    }

    fn accumulate(&mut self, grouped: Vec<(Value, Vec<u64>)>) -> Result<(), Error> {
        let mut inputs: Vec<Option<Arc<ColumnShard>>> = Vec::with_capacity(self.specs.len());
        for i in 0..self.specs.len() {
            let column = match self.specs[i].column.clone() {
                Some(name) => Some(self.column(&name)?),
                None => None,
            };
            inputs.push(column);
        }

        for (key, row_ids) in grouped {
            let slot = match self.index.get(&ValueKey(key.clone())) {
                Some(slot) => *slot,
                None => self.new_group(key)?,
            };
            let group = &mut self.groups[slot];
            for row_id in &row_ids {
                for (function, input) in group.functions.iter_mut().zip(&inputs) {
                    let value = match input {
                        Some(column) => column.resolve(*row_id)?,
                        None => Value::Null,
                    };
                    function.add_value(&value)?;
                }
            }
            self.rows += row_ids.len() as u64;
        }
        Ok(())
    }
}

impl Step for AggregateGroups {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortKind> {
        let mut inputs = vec![PortKind::GroupedRowIds];
        if self.gate.needs_column_built() {
            inputs.push(PortKind::ColumnBuilt);
        }
        inputs
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::GroupIntermediaries)
    }

    fn on_input(&mut self, input: StepOutput, _out: &mut Vec<StepOutput>) -> Result<(), Error> {
        for ready in self.gate.offer(input) {
            if let StepOutput::GroupedRowIds(grouped) = ready {
                self.accumulate(grouped)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        self.gate.ensure_drained(&self.name)?;
        debug!(groups = self.groups.len(), rows = self.rows, "Aggregation finished");

        let groups = self
            .groups
            .drain(..)
            .map(|group| GroupIntermediaries {
                group: group.key,
                results: group.functions.iter().map(|f| f.to_intermediary()).collect(),
            })
            .collect();
        self.index.clear();
        out.push(StepOutput::GroupIntermediaries(groups));
        Ok(Progress::Done)
    }
}
