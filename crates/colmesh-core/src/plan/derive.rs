use std::collections::BTreeSet;
use std::sync::Arc;

use colmesh_proto::{ArithmeticOp, ColumnType, DerivedColumn, Value};
use tracing::debug;

use super::{require_column, ColumnGate, PortKind, Progress, Step, StepOutput};
use crate::env::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::{ColumnShard, ColumnShardBuilder};

/// Result type of `source <op> operand`, or `None` if it cannot be computed.
pub(crate) fn derived_type(source: ColumnType, op: ArithmeticOp, operand: &Value) -> Option<ColumnType> {
    let operand = match operand {
        Value::Long(_) => ColumnType::Long,
        Value::Double(_) => ColumnType::Double,
        _ => return None,
    };
    match (source, operand) {
        (ColumnType::String, _) => None,
        (ColumnType::Long, ColumnType::Long) if op != ArithmeticOp::Divide => Some(ColumnType::Long),
        _ => Some(ColumnType::Double),
    }
}

/// Computes a temporary column batch by batch and publishes it when complete.
///
/// After the first batch, if rows remain, the partial result is stored as a
/// draft version. Readers never see it; they see the published version only.
pub struct MaterializeColumn {
    name: String,
    column: DerivedColumn,
    result_type: ColumnType,
    env: Arc<ExecutionEnvironment>,
    gate: ColumnGate,
    next: u64,
    end: u64,
    first: u64,
    batch_size: u64,
    page_size: usize,
    computed: Vec<Value>,
    drafted: bool,
}

impl MaterializeColumn {
    pub fn new(
        column: DerivedColumn,
        result_type: ColumnType,
        env: Arc<ExecutionEnvironment>,
        derived: &BTreeSet<String>,
        batch_size: usize,
        page_size: usize,
    ) -> Self {
        let shard = env.table_shard().clone();
        Self {
            name: format!("derive:{}", column.name),
            gate: ColumnGate::new([column.source.as_str()], derived),
            column,
            result_type,
            env,
            next: shard.first_row_id(),
            end: shard.end_row_id(),
            first: shard.first_row_id(),
            batch_size: batch_size.max(1) as u64,
            page_size,
            computed: Vec::new(),
            drafted: false,
        }
    }

    fn compute(&self, value: &Value) -> Result<Value, Error> {
        let op = self.column.op;
        if let (Value::Long(a), Value::Long(b), ColumnType::Long) = (value, &self.column.operand, self.result_type) {
            let result = match op {
                ArithmeticOp::Add => a.checked_add(*b),
                ArithmeticOp::Subtract => a.checked_sub(*b),
                ArithmeticOp::Multiply => a.checked_mul(*b),
                ArithmeticOp::Divide => None,
            };
            return result.map(Value::Long).ok_or_else(|| {
                Error::Overflow(format!("{} {:?} {} in column '{}'", a, op, b, self.column.name))
            });
        }

        let (Some(a), Some(b)) = (as_f64(value), as_f64(&self.column.operand)) else {
            return Err(Error::TypeMismatch {
                column: self.column.source.clone(),
                expected: "number".to_string(),
                actual: crate::storage::describe_type(value),
            });
        };
        Ok(Value::Double(match op {
            ArithmeticOp::Add => a + b,
            ArithmeticOp::Subtract => a - b,
            ArithmeticOp::Multiply => a * b,
            ArithmeticOp::Divide => a / b,
        }))
    }

    fn build(&self, values: &[Value]) -> Result<ColumnShard, Error> {
        let mut builder = ColumnShardBuilder::new(self.column.name.clone(), self.result_type, self.first)
            .with_page_size(self.page_size);
        builder.extend(values.iter().cloned())?;
        builder.build_shard()
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Long(v) => Some(*v as f64),
        Value::Double(v) => Some(*v),
        _ => None,
    }
}

impl Step for MaterializeColumn {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortKind> {
        if self.gate.needs_column_built() {
            vec![PortKind::ColumnBuilt]
        } else {
            Vec::new()
        }
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::ColumnBuilt)
    }

    fn on_input(&mut self, input: StepOutput, _out: &mut Vec<StepOutput>) -> Result<(), Error> {
        // only ColumnBuilt arrives here; it just opens the gate
        self.gate.offer(input);
        Ok(())
    }

    fn run(&mut self, out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        if !self.gate.is_open() {
            return Err(Error::InvalidShard(format!(
                "source column '{}' of '{}' was never built",
                self.column.source, self.column.name
            )));
        }

        if self.next < self.end {
            let source = require_column(&self.env, &self.column.source)?;
            let to = self.end.min(self.next.saturating_add(self.batch_size));
            for value in source.resolve_range(self.next, to)? {
                let computed = self.compute(&value)?;
                self.computed.push(computed);
            }
            self.next = to;

            if self.next < self.end {
                if !self.drafted {
                    let draft = self.build(&self.computed)?;
                    self.env.store_temporary_draft(draft)?;
                    self.drafted = true;
                }
                return Ok(Progress::More);
            }
        }

        let column = self.build(&self.computed)?;
        let version = self.env.publish_temporary(column)?;
        debug!(
            column = %self.column.name,
            rows = self.computed.len(),
            version,
            "Materialized temporary column"
        );
        out.push(StepOutput::ColumnBuilt(self.column.name.clone()));
        Ok(Progress::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_type() {
        let mul = ArithmeticOp::Multiply;
        assert_eq!(derived_type(ColumnType::Long, mul, &Value::Long(2)), Some(ColumnType::Long));
        assert_eq!(derived_type(ColumnType::Long, mul, &Value::Double(2.0)), Some(ColumnType::Double));
        assert_eq!(
            derived_type(ColumnType::Long, ArithmeticOp::Divide, &Value::Long(2)),
            Some(ColumnType::Double)
        );
        assert_eq!(derived_type(ColumnType::String, mul, &Value::Long(2)), None);
        assert_eq!(derived_type(ColumnType::Long, mul, &Value::from("x")), None);
    }
}
