use colmesh_proto::{ColumnSegment, GroupIntermediaries, ShardPayload};

use super::{PortKind, Progress, Step, StepOutput};
use crate::error::Error;

/// Sink collecting projected column values and group intermediaries.
///
/// With a row limit, every projected column is cut at `limit` rows and the
/// collector turns inactive once all of them are full, which lets the
/// producers skip the rest of the shard.
pub struct ResultCollector {
    name: String,
    segments: Vec<ColumnSegment>,
    groups: Vec<GroupIntermediaries>,
    aggregating: bool,
    limit: Option<u64>,
}

impl ResultCollector {
    pub fn new(projection: &[String], aggregating: bool, first_row_id: u64, limit: Option<u64>) -> Self {
        Self {
            name: "collect".to_string(),
            segments: projection
                .iter()
                .map(|column| ColumnSegment {
                    column: column.clone(),
                    first_row_id,
                    row_ids: Vec::new(),
                    values: Vec::new(),
                })
                .collect(),
            groups: Vec::new(),
            aggregating,
            // a limit only applies to row output
            limit: if aggregating { None } else { limit },
        }
    }

    fn room(&self, segment: &ColumnSegment) -> usize {
        match self.limit {
            Some(limit) => (limit as usize).saturating_sub(segment.row_ids.len()),
            None => usize::MAX,
        }
    }
}

impl Step for ResultCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortKind> {
        let mut inputs = Vec::new();
        if !self.segments.is_empty() {
            inputs.push(PortKind::ColumnValues);
        }
        if self.aggregating {
            inputs.push(PortKind::GroupIntermediaries);
        }
        inputs
    }

    fn output(&self) -> Option<PortKind> {
        None
    }

    fn on_input(&mut self, input: StepOutput, _out: &mut Vec<StepOutput>) -> Result<(), Error> {
        match input {
            StepOutput::ColumnValues {
                column,
                mut row_ids,
                mut values,
            } => {
                let Some(index) = self.segments.iter().position(|s| s.column == column) else {
                    return Err(Error::InvalidShard(format!("values of unprojected column '{}'", column)));
                };
                let room = self.room(&self.segments[index]);
                row_ids.truncate(room);
                values.truncate(room);

                let segment = &mut self.segments[index];
                segment.row_ids.extend(row_ids);
                segment.values.extend(values);
            }
            StepOutput::GroupIntermediaries(groups) => self.groups.extend(groups),
            _ => {}
        }
        Ok(())
    }

    fn run(&mut self, _out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        Ok(Progress::Done)
    }

    fn is_active(&self) -> bool {
        if self.aggregating || self.segments.is_empty() {
            return true;
        }
        self.segments.iter().any(|s| self.room(s) > 0)
    }

    fn take_payload(&mut self) -> Option<ShardPayload> {
        Some(ShardPayload {
            columns: std::mem::take(&mut self.segments),
            groups: std::mem::take(&mut self.groups),
        })
    }
}
