use colmesh_proto::ShardId;
use tracing::debug;

use super::{PortKind, Progress, Step, StepOutput};
use crate::error::Error;

/// Emits every row id of the shard in ascending batches.
pub struct RowIdSource {
    name: String,
    shard: ShardId,
    next: u64,
    end: u64,
    batch_size: u64,
}

impl RowIdSource {
    pub fn new(shard: ShardId, first_row_id: u64, end_row_id: u64, batch_size: usize) -> Self {
        Self {
            name: "row-ids".to_string(),
            shard,
            next: first_row_id,
            end: end_row_id,
            batch_size: batch_size.max(1) as u64,
        }
    }
}

impl Step for RowIdSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortKind> {
        Vec::new()
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::RowIds)
    }

    fn on_input(&mut self, _input: StepOutput, _out: &mut Vec<StepOutput>) -> Result<(), Error> {
        Ok(())
    }

    fn run(&mut self, out: &mut Vec<StepOutput>) -> Result<Progress, Error> {
        if self.next >= self.end {
            return Ok(Progress::Done);
        }
        let to = self.end.min(self.next.saturating_add(self.batch_size));
        debug!(shard = %self.shard, from = self.next, to, "Emitting row ids");
        out.push(StepOutput::RowIds((self.next..to).collect()));
        self.next = to;

        Ok(if self.next >= self.end {
            Progress::Done
        } else {
            Progress::More
        })
    }
}
