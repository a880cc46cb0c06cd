use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use colmesh_proto::ShardPayload;
use tracing::debug;

use super::{CancellationToken, Progress, Step, StepOutput};
use crate::env::ExecutionEnvironment;
use crate::error::Error;

pub(crate) struct Node {
    pub(crate) step: Box<dyn Step>,
    pub(crate) consumers: Vec<usize>,
    pub(crate) producers: Vec<usize>,
    inbox: VecDeque<StepOutput>,
    done: bool,
}

impl Node {
    pub(crate) fn new(step: Box<dyn Step>) -> Self {
        Self {
            step,
            consumers: Vec::new(),
            producers: Vec::new(),
            inbox: VecDeque::new(),
            done: false,
        }
    }
}

/// A wired plan for one table shard, ready to run.
///
/// Nodes are kept in topological order: every producer precedes its consumers.
pub struct ExecutionPlan {
    env: Arc<ExecutionEnvironment>,
    nodes: Vec<Node>,
}

impl ExecutionPlan {
    pub(crate) fn new(env: Arc<ExecutionEnvironment>, nodes: Vec<Node>) -> Self {
        Self { env, nodes }
    }

    pub fn env(&self) -> &Arc<ExecutionEnvironment> {
        &self.env
    }

    /// Names of the steps, in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.step.name().to_string()).collect()
    }

    /// Run every step to completion on the calling thread.
    ///
    /// Steps are visited round-robin; each visit drains the step's inbox and,
    /// once all its producers are done, lets it run. A step whose consumers
    /// are all inactive or done is finished without doing any work.
    pub fn execute(mut self, cancel: &CancellationToken) -> Result<ShardPayload, Error> {
        let started = Instant::now();
        let query_id = self.env.query_id();
        let shard = self.env.table_shard().id().clone();
        let mut active = vec![true; self.nodes.len()];
        let mut emitted = Vec::new();

        while self.nodes.iter().any(|n| !n.done) {
            if cancel.is_cancelled() {
                debug!(query_id, shard = %shard, "Plan cancelled");
                return Err(Error::Cancelled);
            }

            for i in (0..self.nodes.len()).rev() {
                let node = &self.nodes[i];
                active[i] = !node.done
                    && node.step.is_active()
                    && (node.step.output().is_none() || node.consumers.iter().any(|c| active[*c]));
            }

            let mut progressed = false;
            for i in 0..self.nodes.len() {
                if self.nodes[i].done {
                    continue;
                }

                if !active[i] {
                    let node = &mut self.nodes[i];
                    node.inbox.clear();
                    node.done = true;
                    progressed = true;
                    debug!(query_id, step = node.step.name(), "Skipping step without active consumers");
                    continue;
                }

                while let Some(input) = self.nodes[i].inbox.pop_front() {
                    let node = &mut self.nodes[i];
                    node.step
                        .on_input(input, &mut emitted)
                        .map_err(|e| Error::in_step(node.step.name(), e))?;
                    progressed = true;
                    self.deliver(i, &mut emitted);
                }

                let ready = self.nodes[i].producers.iter().all(|p| self.nodes[*p].done);
                if ready {
                    let node = &mut self.nodes[i];
                    let progress = node
                        .step
                        .run(&mut emitted)
                        .map_err(|e| Error::in_step(node.step.name(), e))?;
                    if progress == Progress::Done {
                        node.done = true;
                    }
                    progressed = true;
                    self.deliver(i, &mut emitted);
                }
            }

            if !progressed {
                return Err(Error::PlanExecution {
                    step: "scheduler".to_string(),
                    source: Box::new(Error::InvalidShard("plan stalled with unfinished steps".into())),
                });
            }
        }

        let mut payload = ShardPayload::default();
        for node in &mut self.nodes {
            if let Some(part) = node.step.take_payload() {
                payload.columns.extend(part.columns);
                payload.groups.extend(part.groups);
            }
        }

        debug!(
            query_id,
            shard = %shard,
            columns = payload.columns.len(),
            groups = payload.groups.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Plan finished"
        );
        Ok(payload)
    }

    fn deliver(&mut self, from: usize, emitted: &mut Vec<StepOutput>) {
        if emitted.is_empty() {
            return;
        }
        let consumers = self.nodes[from].consumers.clone();
        for output in emitted.drain(..) {
            let Some((last, rest)) = consumers.split_last() else {
                continue;
            };
            for consumer in rest {
                if !self.nodes[*consumer].done {
                    self.nodes[*consumer].inbox.push_back(output.clone());
                }
            }
            if !self.nodes[*last].done {
                self.nodes[*last].inbox.push_back(output);
            }
        }
    }
}
