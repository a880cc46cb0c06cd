use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use colmesh_proto::{AggregateFunction, ColumnType, RemotePlan, Value};
use tracing::debug;

use super::derive::derived_type;
use super::executor::Node;
use super::{
    AggregateGroups, ExecutionPlan, GroupRows, MaterializeColumn, ResolveColumnValues, ResultCollector,
    RowIdFilter, RowIdSource, Step,
};
use crate::aggregate;
use crate::config::PlanConfig;
use crate::env::ExecutionEnvironment;
use crate::error::Error;

/// Turns a [`RemotePlan`] into an [`ExecutionPlan`] for one table shard.
///
/// Every name in the plan is checked against the shard's columns and the
/// plan's derived columns; any problem is an [`Error::PlanBuild`] raised
/// before data is touched.
pub struct PlanBuilder<'a> {
    plan: &'a RemotePlan,
    env: Arc<ExecutionEnvironment>,
    config: &'a PlanConfig,
    /// Types of temporary columns, by name.
    derived: BTreeMap<String, ColumnType>,
    nodes: Vec<Node>,
    /// Node index of the step materializing each temporary column.
    derive_steps: BTreeMap<String, usize>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(plan: &'a RemotePlan, env: Arc<ExecutionEnvironment>, config: &'a PlanConfig) -> Self {
        Self {
            plan,
            env,
            config,
            derived: BTreeMap::new(),
            nodes: Vec::new(),
            derive_steps: BTreeMap::new(),
        }
    }

    /// Validate and wire the plan.
    pub fn build(plan: &'a RemotePlan, env: Arc<ExecutionEnvironment>, config: &'a PlanConfig) -> Result<ExecutionPlan, Error> {
        Self::new(plan, env, config).wire()
    }

    fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.derived
            .get(name)
            .copied()
            .or_else(|| self.env.table_shard().column_type(name))
    }

    fn require(&self, name: &str, usage: &str) -> Result<ColumnType, Error> {
        self.column_type(name).ok_or_else(|| {
            Error::PlanBuild(format!(
                "unknown column '{}' in {} of table '{}'",
                name, usage, self.plan.table
            ))
        })
    }

    fn add(&mut self, step: impl Step + 'static) -> usize {
        self.nodes.push(Node::new(Box::new(step)));
        self.nodes.len() - 1
    }

    fn connect(&mut self, producer: usize, consumer: usize) -> Result<(), Error> {
        let output = self.nodes[producer].step.output();
        let accepts = output.map_or(false, |kind| self.nodes[consumer].step.inputs().contains(&kind));
        if !accepts {
            return Err(Error::PlanBuild(format!(
                "step '{}' cannot consume the output of '{}'",
                self.nodes[consumer].step.name(),
                self.nodes[producer].step.name()
            )));
        }
        self.nodes[producer].consumers.push(consumer);
        self.nodes[consumer].producers.push(producer);
        Ok(())
    }

    /// Connect the steps materializing the temporary columns among `columns`.
    fn connect_derived<'c>(&mut self, columns: impl IntoIterator<Item = &'c str>, consumer: usize) -> Result<(), Error> {
        let mut producers = BTreeSet::new();
        for column in columns {
            if let Some(producer) = self.derive_steps.get(column) {
                producers.insert(*producer);
            }
        }
        for producer in producers {
            self.connect(producer, consumer)?;
        }
        Ok(())
    }

    fn validate_plan(&mut self) -> Result<(), Error> {
        let plan = self.plan;
        let shard = self.env.table_shard().clone();
        if shard.table() != plan.table {
            return Err(Error::PlanBuild(format!(
                "plan for table '{}' given shard {}",
                plan.table,
                shard.id()
            )));
        }
        if plan.projection.is_empty() && plan.aggregations.is_empty() {
            return Err(Error::PlanBuild("plan projects no column and computes no aggregation".into()));
        }

        for column in &plan.derived {
            if shard.has_column(&column.name) || self.derived.contains_key(&column.name) {
                return Err(Error::PlanBuild(format!("derived column '{}' is already defined", column.name)));
            }
            let source = self.require(&column.source, "derived column")?;
            let result = derived_type(source, column.op, &column.operand).ok_or_else(|| {
                Error::PlanBuild(format!(
                    "cannot compute '{}' from {} column '{}' and {:?}",
                    column.name, source, column.source, column.operand
                ))
            })?;
            self.derived.insert(column.name.clone(), result);
        }

        for filter in &plan.filters {
            let column = self.require(&filter.column, "filter")?;
            let comparable = match (&filter.value, column) {
                (Value::Long(_) | Value::Double(_), ColumnType::Long | ColumnType::Double) => true,
                (Value::String(_), ColumnType::String) => true,
                _ => false,
            };
            if !comparable {
                return Err(Error::PlanBuild(format!(
                    "cannot compare {} column '{}' with {:?}",
                    column, filter.column, filter.value
                )));
            }
        }

        let mut projected = BTreeSet::new();
        for column in &plan.projection {
            self.require(column, "projection")?;
            if !projected.insert(column.as_str()) {
                return Err(Error::PlanBuild(format!("column '{}' is projected twice", column)));
            }
        }

        if let Some(group_by) = &plan.group_by {
            self.require(group_by, "group by")?;
        }

        let mut outputs = BTreeSet::new();
        for spec in &plan.aggregations {
            aggregate::create(spec)?;
            if !outputs.insert(spec.output.as_str()) {
                return Err(Error::PlanBuild(format!("aggregation output '{}' is defined twice", spec.output)));
            }
            if let Some(column) = &spec.column {
                let column_type = self.require(column, "aggregation")?;
                let numeric = matches!(
                    spec.function,
                    AggregateFunction::Sum | AggregateFunction::Avg | AggregateFunction::Quantile
                );
                if numeric && column_type == ColumnType::String {
                    return Err(Error::PlanBuild(format!(
                        "{}() needs a numeric column, '{}' is {}",
                        spec.function.name(),
                        column,
                        column_type
                    )));
                }
            }
        }
        Ok(())
    }

    fn wire(mut self) -> Result<ExecutionPlan, Error> {
        self.validate_plan()?;
        let plan = self.plan;
        let env = self.env.clone();
        let shard = env.table_shard().clone();
        let derived_names: BTreeSet<String> = self.derived.keys().cloned().collect();

        let source = self.add(RowIdSource::new(
            shard.id().clone(),
            shard.first_row_id(),
            shard.end_row_id(),
            self.config.batch_size,
        ));

        for column in &plan.derived {
            let result_type = self.derived[&column.name];
            let step = self.add(MaterializeColumn::new(
                column.clone(),
                result_type,
                env.clone(),
                &derived_names,
                self.config.batch_size,
                self.config.page_size,
            ));
            self.connect_derived([column.source.as_str()], step)?;
            self.derive_steps.insert(column.name.clone(), step);
        }

        let mut rows = source;
        for filter in &plan.filters {
            let step = self.add(RowIdFilter::new(filter.clone(), env.clone(), &derived_names));
            self.connect(rows, step)?;
            self.connect_derived([filter.column.as_str()], step)?;
            rows = step;
        }

        let aggregate_step = if plan.is_aggregating() {
            let group = self.add(GroupRows::new(plan.group_by.clone(), env.clone(), &derived_names));
            self.connect(rows, group)?;
            self.connect_derived(plan.group_by.as_deref(), group)?;

            let aggregate = self.add(AggregateGroups::new(
                plan.aggregations.clone(),
                plan.group_by.is_some(),
                env.clone(),
                &derived_names,
            )?);
            self.connect(group, aggregate)?;
            self.connect_derived(plan.aggregations.iter().filter_map(|s| s.column.as_deref()), aggregate)?;
            Some(aggregate)
        } else {
            None
        };

        let mut value_steps = Vec::new();
        for column in &plan.projection {
            let step = self.add(ResolveColumnValues::new(column.clone(), env.clone(), &derived_names));
            self.connect(rows, step)?;
            self.connect_derived([column.as_str()], step)?;
            value_steps.push(step);
        }

        let collector = self.add(ResultCollector::new(
            &plan.projection,
            plan.is_aggregating(),
            shard.first_row_id(),
            plan.limit,
        ));
        for step in value_steps {
            self.connect(step, collector)?;
        }
        if let Some(aggregate) = aggregate_step {
            self.connect(aggregate, collector)?;
        }

        for node in &self.nodes {
            for required in node.step.inputs() {
                let connected = node
                    .producers
                    .iter()
                    .any(|p| self.nodes[*p].step.output() == Some(required));
                if !connected {
                    return Err(Error::PlanBuild(format!(
                        "step '{}' has no producer for {:?}",
                        node.step.name(),
                        required
                    )));
                }
            }
        }

        debug!(
            query_id = plan.query_id,
            shard = %shard.id(),
            steps = self.nodes.len(),
            "Built execution plan"
        );
        Ok(ExecutionPlan::new(env, self.nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CancellationToken;
    use crate::test_support::{people_env, PEOPLE};
    use colmesh_proto::{
        AggregationSpec, ArithmeticOp, CompareOp, DerivedColumn, RowFilter,
    };

    fn run(plan: &RemotePlan, config: &PlanConfig) -> Result<colmesh_proto::ShardPayload, Error> {
        let env = Arc::new(people_env(plan.query_id));
        PlanBuilder::build(plan, env, config)?.execute(&CancellationToken::new())
    }

    fn default_run(plan: &RemotePlan) -> Result<colmesh_proto::ShardPayload, Error> {
        run(plan, &PlanConfig::default().with_batch_size(2))
    }

    #[test]
    fn test_projection_with_filter() {
        let plan = RemotePlan::new(1, PEOPLE)
            .with_projection(vec!["name".into(), "age".into()])
            .filter(RowFilter::new("age", CompareOp::Ge, 30i64));
        let payload = default_run(&plan).unwrap();

        assert_eq!(payload.columns.len(), 2);
        assert_eq!(payload.columns[0].column, "name");
        assert_eq!(payload.columns[0].row_ids, vec![0, 2, 4]);
        assert_eq!(
            payload.columns[0].values,
            vec![Value::from("ann"), Value::from("cy"), Value::from("ed")]
        );
        assert_eq!(payload.columns[1].values, vec![Value::Long(30), Value::Long(41), Value::Long(35)]);
    }

    #[test]
    fn test_grouped_aggregation() {
        let plan = RemotePlan::new(1, PEOPLE)
            .group_by("city")
            .aggregate(AggregationSpec::count("n"))
            .aggregate(AggregationSpec::over(AggregateFunction::Sum, "age", "total"));
        let payload = default_run(&plan).unwrap();

        let mut totals: Vec<(String, Value, Value)> = payload
            .groups
            .iter()
            .map(|g| {
                (
                    g.group.to_string(),
                    aggregate::finalize(&plan.aggregations[0], &g.results[0]).unwrap(),
                    aggregate::finalize(&plan.aggregations[1], &g.results[1]).unwrap(),
                )
            })
            .collect();
        totals.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            totals,
            vec![
                ("oslo".to_string(), Value::Long(2), Value::Long(71)),
                ("rome".to_string(), Value::Long(3), Value::Long(82)),
            ]
        );
    }

    #[test]
    fn test_ungrouped_aggregation_over_no_rows() {
        let plan = RemotePlan::new(1, PEOPLE)
            .filter(RowFilter::new("age", CompareOp::Gt, 1000i64))
            .aggregate(AggregationSpec::count("n"));
        let payload = default_run(&plan).unwrap();
        assert_eq!(payload.groups.len(), 1);
        assert_eq!(payload.groups[0].group, Value::Null);
        assert_eq!(
            aggregate::finalize(&plan.aggregations[0], &payload.groups[0].results[0]).unwrap(),
            Value::Long(0)
        );
    }

    #[test]
    fn test_derived_column_feeds_filter_and_projection() {
        let plan = RemotePlan::new(1, PEOPLE)
            .derive(DerivedColumn::new("age_doubled", "age", ArithmeticOp::Multiply, 2i64))
            .derive(DerivedColumn::new("age_half", "age_doubled", ArithmeticOp::Divide, 4i64))
            .filter(RowFilter::new("age_doubled", CompareOp::Lt, 60i64))
            .with_projection(vec!["age_doubled".into(), "age_half".into()]);
        let payload = default_run(&plan).unwrap();

        assert_eq!(payload.columns[0].row_ids, vec![1, 3]);
        assert_eq!(payload.columns[0].values, vec![Value::Long(50), Value::Long(44)]);
        assert_eq!(payload.columns[1].values, vec![Value::Double(12.5), Value::Double(11.0)]);
    }

    #[test]
    fn test_limit_short_circuits() {
        let plan = RemotePlan::new(1, PEOPLE)
            .with_projection(vec!["name".into()])
            .with_limit(2);
        let payload = default_run(&plan).unwrap();
        assert_eq!(payload.columns[0].row_ids, vec![0, 1]);

        let none = RemotePlan::new(1, PEOPLE).with_projection(vec!["name".into()]).with_limit(0);
        assert!(default_run(&none).unwrap().columns[0].row_ids.is_empty());
    }

    #[test]
    fn test_build_errors() {
        let cases = vec![
            RemotePlan::new(1, PEOPLE).with_projection(vec!["nope".into()]),
            RemotePlan::new(1, "other").with_projection(vec!["name".into()]),
            RemotePlan::new(1, PEOPLE),
            RemotePlan::new(1, PEOPLE)
                .with_projection(vec!["name".into()])
                .filter(RowFilter::new("name", CompareOp::Eq, 3i64)),
            RemotePlan::new(1, PEOPLE).aggregate(AggregationSpec::over(AggregateFunction::Sum, "name", "s")),
            RemotePlan::new(1, PEOPLE)
                .derive(DerivedColumn::new("x", "name", ArithmeticOp::Add, 1i64))
                .with_projection(vec!["x".into()]),
            RemotePlan::new(1, PEOPLE)
                .derive(DerivedColumn::new("age", "age", ArithmeticOp::Add, 1i64))
                .with_projection(vec!["age".into()]),
            RemotePlan::new(1, PEOPLE)
                .aggregate(AggregationSpec::count("n"))
                .aggregate(AggregationSpec::count("n")),
        ];
        for plan in cases {
            let env = Arc::new(people_env(1));
            let result = PlanBuilder::build(&plan, env, &PlanConfig::default());
            assert!(matches!(result, Err(Error::PlanBuild(_))), "{:?}", plan);
        }
    }

    #[test]
    fn test_runtime_failure_names_the_step() {
        let plan = RemotePlan::new(1, PEOPLE)
            .derive(DerivedColumn::new("huge", "age", ArithmeticOp::Multiply, i64::MAX))
            .with_projection(vec!["huge".into()]);
        match default_run(&plan) {
            Err(Error::PlanExecution { step, source }) => {
                assert_eq!(step, "derive:huge");
                assert!(matches!(*source, Error::Overflow(_)));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cancelled_plan() {
        let plan = RemotePlan::new(1, PEOPLE).with_projection(vec!["name".into()]);
        let env = Arc::new(people_env(1));
        let built = PlanBuilder::build(&plan, env, &PlanConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(built.execute(&cancel), Err(Error::Cancelled)));
    }
}
