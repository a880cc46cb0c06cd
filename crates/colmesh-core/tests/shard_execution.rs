//! End-to-end execution of remote plans against stored shards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use colmesh_core::aggregate;
use colmesh_core::env::{ColumnSource, ExecutionEnvironment};
use colmesh_core::proto::{
    AggregateFunction, AggregationSpec, ArithmeticOp, ColumnType, CompareOp, DerivedColumn,
    RemotePlan, RowFilter, ShardId, Value,
};
use colmesh_core::storage::{ShardCatalog, ShardStorage, SledShardStorage, SledStorageConfig};
use colmesh_core::test_support::{column, constant_shards, people_storage, PEOPLE};
use colmesh_core::{CancellationToken, ColumnShardCache, MemoryShardStorage, PlanBuilder, PlanConfig};

fn env_for(storage: Arc<dyn ShardStorage>, cache: Arc<ColumnShardCache>, id: &ShardId, query_id: u64) -> Arc<ExecutionEnvironment> {
    let shard = storage.table_shard(id).unwrap().expect("shard is stored");
    Arc::new(ExecutionEnvironment::new(
        query_id,
        Arc::new(shard),
        ColumnSource::new(cache, storage),
    ))
}

#[test]
fn test_late_consumer_sees_only_published_column() {
    let storage: Arc<dyn ShardStorage> = people_storage();
    let cache = Arc::new(ColumnShardCache::new(1 << 20));
    let env = env_for(storage, cache, &ShardId::new(PEOPLE, 0), 7);

    let plan = RemotePlan::new(7, PEOPLE)
        .derive(DerivedColumn::new("age_doubled", "age", ArithmeticOp::Multiply, 2i64))
        .with_projection(vec!["age_doubled".into()]);
    // two rows per batch, so a draft exists before the column is complete
    let config = PlanConfig::default().with_batch_size(2);
    let execution = PlanBuilder::build(&plan, env.clone(), &config).unwrap();

    let waiter = {
        let env = env.clone();
        thread::spawn(move || env.wait_for_published("age_doubled", Duration::from_secs(10)))
    };

    let payload = execution.execute(&CancellationToken::new()).unwrap();
    let observed = waiter.join().unwrap().unwrap();

    let expected: Vec<Value> = [60, 50, 82, 44, 70].into_iter().map(Value::Long).collect();
    assert_eq!(observed.len(), 5);
    assert_eq!(observed.resolve_range(0, 5).unwrap(), expected);
    assert_eq!(payload.columns[0].values, expected);

    // the draft is kept but never handed out
    assert_eq!(env.versions().version_count("age_doubled"), 2);
    assert_eq!(env.versions().published_version("age_doubled"), Some(1));
    let resolved = env.column("age_doubled").unwrap().unwrap();
    assert_eq!(resolved.len(), 5);
    assert_eq!(resolved.resolve(4).unwrap(), Value::Long(70));

    // the source column was pinned for the query
    assert_eq!(env.pinned_columns(), vec!["age".to_string()]);
}

#[test]
fn test_constant_shards_sum_per_shard() {
    let storage = Arc::new(MemoryShardStorage::new());
    let ids = constant_shards(
        storage.as_ref(),
        "t",
        "x",
        &[(0, 100), (100, 100), (200, 50)],
        Value::Long(5),
    );
    let cache = Arc::new(ColumnShardCache::new(1 << 20));
    let spec = AggregationSpec::over(AggregateFunction::Sum, "x", "total");
    let plan = RemotePlan::new(1, "t").aggregate(spec.clone());

    let mut merged = None;
    for id in &ids {
        let env = env_for(storage.clone(), cache.clone(), id, 1);
        let payload = PlanBuilder::build(&plan, env, &PlanConfig::default())
            .unwrap()
            .execute(&CancellationToken::new())
            .unwrap();
        assert_eq!(payload.groups.len(), 1);
        let state = payload.groups[0].results[0].clone();
        merged = Some(match merged {
            None => state,
            Some(acc) => aggregate::merge_intermediaries(&spec, &acc, &state).unwrap(),
        });
    }

    let total = aggregate::finalize(&spec, &merged.unwrap()).unwrap();
    assert_eq!(total, Value::Long(1250));
}

#[test]
fn test_second_query_hits_shared_cache() {
    let storage: Arc<dyn ShardStorage> = people_storage();
    let cache = Arc::new(ColumnShardCache::new(1 << 20));
    let id = ShardId::new(PEOPLE, 0);
    let plan = RemotePlan::new(1, PEOPLE)
        .filter(RowFilter::new("city", CompareOp::Eq, "rome"))
        .with_projection(vec!["name".into()]);

    for query_id in [1, 2] {
        let env = env_for(storage.clone(), cache.clone(), &id, query_id);
        let payload = PlanBuilder::build(&plan, env, &PlanConfig::default())
            .unwrap()
            .execute(&CancellationToken::new())
            .unwrap();
        assert_eq!(payload.columns[0].row_ids, vec![1, 3, 4]);
    }

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().misses(), 2);
    assert!(cache.stats().hits() >= 2);
}

#[test]
fn test_unloading_a_shard_invalidates_cached_columns() {
    let storage: Arc<dyn ShardStorage> = people_storage();
    let cache = Arc::new(ColumnShardCache::new(1 << 20));
    let catalog = ShardCatalog::new();
    catalog.register_listener(cache.clone());
    assert_eq!(catalog.load_table(storage.as_ref(), PEOPLE).unwrap(), 1);

    let id = ShardId::new(PEOPLE, 0);
    let env = env_for(storage.clone(), cache.clone(), &id, 1);
    let age = env.column("age").unwrap().unwrap();
    assert!(cache.contains(&id, "age"));

    assert!(catalog.unload(&id));
    assert!(!cache.contains(&id, "age"));
    // the query keeps reading its pinned handle
    assert_eq!(age.resolve(2).unwrap(), Value::Long(41));
}

#[test]
fn test_sled_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = SledStorageConfig::new(dir.path());
    let id = ShardId::new("scores", 10);

    {
        let storage = SledShardStorage::open(&config).unwrap();
        storage
            .store_column(
                &id,
                &column("score", ColumnType::Double, 10, vec![1.5.into(), 2.5.into(), 1.5.into()]),
            )
            .unwrap();
        storage
            .store_column(
                &id,
                &column("team", ColumnType::String, 10, vec!["a".into(), "b".into(), "a".into()]),
            )
            .unwrap();
        storage.flush().unwrap();
    }

    let storage: Arc<dyn ShardStorage> = Arc::new(SledShardStorage::open(&config).unwrap());
    let shards = storage.shards_of("scores").unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].row_count(), 3);
    assert_eq!(shards[0].column_type("team"), Some(ColumnType::String));

    let env = env_for(storage, Arc::new(ColumnShardCache::new(1 << 20)), &id, 3);
    let spec = AggregationSpec::over(AggregateFunction::Avg, "score", "mean");
    let plan = RemotePlan::new(3, "scores").group_by("team").aggregate(spec.clone());
    let payload = PlanBuilder::build(&plan, env, &PlanConfig::default())
        .unwrap()
        .execute(&CancellationToken::new())
        .unwrap();

    let mut means: Vec<(Value, Value)> = payload
        .groups
        .iter()
        .map(|g| (g.group.clone(), aggregate::finalize(&spec, &g.results[0]).unwrap()))
        .collect();
    means.sort_by(|a, b| a.0.total_cmp(&b.0));
    assert_eq!(
        means,
        vec![
            (Value::from("a"), Value::Double(1.5)),
            (Value::from("b"), Value::Double(2.5)),
        ]
    );
}
