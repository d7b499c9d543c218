mod common;

use std::sync::Arc;

use common::*;
use disttable::ast::InsertQuery;
use disttable::sharding::BATCH_EXTENSION;
use disttable::{ColumnShardingKey, DistError, QueryContext, Settings, ShardingKeyExpr};
use tempfile::TempDir;

fn id_key() -> Option<Arc<dyn ShardingKeyExpr>> {
    Some(Arc::new(ColumnShardingKey::new("id")))
}

fn insert() -> InsertQuery {
    InsertQuery::new("default", "hits_all").with_columns(vec!["id".to_string(), "value".to_string()])
}

#[tokio::test]
async fn test_multi_shard_without_key_refuses_writes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(
        topology(vec![remote_shard(1, "a:9000"), remote_shard(1, "b:9000")]),
        None,
        Some(dir.path()),
    );

    assert!(!table.is_write_enabled());
    let err = table
        .write(&insert(), rows(&[1, 2]), &QueryContext::new("default"))
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::WriteNotSupported(ref name) if name == "hits_all"));
    assert!(err.is_permanent());
    table.shutdown().await;
}

#[tokio::test]
async fn test_single_shard_without_key_accepts_writes() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(topology(vec![local_shard(1)]), None, Some(dir.path()));

    assert!(table.is_write_enabled());
    let summary = table
        .write(&insert(), rows(&[1, 2, 3]), &QueryContext::new("default"))
        .await
        .unwrap();
    assert_eq!(summary.rows, 3);
    assert_eq!(summary.local_batches, 1);

    let inserts = harness.local.inserts.lock();
    assert_eq!(inserts[0].0.database, "shard_db");
    assert_eq!(inserts[0].0.table, "hits_local");
    assert_eq!(inserts[0].1.num_rows(), 3);
}

#[tokio::test]
async fn test_sharding_key_enables_writes_on_any_cluster() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(
        topology(vec![
            local_shard(1),
            remote_shard(1, "a:9000"),
            remote_shard(1, "b:9000"),
        ]),
        id_key(),
        Some(dir.path()),
    );

    assert!(table.is_write_enabled());
    table
        .write(&insert(), rows(&[0, 1, 2, 3, 4, 5]), &QueryContext::new("default"))
        .await
        .unwrap();

    wait_until(|| harness.sender.delivered_count() == 2).await;
    let local_rows = harness.local.inserts.lock()[0].1.num_rows();
    assert_eq!(local_rows, 2);
    table.shutdown().await;
}

#[tokio::test]
async fn test_missing_data_path_disables_writes() {
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(topology(vec![local_shard(1)]), id_key(), None);

    assert!(!table.is_write_enabled());
    assert!(table.queue_names().is_empty());
    assert!(matches!(
        table
            .write(&insert(), rows(&[1]), &QueryContext::new("default"))
            .await,
        Err(DistError::WriteNotSupported(_))
    ));
}

#[tokio::test]
async fn test_weighted_routing_scenario() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(
        topology(vec![
            remote_shard(1, "a:9000"),
            remote_shard(1, "b:9000"),
            remote_shard(2, "c:9000"),
        ]),
        id_key(),
        Some(dir.path()),
    );

    let settings = Settings {
        insert_distributed_sync: true,
        ..Settings::default()
    };
    let context = QueryContext::new("default").with_settings(settings);

    // Shards own the slots [0,1), [1,2) and [2,4) of the total weight 4
    for (id, expected) in [(0, 0), (1, 1), (2, 2), (3, 2), (4, 0), (6, 2)] {
        harness.sender.delivered.lock().clear();
        table.write(&insert(), rows(&[id]), &context).await.unwrap();

        let delivered = harness.sender.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].shard_index(), expected, "id {}", id);
    }

    // Same rows, same shards
    let key = ColumnShardingKey::new("id");
    let block = rows(&[10, 11, 12, 13]);
    assert_eq!(key.evaluate(&block).unwrap(), key.evaluate(&block).unwrap());
    table.shutdown().await;
}

#[tokio::test]
async fn test_recovered_queue_directories() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let table_dir = dir.path().join("hits_all");
    std::fs::create_dir_all(table_dir.join("shard_1")).unwrap();
    std::fs::create_dir_all(table_dir.join("shard_2")).unwrap();

    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(
        topology(vec![
            local_shard(1),
            remote_shard(1, "a:9000"),
            remote_shard(1, "b:9000"),
        ]),
        id_key(),
        Some(dir.path()),
    );

    assert_eq!(
        table.queue_names(),
        vec!["shard_1".to_string(), "shard_2".to_string()]
    );
    table.shutdown().await;
}

#[tokio::test]
async fn test_queued_batches_survive_restart() {
    let dir = TempDir::new().unwrap();
    let shards = || {
        topology(vec![
            remote_shard(1, "a:9000"),
            remote_shard(1, "b:9000"),
        ])
    };

    let down = Harness::new(ScriptedRemote::new()).with_sender(RecordingSender::down());
    let table = down.table(shards(), id_key(), Some(dir.path()));
    table
        .write(&insert(), rows(&[1, 2, 3, 4]), &QueryContext::new("default"))
        .await
        .unwrap();
    table.shutdown().await;
    drop(table);

    let pending = |shard: &str| {
        std::fs::read_dir(dir.path().join("hits_all").join(shard))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(BATCH_EXTENSION))
            .count()
    };
    assert_eq!(pending("shard_0"), 1);
    assert_eq!(pending("shard_1"), 1);
    assert_eq!(down.sender.delivered_count(), 0);

    // No query issued: recovery alone drains both queues
    let up = Harness::new(ScriptedRemote::new());
    let table = up.table(shards(), id_key(), Some(dir.path()));
    assert_eq!(table.queue_names().len(), 2);

    wait_until(|| up.sender.delivered_count() == 2).await;
    let mut delivered: Vec<(usize, usize)> = up
        .sender
        .delivered
        .lock()
        .iter()
        .map(|b| (b.shard_index(), b.num_rows()))
        .collect();
    delivered.sort();
    assert_eq!(delivered, vec![(0, 2), (1, 2)]);

    wait_until(|| pending("shard_0") == 0 && pending("shard_1") == 0).await;
    table.shutdown().await;
}

#[tokio::test]
async fn test_short_row_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let table = harness.table(
        topology(vec![local_shard(1), remote_shard(1, "a:9000")]),
        Some(Arc::new(ColumnShardingKey::new("value"))),
        Some(dir.path()),
    );

    let block = disttable::Block::with_rows(
        vec!["id".to_string(), "value".to_string()],
        vec![vec![serde_json::json!(1)]],
    );
    let err = table
        .write(&insert(), block, &QueryContext::new("default"))
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::InternalError(_)));
    assert!(harness.local.inserts.lock().is_empty());
    assert_eq!(harness.sender.delivered_count(), 0);
    table.shutdown().await;
}

#[test]
fn test_construction_outside_runtime() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("hits_all").join("shard_0")).unwrap();
    let harness = Harness::new(ScriptedRemote::new());
    let shards = || topology(vec![remote_shard(1, "a:9000"), remote_shard(1, "b:9000")]);

    // No runtime to run queue senders on
    let err = disttable::DistributedTable::new(
        descriptor(id_key()),
        shards(),
        Some(dir.path()),
        harness.services(),
        fast_retry(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, DistError::InternalError(_)));

    // An explicit runtime handle is enough
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut services = harness.services();
    services.runtime = Some(runtime.handle().clone());
    let table = disttable::DistributedTable::new(
        descriptor(id_key()),
        shards(),
        Some(dir.path()),
        services,
        fast_retry(),
    )
    .unwrap();
    assert_eq!(table.queue_names(), vec!["shard_0".to_string()]);
    runtime.block_on(table.shutdown());
}
