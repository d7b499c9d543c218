//! Common test utilities for distributed table tests
//!
//! Provides shared helpers for:
//! - Building topologies and tables over mock collaborators
//! - Scripting per-shard behaviour of remote execution
//! - Collecting delivered write batches

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use disttable::ast::{AlterParameter, InsertQuery, Statement};
use disttable::cluster::executor::{LocalExecutor, RemoteExecutor, RemoteRequest};
use disttable::resharding::{CoordinatorStatus, InMemoryReshardingWorker};
use disttable::sharding::RetryPolicy;
use disttable::table::MetadataStore;
use disttable::{
    BatchSender, Block, BlockStream, ClusterTopology, ColumnDef, DistError, DistResult,
    DistributedTable, DistributedTableDescriptor, ProcessingStage, QueryContext, ShardInfo,
    ShardingKeyExpr, TableSchema, TableServices, WriteBatch,
};
use futures::stream;
use parking_lot::Mutex;
use serde_json::json;

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("disttable=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn local_shard(weight: u64) -> ShardInfo {
    ShardInfo::new(weight, 1, vec![])
}

pub fn remote_shard(weight: u64, addr: &str) -> ShardInfo {
    ShardInfo::new(weight, 0, vec![addr.to_string()])
}

pub fn topology(shards: Vec<ShardInfo>) -> Arc<ClusterTopology> {
    Arc::new(ClusterTopology::new("test_cluster", shards).expect("valid topology"))
}

pub fn rows(ids: &[i64]) -> Block {
    Block::with_rows(
        vec!["id".to_string(), "value".to_string()],
        ids.iter().map(|id| vec![json!(id), json!(format!("v{}", id))]).collect(),
    )
}

pub fn schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("id", "Int64"),
        ColumnDef::new("value", "String"),
    ])
}

pub fn descriptor(sharding_key: Option<Arc<dyn ShardingKeyExpr>>) -> DistributedTableDescriptor {
    DistributedTableDescriptor {
        database: "default".to_string(),
        name: "hits_all".to_string(),
        remote_database: "shard_db".to_string(),
        remote_table: "hits_local".to_string(),
        sharding_key,
        schema: schema(),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// In-process shard: answers reads with fixed rows and records inserts
#[derive(Default)]
pub struct MockLocal {
    pub inserts: Mutex<Vec<(InsertQuery, Block)>>,
    pub executed: Mutex<Vec<(Statement, ProcessingStage)>>,
}

#[async_trait]
impl LocalExecutor for MockLocal {
    async fn execute(
        &self,
        statement: &Statement,
        stage: ProcessingStage,
        _context: &QueryContext,
    ) -> DistResult<BlockStream> {
        self.executed.lock().push((statement.clone(), stage));
        let block = Block::with_rows(vec!["shard".to_string()], vec![vec![json!("local")]]);
        Ok(Box::pin(stream::iter(vec![Ok(block)])))
    }

    async fn insert(&self, insert: &InsertQuery, block: Block) -> DistResult<()> {
        self.inserts.lock().push((insert.clone(), block));
        Ok(())
    }
}

/// How a remote shard answers
#[derive(Clone)]
pub enum ShardBehavior {
    /// Return these blocks
    Rows(Vec<Block>),
    /// Fail when the statement is opened
    Fail(String),
    /// Return one block, then fail mid-stream
    FailAfterRows(String),
    /// Block at a resharding barrier until the coordination record leaves
    /// the normal path, then fail
    WaitForAbort(Arc<InMemoryReshardingWorker>),
    /// Never return anything
    Hang,
}

/// Remote executor with scripted per-shard behaviour
#[derive(Default)]
pub struct ScriptedRemote {
    behaviors: Mutex<HashMap<usize, ShardBehavior>>,
    pub requests: Mutex<Vec<(usize, RemoteRequest)>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, shard: usize, behavior: ShardBehavior) -> Self {
        self.behaviors.lock().insert(shard, behavior);
        self
    }

    pub fn requests_for(&self, shard: usize) -> Vec<RemoteRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|(index, _)| *index == shard)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

/// Coordinator id carried by an ALTER ... RESHARD statement
pub fn coordinator_of(statement: &Statement) -> Option<String> {
    match statement {
        Statement::Alter(alter) => alter.parameters.iter().find_map(|p| match p {
            AlterParameter::ReshardPartition(params) => params
                .coordinator
                .as_ref()
                .and_then(|c| c.as_str())
                .map(str::to_string),
        }),
        _ => None,
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedRemote {
    async fn execute(&self, shard: &ShardInfo, request: RemoteRequest) -> DistResult<BlockStream> {
        self.requests.lock().push((shard.index, request.clone()));
        let behavior = self.behaviors.lock().get(&shard.index).cloned();

        match behavior {
            None => {
                let block = Block::with_rows(vec!["shard".to_string()], vec![vec![json!(shard.index)]]);
                Ok(Box::pin(stream::iter(vec![Ok(block)])))
            }
            Some(ShardBehavior::Rows(blocks)) => Ok(Box::pin(stream::iter(blocks.into_iter().map(Ok)))),
            Some(ShardBehavior::Fail(message)) => Err(DistError::NetworkError(message)),
            Some(ShardBehavior::FailAfterRows(message)) => {
                let block = Block::with_rows(vec!["shard".to_string()], vec![vec![json!(shard.index)]]);
                Ok(Box::pin(stream::iter(vec![
                    Ok(block),
                    Err(DistError::NetworkError(message)),
                ])))
            }
            Some(ShardBehavior::WaitForAbort(worker)) => {
                let id = coordinator_of(&request.statement);
                Ok(Box::pin(async_stream::stream! {
                    loop {
                        let status = id.as_deref().and_then(|id| worker.record(id)).map(|r| r.status);
                        if matches!(status, Some(CoordinatorStatus::Error) | Some(CoordinatorStatus::Deleted) | None) {
                            yield Err(DistError::CoordinationError("resharding aborted by a peer".to_string()));
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }))
            }
            Some(ShardBehavior::Hang) => Ok(Box::pin(stream::pending())),
        }
    }
}

/// Batch sender that can be switched between failing and accepting
#[derive(Default)]
pub struct RecordingSender {
    pub delivered: Mutex<Vec<WriteBatch>>,
    pub down: std::sync::atomic::AtomicBool,
}

impl RecordingSender {
    pub fn down() -> Self {
        let sender = Self::default();
        sender.down.store(true, std::sync::atomic::Ordering::SeqCst);
        sender
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl BatchSender for RecordingSender {
    async fn send_batch(&self, _shard: &ShardInfo, batch: &WriteBatch) -> DistResult<()> {
        if self.down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DistError::NetworkError("replica down".to_string()));
        }
        self.delivered.lock().push(batch.clone());
        Ok(())
    }
}

/// Metadata store keeping the last schema per table
#[derive(Default)]
pub struct MemoryMetadata {
    pub tables: Mutex<HashMap<String, TableSchema>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn alter_table(&self, database: &str, table: &str, schema: &TableSchema) -> DistResult<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DistError::IoError("metadata disk full".to_string()));
        }
        self.tables
            .lock()
            .insert(format!("{}.{}", database, table), schema.clone());
        Ok(())
    }
}

/// A table with every collaborator mocked
pub struct Harness {
    pub local: Arc<MockLocal>,
    pub remote: Arc<ScriptedRemote>,
    pub sender: Arc<RecordingSender>,
    pub metadata: Arc<MemoryMetadata>,
    pub worker: Option<Arc<InMemoryReshardingWorker>>,
}

impl Harness {
    pub fn new(remote: ScriptedRemote) -> Self {
        Self {
            local: Arc::new(MockLocal::default()),
            remote: Arc::new(remote),
            sender: Arc::new(RecordingSender::default()),
            metadata: Arc::new(MemoryMetadata::default()),
            worker: Some(Arc::new(InMemoryReshardingWorker::new())),
        }
    }

    pub fn with_sender(mut self, sender: RecordingSender) -> Self {
        self.sender = Arc::new(sender);
        self
    }

    pub fn with_worker(mut self, worker: Option<Arc<InMemoryReshardingWorker>>) -> Self {
        self.worker = worker;
        self
    }

    pub fn services(&self) -> TableServices {
        TableServices {
            local: self.local.clone(),
            remote: self.remote.clone(),
            sender: self.sender.clone(),
            resharding: self
                .worker
                .clone()
                .map(|w| w as Arc<dyn disttable::ReshardingWorker>),
            metadata: self.metadata.clone(),
            runtime: None,
        }
    }

    pub fn table(
        &self,
        topology: Arc<ClusterTopology>,
        sharding_key: Option<Arc<dyn ShardingKeyExpr>>,
        data_path: Option<&Path>,
    ) -> DistributedTable {
        DistributedTable::new(
            descriptor(sharding_key),
            topology,
            data_path,
            self.services(),
            fast_retry(),
        )
        .expect("table")
    }
}
