//! Fan-out of one statement to every shard of a cluster.
//!
//! Each shard gets its own task that opens the shard stream and pumps its
//! blocks into a bounded channel, so a slow or failing shard never holds up
//! collection from the others. Local shards run in-process through the
//! [`LocalExecutor`]; all others go through the [`RemoteExecutor`].
//!
//! Replicas of one shard are never multiplexed over a single task. The
//! remote executor tries them one after another. Merging multiplexed replica
//! streams is unverified for ORDER BY without GROUP BY, so it stays off.

use std::sync::Arc;

use async_trait::async_trait;
use disttable_ast::{InsertQuery, Statement};
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::settings::Settings;
use super::topology::{ClusterTopology, ShardInfo};
use crate::error::{DistError, DistResult};
use crate::query::{ExternalTable, QueryContext};
use crate::stream::{Block, BlockStream};

const SHARD_CHANNEL_CAPACITY: usize = 16;

/// How far a shard takes a query before returning results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStage {
    /// Partially aggregated state the initiator still has to merge
    WithMergeableState,
    /// Final results
    Complete,
}

/// Stage a SELECT over `topology` can be asked to reach on each shard.
///
/// Shards finish the query themselves when exactly one stream will be read
/// (one local shard, or one remote shard read from a single replica) or when
/// merging on the initiator was turned off.
pub fn processing_stage(topology: &ClusterTopology, settings: &Settings) -> ProcessingStage {
    let result_size = topology.remote_shard_count() * settings.max_parallel_replicas
        + topology.local_shard_count();

    if settings.distributed_group_by_no_merge || result_size == 1 {
        ProcessingStage::Complete
    } else {
        ProcessingStage::WithMergeableState
    }
}

/// In-process execution against the physical tables of local shards
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(
        &self,
        statement: &Statement,
        stage: ProcessingStage,
        context: &QueryContext,
    ) -> DistResult<BlockStream>;

    async fn insert(&self, insert: &InsertQuery, block: Block) -> DistResult<()>;
}

/// What a remote replica receives for one shard execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub statement: Statement,
    pub stage: ProcessingStage,
    #[serde(default)]
    pub external_tables: Vec<ExternalTable>,
    pub settings: Settings,
}

/// Execution on the remote replicas of a shard
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, shard: &ShardInfo, request: RemoteRequest) -> DistResult<BlockStream>;
}

/// Per statement kind: the stage shards run to and what travels with a
/// remote execution.
pub trait QueryConstructor: Send + Sync {
    fn stage(&self) -> ProcessingStage;

    fn remote_request(&self, statement: Statement, context: &QueryContext) -> RemoteRequest;
}

pub struct SelectQueryConstructor {
    stage: ProcessingStage,
    external_tables: Vec<ExternalTable>,
}

impl SelectQueryConstructor {
    pub fn new(stage: ProcessingStage, context: &QueryContext) -> Self {
        Self {
            stage,
            external_tables: context.forwarded_external_tables(),
        }
    }
}

impl QueryConstructor for SelectQueryConstructor {
    fn stage(&self) -> ProcessingStage {
        self.stage
    }

    fn remote_request(&self, statement: Statement, context: &QueryContext) -> RemoteRequest {
        RemoteRequest {
            statement,
            stage: self.stage,
            external_tables: self.external_tables.clone(),
            settings: context.settings.clone(),
        }
    }
}

#[derive(Default)]
pub struct DescribeQueryConstructor;

impl QueryConstructor for DescribeQueryConstructor {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Complete
    }

    fn remote_request(&self, statement: Statement, context: &QueryContext) -> RemoteRequest {
        RemoteRequest {
            statement,
            stage: ProcessingStage::Complete,
            external_tables: Vec::new(),
            settings: context.settings.clone(),
        }
    }
}

#[derive(Default)]
pub struct AlterQueryConstructor;

impl QueryConstructor for AlterQueryConstructor {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Complete
    }

    fn remote_request(&self, statement: Statement, context: &QueryContext) -> RemoteRequest {
        RemoteRequest {
            statement,
            stage: ProcessingStage::Complete,
            external_tables: Vec::new(),
            settings: context.settings.clone(),
        }
    }
}

/// Runs statements on every shard of one cluster
#[derive(Clone)]
pub struct ClusterQueryExecutor {
    topology: Arc<ClusterTopology>,
    local: Arc<dyn LocalExecutor>,
    remote: Arc<dyn RemoteExecutor>,
}

impl ClusterQueryExecutor {
    pub fn new(
        topology: Arc<ClusterTopology>,
        local: Arc<dyn LocalExecutor>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            topology,
            local,
            remote,
        }
    }

    pub fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }

    pub fn local(&self) -> &Arc<dyn LocalExecutor> {
        &self.local
    }

    /// Start `statement` on every shard, one stream per shard in shard
    /// order. At most `max_distributed_connections` shards run at a time;
    /// the rest start, in shard order, as running ones finish. Shard failures
    /// surface as a [`DistError::ShardExecution`] item of that shard's stream.
    pub fn execute(
        &self,
        constructor: &dyn QueryConstructor,
        statement: &Statement,
        context: &Arc<QueryContext>,
    ) -> Vec<BlockStream> {
        let limit = context.settings.max_distributed_connections.max(1);
        let (database, table) = statement.target().unwrap_or_default();
        debug!(
            "DISTRIBUTED: starting {} on {}.{} across {} shards of cluster '{}' ({} at a time)",
            statement.kind().as_str(),
            database,
            table,
            self.topology.shard_count(),
            self.topology.name(),
            limit
        );

        let mut tasks = Vec::with_capacity(self.topology.shard_count());
        let mut streams = Vec::with_capacity(self.topology.shard_count());
        for shard in self.topology.shards() {
            let opener = self.opener(shard.clone(), constructor, statement.clone(), context.clone());
            let (tx, mut rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            tasks.push(ShardTask {
                index: shard.index,
                opener,
                tx,
            });

            let stream: BlockStream = Box::pin(async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            });
            streams.push(stream);
        }

        tokio::spawn(dispatch_shards(tasks, Arc::new(Semaphore::new(limit))));
        streams
    }

    fn opener(
        &self,
        shard: ShardInfo,
        constructor: &dyn QueryConstructor,
        statement: Statement,
        context: Arc<QueryContext>,
    ) -> BoxFuture<'static, DistResult<BlockStream>> {
        if shard.is_local() {
            let local = self.local.clone();
            let stage = constructor.stage();
            Box::pin(async move { local.execute(&statement, stage, &context).await })
        } else {
            let remote = self.remote.clone();
            let request = constructor.remote_request(statement, &context);
            let timeout = context.settings.remote_timeout();
            Box::pin(async move {
                match tokio::time::timeout(timeout, remote.execute(&shard, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(DistError::Timeout(format!(
                        "no response from shard {} within {}s",
                        shard.index,
                        timeout.as_secs()
                    ))),
                }
            })
        }
    }
}

struct ShardTask {
    index: usize,
    opener: BoxFuture<'static, DistResult<BlockStream>>,
    tx: mpsc::Sender<DistResult<Block>>,
}

/// Start shards in order, each once a permit is free. A shard keeps its
/// permit until its stream is drained, fails or is abandoned.
async fn dispatch_shards(tasks: Vec<ShardTask>, semaphore: Arc<Semaphore>) {
    for task in tasks {
        let permit = tokio::select! {
            _ = task.tx.closed() => {
                debug!("DISTRIBUTED: shard {} abandoned before it started", task.index);
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        tokio::spawn(async move {
            let _permit = permit;
            let ShardTask { index, opener, tx } = task;
            tokio::select! {
                _ = tx.closed() => {
                    debug!("DISTRIBUTED: shard {} stream abandoned by consumer", index);
                }
                _ = pump_shard(opener, &tx, index) => {}
            }
        });
    }
}

/// Forward one shard's blocks until it ends, fails or the consumer leaves
async fn pump_shard(
    opener: BoxFuture<'static, DistResult<BlockStream>>,
    tx: &mpsc::Sender<DistResult<Block>>,
    index: usize,
) {
    let mut stream = match opener.await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = tx.send(Err(err.for_shard(index))).await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let failed = item.is_err();
        if tx.send(item.map_err(|e| e.for_shard(index))).await.is_err() || failed {
            return;
        }
    }
}
