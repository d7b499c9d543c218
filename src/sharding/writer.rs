use std::sync::Arc;

use disttable_ast::{InsertQuery, Statement};
use tracing::debug;

use super::batch::WriteBatch;
use super::queue::{BatchSender, DeliveryQueues};
use super::router::ShardingRouter;
use crate::cluster::executor::LocalExecutor;
use crate::cluster::settings::Settings;
use crate::cluster::topology::ClusterTopology;
use crate::error::{DistError, DistResult};
use crate::query::rewrite_insert_query;
use crate::stream::Block;

/// Where the rows of one write went
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: usize,
    /// Batches inserted in-process into local shards
    pub local_batches: usize,
    /// Batches persisted to delivery queues
    pub queued_batches: usize,
    /// Batches sent to remote replicas before returning
    pub sent_batches: usize,
}

/// Splits writes by shard and hands every part to its destination
pub struct DistributedWriter {
    table_name: String,
    remote_database: String,
    remote_table: String,
    topology: Arc<ClusterTopology>,
    router: ShardingRouter,
    local: Arc<dyn LocalExecutor>,
    sender: Arc<dyn BatchSender>,
    queues: Arc<DeliveryQueues>,
}

impl DistributedWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_name: impl Into<String>,
        remote_database: impl Into<String>,
        remote_table: impl Into<String>,
        topology: Arc<ClusterTopology>,
        router: ShardingRouter,
        local: Arc<dyn LocalExecutor>,
        sender: Arc<dyn BatchSender>,
        queues: Arc<DeliveryQueues>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            remote_database: remote_database.into(),
            remote_table: remote_table.into(),
            topology,
            router,
            local,
            sender,
            queues,
        }
    }

    /// Route the rows of `block` to their shards.
    ///
    /// Local shards are written before returning. Remote replicas receive
    /// their part through the shard's delivery queue, or directly when
    /// `insert_distributed_sync` is set.
    pub async fn write(&self, insert: &InsertQuery, block: Block, settings: &Settings) -> DistResult<WriteSummary> {
        let shard_insert = match rewrite_insert_query(
            &Statement::Insert(insert.clone()),
            &self.remote_database,
            &self.remote_table,
        )? {
            Statement::Insert(q) => q,
            other => {
                return Err(DistError::MalformedStatement(format!(
                    "INSERT rewrite produced {}",
                    other.kind().as_str()
                )))
            }
        };

        let mut summary = WriteSummary {
            rows: block.num_rows(),
            ..WriteSummary::default()
        };

        for (index, part) in self.router.split_block(&self.table_name, &block)? {
            let shard = self.topology.shard(index).ok_or_else(|| {
                DistError::InternalError(format!("router chose missing shard {}", index))
            })?;

            if shard.is_local() {
                self.local
                    .insert(&shard_insert, part.clone())
                    .await
                    .map_err(|e| e.for_shard(index))?;
                summary.local_batches += 1;
            }

            if shard.has_remote_replicas() {
                let batch = WriteBatch::new(index, shard_insert.clone(), part);
                if settings.insert_distributed_sync {
                    self.sender
                        .send_batch(shard, &batch)
                        .await
                        .map_err(|e| e.for_shard(index))?;
                    summary.sent_batches += 1;
                } else {
                    self.queues.require_for_shard(shard)?.enqueue(&batch).await?;
                    summary.queued_batches += 1;
                }
            }
        }

        debug!(
            "DISTRIBUTED: wrote {} rows to {}: {} local, {} queued, {} sent",
            summary.rows,
            self.table_name,
            summary.local_batches,
            summary.queued_batches,
            summary.sent_batches
        );
        Ok(summary)
    }
}
