//! The distributed table: a logical table whose data lives in physical
//! tables on the shards of a cluster.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use disttable_ast::{DescribeQuery, InsertQuery, ReshardParameters, Statement};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::metadata::MetadataStore;
use super::schema::{AlterCommand, ColumnDef, TableSchema};
use crate::cluster::config::DistributedConfig;
use crate::cluster::executor::{
    processing_stage, ClusterQueryExecutor, DescribeQueryConstructor, LocalExecutor, ProcessingStage,
    RemoteExecutor, SelectQueryConstructor,
};
use crate::cluster::topology::{ClusterRegistry, ClusterTopology};
use crate::error::{DistError, DistResult};
use crate::query::{rewrite_select_query, QueryContext};
use crate::resharding::{ReshardingCoordinatorClient, ReshardingWorker};
use crate::sharding::queue::{BatchSender, DeliveryQueues, RetryPolicy};
use crate::sharding::router::{ShardingKeyExpr, ShardingRouter};
use crate::sharding::writer::{DistributedWriter, WriteSummary};
use crate::stream::{Block, BlockStream, UnionStream};

/// Name of the virtual column holding the distributed table's name
pub const VIRTUAL_TABLE_COLUMN: &str = "_table";

/// What identifies a distributed table
#[derive(Debug, Clone)]
pub struct DistributedTableDescriptor {
    pub database: String,
    pub name: String,
    pub remote_database: String,
    pub remote_table: String,
    pub sharding_key: Option<Arc<dyn ShardingKeyExpr>>,
    pub schema: TableSchema,
}

/// Collaborators a distributed table calls into
#[derive(Clone)]
pub struct TableServices {
    pub local: Arc<dyn LocalExecutor>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub sender: Arc<dyn BatchSender>,
    /// Absent when the server runs without a resharding subsystem
    pub resharding: Option<Arc<dyn ReshardingWorker>>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Runtime running the delivery queue senders; the current one when absent
    pub runtime: Option<tokio::runtime::Handle>,
}

/// Streams of one read, with the stage each shard ran the query to
pub struct ReadResult {
    pub stage: ProcessingStage,
    pub streams: Vec<BlockStream>,
}

pub struct DistributedTable {
    database: String,
    name: String,
    remote_database: String,
    remote_table: String,
    topology: Arc<ClusterTopology>,
    executor: ClusterQueryExecutor,
    router: ShardingRouter,
    resharding: Option<Arc<dyn ReshardingWorker>>,
    metadata: Arc<dyn MetadataStore>,
    data_path: Option<PathBuf>,
    queues: Option<Arc<DeliveryQueues>>,
    writer: Option<DistributedWriter>,
    write_enabled: bool,
    schema: RwLock<TableSchema>,
    structure_lock: tokio::sync::Mutex<()>,
}

impl DistributedTable {
    /// Create the table and adopt the delivery queues already on disk.
    ///
    /// Without `data_path` the table is read-only. Writes are also refused
    /// when the cluster has several shards and no sharding key is given.
    /// With a `data_path`, queue senders need a tokio runtime: either
    /// `services.runtime` or the one this is called from.
    pub fn new(
        descriptor: DistributedTableDescriptor,
        topology: Arc<ClusterTopology>,
        data_path: Option<&Path>,
        services: TableServices,
        retry_policy: RetryPolicy,
    ) -> DistResult<Self> {
        let DistributedTableDescriptor {
            database,
            name,
            remote_database,
            remote_table,
            sharding_key,
            schema,
        } = descriptor;

        let write_enabled =
            data_path.is_some() && (topology.shard_count() < 2 || sharding_key.is_some());

        let executor = ClusterQueryExecutor::new(
            topology.clone(),
            services.local.clone(),
            services.remote.clone(),
        );
        let router = ShardingRouter::new(topology.clone(), sharding_key);

        let table_path = data_path.map(|p| p.join(super::escape_for_file_name(&name)));
        let queues = match &table_path {
            Some(path) => {
                let queues = match services.runtime.clone() {
                    Some(runtime) => DeliveryQueues::recover_on(
                        runtime,
                        path.clone(),
                        topology.clone(),
                        services.sender.clone(),
                        retry_policy,
                    )?,
                    None => DeliveryQueues::recover(
                        path.clone(),
                        topology.clone(),
                        services.sender.clone(),
                        retry_policy,
                    )?,
                };
                Some(Arc::new(queues))
            }
            None => None,
        };

        let writer = queues.as_ref().map(|queues| {
            DistributedWriter::new(
                name.clone(),
                remote_database.clone(),
                remote_table.clone(),
                topology.clone(),
                router.clone(),
                services.local.clone(),
                services.sender.clone(),
                queues.clone(),
            )
        });

        info!(
            "DISTRIBUTED: table {}.{} over cluster '{}' ({} shards, writes {})",
            database,
            name,
            topology.name(),
            topology.shard_count(),
            if write_enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            database,
            name,
            remote_database,
            remote_table,
            topology,
            executor,
            router,
            resharding: services.resharding,
            metadata: services.metadata,
            data_path: table_path,
            queues,
            writer,
            write_enabled,
            schema: RwLock::new(schema),
            structure_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create the table over a cluster named in `config`
    pub fn from_config(
        descriptor: DistributedTableDescriptor,
        cluster_name: &str,
        registry: &ClusterRegistry,
        config: &DistributedConfig,
        services: TableServices,
    ) -> DistResult<Self> {
        let topology = registry.get(cluster_name)?;
        Self::new(
            descriptor,
            topology,
            config.data_path.as_deref(),
            services,
            RetryPolicy::default(),
        )
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }

    pub fn is_write_enabled(&self) -> bool {
        self.write_enabled
    }

    pub fn has_sharding_key(&self) -> bool {
        self.router.has_sharding_key()
    }

    /// Directory holding this table's delivery queues
    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    /// Number of remote shards
    pub fn shard_count(&self) -> usize {
        self.topology.remote_shard_count()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.as_ref().map(|q| q.names()).unwrap_or_default()
    }

    pub fn queues(&self) -> Option<&Arc<DeliveryQueues>> {
        self.queues.as_ref()
    }

    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    /// Real or virtual column named `name`
    pub fn get_column(&self, name: &str) -> DistResult<ColumnDef> {
        if name == VIRTUAL_TABLE_COLUMN {
            return Ok(ColumnDef::new(VIRTUAL_TABLE_COLUMN, "String"));
        }
        self.schema
            .read()
            .column(name)
            .cloned()
            .ok_or_else(|| DistError::ColumnNotFound(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == VIRTUAL_TABLE_COLUMN || self.schema.read().has_column(name)
    }

    /// Start a SELECT on every shard.
    ///
    /// With [`ProcessingStage::WithMergeableState`] the caller still has to
    /// merge the partial aggregation states of the returned streams.
    pub fn read(&self, statement: &Statement, context: &QueryContext) -> DistResult<ReadResult> {
        let stage = processing_stage(&self.topology, &context.settings);
        let rewritten = rewrite_select_query(statement, &self.remote_database, &self.remote_table)?;
        if let Statement::Select(select) = &rewritten {
            if select.orders_without_grouping() {
                debug!(
                    "DISTRIBUTED: {} orders without grouping, shard results are concatenated, not sort-merged",
                    self.name
                );
            }
        }
        let constructor = SelectQueryConstructor::new(stage, context);
        let context = Arc::new(context.clone());

        debug!("DISTRIBUTED: {} reading at stage {:?}: {}", self.name, stage, rewritten);
        let streams = self.executor.execute(&constructor, &rewritten, &context);
        Ok(ReadResult { stage, streams })
    }

    /// [`DistributedTable::read`] with the shard streams unioned
    pub fn read_merged(
        &self,
        statement: &Statement,
        context: &QueryContext,
    ) -> DistResult<(ProcessingStage, UnionStream)> {
        let ReadResult { stage, streams } = self.read(statement, context)?;
        Ok((stage, UnionStream::new(streams)))
    }

    /// Route the rows of `block` to their shards
    pub async fn write(
        &self,
        insert: &InsertQuery,
        block: Block,
        context: &QueryContext,
    ) -> DistResult<WriteSummary> {
        let writer = match (&self.writer, self.write_enabled) {
            (Some(writer), true) => writer,
            _ => return Err(DistError::WriteNotSupported(self.name.clone())),
        };
        writer.write(insert, block, &context.settings).await
    }

    /// Apply structural changes and persist the new schema.
    ///
    /// Readers keep seeing the previous schema until every command applied
    /// and the metadata store accepted the result.
    pub async fn alter(&self, commands: &[AlterCommand]) -> DistResult<()> {
        if commands
            .iter()
            .any(|c| matches!(c, AlterCommand::ModifyPrimaryKey { .. }))
        {
            return Err(DistError::UnsupportedOperation(
                "Storage engine Distributed doesn't support primary key".to_string(),
            ));
        }

        let _structure = self.structure_lock.lock().await;

        let mut updated = self.schema.read().clone();
        for command in commands {
            updated.apply(command)?;
        }

        self.metadata
            .alter_table(&self.database, &self.name, &updated)
            .await?;
        *self.schema.write() = updated;

        info!(
            "DISTRIBUTED: altered {}.{} ({} commands)",
            self.database,
            self.name,
            commands.len()
        );
        Ok(())
    }

    /// Redistribute partitions of the physical tables across shards.
    /// `params.coordinator` must be empty.
    pub async fn reshard_partitions(
        &self,
        params: ReshardParameters,
        context: &QueryContext,
    ) -> DistResult<()> {
        let worker = self.resharding.clone().ok_or(DistError::NoReshardingWorker)?;
        let mut client = ReshardingCoordinatorClient::new(
            worker,
            self.executor.clone(),
            self.remote_database.as_str(),
            self.remote_table.as_str(),
        );
        client.run(params, context).await
    }

    /// DESCRIBE the physical table on every shard, one stream per shard
    pub fn describe(&self, context: &QueryContext) -> Vec<BlockStream> {
        let statement = Statement::Describe(DescribeQuery::new(
            self.remote_database.as_str(),
            self.remote_table.as_str(),
        ));

        let mut shard_context = context.clone();
        shard_context.settings.distributed_group_by_no_merge = true;

        self.executor
            .execute(&DescribeQueryConstructor, &statement, &Arc::new(shard_context))
    }

    /// Stop all delivery queues. Pending batches stay on disk.
    pub async fn shutdown(&self) {
        if let Some(queues) = &self.queues {
            queues.shutdown_all().await;
        }
        debug!("DISTRIBUTED: table {}.{} shut down", self.database, self.name);
    }
}
