//! Distributed table engine.
//!
//! A distributed table stores no data itself. Reads fan out to every shard of
//! a cluster and come back as one stream per shard, writes are split by a
//! sharding key and queued on disk per shard, and `ALTER ... RESHARD` is run
//! across all shards under one coordination record.

pub mod cluster;
pub mod error;
pub mod query;
pub mod resharding;
pub mod sharding;
pub mod stream;
pub mod table;

pub use cluster::{
    ClusterQueryExecutor, ClusterRegistry, ClusterTopology, DistributedConfig, ProcessingStage,
    Settings, ShardInfo,
};
pub use disttable_ast as ast;
pub use error::{DistError, DistResult};
pub use query::{ExternalTable, QueryContext};
pub use resharding::{CoordinatorStatus, InMemoryReshardingWorker, ReshardingWorker};
pub use sharding::{BatchSender, ColumnShardingKey, ShardingKeyExpr, WriteBatch, WriteSummary};
pub use stream::{Block, BlockStream, UnionStream};
pub use table::{
    AlterCommand, ColumnDef, DistributedTable, DistributedTableDescriptor, TableSchema,
    TableServices,
};
