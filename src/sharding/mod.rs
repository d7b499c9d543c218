//! Sharded write path: per-row routing, write batches and the per-shard
//! delivery queues that carry them to remote replicas.

pub mod batch;
pub mod queue;
pub mod router;
pub mod writer;

pub use batch::WriteBatch;
pub use queue::{
    recover_queues, BatchSender, DeliveryQueue, DeliveryQueues, RetryPolicy, BATCH_EXTENSION,
};
pub use router::{ColumnShardingKey, ShardingKeyExpr, ShardingRouter};
pub use writer::{DistributedWriter, WriteSummary};
