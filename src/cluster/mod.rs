pub mod config;
pub mod executor;
pub mod settings;
pub mod topology;
pub mod transport;

pub use config::DistributedConfig;
pub use executor::{
    processing_stage, AlterQueryConstructor, ClusterQueryExecutor, DescribeQueryConstructor,
    LocalExecutor, ProcessingStage, QueryConstructor, RemoteExecutor, RemoteRequest,
    SelectQueryConstructor,
};
pub use settings::{GlobalSubqueriesMethod, Settings};
pub use topology::{ClusterRegistry, ClusterTopology, ShardInfo};
pub use transport::{HttpBatchSender, HttpRemoteExecutor};
