use serde::{Deserialize, Serialize};

/// How subqueries marked GLOBAL reach remote shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GlobalSubqueriesMethod {
    /// Results are computed by the initiator and shipped as external tables
    #[default]
    Push,
    /// Remote shards fetch the results themselves
    Pull,
}

/// Per-query settings that influence distributed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Replicas of one remote shard that may take part in a single query
    #[serde(default = "default_max_parallel_replicas")]
    pub max_parallel_replicas: usize,

    /// Let each shard finish aggregation on its own; the initiator only concatenates
    #[serde(default)]
    pub distributed_group_by_no_merge: bool,

    #[serde(default)]
    pub global_subqueries_method: GlobalSubqueriesMethod,

    /// Shard streams pulled concurrently when streams are unioned
    #[serde(default = "default_max_distributed_connections")]
    pub max_distributed_connections: usize,

    /// Send remote write batches inline instead of through the delivery queue
    #[serde(default)]
    pub insert_distributed_sync: bool,

    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
}

fn default_max_parallel_replicas() -> usize {
    1
}

fn default_max_distributed_connections() -> usize {
    1024
}

fn default_remote_timeout_secs() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_replicas: default_max_parallel_replicas(),
            distributed_group_by_no_merge: false,
            global_subqueries_method: GlobalSubqueriesMethod::Push,
            max_distributed_connections: default_max_distributed_connections(),
            insert_distributed_sync: false,
            remote_timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn remote_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.remote_timeout_secs)
    }
}
