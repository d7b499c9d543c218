use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::DistributedConfig;
use crate::error::{DistError, DistResult};

/// One shard of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Position of the shard in the cluster definition
    pub index: usize,
    /// Share of the sharding-key space routed to this shard
    pub weight: u64,
    /// Replicas living in this process
    pub local_replicas: usize,
    /// Addresses (host:port) of replicas reached over the network
    pub remote_replicas: Vec<String>,
}

impl ShardInfo {
    pub fn new(weight: u64, local_replicas: usize, remote_replicas: Vec<String>) -> Self {
        Self {
            index: 0,
            weight,
            local_replicas,
            remote_replicas,
        }
    }

    /// A shard with at least one in-process replica is executed locally
    pub fn is_local(&self) -> bool {
        self.local_replicas > 0
    }

    pub fn has_remote_replicas(&self) -> bool {
        !self.remote_replicas.is_empty()
    }

    /// Name of the delivery-queue directory for this shard
    pub fn dir_name(&self) -> String {
        format!("shard_{}", self.index)
    }
}

/// Immutable description of a cluster's shards.
///
/// Shards form a weighted discrete distribution over `[0, total_weight)`:
/// shard `i` owns the slots between the cumulative weight of the shards
/// before it and its own cumulative weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    name: String,
    shards: Vec<ShardInfo>,
    cumulative_weights: Vec<u64>,
}

impl ClusterTopology {
    pub fn new(name: impl Into<String>, shards: Vec<ShardInfo>) -> DistResult<Self> {
        let name = name.into();
        if shards.is_empty() {
            return Err(DistError::ConfigError(format!(
                "Cluster '{}' has no shards",
                name
            )));
        }

        let mut cumulative_weights = Vec::with_capacity(shards.len());
        let mut total = 0u64;
        let mut indexed = Vec::with_capacity(shards.len());

        for (index, mut shard) in shards.into_iter().enumerate() {
            if shard.weight == 0 {
                return Err(DistError::ConfigError(format!(
                    "Shard {} of cluster '{}' has zero weight",
                    index, name
                )));
            }
            if !shard.is_local() && !shard.has_remote_replicas() {
                return Err(DistError::ConfigError(format!(
                    "Shard {} of cluster '{}' has no replicas",
                    index, name
                )));
            }
            total = total.checked_add(shard.weight).ok_or_else(|| {
                DistError::ConfigError(format!("Total weight of cluster '{}' overflows", name))
            })?;
            cumulative_weights.push(total);
            shard.index = index;
            indexed.push(shard);
        }

        Ok(Self {
            name,
            shards: indexed,
            cumulative_weights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn shard(&self, index: usize) -> Option<&ShardInfo> {
        self.shards.get(index)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn local_shard_count(&self) -> usize {
        self.shards.iter().filter(|s| s.is_local()).count()
    }

    pub fn remote_shard_count(&self) -> usize {
        self.shards.iter().filter(|s| !s.is_local()).count()
    }

    pub fn total_weight(&self) -> u64 {
        // Never empty, checked in new()
        self.cumulative_weights.last().copied().unwrap_or(0)
    }

    /// Shard owning `value` once reduced modulo the total weight
    pub fn shard_for_value(&self, value: u64) -> usize {
        let slot = value % self.total_weight();
        self.cumulative_weights.partition_point(|&bound| bound <= slot)
    }

    /// Shard whose delivery-queue directory is `dir_name`
    pub fn shard_by_dir_name(&self, dir_name: &str) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.dir_name() == dir_name)
    }
}

/// Named clusters known to this server
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: HashMap<String, Arc<ClusterTopology>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DistributedConfig) -> DistResult<Self> {
        let mut registry = Self::new();
        for (name, cluster) in &config.clusters {
            let shards = cluster
                .shards
                .iter()
                .map(|s| ShardInfo::new(s.weight, s.local_replicas, s.remote.clone()))
                .collect();
            registry.insert(ClusterTopology::new(name.clone(), shards)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, topology: ClusterTopology) -> Arc<ClusterTopology> {
        let topology = Arc::new(topology);
        self.clusters
            .insert(topology.name().to_string(), topology.clone());
        topology
    }

    pub fn get(&self, name: &str) -> DistResult<Arc<ClusterTopology>> {
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| DistError::ConfigError(format!("Requested cluster '{}' not found", name)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }
}
