use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::settings::Settings;

pub const ENV_DATA_PATH: &str = "DISTTABLE_DATA_PATH";
pub const ENV_MAX_PARALLEL_REPLICAS: &str = "DISTTABLE_MAX_PARALLEL_REPLICAS";
pub const ENV_MAX_DISTRIBUTED_CONNECTIONS: &str = "DISTTABLE_MAX_DISTRIBUTED_CONNECTIONS";
pub const ENV_REMOTE_TIMEOUT_SECS: &str = "DISTTABLE_REMOTE_TIMEOUT_SECS";

/// One shard entry of a cluster definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDef {
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub local_replicas: usize,
    /// Remote replica addresses (host:port)
    #[serde(default)]
    pub remote: Vec<String>,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDef {
    pub shards: Vec<ShardDef>,
}

/// Configuration of the distributed table engine
///
/// ```toml
/// data_path = "/var/lib/disttable"
///
/// [settings]
/// max_parallel_replicas = 2
///
/// [clusters.logs]
/// shards = [
///     { weight = 1, local_replicas = 1 },
///     { weight = 2, remote = ["10.0.0.2:9000", "10.0.0.3:9000"] },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DistributedConfig {
    /// Root of the per-table delivery-queue directories. Writes are
    /// disabled for tables when this is not set.
    #[serde(default)]
    pub data_path: Option<PathBuf>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterDef>,
}

impl DistributedConfig {
    /// Parse configuration from TOML text, then apply environment overrides
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: DistributedConfig = toml::from_str(content)?;
        config.normalize_addresses();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// A `.env` file next to the configuration file is loaded first, so its
    /// variables take part in the environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(
            "Loaded distributed configuration from {} ({} clusters)",
            path.display(),
            config.clusters.len()
        );
        Ok(config)
    }

    /// Trim replica addresses and strip protocol prefixes to handle copy-pasted URLs
    fn normalize_addresses(&mut self) {
        for cluster in self.clusters.values_mut() {
            for shard in &mut cluster.shards {
                for addr in &mut shard.remote {
                    let trimmed = addr.trim();
                    let stripped = trimmed
                        .strip_prefix("http://")
                        .or_else(|| trimmed.strip_prefix("https://"))
                        .unwrap_or(trimmed);
                    *addr = stripped.trim_end_matches('/').to_string();
                }
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_DATA_PATH) {
            if !path.is_empty() {
                self.data_path = Some(PathBuf::from(path));
            }
        }

        if let Some(n) = env_parse::<usize>(ENV_MAX_PARALLEL_REPLICAS) {
            self.settings.max_parallel_replicas = n;
        }

        if let Some(n) = env_parse::<usize>(ENV_MAX_DISTRIBUTED_CONNECTIONS) {
            self.settings.max_distributed_connections = n;
        }

        if let Some(secs) = env_parse::<u64>(ENV_REMOTE_TIMEOUT_SECS) {
            self.settings.remote_timeout_secs = secs;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
