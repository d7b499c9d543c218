//! Shard routing for the write path

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;

use crate::cluster::topology::ClusterTopology;
use crate::error::{DistError, DistResult};
use crate::stream::Block;

/// Expression evaluated per row to pick a destination shard
pub trait ShardingKeyExpr: Send + Sync + Debug {
    /// Text of the expression as written in the table definition
    fn expression(&self) -> &str;

    /// One routing value per row of `block`
    fn evaluate(&self, block: &Block) -> DistResult<Vec<u64>>;
}

/// Sharding key reading a single column
#[derive(Debug, Clone)]
pub struct ColumnShardingKey {
    column: String,
}

impl ColumnShardingKey {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }

    /// Routing value of one cell.
    ///
    /// Integers route by value (negative ones by their two's complement bit
    /// pattern), so `id % total_weight` picks the slot. Everything else is
    /// hashed with seahash for uniform distribution.
    pub fn routing_value(value: &Value) -> u64 {
        match value {
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    u
                } else if let Some(i) = n.as_i64() {
                    i as u64
                } else {
                    seahash::hash(n.to_string().as_bytes())
                }
            }
            Value::Bool(b) => *b as u64,
            Value::String(s) => seahash::hash(s.as_bytes()),
            other => seahash::hash(other.to_string().as_bytes()),
        }
    }
}

impl ShardingKeyExpr for ColumnShardingKey {
    fn expression(&self) -> &str {
        &self.column
    }

    fn evaluate(&self, block: &Block) -> DistResult<Vec<u64>> {
        Ok(block
            .column_values(&self.column)?
            .into_iter()
            .map(Self::routing_value)
            .collect())
    }
}

/// Maps rows of a write onto shards
#[derive(Debug, Clone)]
pub struct ShardingRouter {
    topology: Arc<ClusterTopology>,
    key: Option<Arc<dyn ShardingKeyExpr>>,
}

impl ShardingRouter {
    pub fn new(topology: Arc<ClusterTopology>, key: Option<Arc<dyn ShardingKeyExpr>>) -> Self {
        Self { topology, key }
    }

    pub fn has_sharding_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn sharding_key(&self) -> Option<&Arc<dyn ShardingKeyExpr>> {
        self.key.as_ref()
    }

    /// Shard owning a routing value
    pub fn choose_shard(&self, value: u64) -> usize {
        self.topology.shard_for_value(value)
    }

    /// Destination shard of every row in `block`.
    ///
    /// `table_name` only feeds the error raised when a multi-shard cluster
    /// has no sharding key.
    pub fn choose_shards(&self, table_name: &str, block: &Block) -> DistResult<Vec<usize>> {
        match &self.key {
            Some(key) => {
                let values = key.evaluate(block)?;
                if values.len() != block.num_rows() {
                    return Err(DistError::InternalError(format!(
                        "Sharding key {} produced {} values for {} rows",
                        key.expression(),
                        values.len(),
                        block.num_rows()
                    )));
                }
                Ok(values.into_iter().map(|v| self.choose_shard(v)).collect())
            }
            None if self.topology.shard_count() < 2 => Ok(vec![0; block.num_rows()]),
            None => Err(DistError::WriteNotSupported(table_name.to_string())),
        }
    }

    /// Split `block` into at most one block per destination shard, in shard
    /// order. Rows keep their relative order inside each part.
    pub fn split_block(&self, table_name: &str, block: &Block) -> DistResult<Vec<(usize, Block)>> {
        block.check_widths()?;
        let shards = self.choose_shards(table_name, block)?;

        let mut per_shard: Vec<Vec<usize>> = vec![Vec::new(); self.topology.shard_count()];
        for (row, shard) in shards.into_iter().enumerate() {
            per_shard[shard].push(row);
        }

        Ok(per_shard
            .into_iter()
            .enumerate()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(shard, rows)| (shard, block.take_rows(&rows)))
            .collect())
    }
}
