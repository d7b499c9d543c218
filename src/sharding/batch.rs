//! Write batches bound for a single shard.
//!
//! On disk a batch is MessagePack, LZ4 compressed with the uncompressed size
//! prepended.

use chrono::{DateTime, Utc};
use disttable_ast::InsertQuery;
use serde::{Deserialize, Serialize};

use crate::error::DistResult;
use crate::stream::Block;

/// Rows for one shard together with the INSERT that delivers them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    shard_index: usize,
    insert: InsertQuery,
    block: Block,
    created_at: DateTime<Utc>,
}

impl WriteBatch {
    /// `insert` must already target the physical shard table
    pub fn new(shard_index: usize, insert: InsertQuery, block: Block) -> Self {
        Self {
            shard_index,
            insert,
            block,
            created_at: Utc::now(),
        }
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    pub fn insert(&self) -> &InsertQuery {
        &self.insert
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn num_rows(&self) -> usize {
        self.block.num_rows()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn encode(&self) -> DistResult<Vec<u8>> {
        let packed = rmp_serde::to_vec_named(self)?;
        Ok(lz4_flex::compress_prepend_size(&packed))
    }

    pub fn decode(bytes: &[u8]) -> DistResult<Self> {
        let packed = lz4_flex::decompress_size_prepended(bytes)?;
        Ok(rmp_serde::from_slice(&packed)?)
    }
}
