use serde::{Deserialize, Serialize};

use crate::cluster::settings::{GlobalSubqueriesMethod, Settings};
use crate::stream::Block;

/// Temporary result set shipped to remote shards alongside a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTable {
    pub name: String,
    /// (column name, type name) pairs
    pub structure: Vec<(String, String)>,
    pub blocks: Vec<Block>,
}

impl ExternalTable {
    pub fn new(name: impl Into<String>, structure: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            structure,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }
}

/// State of the query being executed on behalf of a caller
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub current_database: String,
    pub settings: Settings,
    pub external_tables: Vec<ExternalTable>,
}

impl QueryContext {
    pub fn new(current_database: impl Into<String>) -> Self {
        Self {
            current_database: current_database.into(),
            ..Default::default()
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_external_table(mut self, table: ExternalTable) -> Self {
        self.external_tables.push(table);
        self
    }

    /// External tables to forward with a remote SELECT. Only the push
    /// method ships them; with pull the shards fetch the data themselves.
    pub fn forwarded_external_tables(&self) -> Vec<ExternalTable> {
        match self.settings.global_subqueries_method {
            GlobalSubqueriesMethod::Push => self.external_tables.clone(),
            GlobalSubqueriesMethod::Pull => Vec::new(),
        }
    }
}
