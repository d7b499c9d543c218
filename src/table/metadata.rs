use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::schema::TableSchema;
use crate::error::DistResult;

/// Persistent table definitions owned by the database layer
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn alter_table(&self, database: &str, table: &str, schema: &TableSchema) -> DistResult<()>;
}

/// Stores each table schema as `<root>/<database>/<table>.json`
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    root: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn table_path(&self, database: &str, table: &str) -> PathBuf {
        self.root
            .join(super::escape_for_file_name(database))
            .join(format!("{}.json", super::escape_for_file_name(table)))
    }

    pub async fn load(&self, database: &str, table: &str) -> DistResult<TableSchema> {
        let bytes = tokio::fs::read(self.table_path(database, table)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn alter_table(&self, database: &str, table: &str, schema: &TableSchema) -> DistResult<()> {
        let path = self.table_path(database, table);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(schema)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored metadata of {}.{} in {}", database, table, path.display());
        Ok(())
    }
}
