use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DistError, DistResult};

/// A batch of rows sharing one column layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Row stream produced by one shard, or by a merge of several shards
pub type BlockStream = BoxStream<'static, DistResult<Block>>;

impl Block {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> DistResult<()> {
        self.check_row(self.rows.len(), &row)?;
        self.rows.push(row);
        Ok(())
    }

    fn check_row(&self, index: usize, row: &[Value]) -> DistResult<()> {
        if row.len() != self.columns.len() {
            return Err(DistError::InternalError(format!(
                "Row {} has {} values but block has {} columns",
                index,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }

    /// Every row must have one value per column
    pub fn check_widths(&self) -> DistResult<()> {
        for (index, row) in self.rows.iter().enumerate() {
            self.check_row(index, row)?;
        }
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order
    pub fn column_values(&self, name: &str) -> DistResult<Vec<&Value>> {
        let pos = self
            .column_position(name)
            .ok_or_else(|| DistError::ColumnNotFound(name.to_string()))?;
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                row.get(pos).ok_or_else(|| {
                    DistError::InternalError(format!(
                        "Row {} has no value for column '{}'",
                        index, name
                    ))
                })
            })
            .collect()
    }

    /// New block with the given rows, in the given order
    pub fn take_rows(&self, indices: &[usize]) -> Block {
        Block {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }
}
