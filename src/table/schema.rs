use serde::{Deserialize, Serialize};

use crate::error::{DistError, DistResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultKind {
    Default,
    Materialized,
    Alias,
}

/// Default expression of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefault {
    pub kind: DefaultKind,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, kind: DefaultKind, expression: impl Into<String>) -> Self {
        self.default = Some(ColumnDefault {
            kind,
            expression: expression.into(),
        });
        self
    }
}

/// A structural change requested by ALTER TABLE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlterCommand {
    AddColumn {
        column: ColumnDef,
        /// Insert after this column; at the end when absent
        #[serde(default)]
        after: Option<String>,
    },
    DropColumn {
        name: String,
    },
    /// Replace type and default of an existing column
    ModifyColumn {
        column: ColumnDef,
    },
    ModifyPrimaryKey {
        expression: String,
    },
}

/// Ordered column list of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    fn position(&self, name: &str) -> DistResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DistError::ColumnNotFound(name.to_string()))
    }

    /// Apply one command. On error the schema may be partially changed, so
    /// callers apply commands to a copy.
    pub fn apply(&mut self, command: &AlterCommand) -> DistResult<()> {
        match command {
            AlterCommand::AddColumn { column, after } => {
                if self.has_column(&column.name) {
                    return Err(DistError::ColumnAlreadyExists(column.name.clone()));
                }
                let at = match after {
                    Some(after) => self.position(after)? + 1,
                    None => self.columns.len(),
                };
                self.columns.insert(at, column.clone());
            }
            AlterCommand::DropColumn { name } => {
                let at = self.position(name)?;
                if self.columns.len() == 1 {
                    return Err(DistError::UnsupportedOperation(format!(
                        "Cannot drop column {}: it is the only column of the table",
                        name
                    )));
                }
                self.columns.remove(at);
            }
            AlterCommand::ModifyColumn { column } => {
                let at = self.position(&column.name)?;
                self.columns[at] = column.clone();
            }
            AlterCommand::ModifyPrimaryKey { .. } => {
                return Err(DistError::UnsupportedOperation(
                    "Storage engine Distributed doesn't support primary key".to_string(),
                ));
            }
        }
        Ok(())
    }
}
