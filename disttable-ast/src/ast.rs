use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AstError, AstResult};

/// Role of an identifier node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Database,
    Table,
}

/// Typed identifier used by read statements for their database and table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
    pub kind: IdentifierKind,
}

impl Identifier {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IdentifierKind::Database,
        }
    }

    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IdentifierKind::Table,
        }
    }
}

/// SELECT ... FROM db.table [WHERE ...] [GROUP BY ...] [ORDER BY ...] [LIMIT n]
///
/// Expressions are kept as opaque text; evaluating them is the job of the
/// execution engine on each shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub database: Option<Identifier>,
    pub table: Option<Identifier>,
    /// Projection list; empty means `*`
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub where_expression: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl SelectQuery {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: Some(Identifier::database(database)),
            table: Some(Identifier::table(table)),
            columns: Vec::new(),
            where_expression: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_where(mut self, expression: impl Into<String>) -> Self {
        self.where_expression = Some(expression.into());
        self
    }

    pub fn with_group_by(mut self, keys: Vec<String>) -> Self {
        self.group_by = keys;
        self
    }

    pub fn with_order_by(mut self, keys: Vec<String>) -> Self {
        self.order_by = keys;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Copy of this query reading from `database.table` instead.
    /// Every other clause is kept as is.
    pub fn with_target(&self, database: &str, table: &str) -> Self {
        Self {
            database: Some(Identifier::database(database)),
            table: Some(Identifier::table(table)),
            ..self.clone()
        }
    }

    /// True for ORDER BY without GROUP BY, the shape whose merge order
    /// matters when several replicas of one shard are read on one worker.
    pub fn orders_without_grouping(&self) -> bool {
        !self.order_by.is_empty() && self.group_by.is_empty()
    }
}

/// INSERT INTO db.table [(columns)] [SELECT ... | FORMAT fmt | VALUES]
///
/// Unlike [`SelectQuery`] the target is held as bare names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertQuery {
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub select: Option<Box<SelectQuery>>,
    #[serde(default)]
    pub format: Option<String>,
}

impl InsertQuery {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            columns: Vec::new(),
            select: None,
            format: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_select(mut self, select: SelectQuery) -> Self {
        self.select = Some(Box::new(select));
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Copy of this insert aimed at `database.table`, with any nested
    /// SELECT removed. The copy only ever carries row payload.
    pub fn with_target(&self, database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            columns: self.columns.clone(),
            select: None,
            format: self.format.clone(),
        }
    }
}

/// Destination of a resharding operation: a coordination path and its weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedZooKeeperPath {
    pub path: String,
    pub weight: u64,
}

impl WeightedZooKeeperPath {
    pub fn new(path: impl Into<String>, weight: u64) -> Self {
        Self {
            path: path.into(),
            weight,
        }
    }
}

/// Arguments of `RESHARD [COPY] PARTITION`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshardParameters {
    #[serde(default)]
    pub first_partition: Option<Value>,
    #[serde(default)]
    pub last_partition: Option<Value>,
    pub weighted_paths: Vec<WeightedZooKeeperPath>,
    pub sharding_key: String,
    #[serde(default)]
    pub do_copy: bool,
    #[serde(default)]
    pub coordinator: Option<Value>,
}

impl ReshardParameters {
    /// Reject parameter sets the RESHARD syntax cannot express: a last
    /// partition needs a first one, and there must be a destination.
    pub fn validate(&self) -> AstResult<()> {
        if self.last_partition.is_some() && self.first_partition.is_none() {
            return Err(AstError::Invalid(
                "RESHARD with a last partition requires a first partition".to_string(),
            ));
        }
        if self.weighted_paths.is_empty() {
            return Err(AstError::Invalid(
                "RESHARD requires at least one destination path".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlterParameter {
    ReshardPartition(ReshardParameters),
}

/// ALTER TABLE db.table <parameters>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterQuery {
    pub database: String,
    pub table: String,
    pub parameters: Vec<AlterParameter>,
}

impl AlterQuery {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: AlterParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// DESCRIBE TABLE db.table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeQuery {
    pub database: String,
    pub table: String,
}

impl DescribeQuery {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Alter,
    Describe,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Alter => "ALTER",
            StatementKind::Describe => "DESCRIBE",
        }
    }
}

/// Any statement the distributed table routes to its shards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "query", rename_all = "snake_case")]
pub enum Statement {
    Select(SelectQuery),
    Insert(InsertQuery),
    Alter(AlterQuery),
    Describe(DescribeQuery),
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Select(_) => StatementKind::Select,
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Alter(_) => StatementKind::Alter,
            Statement::Describe(_) => StatementKind::Describe,
        }
    }

    pub fn as_select(&self) -> AstResult<&SelectQuery> {
        match self {
            Statement::Select(q) => Ok(q),
            other => Err(other.unexpected(StatementKind::Select)),
        }
    }

    pub fn as_insert(&self) -> AstResult<&InsertQuery> {
        match self {
            Statement::Insert(q) => Ok(q),
            other => Err(other.unexpected(StatementKind::Insert)),
        }
    }

    /// Database and table the statement targets, if it names one
    pub fn target(&self) -> Option<(&str, &str)> {
        match self {
            Statement::Select(q) => match (&q.database, &q.table) {
                (Some(db), Some(table)) => Some((db.name.as_str(), table.name.as_str())),
                (None, Some(table)) => Some(("", table.name.as_str())),
                _ => None,
            },
            Statement::Insert(q) => Some((q.database.as_str(), q.table.as_str())),
            Statement::Alter(q) => Some((q.database.as_str(), q.table.as_str())),
            Statement::Describe(q) => Some((q.database.as_str(), q.table.as_str())),
        }
    }

    fn unexpected(&self, expected: StatementKind) -> AstError {
        AstError::UnexpectedKind {
            expected: expected.as_str(),
            found: self.kind().as_str(),
        }
    }
}
