//! SQL text rendering for statements.
//!
//! The rendered text is what remote shards receive and what gets recorded
//! with a resharding coordination record.

use std::fmt;

use serde_json::Value;

use crate::ast::{
    AlterParameter, AlterQuery, DescribeQuery, InsertQuery, ReshardParameters, SelectQuery,
    Statement, WeightedZooKeeperPath,
};

fn write_qualified(f: &mut fmt::Formatter<'_>, database: &str, table: &str) -> fmt::Result {
    if database.is_empty() {
        write!(f, "{}", table)
    } else {
        write!(f, "{}.{}", database, table)
    }
}

/// Render a literal the way the SQL dialect spells it
pub fn format_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        other => other.to_string(),
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.columns.is_empty() {
            write!(f, "*")?;
        } else {
            write!(f, "{}", self.columns.join(", "))?;
        }

        if let Some(table) = &self.table {
            write!(f, " FROM ")?;
            let database = self.database.as_ref().map(|d| d.name.as_str()).unwrap_or("");
            write_qualified(f, database, &table.name)?;
        }
        if let Some(expr) = &self.where_expression {
            write!(f, " WHERE {}", expr)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", self.order_by.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

impl fmt::Display for InsertQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO ")?;
        write_qualified(f, &self.database, &self.table)?;
        if !self.columns.is_empty() {
            write!(f, " ({})", self.columns.join(", "))?;
        }
        match (&self.select, &self.format) {
            (Some(select), _) => write!(f, " {}", select),
            (None, Some(format)) => write!(f, " FORMAT {}", format),
            (None, None) => write!(f, " VALUES"),
        }
    }
}

impl fmt::Display for WeightedZooKeeperPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} WEIGHT {}", format_literal(&Value::String(self.path.clone())), self.weight)
    }
}

impl fmt::Display for ReshardParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RESHARD")?;
        if self.do_copy {
            write!(f, " COPY")?;
        }
        // A last partition without a first one is rejected by `validate`
        if let Some(first) = &self.first_partition {
            write!(f, " PARTITION {}", format_literal(first))?;
            if let Some(last) = &self.last_partition {
                write!(f, " TO {}", format_literal(last))?;
            }
        }

        let paths: Vec<String> = self.weighted_paths.iter().map(|p| p.to_string()).collect();
        write!(f, " TO {}", paths.join(", "))?;
        write!(f, " USING {}", self.sharding_key)?;

        if let Some(coordinator) = &self.coordinator {
            write!(f, " COORDINATE WITH {}", format_literal(coordinator))?;
        }
        Ok(())
    }
}

impl fmt::Display for AlterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALTER TABLE ")?;
        write_qualified(f, &self.database, &self.table)?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match parameter {
                AlterParameter::ReshardPartition(params) => write!(f, "{}{}", sep, params)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for DescribeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DESCRIBE TABLE ")?;
        write_qualified(f, &self.database, &self.table)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(q) => q.fmt(f),
            Statement::Insert(q) => q.fmt(f),
            Statement::Alter(q) => q.fmt(f),
            Statement::Describe(q) => q.fmt(f),
        }
    }
}
