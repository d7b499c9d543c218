//! Shard-targeted copies of statements.
//!
//! Only the database/table reference changes. A read statement keeps all of
//! its clauses; a write statement loses any nested SELECT, so a distributed
//! table never forwards INSERT SELECT to its shards.

use disttable_ast::Statement;

use crate::error::{DistError, DistResult};

/// Copy of a SELECT reading from `database.table`
pub fn rewrite_select_query(statement: &Statement, database: &str, table: &str) -> DistResult<Statement> {
    let select = statement.as_select()?;
    Ok(Statement::Select(select.with_target(database, table)))
}

/// Copy of an INSERT writing into `database.table`, without INSERT SELECT
pub fn rewrite_insert_query(statement: &Statement, database: &str, table: &str) -> DistResult<Statement> {
    let insert = statement.as_insert()?;
    Ok(Statement::Insert(insert.with_target(database, table)))
}

/// Rewrite a read or write statement for the physical shard table
pub fn rewrite_for_shard(statement: &Statement, database: &str, table: &str) -> DistResult<Statement> {
    match statement {
        Statement::Select(_) => rewrite_select_query(statement, database, table),
        Statement::Insert(_) => rewrite_insert_query(statement, database, table),
        other => Err(DistError::MalformedStatement(format!(
            "only SELECT and INSERT are rewritten for shards, got {}",
            other.kind().as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disttable_ast::{DescribeQuery, Identifier, InsertQuery, SelectQuery};

    #[test]
    fn test_rewrite_select_preserves_clauses() {
        let original = SelectQuery::new("default", "hits_all")
            .with_columns(vec!["uid".to_string(), "count()".to_string()])
            .with_where("dt = today()")
            .with_group_by(vec!["uid".to_string()])
            .with_order_by(vec!["uid".to_string()])
            .with_limit(10);
        let stmt = Statement::Select(original.clone());

        let rewritten = rewrite_for_shard(&stmt, "remote_db", "hits_local").unwrap();
        let Statement::Select(select) = rewritten else {
            panic!("expected SELECT");
        };
        assert_eq!(select.database, Some(Identifier::database("remote_db")));
        assert_eq!(select.table, Some(Identifier::table("hits_local")));
        assert_eq!(
            SelectQuery {
                database: original.database.clone(),
                table: original.table.clone(),
                ..select
            },
            original
        );
    }

    #[test]
    fn test_rewrite_insert_clears_select() {
        let stmt = Statement::Insert(
            InsertQuery::new("default", "hits_all")
                .with_columns(vec!["id".to_string()])
                .with_format("JSONEachRow")
                .with_select(SelectQuery::new("default", "src")),
        );
        let Statement::Insert(insert) = rewrite_for_shard(&stmt, "remote_db", "hits_local").unwrap() else {
            panic!("expected INSERT");
        };
        assert_eq!(insert.database, "remote_db");
        assert_eq!(insert.table, "hits_local");
        assert!(insert.select.is_none());
        assert_eq!(insert.columns, vec!["id".to_string()]);
        assert_eq!(insert.format.as_deref(), Some("JSONEachRow"));
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let describe = Statement::Describe(DescribeQuery::new("d", "t"));
        assert!(matches!(
            rewrite_for_shard(&describe, "a", "b"),
            Err(DistError::MalformedStatement(_))
        ));

        let insert = Statement::Insert(InsertQuery::new("d", "t"));
        assert!(matches!(
            rewrite_select_query(&insert, "a", "b"),
            Err(DistError::MalformedStatement(_))
        ));

        let select = Statement::Select(SelectQuery::new("d", "t"));
        assert!(matches!(
            rewrite_insert_query(&select, "a", "b"),
            Err(DistError::MalformedStatement(_))
        ));
    }
}
