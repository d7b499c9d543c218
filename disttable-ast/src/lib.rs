//! disttable-ast - Statement representation for distributed tables.
//!
//! This crate holds the statement sum type that the distributed table engine
//! routes across a cluster, without any dependency on execution or transport.
//!
//! # Main Components
//!
//! - **AST**: `Statement` and its per-kind query structs
//! - **Rendering**: `Display` implementations producing SQL text
//!
//! # Example
//!
//! ```rust
//! use disttable_ast::{SelectQuery, Statement};
//!
//! let select = SelectQuery::new("default", "hits")
//!     .with_columns(vec!["id".to_string()])
//!     .with_limit(10);
//! let stmt = Statement::Select(select);
//! assert_eq!(stmt.to_string(), "SELECT id FROM default.hits LIMIT 10");
//! ```

pub mod ast;
pub mod display;
pub mod error;

pub use ast::{
    AlterParameter, AlterQuery, DescribeQuery, Identifier, IdentifierKind, InsertQuery,
    ReshardParameters, SelectQuery, Statement, StatementKind, WeightedZooKeeperPath,
};
pub use error::{AstError, AstResult};
