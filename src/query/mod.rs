pub mod context;
pub mod rewriter;

pub use context::{ExternalTable, QueryContext};
pub use rewriter::{rewrite_for_shard, rewrite_insert_query, rewrite_select_query};
