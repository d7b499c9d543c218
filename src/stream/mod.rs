pub mod block;
pub mod union;

pub use block::{Block, BlockStream};
pub use union::{FailureHook, UnionStream};
