pub mod distributed;
pub mod metadata;
pub mod schema;

pub use distributed::{
    DistributedTable, DistributedTableDescriptor, ReadResult, TableServices, VIRTUAL_TABLE_COLUMN,
};
pub use metadata::{JsonMetadataStore, MetadataStore};
pub use schema::{AlterCommand, ColumnDef, ColumnDefault, DefaultKind, TableSchema};

/// Escape a table or database name for use as a single path component.
/// ASCII letters, digits and `_` are kept, every other byte becomes `%XX`.
pub fn escape_for_file_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}
