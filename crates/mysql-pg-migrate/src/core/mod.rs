//! Core abstractions shared by every migration phase.
//!
//! - [`schema`]: source metadata and resolved table descriptors
//! - [`value`]: row values as read from the source
//! - [`traits`]: the source/target query execution boundary
//! - [`identifier`]: identifier quoting and literal escaping
//! - [`fanout`]: semaphore-bounded task fan-out

pub mod fanout;
pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, IndexKind, SourceColumn,
    SourceColumnType, SourceTable, TableDescriptor, ViewDefinition,
};
pub use traits::{ChunkLoad, ChunkRead, SourceReader, TargetWriter};
pub use value::{Row, SourceValue};
