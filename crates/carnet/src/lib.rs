//! carnet is an embedded, append-mostly document database.
//!
//! Documents carry a user-declared schema and are persisted as opaque
//! serialized blobs in append-only data files; in-memory bitmap indexes
//! answer column predicates; a SQL front end exposes every collection as a
//! virtual table with predicate pushdown.

pub mod bitmap;
mod collection;
mod database;
mod document;
mod error;
pub mod index;
mod registry;
mod schema;
mod sql;

pub use blob_store::BlobHandle;

pub use self::collection::DocumentCollection;
pub use self::database::Database;
pub use self::document::{Document, DocumentBuilder};
pub use self::error::{Error, InternalError, UserError};
pub use self::index::{Constraint, ConstraintOp, IndexInfo, IndexKind, IndexStat, Operand};
pub use self::schema::{Field, FieldKind, Schema};
pub use self::sql::ResultSet;

pub type Result<T> = std::result::Result<T, Error>;

/// Monotonic, dense, per-collection document identifier.
pub type DocumentId = u64;
/// Position of a field in its schema.
pub type FieldId = u16;

/// Runtime configuration. Passed explicitly; the engine reads no environment
/// variables.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory and metadata file when they are absent.
    pub create_if_missing: bool,
    /// Maximum number of data files a collection keeps mapped at once.
    pub max_mapped_regions: usize,
    /// Rollover threshold for the current write file.
    pub datafile_max_bytes: u64,
    /// Batch size used when replaying data files at startup.
    pub blob_batch_size: usize,
    pub sqlite_busy_retries: u32,
    pub sqlite_busy_backoff_ms: u64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            create_if_missing: true,
            max_mapped_regions: 8,
            datafile_max_bytes: 256 * 1024 * 1024,
            blob_batch_size: 10_000,
            sqlite_busy_retries: 100,
            sqlite_busy_backoff_ms: 5,
        }
    }
}
