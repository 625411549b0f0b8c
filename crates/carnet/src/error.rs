use std::io;

use thiserror::Error;

use crate::index::ConstraintOp;
use crate::schema::FieldKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal: {0}.")]
    InternalError(#[from] InternalError),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    UserError(#[from] UserError),
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error(transparent)]
    BlobStore(#[from] blob_store::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("index state for collection `{collection}` diverged from storage: {cause}")]
    IndexCorrupted { collection: String, cause: String },
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database metadata file `{0}` does not exist")]
    MissingDatabaseFile(String),
    #[error("collection `{0}` already exists")]
    CollectionAlreadyExists(String),
    #[error("collection `{0}` does not exist")]
    UnknownCollection(String),
    #[error("document does not match the schema: {0}")]
    SchemaMismatch(String),
    #[error("field `{0}` is missing from the document")]
    FieldMissing(String),
    #[error("field `{field}` is declared as {kind:?} and cannot be read as {requested}")]
    TypeMismatch { field: String, kind: FieldKind, requested: &'static str },
    #[error("index `{index}` does not support the `{op}` operator")]
    UnsupportedOperator { index: String, op: ConstraintOp },
    #[error("index `{index}` does not support {operand} operands")]
    UnsupportedOperand { index: String, operand: &'static str },
    #[error("document with id `{id}` does not exist in collection `{collection}`")]
    MissingDocument { id: u64, collection: String },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

impl From<blob_store::Error> for Error {
    fn from(error: blob_store::Error) -> Error {
        Error::InternalError(InternalError::BlobStore(error))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::InternalError(InternalError::SerdeJson(error))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Error {
        Error::UserError(UserError::Sql(error))
    }
}
