use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unique constraint violated on field '{field}'")]
    KeyViolation { field: String, record: Record },

    #[error("document does not exist")]
    NotExists { record: Record },

    #[error("index not found: {field}")]
    NoIndex { field: String },

    #[error("database is locked: {filename}")]
    DatabaseLocked { filename: String },

    #[error("index already exists: {field}")]
    IndexAlreadyExists { field: String },

    #[error("field name '{field}' is reserved")]
    ReservedField { field: String },

    #[error("primary key generation exhausted its probe budget")]
    KeyGenerationExhausted,

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("corrupt log: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
