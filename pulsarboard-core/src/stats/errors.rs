use serde_json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Storage backend error: {0}")]
    StorageError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
