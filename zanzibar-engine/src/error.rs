use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZanzibarError {
    /// The rule tree handed to the compiler is malformed.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    /// A check referenced an (object type, relation) pair the model does not define.
    #[error("Relation not found: {object_type}#{relation}")]
    RelationNotFound {
        object_type: String,
        relation: String,
    },

    /// Traversal went deeper than the resolver's bound; the answer is unknown, not "denied".
    #[error("Maximum traversal depth of {0} exceeded")]
    MaxDepthExceeded(usize),

    #[error("Tuple not found")]
    NotFound,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Check timed out after {0:?}")]
    Timeout(Duration),
}

impl ZanzibarError {
    pub(crate) fn relation_not_found(object_type: &str, relation: &str) -> Self {
        Self::RelationNotFound {
            object_type: object_type.to_string(),
            relation: relation.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZanzibarError>;
