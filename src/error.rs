use thiserror::Error;

/// Errors raised by the repository layer.
///
/// Caller-contract violations are reported eagerly and never coerced. A query
/// that matches nothing is not an error: operations report `None` or `false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("unknown column `{column}` on table `{table}`")]
    UnknownColumn { table: String, column: String },

    #[error("unknown relationship `{relationship}` on table `{table}`")]
    UnknownRelationship { table: String, relationship: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("order_by length ({order_by}) must be equal to direction length ({direction})")]
    OrderByMismatch { order_by: usize, direction: usize },

    #[error("invalid order direction `{0}`, expected `asc` or `desc`")]
    InvalidDirection(String),

    #[error("invalid values: {0}")]
    InvalidValues(String),

    #[error("invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("relationship options nested deeper than {depth} levels")]
    RelationshipDepthExceeded { depth: usize },

    #[error("no explicit join on `{0}` to populate from")]
    MissingJoin(String),

    #[error("relationship `{0}` is not allowed to be loaded")]
    RaiseLoad(String),

    #[error("relationship `{0}` is not loaded")]
    RelationNotLoaded(String),

    #[error("expected at most one row, found {0}")]
    MultipleRows(usize),

    #[error("table `{0}` has no primary key")]
    MissingPrimaryKey(String),

    #[error("could not refresh row of table `{0}`: row no longer exists")]
    RefreshFailed(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
