use nacre_common::ParamId;
use nacre_query::QueryError;
use nacre_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata catalog error: {0}")]
    Catalog(String),

    #[error("series id {id} is already taken by `{existing}`")]
    SeriesConflict { id: ParamId, existing: String },

    #[error("query parsing error: {0}")]
    QueryParsing(String),

    #[error("timed out waiting for the metadata sync barrier")]
    SyncTimeout,

    #[error("database is shut down")]
    Closed,
}

impl From<libsql::Error> for DbError {
    fn from(err: libsql::Error) -> Self {
        DbError::Catalog(err.to_string())
    }
}
