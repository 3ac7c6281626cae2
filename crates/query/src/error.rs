use nacre_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query parsing error: {0}")]
    Parse(String),

    #[error("malformed request: {0}")]
    BadRequest(&'static str),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}
