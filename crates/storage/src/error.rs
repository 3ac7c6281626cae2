use nacre_common::{LogicAddr, ParamId};

/// Storage-engine error taxonomy.
///
/// `Overflow` doubles as the internal "node/volume is full" signal; it
/// escapes to callers only from the input log, where it drives rotation.
/// End-of-stream is *not* an error: operators report it by returning a
/// zero read count.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no capacity left")]
    Overflow,

    #[error("corrupted data: {0}")]
    BadData(String),

    #[error("block {0} is unavailable")]
    Unavailable(LogicAddr),

    #[error("timestamp {attempted} is behind series head {head}")]
    LateWrite { head: u64, attempted: u64 },

    #[error("value is not a finite number")]
    BadValue,

    #[error("unknown series id {0}")]
    NotFound(ParamId),

    #[error("invalid argument: {0}")]
    BadArg(&'static str),

    #[error("operation is not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("operation timed out")]
    Timeout,

    #[error("transient failure, retry")]
    Retry,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl StoreError {
    /// True for conditions a scan may skip over (with a log line) while
    /// still producing the rest of the result set.
    pub fn is_skippable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
