//! Metadata catalog: durable storage for series names, rescue points
//! and database configuration. The SQL backend is the production one;
//! the in-memory backend serves tests.

mod in_memory;
mod sql;

use nacre_common::{LogicAddr, ParamId};
use rustc_hash::FxHashMap;

use crate::error::DbError;

pub use in_memory::MemoryCatalog;
pub use sql::SqlCatalog;

pub trait MetadataCatalog: std::fmt::Debug + Send + Sync {
    /// Register new series names. Existing ids are overwritten only if
    /// the name matches.
    fn add_series(&self, items: &[(ParamId, String)]) -> Result<(), DbError>;

    fn load_series(&self) -> Result<Vec<(ParamId, String)>, DbError>;

    /// Transactionally replace the rescue-point vectors of the listed
    /// series.
    fn update_rescue_points(
        &self,
        items: &[(ParamId, Vec<LogicAddr>)],
    ) -> Result<(), DbError>;

    fn load_rescue_points(&self) -> Result<FxHashMap<ParamId, Vec<LogicAddr>>, DbError>;

    fn set_config(&self, key: &str, value: &str) -> Result<(), DbError>;

    fn get_config(&self, key: &str) -> Result<Option<String>, DbError>;
}
