//! Query execution layer: tier-2 materializers that combine per-series
//! operators into sample streams, and the plan builder that maps a
//! parsed query request onto operators + materializer.

mod error;
pub mod materialize;
mod plan;
mod request;

pub use error::QueryError;
pub use materialize::Materializer;
pub use plan::{build_query_plan, execute_query_plan, QueryPlan};
pub use request::{FilterSpec, JoinRow, OrderBy, QueryKind, QueryRequest, TimeRange};
