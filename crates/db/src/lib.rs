//! Database facade: owns the block store, the column store, the series
//! matcher, the metadata catalog, the write-ahead log and the metadata
//! sync worker, and exposes sessions and query cursors.

pub mod catalog;
mod config;
mod database;
mod error;
mod matcher;
mod recovery;
mod sync;

pub use config::{DbConfig, WalConfig};
pub use database::{Cursor, Database, Session};
pub use error::DbError;
pub use matcher::SeriesMatcher;
