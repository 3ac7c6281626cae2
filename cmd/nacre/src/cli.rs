use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nacre", author, version, about = "nacre time-series storage engine")]
pub struct CLI {
    #[command(subcommand)]
    pub command: Command,

    /// Database directory.
    #[arg(long = "db", global = true, env = "NACRE_DB", default_value = "./nacre-data")]
    pub db: PathBuf,

    /// Log filter, e.g. "info" or "nacre_storage=debug".
    #[arg(long = "log.level", global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new database.
    Create {
        /// Number of data volumes.
        #[arg(long, default_value_t = 4)]
        volumes: u32,
        /// Capacity of one volume in 4 KiB blocks.
        #[arg(long = "volume-capacity", default_value_t = 1024 * 1024)]
        volume_capacity: u32,
        /// Grow by whole volumes instead of recycling the oldest one.
        #[arg(long)]
        expandable: bool,
        /// Disable the write-ahead log.
        #[arg(long = "no-wal")]
        no_wal: bool,
    },
    /// Print block-store statistics of an existing database.
    Info,
    /// Ingest samples from stdin, one `series-name timestamp value`
    /// triple per line.
    Ingest,
    /// Run a JSON query read from stdin and print samples to stdout.
    Query,
}
