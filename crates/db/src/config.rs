use serde::{Deserialize, Serialize};

/// Write-ahead log settings; one shard per expected writer thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    pub concurrency: usize,
    pub max_volumes: usize,
    pub volume_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            concurrency: 4,
            max_volumes: 4,
            volume_size: 256 * 1024 * 1024,
        }
    }
}

/// Database creation parameters, persisted in the metadata catalog so
/// `open` needs only the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Number of data volumes (fixed-size stores) or the initial count
    /// (expandable stores).
    pub nvolumes: u32,
    /// Capacity of one volume in 4 KiB blocks.
    pub volume_capacity: u32,
    /// Grow by whole volumes instead of recycling the oldest one.
    pub expandable: bool,
    pub wal: Option<WalConfig>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            nvolumes: 4,
            volume_capacity: 1024 * 1024,
            expandable: false,
            wal: Some(WalConfig::default()),
        }
    }
}
