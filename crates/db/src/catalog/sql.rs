use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use libsql::{params::IntoParams, Builder, Connection};
use nacre_common::{LogicAddr, ParamId};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::DbError;

use super::MetadataCatalog;

const DB_SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS nacre_series (id INTEGER PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
    "CREATE TABLE IF NOT EXISTS nacre_rescue_points (id INTEGER, idx INTEGER, addr BLOB NOT NULL, PRIMARY KEY (id, idx))",
    "CREATE TABLE IF NOT EXISTS nacre_config (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
];

/// SQLite-backed metadata catalog.
///
/// Reads go through a dedicated read connection; writes are funneled
/// through a single writer connection guarded by a mutex, because
/// SQLite enforces one writer even in WAL mode.
pub struct SqlCatalog {
    read_conn: Connection,
    write_conn: Arc<std::sync::Mutex<Connection>>,
}

impl std::fmt::Debug for SqlCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SqlCatalog")
    }
}

impl SqlCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<SqlCatalog, DbError> {
        block_on(async {
            let db = Builder::new_local(path.as_ref()).build().await?;
            let write_conn = db.connect()?;
            write_conn.busy_timeout(Duration::from_millis(5000))?;
            let catalog = SqlCatalog {
                read_conn: db.connect()?,
                write_conn: Arc::new(std::sync::Mutex::new(write_conn)),
            };
            catalog.init_db().await?;
            Ok(catalog)
        })
    }

    async fn init_db(&self) -> Result<(), DbError> {
        // WAL journaling keeps catalog readers from blocking the sync
        // worker's writes.
        self.read_conn.query("PRAGMA journal_mode=WAL;", ()).await?;
        let conn = self.writer();
        for statement in DB_SCHEMA {
            conn.execute(statement, ()).await?;
        }
        debug!("metadata catalog schema ready");
        Ok(())
    }

    /// The guard is held across the whole statement; SQLite enforces a
    /// single writer and we do the same here.
    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.write_conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn execute<P: IntoParams>(&self, sql: &str, params: P) -> Result<(), DbError> {
        let conn = self.writer();
        conn.execute(sql, params).await?;
        Ok(())
    }

    fn addr_blob(addr: LogicAddr) -> Vec<u8> {
        addr.0.to_le_bytes().to_vec()
    }

    fn addr_from_blob(blob: &[u8]) -> Result<LogicAddr, DbError> {
        let bytes: [u8; 8] = blob
            .try_into()
            .map_err(|_| DbError::Catalog("malformed rescue-point blob".into()))?;
        Ok(LogicAddr(u64::from_le_bytes(bytes)))
    }
}

impl MetadataCatalog for SqlCatalog {
    fn add_series(&self, items: &[(ParamId, String)]) -> Result<(), DbError> {
        block_on(async {
            for (id, name) in items {
                self.execute(
                    "INSERT INTO nacre_series (id, name) VALUES (?1, ?2) \
                     ON CONFLICT(id) DO NOTHING",
                    (*id as i64, name.as_str()),
                )
                .await?;
            }
            Ok(())
        })
    }

    fn load_series(&self) -> Result<Vec<(ParamId, String)>, DbError> {
        block_on(async {
            let mut rows = self
                .read_conn
                .query("SELECT id, name FROM nacre_series ORDER BY id", ())
                .await?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().await? {
                let id: i64 = row.get(0)?;
                let name: String = row.get(1)?;
                out.push((id as ParamId, name));
            }
            Ok(out)
        })
    }

    fn update_rescue_points(
        &self,
        items: &[(ParamId, Vec<LogicAddr>)],
    ) -> Result<(), DbError> {
        block_on(async {
            let conn = self.writer();
            let tx = conn.transaction().await?;
            for (id, points) in items {
                tx.execute(
                    "DELETE FROM nacre_rescue_points WHERE id = ?1",
                    [*id as i64],
                )
                .await?;
                for (idx, addr) in points.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO nacre_rescue_points (id, idx, addr) VALUES (?1, ?2, ?3)",
                        (*id as i64, idx as i64, Self::addr_blob(*addr)),
                    )
                    .await?;
                }
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn load_rescue_points(&self) -> Result<FxHashMap<ParamId, Vec<LogicAddr>>, DbError> {
        block_on(async {
            let mut rows = self
                .read_conn
                .query(
                    "SELECT id, idx, addr FROM nacre_rescue_points ORDER BY id, idx",
                    (),
                )
                .await?;
            let mut out: FxHashMap<ParamId, Vec<LogicAddr>> = FxHashMap::default();
            while let Some(row) = rows.next().await? {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(2)?;
                out.entry(id as ParamId)
                    .or_default()
                    .push(Self::addr_from_blob(&blob)?);
            }
            Ok(out)
        })
    }

    fn set_config(&self, key: &str, value: &str) -> Result<(), DbError> {
        block_on(async {
            self.execute(
                "INSERT INTO nacre_config (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                (key, value),
            )
            .await
        })
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, DbError> {
        block_on(async {
            let mut rows = self
                .read_conn
                .query("SELECT value FROM nacre_config WHERE key = ?1", [key])
                .await?;
            match rows.next().await? {
                Some(row) => Ok(Some(row.get::<String>(0)?)),
                None => Ok(None),
            }
        })
    }
}
