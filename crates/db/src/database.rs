use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nacre_common::{ParamId, Sample};
use nacre_query::{build_query_plan, execute_query_plan, Materializer, QueryRequest};
use nacre_storage::{
    AppendOutcome, BlockStore, BlockStoreStats, CStoreSession, ColumnStore, ExpandableStore,
    FixedSizeStore, PerVolumeStats, ShardedInputLog, WalAppend,
};
use rustc_hash::FxHashSet;
use tracing::{info, warn};

use crate::catalog::{MetadataCatalog, SqlCatalog};
use crate::config::DbConfig;
use crate::error::DbError;
use crate::matcher::SeriesMatcher;
use crate::recovery::run_recovery;
use crate::sync::MetadataSync;

const DB_BASENAME: &str = "nacre";
const CONFIG_KEY: &str = "db-config";
const BASE_SERIES_ID: ParamId = 1024;
const BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    bstore: Arc<dyn BlockStore>,
    cstore: Arc<ColumnStore>,
    matcher: Arc<SeriesMatcher>,
    catalog: Arc<dyn MetadataCatalog>,
    wal: Option<Arc<ShardedInputLog>>,
    sync: MetadataSync,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Graceful `close` already stopped the worker; this is the
        // backstop for databases that were simply dropped.
        self.sync.shutdown();
    }
}

/// An open nacre database. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Create the on-disk layout and open it.
    pub fn create(dir: &Path, config: &DbConfig) -> Result<Database, DbError> {
        std::fs::create_dir_all(dir)?;
        let catalog = SqlCatalog::open(dir.join(format!("{DB_BASENAME}.sqlite")))?;
        let encoded = serde_json::to_string(config)
            .map_err(|e| DbError::Catalog(e.to_string()))?;
        catalog.set_config(CONFIG_KEY, &encoded)?;
        if config.expandable {
            ExpandableStore::create(dir, DB_BASENAME, config.volume_capacity)?;
        } else {
            let volumes: Vec<(PathBuf, u32)> = (0..config.nvolumes)
                .map(|ix| {
                    (
                        dir.join(format!("{DB_BASENAME}_{ix}.vol")),
                        config.volume_capacity,
                    )
                })
                .collect();
            FixedSizeStore::create(&dir.join(format!("{DB_BASENAME}.metavol")), &volumes)?;
        }
        info!(dir = %dir.display(), "database created");
        Self::open(dir)
    }

    /// Open an existing database, running crash recovery if the last
    /// shutdown left a write-ahead log behind.
    pub fn open(dir: &Path) -> Result<Database, DbError> {
        let catalog: Arc<dyn MetadataCatalog> =
            Arc::new(SqlCatalog::open(dir.join(format!("{DB_BASENAME}.sqlite")))?);
        let config: DbConfig = match catalog.get_config(CONFIG_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| DbError::Catalog(format!("bad stored config: {e}")))?,
            None => return Err(DbError::Catalog("not a nacre database".into())),
        };
        let bstore: Arc<dyn BlockStore> = if config.expandable {
            ExpandableStore::open(dir, DB_BASENAME)?
        } else {
            let volumes: Vec<PathBuf> = (0..config.nvolumes)
                .map(|ix| dir.join(format!("{DB_BASENAME}_{ix}.vol")))
                .collect();
            FixedSizeStore::open(&dir.join(format!("{DB_BASENAME}.metavol")), &volumes)?
        };
        let cstore = ColumnStore::new(Arc::clone(&bstore));
        let matcher = Arc::new(SeriesMatcher::new(BASE_SERIES_ID));
        let report = run_recovery(dir, &bstore, &cstore, &matcher, &catalog)?;
        if report.restored_series > 0 {
            info!(
                series = report.restored_series,
                replayed = report.replayed_samples,
                lost = report.lost_samples,
                "input log replay finished"
            );
        }
        let wal = match &config.wal {
            Some(cfg) => Some(ShardedInputLog::create(
                dir,
                cfg.concurrency,
                cfg.max_volumes,
                cfg.volume_size,
            )?),
            None => None,
        };
        let sync = MetadataSync::spawn(Arc::clone(&bstore), Arc::clone(&catalog));
        Ok(Database {
            inner: Arc::new(Inner {
                dir: dir.to_owned(),
                bstore,
                cstore,
                matcher,
                catalog,
                wal,
                sync,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Resolve a series name, creating the column on first sight.
    pub fn init_series_id(&self, name: &str) -> Result<ParamId, DbError> {
        self.ensure_open()?;
        let (id, created) = self.inner.matcher.init_series_id(name);
        if created {
            self.inner.cstore.create_new_column(id)?;
            self.inner.sync.add_series_name(id, name.to_string());
        }
        Ok(id)
    }

    pub fn get_series_name(&self, id: ParamId) -> Option<String> {
        self.inner.matcher.name_of(id)
    }

    /// Exact-name lookups; selector expansion belongs to the external
    /// series parser.
    pub fn get_series_ids(&self, names: &[&str]) -> Result<Vec<ParamId>, DbError> {
        names
            .iter()
            .map(|name| {
                self.inner
                    .matcher
                    .match_name(name)
                    .ok_or_else(|| DbError::QueryParsing(format!("unknown series `{name}`")))
            })
            .collect()
    }

    /// Open a writer session with its own column cache and WAL shard.
    pub fn session(&self) -> Session {
        let shard = self.inner.wal.as_ref().map(|wal| wal.assign_shard());
        Session {
            inner: Arc::clone(&self.inner),
            cstore_session: CStoreSession::new(Arc::clone(&self.inner.cstore)),
            shard,
            named: FxHashSet::default(),
        }
    }

    /// Execute a parsed query request.
    pub fn query(&self, req: &QueryRequest) -> Result<Cursor, DbError> {
        self.ensure_open()?;
        let plan = build_query_plan(req)?;
        let mat = execute_query_plan(&plan, &self.inner.cstore)?;
        Ok(Cursor { mat })
    }

    /// Parse a JSON query and execute it.
    pub fn query_json(&self, text: &str) -> Result<Cursor, DbError> {
        let req: QueryRequest =
            serde_json::from_str(text).map_err(|e| DbError::QueryParsing(e.to_string()))?;
        self.query(&req)
    }

    /// Series names completing `prefix` (the `meta:names` surface).
    pub fn suggest(&self, prefix: &str) -> Vec<String> {
        self.inner.matcher.names_with_prefix(prefix)
    }

    /// Series names containing `text`.
    pub fn search(&self, text: &str) -> Vec<String> {
        self.inner.matcher.names_containing(text)
    }

    pub fn stats(&self) -> (BlockStoreStats, PerVolumeStats) {
        (self.inner.bstore.stats(), self.inner.bstore.volume_stats())
    }

    /// Commit every dirty column, persist the final rescue points and
    /// delete the write-ahead log.
    pub fn close(&self) -> Result<(), DbError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing database");
        let mapping = self.inner.cstore.close(None)?;
        self.inner.sync.add_rescue_batch(mapping);
        self.inner.sync.shutdown();
        if let Some(wal) = &self.inner.wal {
            wal.delete_files()?;
        }
        self.inner.bstore.flush()?;
        Ok(())
    }
}

/// Writer session: private column cache plus a private WAL shard.
pub struct Session {
    inner: Arc<Inner>,
    cstore_session: CStoreSession,
    shard: Option<usize>,
    /// Series whose name was already logged through this session's
    /// shard.
    named: FxHashSet<ParamId>,
}

impl Session {
    pub fn init_series_id(&mut self, name: &str) -> Result<ParamId, DbError> {
        Database {
            inner: Arc::clone(&self.inner),
        }
        .init_series_id(name)
    }

    /// Write one sample: the column store append and the WAL append,
    /// plus the rotation barrier protocol on WAL overflow.
    pub fn write(&mut self, sample: &Sample) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        let mut rescue_points = Vec::new();
        let outcome = self.cstore_session.write(sample, &mut rescue_points)?;
        if outcome == AppendOutcome::OkFlushNeeded {
            self.inner
                .sync
                .add_rescue_points(sample.id, rescue_points.clone());
        }
        let Some(wal) = self.inner.wal.as_ref().map(Arc::clone) else {
            return Ok(());
        };
        let Some(shard) = self.shard else {
            return Ok(());
        };
        let mut stale: FxHashSet<ParamId> = FxHashSet::default();
        let mut overflowed = false;
        let value = match &sample.payload {
            nacre_common::PayloadValue::Float(x) => *x,
            _ => return Err(DbError::Store(nacre_storage::StoreError::BadArg(
                "only scalar samples can be logged",
            ))),
        };
        wal.with_shard(shard, |log| {
            if !self.named.contains(&sample.id) {
                if let Some(name) = self.inner.matcher.name_of(sample.id) {
                    if let WalAppend::Overflow { stale_ids } =
                        log.append_series_name(sample.id, &name)?
                    {
                        overflowed = true;
                        stale.extend(stale_ids);
                    }
                }
                self.named.insert(sample.id);
            }
            if let WalAppend::Overflow { stale_ids } =
                log.append(sample.id, sample.timestamp, value)?
            {
                overflowed = true;
                stale.extend(stale_ids);
            }
            if outcome == AppendOutcome::OkFlushNeeded {
                if let WalAppend::Overflow { stale_ids } =
                    log.append_rescue_points(sample.id, &rescue_points)?
                {
                    overflowed = true;
                    stale.extend(stale_ids);
                }
            }
            Ok(())
        })?;
        if overflowed {
            self.rotate_shard(&wal, shard, stale)?;
        }
        Ok(())
    }

    /// Before the oldest log volume can be discarded, everything it
    /// still covers must be durable: close the stale columns, wait for
    /// the metadata barrier, then rotate.
    fn rotate_shard(
        &mut self,
        wal: &Arc<ShardedInputLog>,
        shard: usize,
        stale: FxHashSet<ParamId>,
    ) -> Result<(), DbError> {
        if !stale.is_empty() {
            let ids: Vec<ParamId> = stale.into_iter().collect();
            warn!(
                count = ids.len(),
                "closing stale series before WAL rotation"
            );
            let mapping = self.inner.cstore.close(Some(&ids))?;
            self.inner.sync.add_rescue_batch(mapping);
            let barrier = self.inner.sync.add_barrier();
            barrier
                .recv_timeout(BARRIER_TIMEOUT)
                .map_err(|_| DbError::SyncTimeout)?;
        }
        wal.with_shard(shard, |log| log.rotate())?;
        Ok(())
    }

    /// Flush the WAL shard and unload the session cache.
    pub fn close(&mut self) -> Result<(), DbError> {
        if let (Some(wal), Some(shard)) = (&self.inner.wal, self.shard) {
            wal.with_shard(shard, |log| log.flush().map(|_| ()))?;
        }
        self.cstore_session.close();
        Ok(())
    }
}

/// Demand-driven sample stream produced by a query.
pub struct Cursor {
    mat: Box<dyn Materializer>,
}

impl Cursor {
    /// Append up to `limit` samples to `dest`; `0` means the stream is
    /// done.
    pub fn read_batch(
        &mut self,
        dest: &mut Vec<Sample>,
        limit: usize,
    ) -> Result<usize, DbError> {
        Ok(self.mat.read(dest, limit)?)
    }

    /// Drain the whole stream.
    pub fn collect_all(mut self) -> Result<Vec<Sample>, DbError> {
        let mut out = Vec::new();
        loop {
            let n = self.read_batch(&mut out, 4096)?;
            if n == 0 {
                return Ok(out);
            }
        }
    }
}
