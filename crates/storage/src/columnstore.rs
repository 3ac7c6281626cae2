use std::sync::{Arc, Mutex, MutexGuard};

use nacre_common::{LogicAddr, ParamId, PayloadValue, Sample, Timestamp};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::iter::{BoxedAggregateOperator, BoxedOperator, ValueFilter};
use crate::nbtree::{AppendOutcome, ExtentsList, RepairStatus};

pub type SharedColumn = Arc<Mutex<ExtentsList>>;

fn lock_column(column: &SharedColumn) -> MutexGuard<'_, ExtentsList> {
    match column.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Central owner of every per-series tree.
///
/// The table lock guards only the id → column map; per-series work runs
/// under the column's own mutex so concurrent writers to different
/// series never contend.
#[derive(Debug)]
pub struct ColumnStore {
    store: Arc<dyn BlockStore>,
    columns: Mutex<FxHashMap<ParamId, SharedColumn>>,
}

impl ColumnStore {
    pub fn new(store: Arc<dyn BlockStore>) -> Arc<ColumnStore> {
        Arc::new(ColumnStore {
            store,
            columns: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn blockstore(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    fn table(&self) -> MutexGuard<'_, FxHashMap<ParamId, SharedColumn>> {
        match self.columns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Build one extents list per mapping entry and report ids whose
    /// rescue state demands a WAL replay.
    pub fn open_or_restore(
        &self,
        mapping: &FxHashMap<ParamId, Vec<LogicAddr>>,
        force_init: bool,
    ) -> Result<Vec<ParamId>, StoreError> {
        let mut needs_replay = Vec::new();
        let mut table = self.table();
        for (id, rescue_points) in mapping {
            let status = ExtentsList::repair_status(rescue_points);
            let mut column =
                ExtentsList::new(*id, rescue_points.clone(), Arc::clone(&self.store));
            match status {
                RepairStatus::Repair => needs_replay.push(*id),
                // Nothing was ever committed; whatever the series held
                // lives only in the input log.
                RepairStatus::New => {
                    warn!(id = *id, "empty rescue-point vector, leaf data must be replayed");
                    needs_replay.push(*id);
                }
                RepairStatus::Ok => {}
            }
            if force_init || status == RepairStatus::Repair {
                column.force_init()?;
            }
            table.insert(*id, Arc::new(Mutex::new(column)));
        }
        info!(
            columns = table.len(),
            repaired = needs_replay.len(),
            "column store opened"
        );
        Ok(needs_replay)
    }

    pub fn create_new_column(&self, id: ParamId) -> Result<(), StoreError> {
        let mut table = self.table();
        if table.contains_key(&id) {
            return Err(StoreError::BadArg("column already exists"));
        }
        debug!(id, "creating column");
        table.insert(
            id,
            Arc::new(Mutex::new(ExtentsList::new(
                id,
                Vec::new(),
                Arc::clone(&self.store),
            ))),
        );
        Ok(())
    }

    pub fn column(&self, id: ParamId) -> Result<SharedColumn, StoreError> {
        self.table()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn sample_value(sample: &Sample) -> Result<f64, StoreError> {
        match &sample.payload {
            PayloadValue::Float(x) => Ok(*x),
            _ => Err(StoreError::BadArg("only scalar samples can be stored")),
        }
    }

    /// Route one sample to its column. `rescue_points` is filled only
    /// when the append committed something and the new rescue vector
    /// must reach the metadata catalog.
    pub fn write(
        &self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
        cache: Option<&mut FxHashMap<ParamId, SharedColumn>>,
    ) -> Result<AppendOutcome, StoreError> {
        let value = Self::sample_value(sample)?;
        let column = self.column(sample.id)?;
        if let Some(cache) = cache {
            cache.insert(sample.id, Arc::clone(&column));
        }
        let mut tree = lock_column(&column);
        let outcome = tree.append(sample.timestamp, value)?;
        if outcome == AppendOutcome::OkFlushNeeded {
            *rescue_points = tree.get_roots();
        }
        Ok(outcome)
    }

    /// WAL-replay write path: duplicate suppression is controlled by
    /// the caller and unknown ids are reported, not fatal.
    pub fn recovery_write(
        &self,
        sample: &Sample,
        allow_duplicates: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let value = Self::sample_value(sample)?;
        let column = self.column(sample.id)?;
        let mut tree = lock_column(&column);
        tree.append_with(sample.timestamp, value, allow_duplicates)
    }

    /// Force-commit the listed columns (or every column) and return
    /// their final rescue vectors.
    pub fn close(
        &self,
        ids: Option<&[ParamId]>,
    ) -> Result<FxHashMap<ParamId, Vec<LogicAddr>>, StoreError> {
        let selected: Vec<(ParamId, SharedColumn)> = {
            let table = self.table();
            match ids {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| table.get(id).map(|c| (*id, Arc::clone(c))))
                    .collect(),
                None => table.iter().map(|(id, c)| (*id, Arc::clone(c))).collect(),
            }
        };
        let mut mapping = FxHashMap::default();
        for (id, column) in selected {
            let mut tree = lock_column(&column);
            mapping.insert(id, tree.close()?);
        }
        Ok(mapping)
    }

    pub fn scan(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BoxedOperator>, StoreError> {
        self.operators(ids, |tree| tree.search(begin, end))
    }

    pub fn aggregate(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BoxedAggregateOperator>, StoreError> {
        self.operators(ids, |tree| tree.aggregate(begin, end))
    }

    pub fn group_aggregate(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<Vec<BoxedAggregateOperator>, StoreError> {
        self.operators(ids, |tree| tree.group_aggregate(begin, end, step))
    }

    pub fn filter_scan(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
        filter: &ValueFilter,
    ) -> Result<Vec<BoxedOperator>, StoreError> {
        self.operators(ids, |tree| tree.filter(begin, end, filter))
    }

    fn operators<T>(
        &self,
        ids: &[ParamId],
        make: impl Fn(&ExtentsList) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let column = self.column(*id)?;
            let mut tree = lock_column(&column);
            tree.force_init()?;
            out.push(make(&tree)?);
        }
        Ok(out)
    }
}

/// Per-writer view of the column store with a private column cache;
/// misses fall back to the shared table under its lock.
#[derive(Debug)]
pub struct CStoreSession {
    cstore: Arc<ColumnStore>,
    cache: FxHashMap<ParamId, SharedColumn>,
}

impl CStoreSession {
    pub fn new(cstore: Arc<ColumnStore>) -> Self {
        CStoreSession {
            cstore,
            cache: FxHashMap::default(),
        }
    }

    pub fn write(
        &mut self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
    ) -> Result<AppendOutcome, StoreError> {
        if let Some(column) = self.cache.get(&sample.id) {
            let value = match &sample.payload {
                PayloadValue::Float(x) => *x,
                _ => return Err(StoreError::BadArg("only scalar samples can be stored")),
            };
            let mut tree = lock_column(column);
            let outcome = tree.append(sample.timestamp, value)?;
            if outcome == AppendOutcome::OkFlushNeeded {
                *rescue_points = tree.get_roots();
            }
            return Ok(outcome);
        }
        self.cstore
            .write(sample, rescue_points, Some(&mut self.cache))
    }

    /// Unload the cached trees; the columns stay live in the store.
    pub fn close(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemStore;
    use crate::nbtree::iter::SeriesOperator;

    fn sample(id: ParamId, ts: Timestamp, value: f64) -> Sample {
        Sample::float(id, ts, value)
    }

    #[test]
    fn write_requires_existing_column() {
        let cstore = ColumnStore::new(MemStore::new());
        let mut rescue = Vec::new();
        assert!(matches!(
            cstore.write(&sample(5, 1, 1.0), &mut rescue, None),
            Err(StoreError::NotFound(5))
        ));
        cstore.create_new_column(5).expect("create");
        cstore
            .write(&sample(5, 1, 1.0), &mut rescue, None)
            .expect("write");
    }

    #[test]
    fn session_cache_is_populated_on_miss() {
        let cstore = ColumnStore::new(MemStore::new());
        cstore.create_new_column(1).expect("create");
        let mut session = CStoreSession::new(Arc::clone(&cstore));
        let mut rescue = Vec::new();
        session.write(&sample(1, 1, 0.5), &mut rescue).expect("write");
        assert!(session.cache.contains_key(&1));
        session.write(&sample(1, 2, 0.5), &mut rescue).expect("write");
    }

    #[test]
    fn blob_samples_are_rejected_by_the_write_path() {
        let cstore = ColumnStore::new(MemStore::new());
        cstore.create_new_column(1).expect("create");
        let mut rescue = Vec::new();
        let blob = Sample {
            id: 1,
            timestamp: 1,
            payload: PayloadValue::Blob(vec![1, 2, 3]),
        };
        assert!(matches!(
            cstore.write(&blob, &mut rescue, None),
            Err(StoreError::BadArg(_))
        ));
    }

    #[test]
    fn close_returns_root_vectors_per_id() {
        let cstore = ColumnStore::new(MemStore::new());
        for id in [1u64, 2] {
            cstore.create_new_column(id).expect("create");
        }
        let mut rescue = Vec::new();
        for ts in 0..1000u64 {
            for id in [1u64, 2] {
                cstore
                    .write(&sample(id, ts, ts as f64), &mut rescue, None)
                    .expect("write");
            }
        }
        let mapping = cstore.close(None).expect("close");
        assert_eq!(mapping.len(), 2);
        for roots in mapping.values() {
            assert!(roots.last().map(|a| !a.is_empty()).unwrap_or(false));
        }
    }

    #[test]
    fn scan_after_restore_round_trip() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let cstore = ColumnStore::new(Arc::clone(&store));
        cstore.create_new_column(7).expect("create");
        let mut rescue = Vec::new();
        for ts in 0..5000u64 {
            cstore
                .write(&sample(7, ts, ts as f64), &mut rescue, None)
                .expect("write");
        }
        let mapping = cstore.close(None).expect("close");

        let reopened = ColumnStore::new(store);
        let replay = reopened
            .open_or_restore(&mapping, false)
            .expect("open_or_restore");
        assert!(replay.is_empty());
        let mut ops = reopened.scan(&[7], 0, 10_000).expect("scan");
        let mut ts = [0u64; 256];
        let mut xs = [0f64; 256];
        let mut total = 0usize;
        loop {
            let n = ops[0].read(&mut ts, &mut xs).expect("read");
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 5000);
    }
}
