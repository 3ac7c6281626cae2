use std::sync::{Mutex, MutexGuard};

use nacre_common::{LogicAddr, ParamId};
use rustc_hash::FxHashMap;

use crate::error::DbError;

use super::MetadataCatalog;

#[derive(Debug, Default)]
struct Inner {
    series: FxHashMap<ParamId, String>,
    rescue: FxHashMap<ParamId, Vec<LogicAddr>>,
    config: FxHashMap<String, String>,
}

/// Volatile catalog used by tests and throwaway databases.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> MemoryCatalog {
        MemoryCatalog::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MetadataCatalog for MemoryCatalog {
    fn add_series(&self, items: &[(ParamId, String)]) -> Result<(), DbError> {
        let mut inner = self.lock();
        for (id, name) in items {
            inner.series.entry(*id).or_insert_with(|| name.clone());
        }
        Ok(())
    }

    fn load_series(&self) -> Result<Vec<(ParamId, String)>, DbError> {
        let mut out: Vec<(ParamId, String)> = self
            .lock()
            .series
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    fn update_rescue_points(
        &self,
        items: &[(ParamId, Vec<LogicAddr>)],
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        for (id, points) in items {
            inner.rescue.insert(*id, points.clone());
        }
        Ok(())
    }

    fn load_rescue_points(&self) -> Result<FxHashMap<ParamId, Vec<LogicAddr>>, DbError> {
        Ok(self.lock().rescue.clone())
    }

    fn set_config(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.lock().config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, DbError> {
        Ok(self.lock().config.get(key).cloned())
    }
}
