use std::sync::{Mutex, MutexGuard};

use nacre_common::ParamId;
use rustc_hash::FxHashMap;

use crate::error::DbError;

#[derive(Debug, Default)]
struct MatcherInner {
    by_name: FxHashMap<String, ParamId>,
    by_id: FxHashMap<ParamId, String>,
    next_id: ParamId,
}

/// Process-wide series registry mapping names to dense ids.
///
/// The full tag/selector grammar lives in the external series parser;
/// the engine only needs the id ⇄ name bijection, which WAL recovery
/// also repopulates.
#[derive(Debug)]
pub struct SeriesMatcher {
    inner: Mutex<MatcherInner>,
}

impl SeriesMatcher {
    /// Ids are assigned from `base_id` upwards.
    pub fn new(base_id: ParamId) -> SeriesMatcher {
        SeriesMatcher {
            inner: Mutex::new(MatcherInner {
                next_id: base_id,
                ..MatcherInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MatcherInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn match_name(&self, name: &str) -> Option<ParamId> {
        self.lock().by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ParamId) -> Option<String> {
        self.lock().by_id.get(&id).cloned()
    }

    /// Register a known `(name, id)` pair (catalog load, WAL replay).
    pub fn add(&self, name: &str, id: ParamId) -> Result<(), DbError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.by_id.get(&id) {
            if existing == name {
                return Ok(());
            }
            return Err(DbError::SeriesConflict {
                id,
                existing: existing.clone(),
            });
        }
        inner.by_name.insert(name.to_string(), id);
        inner.by_id.insert(id, name.to_string());
        if id >= inner.next_id {
            inner.next_id = id + 1;
        }
        Ok(())
    }

    /// Resolve a name, assigning a fresh id on first sight. The bool is
    /// true when the series is new.
    pub fn init_series_id(&self, name: &str) -> (ParamId, bool) {
        let mut inner = self.lock();
        if let Some(id) = inner.by_name.get(name) {
            return (*id, false);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_name.insert(name.to_string(), id);
        inner.by_id.insert(id, name.to_string());
        (id, true)
    }

    pub fn all_ids(&self) -> Vec<ParamId> {
        let mut ids: Vec<ParamId> = self.lock().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered names starting with `prefix`, sorted.
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .by_name
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Registered names containing `text`, sorted.
    pub fn names_containing(&self, text: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .by_name
            .keys()
            .filter(|name| name.contains(text))
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_dense_ids_from_base() {
        let matcher = SeriesMatcher::new(1000);
        let (a, created_a) = matcher.init_series_id("cpu host=a");
        let (b, created_b) = matcher.init_series_id("cpu host=b");
        let (a2, created_a2) = matcher.init_series_id("cpu host=a");
        assert_eq!((a, created_a), (1000, true));
        assert_eq!((b, created_b), (1001, true));
        assert_eq!((a2, created_a2), (1000, false));
    }

    #[test]
    fn add_detects_id_conflicts() {
        let matcher = SeriesMatcher::new(1);
        matcher.add("mem host=a", 7).expect("add");
        matcher.add("mem host=a", 7).expect("idempotent add");
        assert!(matches!(
            matcher.add("mem host=b", 7),
            Err(DbError::SeriesConflict { .. })
        ));
        // New assignments continue above restored ids.
        let (id, _) = matcher.init_series_id("mem host=c");
        assert_eq!(id, 8);
    }
}
