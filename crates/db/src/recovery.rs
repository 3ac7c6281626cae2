use std::path::Path;
use std::sync::Arc;

use nacre_common::{LogicAddr, ParamId, Sample};
use nacre_storage::{
    BlockStore, ColumnStore, InputLogRecord, ShardedInputLog, StoreError,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, info, warn};

use crate::catalog::MetadataCatalog;
use crate::error::DbError;
use crate::matcher::SeriesMatcher;

/// Outcome of the startup recovery sequence.
#[derive(Debug, Default)]
pub(crate) struct RecoveryReport {
    pub replayed_samples: u64,
    pub lost_samples: u64,
    pub restored_series: usize,
}

/// Replay state recovered from the catalog and, when present, the
/// write-ahead log: metadata pass, tree restore, then data pass.
pub(crate) fn run_recovery(
    wal_dir: &Path,
    bstore: &Arc<dyn BlockStore>,
    cstore: &ColumnStore,
    matcher: &SeriesMatcher,
    catalog: &Arc<dyn MetadataCatalog>,
) -> Result<RecoveryReport, DbError> {
    let mut report = RecoveryReport::default();
    let mut mapping = catalog.load_rescue_points()?;
    for (id, name) in catalog.load_series()? {
        matcher.add(&name, id)?;
        mapping.entry(id).or_default();
    }

    let shard_count = ShardedInputLog::find_logs(wal_dir)?;
    let run_wal_recovery = shard_count > 0;
    let mut new_ids = Vec::new();
    if run_wal_recovery {
        info!(shards = shard_count, "WAL metadata recovery started");
        new_ids = metadata_pass(wal_dir, bstore, matcher, &mut mapping)?;
    }

    let mut replay_ids = cstore.open_or_restore(&mapping, !run_wal_recovery)?;
    replay_ids.extend(new_ids.iter().copied());
    report.restored_series = replay_ids.len();

    if run_wal_recovery {
        info!("WAL data recovery started");
        data_pass(wal_dir, cstore, &replay_ids, &mut report)?;
        // Persist the final state of everything the replay touched and
        // drop the logs; the next startup sees a clean catalog.
        let mapping = cstore.close(Some(&replay_ids))?;
        let items: Vec<(ParamId, Vec<LogicAddr>)> = mapping.into_iter().collect();
        catalog.update_rescue_points(&items)?;
        let names: Vec<(ParamId, String)> = new_ids
            .iter()
            .filter_map(|id| matcher.name_of(*id).map(|name| (*id, name)))
            .collect();
        catalog.add_series(&names)?;
        bstore.flush()?;
        ShardedInputLog::delete_found_logs(wal_dir)?;
        info!(
            samples = report.replayed_samples,
            lost = report.lost_samples,
            "WAL recovery completed"
        );
    }
    Ok(report)
}

/// First pass: series names and rescue-point records from the meta
/// streams.
fn metadata_pass(
    wal_dir: &Path,
    bstore: &Arc<dyn BlockStore>,
    matcher: &SeriesMatcher,
    mapping: &mut FxHashMap<ParamId, Vec<LogicAddr>>,
) -> Result<Vec<ParamId>, DbError> {
    let top_addr = bstore.top_address();
    let mut reader = ShardedInputLog::open_meta_reader(wal_dir)?;
    let mut new_ids = Vec::new();
    while let Some(row) = reader.next_row() {
        match row.record {
            InputLogRecord::SeriesName(name) => match matcher.add(&name, row.id) {
                Ok(()) => {
                    if !mapping.contains_key(&row.id) {
                        mapping.insert(row.id, Vec::new());
                        new_ids.push(row.id);
                    }
                }
                Err(DbError::SeriesConflict { id, existing }) => {
                    error!(
                        id,
                        %existing,
                        %name,
                        "series id conflict in the WAL, record skipped"
                    );
                }
                Err(other) => return Err(other),
            },
            InputLogRecord::RescuePoints(points) => {
                if matcher.name_of(row.id).is_none() {
                    warn!(id = row.id, "rescue record for an unknown series, skipped");
                    continue;
                }
                if is_newer(mapping.get(&row.id), &points, top_addr) {
                    mapping.insert(row.id, points);
                }
            }
            InputLogRecord::DataPoint { .. } => {}
        }
    }
    Ok(new_ids)
}

/// A logged rescue vector replaces the catalog's only when it is
/// plausibly newer: longer, or reaching a higher address that is still
/// inside the block store.
fn is_newer(
    current: Option<&Vec<LogicAddr>>,
    candidate: &[LogicAddr],
    top_addr: LogicAddr,
) -> bool {
    let max_of = |points: &[LogicAddr]| {
        points
            .iter()
            .filter(|a| !a.is_empty())
            .map(|a| a.0)
            .max()
    };
    let Some(cand_max) = max_of(candidate) else {
        return false;
    };
    if cand_max >= top_addr.0 {
        // Points past the end of the store belong to a discarded run.
        return false;
    }
    match current.and_then(|c| {
        if c.len() > candidate.len() {
            Some(u64::MAX)
        } else {
            max_of(c)
        }
    }) {
        Some(curr_max) => curr_max < cand_max,
        None => true,
    }
}

/// Second pass: replay raw data points for the series that need it.
fn data_pass(
    wal_dir: &Path,
    cstore: &ColumnStore,
    replay_ids: &[ParamId],
    report: &mut RecoveryReport,
) -> Result<(), DbError> {
    let filter: FxHashSet<ParamId> = replay_ids.iter().copied().collect();
    let mut updated: FxHashSet<ParamId> = FxHashSet::default();
    let mut reader = ShardedInputLog::open_data_reader(wal_dir)?;
    while let Some(row) = reader.next_row() {
        let InputLogRecord::DataPoint { timestamp, value } = row.record else {
            continue;
        };
        if !filter.contains(&row.id) {
            continue;
        }
        // Until the first point of a series lands, duplicates of the
        // last persisted value are rejected so the replay does not
        // reinsert it.
        let allow_duplicates = updated.contains(&row.id);
        let sample = Sample::float(row.id, timestamp, value);
        match cstore.recovery_write(&sample, allow_duplicates) {
            Ok(_) => {
                updated.insert(row.id);
                report.replayed_samples += 1;
            }
            Err(StoreError::LateWrite { .. }) => {}
            Err(StoreError::NotFound(_)) => {
                report.lost_samples += 1;
            }
            Err(StoreError::BadValue) => {
                error!(id = row.id, "bad value in the WAL, replay aborted");
                break;
            }
            Err(other) => return Err(other.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescue_freshness_rule() {
        let top = LogicAddr(100);
        let e = LogicAddr::EMPTY;
        // No candidate content: never newer.
        assert!(!is_newer(None, &[e, e], top));
        // Fresh id: accept.
        assert!(is_newer(None, &[LogicAddr(5)], top));
        // Beyond the store's top address: stale run, reject.
        assert!(!is_newer(None, &[LogicAddr(100)], top));
        // Candidate older than current: reject.
        assert!(!is_newer(
            Some(&vec![LogicAddr(50)]),
            &[LogicAddr(10)],
            top
        ));
        // Candidate newer than current: accept.
        assert!(is_newer(
            Some(&vec![LogicAddr(10)]),
            &[LogicAddr(50)],
            top
        ));
        // Longer current vector wins regardless of addresses.
        assert!(!is_newer(
            Some(&vec![LogicAddr(1), LogicAddr(2)]),
            &[LogicAddr(50)],
            top
        ));
    }
}
