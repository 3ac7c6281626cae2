use nacre_common::ParamId;
use nacre_storage::{AggregationFunction, ColumnStore, ValueFilter};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::QueryError;
use crate::materialize::{
    AggregateCombiner, AggregateMaterializer, ChainMaterializer, JoinMaterializer, JoinMode,
    Materializer, MergeKey, MergeMaterializer, SeriesOrderGroupAggregate, TimeOrderGroupAggregate,
};
use crate::request::{JoinRow, OrderBy, QueryKind, QueryRequest, TimeRange};

/// Tier-1 half of the plan: which operators to open per series.
#[derive(Debug, Clone)]
enum Prelude {
    Scan { ids: Vec<ParamId> },
    FilterScan { ids: Vec<ParamId>, filter: ValueFilter },
    Aggregate { ids: Vec<ParamId> },
    GroupAggregate { ids: Vec<ParamId>, step: u64 },
}

/// Tier-2 half: how the per-series streams are combined.
#[derive(Debug, Clone)]
enum MatStep {
    Chain,
    MergeTime,
    Aggregate {
        func: AggregationFunction,
    },
    AggregateCombine {
        func: AggregationFunction,
        groups: Vec<(ParamId, Vec<ParamId>)>,
    },
    SeriesOrderGroupAggregate {
        funcs: Vec<AggregationFunction>,
    },
    TimeOrderGroupAggregate {
        funcs: Vec<AggregationFunction>,
    },
    Join {
        rows: Vec<JoinRow>,
        mode: JoinMode,
    },
}

/// Two-step query plan: a processing prelude building tier-1 operators
/// and a materialization step combining them into a sample stream.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    range: TimeRange,
    prelude: Prelude,
    step: MatStep,
}

/// Map a parsed request onto a concrete plan.
pub fn build_query_plan(req: &QueryRequest) -> Result<QueryPlan, QueryError> {
    let backward = req.range.from > req.range.to;
    let mut ids = req.ids.clone();
    if backward {
        // Series-ordered output enumerates series in reverse on
        // backward queries.
        ids.reverse();
    }
    if req.filter.is_some() && !matches!(req.kind, QueryKind::Scan) {
        return Err(QueryError::NotImplemented(
            "value filters apply to scans only",
        ));
    }
    let plan = match &req.kind {
        QueryKind::Scan => {
            let step = match req.order_by {
                OrderBy::Series => MatStep::Chain,
                OrderBy::Time => MatStep::MergeTime,
            };
            let prelude = match &req.filter {
                Some(spec) => Prelude::FilterScan {
                    ids,
                    filter: spec.to_filter()?,
                },
                None => Prelude::Scan { ids },
            };
            QueryPlan {
                range: req.range,
                prelude,
                step,
            }
        }
        QueryKind::Aggregate { func } => {
            let step = match &req.group_map {
                Some(mapping) => MatStep::AggregateCombine {
                    func: *func,
                    groups: group_ids(&ids, mapping, backward),
                },
                None => MatStep::Aggregate { func: *func },
            };
            QueryPlan {
                range: req.range,
                prelude: Prelude::Aggregate { ids },
                step,
            }
        }
        QueryKind::GroupAggregate { funcs, step } => {
            if funcs.is_empty() {
                return Err(QueryError::BadRequest("empty aggregation function list"));
            }
            if *step == 0 {
                return Err(QueryError::BadRequest("zero group-aggregate step"));
            }
            if req.group_map.is_some() {
                return Err(QueryError::NotImplemented(
                    "group-by combined with group-aggregate",
                ));
            }
            let mat = match req.order_by {
                OrderBy::Series => MatStep::SeriesOrderGroupAggregate {
                    funcs: funcs.clone(),
                },
                OrderBy::Time => MatStep::TimeOrderGroupAggregate {
                    funcs: funcs.clone(),
                },
            };
            QueryPlan {
                range: req.range,
                prelude: Prelude::GroupAggregate { ids, step: *step },
                step: mat,
            }
        }
        QueryKind::Join { rows } => {
            if rows.is_empty() {
                return Err(QueryError::BadRequest("join without rows"));
            }
            let width = rows[0].columns.len();
            if width == 0 || rows.iter().any(|r| r.columns.len() != width) {
                return Err(QueryError::BadRequest("ragged join rows"));
            }
            let mut rows = rows.clone();
            let mode = match req.order_by {
                OrderBy::Series => {
                    if backward {
                        rows.reverse();
                    }
                    JoinMode::Concat
                }
                OrderBy::Time => JoinMode::MergeJoin,
            };
            let ids = rows.iter().flat_map(|r| r.columns.clone()).collect();
            QueryPlan {
                range: req.range,
                prelude: Prelude::Scan { ids },
                step: MatStep::Join { rows, mode },
            }
        }
    };
    debug!(?plan, "query plan built");
    Ok(plan)
}

/// Group raw ids by their synthetic destination, preserving id order.
fn group_ids(
    ids: &[ParamId],
    mapping: &FxHashMap<ParamId, ParamId>,
    backward: bool,
) -> Vec<(ParamId, Vec<ParamId>)> {
    let mut order: Vec<ParamId> = Vec::new();
    let mut groups: FxHashMap<ParamId, Vec<ParamId>> = FxHashMap::default();
    for id in ids {
        let dest = mapping.get(id).copied().unwrap_or(*id);
        let members = groups.entry(dest).or_default();
        if members.is_empty() {
            order.push(dest);
        }
        members.push(*id);
    }
    order.sort_unstable();
    if backward {
        order.reverse();
    }
    order
        .into_iter()
        .filter_map(|dest| groups.remove(&dest).map(|members| (dest, members)))
        .collect()
}

/// Open the tier-1 operators and assemble the materializer.
pub fn execute_query_plan(
    plan: &QueryPlan,
    cstore: &ColumnStore,
) -> Result<Box<dyn Materializer>, QueryError> {
    let (from, to) = (plan.range.from, plan.range.to);
    let mat: Box<dyn Materializer> = match (&plan.prelude, &plan.step) {
        (Prelude::Scan { ids }, MatStep::Chain) => {
            let ops = cstore.scan(ids, from, to)?;
            Box::new(ChainMaterializer::new(ids.iter().copied().zip(ops).collect()))
        }
        (Prelude::Scan { ids }, MatStep::MergeTime) => {
            let ops = cstore.scan(ids, from, to)?;
            Box::new(MergeMaterializer::new(
                ids.iter().copied().zip(ops).collect(),
                MergeKey::Time,
            ))
        }
        (Prelude::FilterScan { ids, filter }, MatStep::Chain) => {
            let ops = cstore.filter_scan(ids, from, to, filter)?;
            Box::new(ChainMaterializer::new(ids.iter().copied().zip(ops).collect()))
        }
        (Prelude::FilterScan { ids, filter }, MatStep::MergeTime) => {
            let ops = cstore.filter_scan(ids, from, to, filter)?;
            Box::new(MergeMaterializer::new(
                ids.iter().copied().zip(ops).collect(),
                MergeKey::Time,
            ))
        }
        (Prelude::Aggregate { ids }, MatStep::Aggregate { func }) => {
            let ops = cstore.aggregate(ids, from, to)?;
            Box::new(AggregateMaterializer::new(
                ids.iter().copied().zip(ops).collect(),
                *func,
            ))
        }
        (Prelude::Aggregate { .. }, MatStep::AggregateCombine { func, groups }) => {
            let mut built = Vec::with_capacity(groups.len());
            for (dest, members) in groups {
                built.push((*dest, cstore.aggregate(members, from, to)?));
            }
            Box::new(AggregateCombiner::new(built, *func))
        }
        (
            Prelude::GroupAggregate { ids, step },
            MatStep::SeriesOrderGroupAggregate { funcs },
        ) => {
            let ops = cstore.group_aggregate(ids, from, to, *step)?;
            Box::new(SeriesOrderGroupAggregate::new(
                ids.iter().copied().zip(ops).collect(),
                funcs.clone(),
            ))
        }
        (
            Prelude::GroupAggregate { ids, step },
            MatStep::TimeOrderGroupAggregate { funcs },
        ) => {
            let ops = cstore.group_aggregate(ids, from, to, *step)?;
            Box::new(TimeOrderGroupAggregate::new(
                ids.iter().copied().zip(ops).collect(),
                funcs.clone(),
            ))
        }
        (Prelude::Scan { .. }, MatStep::Join { rows, mode }) => {
            let mut built = Vec::with_capacity(rows.len());
            for row in rows {
                built.push((row.dest_id, cstore.scan(&row.columns, from, to)?));
            }
            Box::new(JoinMaterializer::new(built, *mode))
        }
        _ => return Err(QueryError::BadRequest("incoherent plan")),
    };
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FilterSpec;

    #[test]
    fn scan_order_by_picks_materializer() {
        let req = QueryRequest::scan(vec![1, 2], TimeRange { from: 0, to: 10 }, OrderBy::Series);
        let plan = build_query_plan(&req).expect("plan");
        assert!(matches!(plan.step, MatStep::Chain));

        let req = QueryRequest::scan(vec![1, 2], TimeRange { from: 0, to: 10 }, OrderBy::Time);
        let plan = build_query_plan(&req).expect("plan");
        assert!(matches!(plan.step, MatStep::MergeTime));
    }

    #[test]
    fn backward_series_scan_reverses_ids() {
        let req = QueryRequest::scan(vec![1, 2, 3], TimeRange { from: 10, to: 0 }, OrderBy::Series);
        let plan = build_query_plan(&req).expect("plan");
        match &plan.prelude {
            Prelude::Scan { ids } => assert_eq!(ids, &[3, 2, 1]),
            other => panic!("unexpected prelude {other:?}"),
        }
    }

    #[test]
    fn group_map_produces_combiner_groups() {
        let mut req = QueryRequest::scan(
            vec![10, 11, 12, 13],
            TimeRange { from: 0, to: 10 },
            OrderBy::Series,
        );
        req.kind = QueryKind::Aggregate {
            func: AggregationFunction::Sum,
        };
        let mut mapping = FxHashMap::default();
        mapping.insert(10u64, 100u64);
        mapping.insert(11, 100);
        mapping.insert(12, 101);
        mapping.insert(13, 101);
        req.group_map = Some(mapping);
        let plan = build_query_plan(&req).expect("plan");
        match &plan.step {
            MatStep::AggregateCombine { groups, .. } => {
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0], (100, vec![10, 11]));
                assert_eq!(groups[1], (101, vec![12, 13]));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn filters_are_scan_only() {
        let mut req = QueryRequest::scan(vec![1], TimeRange { from: 0, to: 10 }, OrderBy::Series);
        req.kind = QueryKind::Aggregate {
            func: AggregationFunction::Min,
        };
        req.filter = Some(FilterSpec {
            gt: Some(0.0),
            ..FilterSpec::default()
        });
        assert!(matches!(
            build_query_plan(&req),
            Err(QueryError::NotImplemented(_))
        ));
    }

    #[test]
    fn ragged_join_rows_are_rejected() {
        let mut req = QueryRequest::scan(vec![], TimeRange { from: 0, to: 10 }, OrderBy::Series);
        req.kind = QueryKind::Join {
            rows: vec![
                JoinRow {
                    dest_id: 1,
                    columns: vec![1, 2],
                },
                JoinRow {
                    dest_id: 2,
                    columns: vec![3],
                },
            ],
        };
        assert!(matches!(
            build_query_plan(&req),
            Err(QueryError::BadRequest(_))
        ));
    }
}
