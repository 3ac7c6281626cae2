//! End-to-end operator/materializer scenarios: ten series of one
//! hundred points each, exercised through the query plan builder.

use nacre_common::{ParamId, PayloadValue, Sample};
use nacre_query::{
    build_query_plan, execute_query_plan, FilterSpec, JoinRow, OrderBy, QueryKind, QueryRequest,
    TimeRange,
};
use nacre_storage::{AggregationFunction, ColumnStore, MemStore};
use rustc_hash::FxHashMap;
use std::sync::Arc;

const IDS: std::ops::Range<u64> = 10..20;

/// `series_i` for i in 10..20, timestamps 100..200, value = ts * 0.1.
fn fixture() -> Arc<ColumnStore> {
    let cstore = ColumnStore::new(MemStore::new());
    let mut rescue = Vec::new();
    for id in IDS {
        cstore.create_new_column(id).expect("create");
    }
    for ts in 100..200u64 {
        for id in IDS {
            cstore
                .write(&Sample::float(id, ts, ts as f64 * 0.1), &mut rescue, None)
                .expect("write");
        }
    }
    cstore
}

fn run(cstore: &ColumnStore, req: &QueryRequest) -> Vec<Sample> {
    let plan = build_query_plan(req).expect("plan");
    let mut mat = execute_query_plan(&plan, cstore).expect("execute");
    let mut out = Vec::new();
    loop {
        let n = mat.read(&mut out, 4096).expect("read");
        if n == 0 {
            break;
        }
    }
    out
}

#[test]
fn scan_ten_series_by_series_order() {
    let cstore = fixture();
    let req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 1000);
    for (ix, sample) in out.iter().enumerate() {
        let expected_id = 10 + (ix / 100) as u64;
        let expected_ts = 100 + (ix % 100) as u64;
        assert_eq!(sample.id, expected_id);
        assert_eq!(sample.timestamp, expected_ts);
        let x = sample.payload.as_float().expect("float");
        assert!((x - expected_ts as f64 * 0.1).abs() < 1e-9);
    }
}

#[test]
fn reverse_scan_descends_ids_and_timestamps() {
    let cstore = fixture();
    let req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 200, to: 99 },
        OrderBy::Series,
    );
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 1000);
    for (ix, sample) in out.iter().enumerate() {
        let expected_id = 19 - (ix / 100) as u64;
        let expected_ts = 199 - (ix % 100) as u64;
        assert_eq!(sample.id, expected_id);
        assert_eq!(sample.timestamp, expected_ts);
    }
}

#[test]
fn scan_time_order_interleaves_all_series() {
    let cstore = fixture();
    let req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Time,
    );
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 1000);
    for (ix, sample) in out.iter().enumerate() {
        let expected_ts = 100 + (ix / 10) as u64;
        let expected_id = 10 + (ix % 10) as u64;
        assert_eq!((sample.timestamp, sample.id), (expected_ts, expected_id));
    }
}

#[test]
fn aggregate_sum_per_series() {
    let cstore = fixture();
    let mut req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    req.kind = QueryKind::Aggregate {
        func: AggregationFunction::Sum,
    };
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 10);
    for sample in &out {
        let sum = sample.payload.as_float().expect("float");
        assert!((sum - 1495.0).abs() < 1e-9, "sum was {sum}");
    }
}

#[test]
fn group_by_aggregate_sum_combines_series() {
    let cstore = fixture();
    let mut req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    req.kind = QueryKind::Aggregate {
        func: AggregationFunction::Sum,
    };
    // group = 0 for i < 15, 1 otherwise; the matcher assigned ids 1000
    // and 1001 to the two synthetic series.
    let mut mapping: FxHashMap<ParamId, ParamId> = FxHashMap::default();
    for id in IDS {
        mapping.insert(id, if id < 15 { 1000 } else { 1001 });
    }
    req.group_map = Some(mapping);
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].id, 1000);
    assert_eq!(out[1].id, 1001);
    for sample in &out {
        let sum = sample.payload.as_float().expect("float");
        assert!((sum - 5.0 * 1495.0).abs() < 1e-9, "sum was {sum}");
    }
}

#[test]
fn group_aggregate_step_ten_buckets() {
    let cstore = fixture();
    let mut req = QueryRequest::scan(
        IDS.collect(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    req.kind = QueryKind::GroupAggregate {
        funcs: vec![AggregationFunction::Cnt, AggregationFunction::Sum],
        step: 10,
    };
    let out = run(&cstore, &req);
    // 10 buckets for each of the 10 series.
    assert_eq!(out.len(), 100);
    let first = &out[0];
    assert_eq!(first.id, 10);
    assert_eq!(first.timestamp, 100);
    match &first.payload {
        PayloadValue::Tuple { bitmap, columns } => {
            assert_eq!(*bitmap, 0b11);
            assert_eq!(columns[0], 10.0);
            let expected: f64 = (100..110).map(|t| t as f64 * 0.1).sum();
            assert!((columns[1] - expected).abs() < 1e-9);
        }
        other => panic!("expected tuple, got {other:?}"),
    }
    // Per series, the bucket counts add up to the raw point count.
    let mut per_series: FxHashMap<ParamId, f64> = FxHashMap::default();
    for sample in &out {
        let PayloadValue::Tuple { columns, .. } = &sample.payload else {
            panic!("expected tuple");
        };
        *per_series.entry(sample.id).or_default() += columns[0];
    }
    for (_, cnt) in per_series {
        assert_eq!(cnt, 100.0);
    }
}

#[test]
fn join_two_series_with_identical_timestamps() {
    let cstore = fixture();
    let mut req = QueryRequest::scan(
        Vec::new(),
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    req.kind = QueryKind::Join {
        rows: vec![JoinRow {
            dest_id: 10,
            columns: vec![10, 11],
        }],
    };
    let out = run(&cstore, &req);
    assert_eq!(out.len(), 100);
    for (ix, sample) in out.iter().enumerate() {
        assert_eq!(sample.timestamp, 100 + ix as u64);
        match &sample.payload {
            PayloadValue::Tuple { bitmap, columns } => {
                assert_eq!(*bitmap, 0b11);
                assert_eq!(columns[0], columns[1]);
            }
            other => panic!("expected tuple, got {other:?}"),
        }
    }
}

#[test]
fn filtered_scan_returns_exactly_matching_points() {
    let cstore = fixture();
    let mut req = QueryRequest::scan(
        vec![10],
        TimeRange { from: 100, to: 200 },
        OrderBy::Series,
    );
    req.filter = Some(FilterSpec {
        ge: Some(15.0),
        lt: Some(18.0),
        ..FilterSpec::default()
    });
    let out = run(&cstore, &req);
    // value = ts * 0.1, so 15.0 <= x < 18.0 covers ts in [150, 180).
    assert_eq!(out.len(), 30);
    for sample in &out {
        let x = sample.payload.as_float().expect("float");
        assert!((15.0..18.0).contains(&x));
    }
    assert_eq!(out[0].timestamp, 150);
    assert_eq!(out[29].timestamp, 179);
}
