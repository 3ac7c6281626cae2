use std::cmp::Reverse;
use std::collections::BinaryHeap;

use nacre_common::{ParamId, PayloadValue, Sample};
use nacre_storage::{
    AggregationFunction, AggregationResult, BoxedAggregateOperator, Direction, SeriesOperator,
};

use crate::error::QueryError;

use super::Materializer;

fn drain_one(
    op: &mut BoxedAggregateOperator,
) -> Result<Option<(u64, AggregationResult)>, QueryError> {
    let mut ts = [0u64; 1];
    let mut val = [AggregationResult::default(); 1];
    let n = op.read(&mut ts, &mut val)?;
    Ok((n > 0).then(|| (ts[0], val[0])))
}

/// Emits one sample per series: the selected aggregation function
/// applied to the series' whole query window.
pub struct AggregateMaterializer {
    inputs: Vec<(ParamId, BoxedAggregateOperator)>,
    func: AggregationFunction,
    pos: usize,
}

impl AggregateMaterializer {
    pub fn new(inputs: Vec<(ParamId, BoxedAggregateOperator)>, func: AggregationFunction) -> Self {
        AggregateMaterializer {
            inputs,
            func,
            pos: 0,
        }
    }
}

impl Materializer for AggregateMaterializer {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let mut produced = 0;
        while produced < limit && self.pos < self.inputs.len() {
            let (id, op) = &mut self.inputs[self.pos];
            if let Some((ts, res)) = drain_one(op)? {
                dest.push(Sample::float(*id, ts, self.func.extract(&res)));
                produced += 1;
            }
            self.pos += 1;
        }
        Ok(produced)
    }
}

/// Groups aggregate operators by destination id (the group-by mapping),
/// combines their results and emits one sample per group.
pub struct AggregateCombiner {
    groups: Vec<(ParamId, Vec<BoxedAggregateOperator>)>,
    func: AggregationFunction,
    pos: usize,
}

impl AggregateCombiner {
    pub fn new(
        groups: Vec<(ParamId, Vec<BoxedAggregateOperator>)>,
        func: AggregationFunction,
    ) -> Self {
        AggregateCombiner {
            groups,
            func,
            pos: 0,
        }
    }
}

impl Materializer for AggregateCombiner {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let mut produced = 0;
        while produced < limit && self.pos < self.groups.len() {
            let (dest_id, ops) = &mut self.groups[self.pos];
            let mut combined = AggregationResult::default();
            for op in ops.iter_mut() {
                if let Some((_, res)) = drain_one(op)? {
                    combined.combine(&res);
                }
            }
            if !combined.is_empty() {
                dest.push(Sample::float(
                    *dest_id,
                    combined.begin,
                    self.func.extract(&combined),
                ));
                produced += 1;
            }
            self.pos += 1;
        }
        Ok(produced)
    }
}

fn bucket_sample(
    id: ParamId,
    anchor: u64,
    res: &AggregationResult,
    funcs: &[AggregationFunction],
) -> Sample {
    let columns: Vec<f64> = funcs.iter().map(|f| f.extract(res)).collect();
    let bitmap = (1u64 << funcs.len()) - 1;
    Sample {
        id,
        timestamp: anchor,
        payload: PayloadValue::Tuple { bitmap, columns },
    }
}

/// Per-series stream of aggregated buckets as tuples of the selected
/// function vector, series after series.
pub struct SeriesOrderGroupAggregate {
    inputs: Vec<(ParamId, BoxedAggregateOperator)>,
    funcs: Vec<AggregationFunction>,
    pos: usize,
}

impl SeriesOrderGroupAggregate {
    pub fn new(
        inputs: Vec<(ParamId, BoxedAggregateOperator)>,
        funcs: Vec<AggregationFunction>,
    ) -> Self {
        SeriesOrderGroupAggregate {
            inputs,
            funcs,
            pos: 0,
        }
    }
}

impl Materializer for SeriesOrderGroupAggregate {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let mut produced = 0;
        while produced < limit && self.pos < self.inputs.len() {
            let funcs = &self.funcs;
            let (id, op) = &mut self.inputs[self.pos];
            match drain_one(op)? {
                Some((anchor, res)) => {
                    dest.push(bucket_sample(*id, anchor, &res, funcs));
                    produced += 1;
                }
                None => self.pos += 1,
            }
        }
        Ok(produced)
    }
}

/// Wraps the per-series bucket streams in a merge-join keyed by the
/// bucket timestamp.
pub struct TimeOrderGroupAggregate {
    inputs: Vec<(ParamId, BoxedAggregateOperator)>,
    funcs: Vec<AggregationFunction>,
    heads: Vec<Option<(u64, AggregationResult)>>,
    heap: BinaryHeap<Reverse<(u64, u64, usize)>>,
    forward: bool,
    started: bool,
}

impl TimeOrderGroupAggregate {
    pub fn new(
        inputs: Vec<(ParamId, BoxedAggregateOperator)>,
        funcs: Vec<AggregationFunction>,
    ) -> Self {
        let forward = inputs
            .first()
            .map(|(_, op)| op.direction() == Direction::Forward)
            .unwrap_or(true);
        let heads = (0..inputs.len()).map(|_| None).collect();
        TimeOrderGroupAggregate {
            inputs,
            funcs,
            heads,
            heap: BinaryHeap::new(),
            forward,
            started: false,
        }
    }

    fn push_input(&mut self, ix: usize) -> Result<(), QueryError> {
        if let Some((anchor, res)) = drain_one(&mut self.inputs[ix].1)? {
            self.heads[ix] = Some((anchor, res));
            let id = self.inputs[ix].0;
            let key = if self.forward {
                (anchor, id, ix)
            } else {
                (!anchor, !id, ix)
            };
            self.heap.push(Reverse(key));
        }
        Ok(())
    }
}

impl Materializer for TimeOrderGroupAggregate {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        if !self.started {
            self.started = true;
            for ix in 0..self.inputs.len() {
                self.push_input(ix)?;
            }
        }
        let mut produced = 0;
        while produced < limit {
            let Some(Reverse((_, _, ix))) = self.heap.pop() else {
                break;
            };
            let Some((anchor, res)) = self.heads[ix].take() else {
                continue;
            };
            dest.push(bucket_sample(self.inputs[ix].0, anchor, &res, &self.funcs));
            produced += 1;
            self.push_input(ix)?;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::column_with;
    use super::*;

    fn series(id: ParamId) -> (std::sync::Arc<dyn nacre_storage::BlockStore>, nacre_storage::nbtree::ExtentsList)
    {
        let points: Vec<(u64, f64)> = (100..200).map(|t| (t, t as f64 * 0.1)).collect();
        column_with(id, &points)
    }

    #[test]
    fn aggregate_emits_one_sum_per_series() {
        let (_s1, col1) = series(1);
        let (_s2, col2) = series(2);
        let inputs = vec![
            (1u64, col1.aggregate(100, 200).expect("aggregate")),
            (2u64, col2.aggregate(100, 200).expect("aggregate")),
        ];
        let mut mat = AggregateMaterializer::new(inputs, AggregationFunction::Sum);
        let mut dest = Vec::new();
        assert_eq!(mat.read(&mut dest, 10).expect("read"), 2);
        for sample in &dest {
            let sum = sample.payload.as_float().expect("float");
            assert!((sum - 1495.0).abs() < 1e-9);
        }
    }

    #[test]
    fn combiner_folds_groups_to_synthetic_ids() {
        let (_s1, col1) = series(1);
        let (_s2, col2) = series(2);
        let (_s3, col3) = series(3);
        let groups = vec![
            (
                100u64,
                vec![
                    col1.aggregate(100, 200).expect("aggregate"),
                    col2.aggregate(100, 200).expect("aggregate"),
                ],
            ),
            (101u64, vec![col3.aggregate(100, 200).expect("aggregate")]),
        ];
        let mut mat = AggregateCombiner::new(groups, AggregationFunction::Sum);
        let mut dest = Vec::new();
        assert_eq!(mat.read(&mut dest, 10).expect("read"), 2);
        assert_eq!(dest[0].id, 100);
        assert!((dest[0].payload.as_float().expect("float") - 2.0 * 1495.0).abs() < 1e-9);
        assert_eq!(dest[1].id, 101);
    }

    #[test]
    fn group_aggregate_tuples_carry_cnt_and_sum() {
        let (_s1, col1) = series(1);
        let inputs = vec![(1u64, col1.group_aggregate(100, 200, 10).expect("ga"))];
        let mut mat = SeriesOrderGroupAggregate::new(
            inputs,
            vec![AggregationFunction::Cnt, AggregationFunction::Sum],
        );
        let mut dest = Vec::new();
        let n = mat.read(&mut dest, 100).expect("read");
        assert_eq!(n, 10);
        assert_eq!(dest[0].timestamp, 100);
        match &dest[0].payload {
            PayloadValue::Tuple { bitmap, columns } => {
                assert_eq!(*bitmap, 0b11);
                assert_eq!(columns[0], 10.0);
                let expected: f64 = (100..110).map(|t| t as f64 * 0.1).sum();
                assert!((columns[1] - expected).abs() < 1e-9);
            }
            other => panic!("expected tuple payload, got {other:?}"),
        }
    }

    #[test]
    fn time_order_group_aggregate_interleaves_buckets() {
        let (_s1, col1) = series(1);
        let (_s2, col2) = series(2);
        let inputs = vec![
            (1u64, col1.group_aggregate(100, 200, 50).expect("ga")),
            (2u64, col2.group_aggregate(100, 200, 50).expect("ga")),
        ];
        let mut mat =
            TimeOrderGroupAggregate::new(inputs, vec![AggregationFunction::Cnt]);
        let mut dest = Vec::new();
        let n = mat.read(&mut dest, 100).expect("read");
        assert_eq!(n, 4);
        let keys: Vec<(u64, u64)> = dest.iter().map(|s| (s.timestamp, s.id)).collect();
        assert_eq!(keys, vec![(100, 1), (100, 2), (150, 1), (150, 2)]);
    }
}
