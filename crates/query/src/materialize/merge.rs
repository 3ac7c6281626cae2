use std::cmp::Reverse;
use std::collections::BinaryHeap;

use nacre_common::{ParamId, Sample};
use nacre_storage::{BoxedOperator, Direction, SeriesOperator};

use crate::error::QueryError;

use super::{Materializer, OP_BATCH};

/// Primary sort key of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKey {
    /// `(timestamp, id)`: interleave series by time.
    Time,
    /// `(id, timestamp)`: group by series, ordered inside each group.
    Series,
}

struct MergeInput {
    id: ParamId,
    op: BoxedOperator,
    ts: Vec<u64>,
    xs: Vec<f64>,
    pos: usize,
}

impl MergeInput {
    fn refill(&mut self) -> Result<bool, QueryError> {
        self.ts.resize(OP_BATCH, 0);
        self.xs.resize(OP_BATCH, 0.0);
        let n = self.op.read(&mut self.ts, &mut self.xs)?;
        self.ts.truncate(n);
        self.xs.truncate(n);
        self.pos = 0;
        Ok(n > 0)
    }

    fn head(&self) -> Option<(u64, f64)> {
        (self.pos < self.ts.len()).then(|| (self.ts[self.pos], self.xs[self.pos]))
    }
}

/// K-way heap merge of per-series operators.
///
/// Backward merges reuse the ascending heap by bit-inverting the key
/// components, which flips the order exactly. Ties break on the input
/// index, keeping the merge stable.
pub struct MergeMaterializer {
    inputs: Vec<MergeInput>,
    heap: BinaryHeap<Reverse<(u64, u64, usize)>>,
    key: MergeKey,
    forward: bool,
    started: bool,
}

impl MergeMaterializer {
    pub fn new(inputs: Vec<(ParamId, BoxedOperator)>, key: MergeKey) -> Self {
        let forward = inputs
            .first()
            .map(|(_, op)| op.direction() == Direction::Forward)
            .unwrap_or(true);
        MergeMaterializer {
            inputs: inputs
                .into_iter()
                .map(|(id, op)| MergeInput {
                    id,
                    op,
                    ts: Vec::new(),
                    xs: Vec::new(),
                    pos: 0,
                })
                .collect(),
            heap: BinaryHeap::new(),
            key,
            forward,
            started: false,
        }
    }

    fn heap_key(&self, ix: usize, ts: u64) -> (u64, u64, usize) {
        let id = self.inputs[ix].id;
        let (a, b) = if self.forward { (ts, id) } else { (!ts, !id) };
        match self.key {
            MergeKey::Time => (a, b, ix),
            MergeKey::Series => (b, a, ix),
        }
    }

    fn push_input(&mut self, ix: usize) -> Result<(), QueryError> {
        if self.inputs[ix].head().is_none() && !self.inputs[ix].refill()? {
            return Ok(());
        }
        if let Some((ts, _)) = self.inputs[ix].head() {
            let key = self.heap_key(ix, ts);
            self.heap.push(Reverse(key));
        }
        Ok(())
    }
}

impl Materializer for MergeMaterializer {
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
            let input = &mut self.inputs[ix];
            let Some((ts, x)) = input.head() else {
                continue;
            };
            dest.push(Sample::float(input.id, ts, x));
            produced += 1;
            input.pos += 1;
            self.push_input(ix)?;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::column_with;
    use super::*;

    fn merged(key: MergeKey, backward: bool) -> Vec<Sample> {
        let (b, e) = if backward { (100, 0) } else { (0, 100) };
        let (_s1, col1) = column_with(1, &[(10, 1.0), (30, 1.3)]);
        let (_s2, col2) = column_with(2, &[(20, 2.0), (30, 2.3)]);
        let inputs = vec![
            (1u64, col1.search(b, e).expect("search")),
            (2u64, col2.search(b, e).expect("search")),
        ];
        let mut merge = MergeMaterializer::new(inputs, key);
        let mut dest = Vec::new();
        merge.read(&mut dest, 100).expect("read");
        dest
    }

    #[test]
    fn time_order_interleaves_by_timestamp() {
        let out = merged(MergeKey::Time, false);
        let keys: Vec<(u64, u64)> = out.iter().map(|s| (s.timestamp, s.id)).collect();
        assert_eq!(keys, vec![(10, 1), (20, 2), (30, 1), (30, 2)]);
    }

    #[test]
    fn series_order_groups_by_id() {
        let out = merged(MergeKey::Series, false);
        let keys: Vec<(u64, u64)> = out.iter().map(|s| (s.id, s.timestamp)).collect();
        assert_eq!(keys, vec![(1, 10), (1, 30), (2, 20), (2, 30)]);
    }

    #[test]
    fn backward_time_order_descends() {
        let out = merged(MergeKey::Time, true);
        let keys: Vec<(u64, u64)> = out.iter().map(|s| (s.timestamp, s.id)).collect();
        assert_eq!(keys, vec![(30, 2), (30, 1), (20, 2), (10, 1)]);
    }

    #[test]
    fn backward_series_order_descends_ids() {
        let out = merged(MergeKey::Series, true);
        let keys: Vec<(u64, u64)> = out.iter().map(|s| (s.id, s.timestamp)).collect();
        assert_eq!(keys, vec![(2, 30), (2, 20), (1, 30), (1, 10)]);
    }
}
