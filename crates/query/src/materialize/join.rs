use nacre_common::{ParamId, PayloadValue, Sample};
use nacre_storage::{BoxedOperator, Direction, SeriesOperator};

use crate::error::QueryError;

use super::{Materializer, OP_BATCH};

/// Buffered cursor over one joined column.
struct ColumnCursor {
    op: BoxedOperator,
    ts: Vec<u64>,
    xs: Vec<f64>,
    pos: usize,
    done: bool,
}

impl ColumnCursor {
    fn new(op: BoxedOperator) -> Self {
        ColumnCursor {
            op,
            ts: Vec::new(),
            xs: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn peek(&mut self) -> Result<Option<(u64, f64)>, QueryError> {
        if self.pos >= self.ts.len() && !self.done {
            self.ts.resize(OP_BATCH, 0);
            self.xs.resize(OP_BATCH, 0.0);
            let n = self.op.read(&mut self.ts, &mut self.xs)?;
            self.ts.truncate(n);
            self.xs.truncate(n);
            self.pos = 0;
            self.done = n == 0;
        }
        Ok((self.pos < self.ts.len()).then(|| (self.ts[self.pos], self.xs[self.pos])))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// One join row: `c` column operators sharing a timeline. Produces one
/// tuple per distinct timestamp, with bitmap bit `i` set iff column `i`
/// has a sample at that timestamp.
struct RowJoin {
    dest_id: ParamId,
    columns: Vec<ColumnCursor>,
    forward: bool,
}

impl RowJoin {
    fn new(dest_id: ParamId, ops: Vec<BoxedOperator>) -> Self {
        let forward = ops
            .first()
            .map(|op| op.direction() == Direction::Forward)
            .unwrap_or(true);
        RowJoin {
            dest_id,
            columns: ops.into_iter().map(ColumnCursor::new).collect(),
            forward,
        }
    }

    /// Timestamp of the next tuple, if any.
    fn peek_ts(&mut self) -> Result<Option<u64>, QueryError> {
        let mut best: Option<u64> = None;
        for column in &mut self.columns {
            if let Some((ts, _)) = column.peek()? {
                best = Some(match best {
                    None => ts,
                    Some(b) if self.forward => b.min(ts),
                    Some(b) => b.max(ts),
                });
            }
        }
        Ok(best)
    }

    fn next_tuple(&mut self) -> Result<Option<Sample>, QueryError> {
        let Some(ts) = self.peek_ts()? else {
            return Ok(None);
        };
        let mut bitmap = 0u64;
        let mut columns = Vec::new();
        for (ix, column) in self.columns.iter_mut().enumerate() {
            if let Some((cts, x)) = column.peek()? {
                if cts == ts {
                    bitmap |= 1 << ix;
                    columns.push(x);
                    column.advance();
                }
            }
        }
        Ok(Some(Sample {
            id: self.dest_id,
            timestamp: ts,
            payload: PayloadValue::Tuple { bitmap, columns },
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Row by row, in series order.
    Concat,
    /// Tuples ordered by timestamp across all rows.
    MergeJoin,
}

/// Join materializer over `n` rows of `c` columns each.
pub struct JoinMaterializer {
    rows: Vec<RowJoin>,
    mode: JoinMode,
    pos: usize,
}

impl JoinMaterializer {
    pub fn new(rows: Vec<(ParamId, Vec<BoxedOperator>)>, mode: JoinMode) -> Self {
        JoinMaterializer {
            rows: rows
                .into_iter()
                .map(|(dest_id, ops)| RowJoin::new(dest_id, ops))
                .collect(),
            mode,
            pos: 0,
        }
    }

    fn read_concat(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let mut produced = 0;
        while produced < limit && self.pos < self.rows.len() {
            match self.rows[self.pos].next_tuple()? {
                Some(sample) => {
                    dest.push(sample);
                    produced += 1;
                }
                None => self.pos += 1,
            }
        }
        Ok(produced)
    }

    fn read_merge(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let forward = self.rows.first().map(|r| r.forward).unwrap_or(true);
        let mut produced = 0;
        while produced < limit {
            // Row count is small; a linear scan beats maintaining a heap
            // over peeked tuples.
            let mut best: Option<(u64, usize)> = None;
            for ix in 0..self.rows.len() {
                if let Some(ts) = self.rows[ix].peek_ts()? {
                    best = Some(match best {
                        None => (ts, ix),
                        Some((bts, bix)) => {
                            let take = if forward { ts < bts } else { ts > bts };
                            if take {
                                (ts, ix)
                            } else {
                                (bts, bix)
                            }
                        }
                    });
                }
            }
            let Some((_, ix)) = best else {
                break;
            };
            if let Some(sample) = self.rows[ix].next_tuple()? {
                dest.push(sample);
                produced += 1;
            }
        }
        Ok(produced)
    }
}

impl Materializer for JoinMaterializer {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        match self.mode {
            JoinMode::Concat => self.read_concat(dest, limit),
            JoinMode::MergeJoin => self.read_merge(dest, limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::column_with;
    use super::*;

    #[test]
    fn join_pairs_columns_with_identical_timestamps() {
        let points: Vec<(u64, f64)> = (0..10).map(|t| (t, t as f64)).collect();
        let (_s1, col1) = column_with(1, &points);
        let (_s2, col2) = column_with(2, &points);
        let ops = vec![
            col1.search(0, 100).expect("search"),
            col2.search(0, 100).expect("search"),
        ];
        let mut join = JoinMaterializer::new(vec![(1, ops)], JoinMode::Concat);
        let mut dest = Vec::new();
        let n = join.read(&mut dest, 100).expect("read");
        assert_eq!(n, 10);
        for (ix, sample) in dest.iter().enumerate() {
            match &sample.payload {
                PayloadValue::Tuple { bitmap, columns } => {
                    assert_eq!(*bitmap, 0b11);
                    assert_eq!(columns.len(), 2);
                    assert_eq!(columns[0], ix as f64);
                    assert_eq!(columns[0], columns[1]);
                }
                other => panic!("expected tuple, got {other:?}"),
            }
        }
    }

    #[test]
    fn join_sets_bitmap_for_missing_columns() {
        let (_s1, col1) = column_with(1, &[(0, 1.0), (2, 1.2)]);
        let (_s2, col2) = column_with(2, &[(0, 2.0), (1, 2.1)]);
        let ops = vec![
            col1.search(0, 100).expect("search"),
            col2.search(0, 100).expect("search"),
        ];
        let mut join = JoinMaterializer::new(vec![(9, ops)], JoinMode::Concat);
        let mut dest = Vec::new();
        join.read(&mut dest, 100).expect("read");
        let bitmaps: Vec<u64> = dest
            .iter()
            .map(|s| match &s.payload {
                PayloadValue::Tuple { bitmap, .. } => *bitmap,
                _ => panic!("expected tuple"),
            })
            .collect();
        assert_eq!(bitmaps, vec![0b11, 0b10, 0b01]);
        assert_eq!(dest[1].timestamp, 1);
    }

    #[test]
    fn merge_join_orders_tuples_by_time_across_rows() {
        let (_s1, col1) = column_with(1, &[(0, 1.0), (10, 1.1)]);
        let (_s2, col2) = column_with(2, &[(5, 2.0), (15, 2.1)]);
        let rows = vec![
            (1u64, vec![col1.search(0, 100).expect("search")]),
            (2u64, vec![col2.search(0, 100).expect("search")]),
        ];
        let mut join = JoinMaterializer::new(rows, JoinMode::MergeJoin);
        let mut dest = Vec::new();
        join.read(&mut dest, 100).expect("read");
        let ts: Vec<u64> = dest.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![0, 5, 10, 15]);
    }
}
