use std::sync::Arc;

use nacre_common::Timestamp;

use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::def::{NodeType, SubtreeRef};
use crate::nbtree::leaf::LeafView;
use crate::nbtree::superblock::Superblock;

use super::scan::{in_range, ChildBuilder, SBlockIteratorBase};
use super::{AggregationResult, BoxedAggregateOperator, Direction, SeriesOperator};

/// Anchor timestamp of the `step`-wide bucket containing `ts`.
///
/// Buckets are anchored at the query `begin`; for backward queries they
/// extend downwards from it.
fn bucket_anchor(ts: Timestamp, begin: Timestamp, step: u64, direction: Direction) -> Timestamp {
    match direction {
        Direction::Forward => begin + (ts - begin) / step * step,
        Direction::Backward => begin - (begin - ts) / step * step,
    }
}

/// Group-aggregation over one decoded leaf: partitions the in-range
/// points into buckets and yields `(anchor, result)` pairs in direction
/// order. The aggregation result keeps the true data boundaries; the
/// anchor is carried as the operator timestamp so that neighbouring
/// leaves sharing a bucket can be merged downstream.
pub struct LeafGroupAggregator {
    buckets: Vec<(Timestamp, AggregationResult)>,
    pos: usize,
    direction: Direction,
}

impl LeafGroupAggregator {
    pub fn from_points(
        ts: Vec<Timestamp>,
        xs: Vec<f64>,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Self {
        let direction = Direction::of(begin, end);
        let mut buckets: Vec<(Timestamp, AggregationResult)> = Vec::new();
        let indexes: Vec<usize> = match direction {
            Direction::Forward => (0..ts.len()).collect(),
            Direction::Backward => (0..ts.len()).rev().collect(),
        };
        for ix in indexes {
            let t = ts[ix];
            if !in_range(t, begin, end) {
                continue;
            }
            let anchor = bucket_anchor(t, begin, step, direction);
            match buckets.last_mut() {
                Some((a, res)) if *a == anchor => res.add(t, xs[ix]),
                _ => {
                    let mut res = AggregationResult::default();
                    res.add(t, xs[ix]);
                    buckets.push((anchor, res));
                }
            }
        }
        LeafGroupAggregator {
            buckets,
            pos: 0,
            direction,
        }
    }

    pub fn from_view(
        view: &LeafView,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<Self, StoreError> {
        let direction = Direction::of(begin, end);
        let header = view.header();
        let covered = in_range(header.begin, begin, end) && in_range(header.end, begin, end);
        let single_bucket = covered
            && bucket_anchor(header.begin, begin, step, direction)
                == bucket_anchor(header.end, begin, step, direction);
        if single_bucket {
            // Whole leaf falls into one bucket: answer from the header.
            let anchor = bucket_anchor(header.begin, begin, step, direction);
            return Ok(LeafGroupAggregator {
                buckets: vec![(anchor, AggregationResult::from_ref(header))],
                pos: 0,
                direction,
            });
        }
        let (ts, xs) = view.read_all()?;
        Ok(Self::from_points(ts, xs, begin, end, step))
    }
}

impl SeriesOperator<AggregationResult> for LeafGroupAggregator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        let want = dest_ts.len().min(dest_val.len());
        let left = self.buckets.len() - self.pos;
        let n = want.min(left);
        for ix in 0..n {
            let (anchor, res) = self.buckets[self.pos + ix];
            dest_ts[ix] = anchor;
            dest_val[ix] = res;
        }
        self.pos += n;
        Ok(n)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

/// Emits one precomputed `(anchor, result)` pair; fast path for
/// subtrees confined to a single bucket.
struct SingleBucket {
    pair: Option<(Timestamp, AggregationResult)>,
    direction: Direction,
}

impl SeriesOperator<AggregationResult> for SingleBucket {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        if dest_ts.is_empty() || dest_val.is_empty() {
            return Ok(0);
        }
        match self.pair.take() {
            Some((anchor, res)) => {
                dest_ts[0] = anchor;
                dest_val[0] = res;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

/// Group-aggregation over a superblock subtree. Emits raw per-child
/// bucket streams in direction order; bucket fragments that span child
/// boundaries are merged by the enclosing [`GroupAggConcat`].
pub struct SBlockGroupAggregator {
    inner: SBlockIteratorBase<AggregationResult>,
}

impl SBlockGroupAggregator {
    pub fn from_refs(
        store: Arc<dyn BlockStore>,
        refs: Vec<SubtreeRef>,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Self {
        let make_child: ChildBuilder<AggregationResult> = Box::new(move |store, sref| {
            let direction = Direction::of(begin, end);
            let covered = in_range(sref.begin, begin, end) && in_range(sref.end, begin, end);
            let single_bucket = covered
                && bucket_anchor(sref.begin, begin, step, direction)
                    == bucket_anchor(sref.end, begin, step, direction);
            let child: BoxedAggregateOperator = if single_bucket {
                let anchor = bucket_anchor(sref.begin, begin, step, direction);
                Box::new(SingleBucket {
                    pair: Some((anchor, AggregationResult::from_ref(sref))),
                    direction,
                })
            } else {
                match sref.node_type {
                    NodeType::Leaf => {
                        let view = LeafView::load(store, sref.addr)?;
                        Box::new(LeafGroupAggregator::from_view(&view, begin, end, step)?)
                    }
                    NodeType::Inner => {
                        let node = Superblock::load(store, sref.addr)?;
                        Box::new(SBlockGroupAggregator::from_refs(
                            Arc::clone(store),
                            node.refs().to_vec(),
                            begin,
                            end,
                            step,
                        ))
                    }
                }
            };
            Ok(Some(child))
        });
        SBlockGroupAggregator {
            inner: SBlockIteratorBase::new(store, refs, begin, end, make_child),
        }
    }
}

impl SeriesOperator<AggregationResult> for SBlockGroupAggregator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        self.inner.read(dest_ts, dest_val)
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }
}

/// Concatenates bucket streams, merging adjacent results that share a
/// bucket anchor: the read-ahead withholds the latest bucket until the
/// next source confirms the boundary.
pub struct GroupAggConcat {
    iters: Vec<BoxedAggregateOperator>,
    pos: usize,
    pending: Option<(Timestamp, AggregationResult)>,
    direction: Direction,
}

impl GroupAggConcat {
    pub fn new(iters: Vec<BoxedAggregateOperator>, direction: Direction) -> Self {
        GroupAggConcat {
            iters,
            pos: 0,
            pending: None,
            direction,
        }
    }

    fn next_inner(
        &mut self,
    ) -> Result<Option<(Timestamp, AggregationResult)>, StoreError> {
        let mut ts = [0u64; 1];
        let mut val = [AggregationResult::default(); 1];
        while self.pos < self.iters.len() {
            let produced = self.iters[self.pos].read(&mut ts, &mut val)?;
            if produced > 0 {
                return Ok(Some((ts[0], val[0])));
            }
            self.pos += 1;
        }
        Ok(None)
    }
}

impl SeriesOperator<AggregationResult> for GroupAggConcat {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        let want = dest_ts.len().min(dest_val.len());
        let mut produced = 0;
        while produced < want {
            match self.next_inner()? {
                Some((anchor, res)) => match &mut self.pending {
                    Some((held_anchor, held)) if *held_anchor == anchor => {
                        held.combine(&res);
                    }
                    Some(_) => {
                        if let Some((out_anchor, out)) = self.pending.replace((anchor, res)) {
                            dest_ts[produced] = out_anchor;
                            dest_val[produced] = out;
                            produced += 1;
                        }
                    }
                    None => {
                        self.pending = Some((anchor, res));
                    }
                },
                None => {
                    if let Some((out_anchor, out)) = self.pending.take() {
                        dest_ts[produced] = out_anchor;
                        dest_val[produced] = out;
                        produced += 1;
                    }
                    break;
                }
            }
        }
        Ok(produced)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}
