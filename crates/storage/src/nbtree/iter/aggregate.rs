use std::sync::Arc;

use nacre_common::Timestamp;

use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::def::{NodeType, SubtreeRef};
use crate::nbtree::leaf::LeafView;
use crate::nbtree::superblock::Superblock;

use super::scan::{in_range, ChildBuilder, SBlockIteratorBase};
use super::{AggregationResult, BoxedAggregateOperator, Direction, SeriesOperator};

/// One-shot aggregation over a single leaf.
///
/// When the leaf lies entirely inside the query range the precomputed
/// header is used; otherwise the stream is decoded and folded.
pub struct LeafAggregator {
    result: Option<AggregationResult>,
    direction: Direction,
}

impl LeafAggregator {
    pub fn from_points(
        ts: Vec<Timestamp>,
        xs: Vec<f64>,
        begin: Timestamp,
        end: Timestamp,
    ) -> Self {
        let mut result = AggregationResult::default();
        for (ix, t) in ts.iter().enumerate() {
            if in_range(*t, begin, end) {
                result.add(*t, xs[ix]);
            }
        }
        LeafAggregator {
            result: (!result.is_empty()).then_some(result),
            direction: Direction::of(begin, end),
        }
    }

    pub fn from_view(
        view: &LeafView,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Self, StoreError> {
        let header = view.header();
        let covered = in_range(header.begin, begin, end) && in_range(header.end, begin, end);
        if covered {
            Ok(LeafAggregator {
                result: Some(AggregationResult::from_ref(header)),
                direction: Direction::of(begin, end),
            })
        } else {
            let (ts, xs) = view.read_all()?;
            Ok(Self::from_points(ts, xs, begin, end))
        }
    }
}

impl SeriesOperator<AggregationResult> for LeafAggregator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        if dest_ts.is_empty() || dest_val.is_empty() {
            return Ok(0);
        }
        match self.result.take() {
            Some(result) => {
                dest_ts[0] = result.begin;
                dest_val[0] = result;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

/// Emits one precomputed aggregation result; used for subtrees wholly
/// contained in the query range.
pub struct ValueAggregator {
    result: Option<AggregationResult>,
    direction: Direction,
}

impl ValueAggregator {
    pub fn new(result: AggregationResult, direction: Direction) -> Self {
        ValueAggregator {
            result: Some(result),
            direction,
        }
    }

    pub fn from_ref(sref: &SubtreeRef, direction: Direction) -> Self {
        Self::new(AggregationResult::from_ref(sref), direction)
    }
}

impl SeriesOperator<AggregationResult> for ValueAggregator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        if dest_ts.is_empty() || dest_val.is_empty() {
            return Ok(0);
        }
        match self.result.take() {
            Some(result) => {
                dest_ts[0] = result.begin;
                dest_val[0] = result;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

/// Aggregation over a superblock subtree: fully-contained children are
/// answered from their descriptors, partially covered ones recurse.
/// Yields a single combined result.
pub struct SBlockAggregator {
    inner: SBlockIteratorBase<AggregationResult>,
    done: bool,
}

impl SBlockAggregator {
    pub fn from_refs(
        store: Arc<dyn BlockStore>,
        refs: Vec<SubtreeRef>,
        begin: Timestamp,
        end: Timestamp,
    ) -> Self {
        let make_child: ChildBuilder<AggregationResult> = Box::new(move |store, sref| {
            let direction = Direction::of(begin, end);
            let covered = in_range(sref.begin, begin, end) && in_range(sref.end, begin, end);
            let child: BoxedAggregateOperator = if covered {
                Box::new(ValueAggregator::from_ref(sref, direction))
            } else {
                match sref.node_type {
                    NodeType::Leaf => {
                        let view = LeafView::load(store, sref.addr)?;
                        Box::new(LeafAggregator::from_view(&view, begin, end)?)
                    }
                    NodeType::Inner => {
                        let node = Superblock::load(store, sref.addr)?;
                        Box::new(SBlockAggregator::from_refs(
                            Arc::clone(store),
                            node.refs().to_vec(),
                            begin,
                            end,
                        ))
                    }
                }
            };
            Ok(Some(child))
        });
        SBlockAggregator {
            inner: SBlockIteratorBase::new(store, refs, begin, end, make_child),
            done: false,
        }
    }
}

impl SeriesOperator<AggregationResult> for SBlockAggregator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        if self.done || dest_ts.is_empty() || dest_val.is_empty() {
            return Ok(0);
        }
        let mut combined = AggregationResult::default();
        let mut ts = [0u64; 1];
        let mut val = [AggregationResult::default(); 1];
        loop {
            let produced = self.inner.read(&mut ts, &mut val)?;
            if produced == 0 {
                break;
            }
            combined.combine(&val[0]);
        }
        self.done = true;
        if combined.is_empty() {
            return Ok(0);
        }
        dest_ts[0] = combined.begin;
        dest_val[0] = combined;
        Ok(1)
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }
}

/// Drains a set of aggregate operators and yields their combined
/// result; used to fold per-extent aggregates into one answer.
pub struct CombineAggregateOperator {
    iters: Vec<BoxedAggregateOperator>,
    direction: Direction,
    done: bool,
}

impl CombineAggregateOperator {
    pub fn new(iters: Vec<BoxedAggregateOperator>, direction: Direction) -> Self {
        CombineAggregateOperator {
            iters,
            direction,
            done: false,
        }
    }
}

impl SeriesOperator<AggregationResult> for CombineAggregateOperator {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [AggregationResult],
    ) -> Result<usize, StoreError> {
        if self.done || dest_ts.is_empty() || dest_val.is_empty() {
            return Ok(0);
        }
        let mut combined = AggregationResult::default();
        let mut ts = [0u64; 1];
        let mut val = [AggregationResult::default(); 1];
        for iter in &mut self.iters {
            loop {
                let produced = iter.read(&mut ts, &mut val)?;
                if produced == 0 {
                    break;
                }
                combined.combine(&val[0]);
            }
        }
        self.done = true;
        if combined.is_empty() {
            return Ok(0);
        }
        dest_ts[0] = combined.begin;
        dest_val[0] = combined;
        Ok(1)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_aggregator_folds_range_subset() {
        let ts: Vec<u64> = (100..200).collect();
        let xs: Vec<f64> = ts.iter().map(|t| *t as f64 * 0.1).collect();
        let mut agg = LeafAggregator::from_points(ts, xs, 150, 160);
        let mut out_ts = [0u64; 1];
        let mut out = [AggregationResult::default(); 1];
        let n = agg.read(&mut out_ts, &mut out).expect("read");
        assert_eq!(n, 1);
        assert_eq!(out[0].cnt, 10.0);
        assert_eq!(out[0].begin, 150);
        assert_eq!(out[0].end, 159);
        // Exhausted after the single result.
        assert_eq!(agg.read(&mut out_ts, &mut out).expect("read"), 0);
    }

    #[test]
    fn value_aggregator_emits_descriptor_once() {
        let mut sref = SubtreeRef::empty(1, NodeType::Leaf, 0);
        sref.count = 5;
        sref.sum = 50.0;
        sref.begin = 10;
        sref.end = 14;
        let mut agg = ValueAggregator::from_ref(&sref, Direction::Forward);
        let mut out_ts = [0u64; 1];
        let mut out = [AggregationResult::default(); 1];
        assert_eq!(agg.read(&mut out_ts, &mut out).expect("read"), 1);
        assert_eq!(out[0].sum, 50.0);
        assert_eq!(agg.read(&mut out_ts, &mut out).expect("read"), 0);
    }
}
