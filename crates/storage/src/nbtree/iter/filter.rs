use std::sync::Arc;

use nacre_common::Timestamp;

use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::def::{NodeType, SubtreeRef};
use crate::nbtree::leaf::LeafView;
use crate::nbtree::superblock::Superblock;

use super::scan::{in_range, ChildBuilder, LeafIterator, SBlockIterator, SBlockIteratorBase};
use super::{BoxedOperator, Direction, SeriesOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOverlap {
    NoOverlap,
    FullOverlap,
    PartialOverlap,
}

const LT: usize = 0;
const LE: usize = 1;
const GT: usize = 2;
const GE: usize = 3;

/// Conjunction of value bounds (`<`, `≤`, `>`, `≥`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueFilter {
    mask: u8,
    thresholds: [f64; 4],
}

impl ValueFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn less_than(mut self, value: f64) -> Self {
        self.mask |= 1 << LT;
        self.thresholds[LT] = value;
        self
    }

    pub fn less_or_equal(mut self, value: f64) -> Self {
        self.mask |= 1 << LE;
        self.thresholds[LE] = value;
        self
    }

    pub fn greater_than(mut self, value: f64) -> Self {
        self.mask |= 1 << GT;
        self.thresholds[GT] = value;
        self
    }

    pub fn greater_or_equal(mut self, value: f64) -> Self {
        self.mask |= 1 << GE;
        self.thresholds[GE] = value;
        self
    }

    fn has(&self, bound: usize) -> bool {
        self.mask & (1 << bound) != 0
    }

    pub fn matches(&self, value: f64) -> bool {
        if self.has(LT) && !(value < self.thresholds[LT]) {
            return false;
        }
        if self.has(LE) && !(value <= self.thresholds[LE]) {
            return false;
        }
        if self.has(GT) && !(value > self.thresholds[GT]) {
            return false;
        }
        if self.has(GE) && !(value >= self.thresholds[GE]) {
            return false;
        }
        true
    }

    /// 0 = unbounded, 1 = one side bounded, 2 = both sides.
    pub fn rank(&self) -> u8 {
        let upper = u8::from(self.has(LT) || self.has(LE));
        let lower = u8::from(self.has(GT) || self.has(GE));
        upper + lower
    }

    /// A filter with conflicting duplicate bounds is rejected by the
    /// query layer.
    pub fn validate(&self) -> bool {
        if self.has(LT) && self.has(LE) {
            return false;
        }
        if self.has(GT) && self.has(GE) {
            return false;
        }
        if self.rank() == 2 {
            return self.lower_bound() <= self.upper_bound();
        }
        true
    }

    fn upper_bound(&self) -> f64 {
        if self.has(LT) {
            self.thresholds[LT]
        } else if self.has(LE) {
            self.thresholds[LE]
        } else {
            f64::INFINITY
        }
    }

    fn lower_bound(&self) -> f64 {
        if self.has(GT) {
            self.thresholds[GT]
        } else if self.has(GE) {
            self.thresholds[GE]
        } else {
            f64::NEG_INFINITY
        }
    }

    fn violates_upper(&self, value: f64) -> bool {
        (self.has(LT) && !(value < self.thresholds[LT]))
            || (self.has(LE) && !(value <= self.thresholds[LE]))
    }

    fn violates_lower(&self, value: f64) -> bool {
        (self.has(GT) && !(value > self.thresholds[GT]))
            || (self.has(GE) && !(value >= self.thresholds[GE]))
    }

    /// Three-way overlap test of the filter interval against the
    /// subtree's `[min, max]` envelope. The filter interval is convex,
    /// so matching both bounds means matching everything in between.
    pub fn overlap(&self, sref: &SubtreeRef) -> RangeOverlap {
        if sref.count == 0 {
            return RangeOverlap::NoOverlap;
        }
        if self.matches(sref.min) && self.matches(sref.max) {
            return RangeOverlap::FullOverlap;
        }
        if self.violates_upper(sref.min) || self.violates_lower(sref.max) {
            return RangeOverlap::NoOverlap;
        }
        RangeOverlap::PartialOverlap
    }
}

/// Filtering scan over one decoded leaf.
pub struct LeafFilter {
    inner: LeafIterator,
}

impl LeafFilter {
    pub fn new(
        ts: Vec<Timestamp>,
        xs: Vec<f64>,
        begin: Timestamp,
        end: Timestamp,
        filter: ValueFilter,
    ) -> Self {
        let mut fts = Vec::new();
        let mut fxs = Vec::new();
        for (ix, t) in ts.iter().enumerate() {
            if in_range(*t, begin, end) && filter.matches(xs[ix]) {
                fts.push(*t);
                fxs.push(xs[ix]);
            }
        }
        // The points are already range-filtered; hand the iterator an
        // all-inclusive window in the right direction.
        let (b, e) = if begin <= end {
            (0, Timestamp::MAX)
        } else {
            (Timestamp::MAX, 0)
        };
        LeafFilter {
            inner: LeafIterator::new(fts, fxs, b, e),
        }
    }

    pub fn from_view(
        view: &LeafView,
        begin: Timestamp,
        end: Timestamp,
        filter: ValueFilter,
    ) -> Result<Self, StoreError> {
        let (ts, xs) = view.read_all()?;
        Ok(Self::new(ts, xs, begin, end, filter))
    }
}

impl SeriesOperator<f64> for LeafFilter {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [f64],
    ) -> Result<usize, StoreError> {
        self.inner.read(dest_ts, dest_val)
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }
}

/// Filtering scan over a superblock subtree: children fully inside the
/// filter degrade to plain scans, disjoint children are pruned.
pub struct SBlockFilter {
    inner: SBlockIteratorBase<f64>,
}

impl SBlockFilter {
    pub fn from_refs(
        store: Arc<dyn BlockStore>,
        refs: Vec<SubtreeRef>,
        begin: Timestamp,
        end: Timestamp,
        filter: ValueFilter,
    ) -> Self {
        let make_child: ChildBuilder<f64> = Box::new(move |store, sref| {
            let child: Option<BoxedOperator> = match filter.overlap(sref) {
                RangeOverlap::NoOverlap => None,
                RangeOverlap::FullOverlap => match sref.node_type {
                    NodeType::Leaf => {
                        let view = LeafView::load(store, sref.addr)?;
                        Some(Box::new(LeafIterator::from_view(&view, begin, end)?))
                    }
                    NodeType::Inner => {
                        let node = Superblock::load(store, sref.addr)?;
                        Some(Box::new(SBlockIterator::from_refs(
                            Arc::clone(store),
                            node.refs().to_vec(),
                            begin,
                            end,
                        )))
                    }
                },
                RangeOverlap::PartialOverlap => match sref.node_type {
                    NodeType::Leaf => {
                        let view = LeafView::load(store, sref.addr)?;
                        Some(Box::new(LeafFilter::from_view(
                            &view,
                            begin,
                            end,
                            filter.clone(),
                        )?))
                    }
                    NodeType::Inner => {
                        let node = Superblock::load(store, sref.addr)?;
                        Some(Box::new(SBlockFilter::from_refs(
                            Arc::clone(store),
                            node.refs().to_vec(),
                            begin,
                            end,
                            filter.clone(),
                        )))
                    }
                },
            };
            Ok(child)
        });
        SBlockFilter {
            inner: SBlockIteratorBase::new(store, refs, begin, end, make_child),
        }
    }
}

impl SeriesOperator<f64> for SBlockFilter {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [f64],
    ) -> Result<usize, StoreError> {
        self.inner.read(dest_ts, dest_val)
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbtree::def::{NodeType, SubtreeRef};

    fn envelope(min: f64, max: f64) -> SubtreeRef {
        let mut sref = SubtreeRef::empty(1, NodeType::Leaf, 0);
        sref.count = 10;
        sref.min = min;
        sref.max = max;
        sref
    }

    #[test]
    fn filter_matches_interval() {
        let filter = ValueFilter::new().greater_or_equal(1.0).less_than(5.0);
        assert!(filter.validate());
        assert!(filter.matches(1.0));
        assert!(filter.matches(4.999));
        assert!(!filter.matches(5.0));
        assert!(!filter.matches(0.999));
        assert_eq!(filter.rank(), 2);
    }

    #[test]
    fn overlap_classification() {
        let filter = ValueFilter::new().greater_than(10.0).less_or_equal(20.0);
        assert_eq!(filter.overlap(&envelope(11.0, 20.0)), RangeOverlap::FullOverlap);
        assert_eq!(filter.overlap(&envelope(0.0, 5.0)), RangeOverlap::NoOverlap);
        assert_eq!(filter.overlap(&envelope(25.0, 30.0)), RangeOverlap::NoOverlap);
        assert_eq!(
            filter.overlap(&envelope(5.0, 15.0)),
            RangeOverlap::PartialOverlap
        );
    }

    #[test]
    fn conflicting_bounds_fail_validation() {
        assert!(!ValueFilter::new().less_than(1.0).less_or_equal(2.0).validate());
        assert!(!ValueFilter::new().greater_than(5.0).less_than(1.0).validate());
    }

    #[test]
    fn leaf_filter_keeps_matching_points_only() {
        let ts: Vec<u64> = (0..10).collect();
        let xs: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let filter = ValueFilter::new().greater_or_equal(3.0).less_than(7.0);
        let mut op = LeafFilter::new(ts, xs, 0, 100, filter);
        let mut got_ts = [0u64; 16];
        let mut got_xs = [0f64; 16];
        let n = op.read(&mut got_ts, &mut got_xs).expect("read");
        assert_eq!(&got_xs[..n], &[3.0, 4.0, 5.0, 6.0]);
    }
}
