//! Tier-1 operators: single-series, direction-aware iterators over the
//! committed tree and the in-memory extent tops.
//!
//! All ranges are semi-open. A forward scan over `[a, b)` yields
//! timestamps `a <= t < b`; a backward scan (`a > b`) yields
//! `b < t <= a` in descending order. A read that returns `0` means the
//! operator is exhausted; end-of-stream is not an error.

mod aggregate;
mod filter;
mod group;
mod scan;

use nacre_common::Timestamp;

use crate::error::StoreError;
use crate::nbtree::def::SubtreeRef;

pub use aggregate::{CombineAggregateOperator, LeafAggregator, SBlockAggregator, ValueAggregator};
pub use filter::{LeafFilter, RangeOverlap, SBlockFilter, ValueFilter};
pub use group::{GroupAggConcat, LeafGroupAggregator, SBlockGroupAggregator};
pub use scan::{LeafIterator, SBlockIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn of(begin: Timestamp, end: Timestamp) -> Direction {
        if begin <= end {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Demand-driven pull interface shared by every tier-1 operator.
pub trait SeriesOperator<T>: Send {
    /// Fill the destination buffers and return the number of elements
    /// produced; `0` signals end of stream.
    fn read(&mut self, dest_ts: &mut [Timestamp], dest_val: &mut [T])
        -> Result<usize, StoreError>;

    fn direction(&self) -> Direction;
}

pub type BoxedOperator = Box<dyn SeriesOperator<f64> + Send>;
pub type BoxedAggregateOperator = Box<dyn SeriesOperator<AggregationResult> + Send>;

/// Aggregation functions selectable by the query layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Min,
    Max,
    Sum,
    Cnt,
    Mean,
    MinTimestamp,
    MaxTimestamp,
    First,
    Last,
}

impl AggregationFunction {
    pub fn extract(&self, res: &AggregationResult) -> f64 {
        match self {
            AggregationFunction::Min => res.min,
            AggregationFunction::Max => res.max,
            AggregationFunction::Sum => res.sum,
            AggregationFunction::Cnt => res.cnt,
            AggregationFunction::Mean => {
                if res.cnt > 0.0 {
                    res.sum / res.cnt
                } else {
                    f64::NAN
                }
            }
            AggregationFunction::MinTimestamp => res.mints as f64,
            AggregationFunction::MaxTimestamp => res.maxts as f64,
            AggregationFunction::First => res.first,
            AggregationFunction::Last => res.last,
        }
    }
}

/// Components of one aggregation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationResult {
    pub cnt: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub first: f64,
    pub last: f64,
    /// Timestamp of the minimum value.
    pub mints: Timestamp,
    /// Timestamp of the maximum value.
    pub maxts: Timestamp,
    /// Smallest timestamp of the window (bucket anchor for
    /// group-aggregation).
    pub begin: Timestamp,
    /// Largest timestamp of the window.
    pub end: Timestamp,
}

impl Default for AggregationResult {
    fn default() -> Self {
        AggregationResult {
            cnt: 0.0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            first: 0.0,
            last: 0.0,
            mints: Timestamp::MAX,
            maxts: 0,
            begin: Timestamp::MAX,
            end: 0,
        }
    }
}

impl AggregationResult {
    /// Copy all components from a subtree descriptor.
    pub fn from_ref(sref: &SubtreeRef) -> Self {
        AggregationResult {
            cnt: sref.count as f64,
            sum: sref.sum,
            min: sref.min,
            max: sref.max,
            first: sref.first,
            last: sref.last,
            mints: sref.min_time,
            maxts: sref.max_time,
            begin: sref.begin,
            end: sref.end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cnt == 0.0
    }

    /// Fold one point into the window.
    pub fn add(&mut self, ts: Timestamp, value: f64) {
        if self.is_empty() {
            self.begin = ts;
            self.end = ts;
            self.first = value;
            self.last = value;
        } else {
            if ts < self.begin {
                self.begin = ts;
                self.first = value;
            }
            if ts >= self.end {
                self.end = ts;
                self.last = value;
            }
        }
        self.cnt += 1.0;
        self.sum += value;
        if value < self.min {
            self.min = value;
            self.mints = ts;
        }
        if value > self.max {
            self.max = value;
            self.maxts = ts;
        }
    }

    /// Merge another window into this one, keeping `first`/`last`
    /// consistent with the combined boundary timestamps.
    pub fn combine(&mut self, other: &AggregationResult) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
            return;
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
            self.mints = other.mints;
        }
        if other.max > self.max {
            self.max = other.max;
            self.maxts = other.maxts;
        }
        if other.begin < self.begin {
            self.begin = other.begin;
            self.first = other.first;
        }
        if other.end >= self.end {
            self.end = other.end;
            self.last = other.last;
        }
    }
}

/// Concatenation of same-typed operators in list order.
pub struct ConcatIterator<T> {
    iters: Vec<Box<dyn SeriesOperator<T> + Send>>,
    pos: usize,
    direction: Direction,
}

impl<T> ConcatIterator<T> {
    pub fn new(iters: Vec<Box<dyn SeriesOperator<T> + Send>>, direction: Direction) -> Self {
        ConcatIterator {
            iters,
            pos: 0,
            direction,
        }
    }
}

impl<T> SeriesOperator<T> for ConcatIterator<T> {
    fn read(
        &mut self,
        dest_ts: &mut [Timestamp],
        dest_val: &mut [T],
    ) -> Result<usize, StoreError> {
        while self.pos < self.iters.len() {
            let produced = self.iters[self.pos].read(dest_ts, dest_val)?;
            if produced > 0 {
                return Ok(produced);
            }
            self.pos += 1;
        }
        Ok(0)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

/// Operator that never yields anything.
pub struct EmptyIterator<T> {
    direction: Direction,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> EmptyIterator<T> {
    pub fn new(direction: Direction) -> Self {
        EmptyIterator {
            direction,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> SeriesOperator<T> for EmptyIterator<T> {
    fn read(&mut self, _: &mut [Timestamp], _: &mut [T]) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}
