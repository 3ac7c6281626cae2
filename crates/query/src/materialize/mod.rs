//! Tier-2 materializers: cross-series combinators that turn per-series
//! operators into a stream of [`Sample`]s.

mod aggregate;
mod join;
mod merge;

use nacre_common::{ParamId, Sample};
use nacre_storage::{BoxedOperator, SeriesOperator};

use crate::error::QueryError;

pub use aggregate::{
    AggregateCombiner, AggregateMaterializer, SeriesOrderGroupAggregate, TimeOrderGroupAggregate,
};
pub use join::{JoinMaterializer, JoinMode};
pub use merge::{MergeKey, MergeMaterializer};

/// Batch size used when draining tier-1 operators.
pub(crate) const OP_BATCH: usize = 256;

/// Demand-driven sample producer.
///
/// `read` appends at most `limit` samples to `dest` and returns how
/// many were produced; `0` means the stream is exhausted.
pub trait Materializer: Send {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError>;
}

/// Concatenates per-series scans in list order: all of series A, then
/// all of series B, and so on.
pub struct ChainMaterializer {
    inputs: Vec<(ParamId, BoxedOperator)>,
    pos: usize,
}

impl ChainMaterializer {
    pub fn new(inputs: Vec<(ParamId, BoxedOperator)>) -> Self {
        ChainMaterializer { inputs, pos: 0 }
    }
}

impl Materializer for ChainMaterializer {
    fn read(&mut self, dest: &mut Vec<Sample>, limit: usize) -> Result<usize, QueryError> {
        let mut produced = 0;
        let mut ts = [0u64; OP_BATCH];
        let mut xs = [0f64; OP_BATCH];
        while produced < limit && self.pos < self.inputs.len() {
            let want = (limit - produced).min(OP_BATCH);
            let (id, op) = &mut self.inputs[self.pos];
            let n = op.read(&mut ts[..want], &mut xs[..want])?;
            if n == 0 {
                self.pos += 1;
                continue;
            }
            for ix in 0..n {
                dest.push(Sample::float(*id, ts[ix], xs[ix]));
            }
            produced += n;
        }
        Ok(produced)
    }
}
