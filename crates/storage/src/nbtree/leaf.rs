use std::sync::Arc;

use bytes::Bytes;
use nacre_common::{LogicAddr, ParamId, Timestamp, FANOUT};

use crate::block::Block;
use crate::blockstore::BlockStore;
use crate::compression::{DataBlockReader, DataBlockWriter};
use crate::error::StoreError;
use crate::nbtree::def::{self, NodeType, SubtreeRef, MAX_PAYLOAD_SIZE, SUBTREE_REF_SIZE};

/// Mutable level-0 node accumulating a compressed point stream.
///
/// The leaf is sealed by the first [`StoreError::Overflow`] returned
/// from [`Leaf::append`]; after [`Leaf::commit`] it must be discarded.
#[derive(Debug)]
pub struct Leaf {
    id: ParamId,
    prev: LogicAddr,
    fanout_index: u16,
    writer: DataBlockWriter,
    header: SubtreeRef,
}

impl Leaf {
    pub fn new(id: ParamId, prev: LogicAddr, fanout_index: u16) -> Self {
        debug_assert!(fanout_index < FANOUT);
        Leaf {
            id,
            prev,
            fanout_index,
            writer: DataBlockWriter::new(MAX_PAYLOAD_SIZE),
            header: SubtreeRef::empty(id, NodeType::Leaf, 0),
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn nelements(&self) -> u32 {
        self.writer.count()
    }

    pub fn fanout_index(&self) -> u16 {
        self.fanout_index
    }

    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    pub fn timestamps(&self) -> Option<(Timestamp, Timestamp)> {
        (self.writer.count() > 0).then_some((self.header.begin, self.header.end))
    }

    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<(), StoreError> {
        self.writer.append(ts, value)?;
        let h = &mut self.header;
        if h.count == 0 {
            h.begin = ts;
            h.first = value;
        }
        h.count += 1;
        h.end = ts;
        h.last = value;
        h.sum += value;
        if value < h.min {
            h.min = value;
            h.min_time = ts;
        }
        if value > h.max {
            h.max = value;
            h.max_time = ts;
        }
        Ok(())
    }

    /// Parent-facing descriptor of the current content. Fails on an
    /// empty leaf, which must never reach a parent node.
    pub fn summarize(&self) -> Result<SubtreeRef, StoreError> {
        if self.header.count == 0 {
            return Err(StoreError::BadArg("empty leaf cannot be summarized"));
        }
        let mut out = self.header;
        out.addr = self.prev;
        out.fanout_index = self.fanout_index;
        out.payload_size = self.writer.size() as u16;
        Ok(out)
    }

    /// Decode the pending stream.
    pub fn read_all(&self) -> Result<(Vec<Timestamp>, Vec<f64>), StoreError> {
        DataBlockReader::new(self.writer.payload(), self.writer.count()).read_all()
    }

    /// Finalize the header, write the page and return its address with
    /// the descriptor the parent should record.
    pub fn commit(
        &self,
        store: &Arc<dyn BlockStore>,
    ) -> Result<(LogicAddr, SubtreeRef), StoreError> {
        let header = self.summarize()?;
        let block = def::build_block(header, self.writer.payload())?;
        let addr = store.append_block(&block)?;
        let mut backref = header;
        backref.addr = addr;
        Ok((addr, backref))
    }
}

/// Read-only leaf decoded from a committed block.
#[derive(Debug, Clone)]
pub struct LeafView {
    header: SubtreeRef,
    payload: Bytes,
}

impl LeafView {
    pub fn from_block(block: &Block) -> Result<LeafView, StoreError> {
        let header = def::checked_header(block, Some(NodeType::Leaf))?;
        let payload = block
            .bytes()
            .slice(SUBTREE_REF_SIZE..SUBTREE_REF_SIZE + header.payload_size as usize);
        Ok(LeafView { header, payload })
    }

    pub fn load(store: &Arc<dyn BlockStore>, addr: LogicAddr) -> Result<LeafView, StoreError> {
        let block = store.read_block(addr)?;
        Self::from_block(&block)
    }

    pub fn header(&self) -> &SubtreeRef {
        &self.header
    }

    pub fn prev_addr(&self) -> LogicAddr {
        self.header.addr
    }

    pub fn read_all(&self) -> Result<(Vec<Timestamp>, Vec<f64>), StoreError> {
        DataBlockReader::new(&self.payload, self.header.count as u32).read_all()
    }

    /// Descriptor of this committed node for a parent, pointing at the
    /// node itself rather than its predecessor.
    pub fn backref(&self, own_addr: LogicAddr) -> SubtreeRef {
        let mut out = self.header;
        out.addr = own_addr;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemStore;

    fn filled_leaf() -> Leaf {
        let mut leaf = Leaf::new(9, LogicAddr::EMPTY, 0);
        for i in 0..100u64 {
            leaf.append(100 + i, (100 + i) as f64 * 0.1).expect("append");
        }
        leaf
    }

    #[test]
    fn leaf_tracks_aggregates() {
        let leaf = filled_leaf();
        let sref = leaf.summarize().expect("summarize");
        assert_eq!(sref.count, 100);
        assert_eq!(sref.begin, 100);
        assert_eq!(sref.end, 199);
        assert_eq!(sref.min, 10.0);
        assert_eq!(sref.min_time, 100);
        assert_eq!(sref.max, 19.9);
        assert_eq!(sref.max_time, 199);
        assert_eq!(sref.first, 10.0);
        assert_eq!(sref.last, 19.9);
        assert!((sref.sum - 1495.0).abs() < 1e-9);
    }

    #[test]
    fn leaf_commit_and_reload() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let leaf = filled_leaf();
        let (addr, backref) = leaf.commit(&store).expect("commit");
        assert_eq!(backref.addr, addr);

        let view = LeafView::load(&store, addr).expect("load");
        assert_eq!(view.header().count, 100);
        let (ts, xs) = view.read_all().expect("read");
        assert_eq!(ts.len(), 100);
        assert_eq!(ts[0], 100);
        assert_eq!(xs[99], 19.9);
    }

    #[test]
    fn leaf_eventually_overflows() {
        let mut leaf = Leaf::new(1, LogicAddr::EMPTY, 0);
        let mut n = 0u64;
        loop {
            // Random-looking values defeat the xor codec so the page
            // fills up in a few hundred points.
            let x = f64::from_bits(n.wrapping_mul(0x9e3779b97f4a7c15));
            let x = if x.is_finite() { x } else { n as f64 };
            match leaf.append(n, x) {
                Ok(()) => n += 1,
                Err(StoreError::Overflow) => break,
                Err(other) => panic!("unexpected: {other}"),
            }
        }
        assert!(n > 0);
        assert_eq!(leaf.nelements() as u64, n);
    }

    #[test]
    fn empty_leaf_refuses_commit() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let leaf = Leaf::new(1, LogicAddr::EMPTY, 0);
        assert!(leaf.commit(&store).is_err());
    }
}
