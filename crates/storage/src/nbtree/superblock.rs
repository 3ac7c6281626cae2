use std::sync::Arc;

use nacre_common::{LogicAddr, ParamId, FANOUT};

use crate::block::Block;
use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::def::{self, NodeType, SubtreeRef, SUBTREE_REF_SIZE};

/// Level-k (k ≥ 1) node holding up to [`FANOUT`] child references.
#[derive(Debug, Clone)]
pub struct Superblock {
    id: ParamId,
    level: u16,
    prev: LogicAddr,
    fanout_index: u16,
    refs: Vec<SubtreeRef>,
}

impl Superblock {
    pub fn new(id: ParamId, prev: LogicAddr, fanout_index: u16, level: u16) -> Self {
        debug_assert!(level > 0);
        debug_assert!(fanout_index < FANOUT);
        Superblock {
            id,
            level,
            prev,
            fanout_index,
            refs: Vec::with_capacity(FANOUT as usize),
        }
    }

    /// Reopen a committed superblock to continue filling it in memory.
    /// The old page stays on disk; the node is rewritten at a new
    /// address on the next commit (copy-on-write, so the tree height
    /// does not grow on every reopen).
    pub fn from_block(block: &Block) -> Result<Superblock, StoreError> {
        let header = def::checked_header(block, Some(NodeType::Inner))?;
        let nrefs = header.payload_size as usize / SUBTREE_REF_SIZE;
        let mut refs = Vec::with_capacity(FANOUT as usize);
        for ix in 0..nrefs {
            let at = SUBTREE_REF_SIZE + ix * SUBTREE_REF_SIZE;
            refs.push(SubtreeRef::read_from(&block.data()[at..])?);
        }
        Ok(Superblock {
            id: header.id,
            level: header.level,
            prev: header.addr,
            fanout_index: header.fanout_index,
            refs,
        })
    }

    pub fn load(store: &Arc<dyn BlockStore>, addr: LogicAddr) -> Result<Superblock, StoreError> {
        let block = store.read_block(addr)?;
        Self::from_block(&block)
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn level(&self) -> u16 {
        self.level
    }

    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    pub fn fanout_index(&self) -> u16 {
        self.fanout_index
    }

    pub fn nelements(&self) -> usize {
        self.refs.len()
    }

    pub fn is_full(&self) -> bool {
        self.refs.len() == FANOUT as usize
    }

    pub fn refs(&self) -> &[SubtreeRef] {
        &self.refs
    }

    /// Push one child descriptor. Children must arrive in fanout order
    /// from the level below.
    pub fn append_ref(&mut self, child: SubtreeRef) -> Result<(), StoreError> {
        if self.is_full() {
            return Err(StoreError::Overflow);
        }
        if child.level + 1 != self.level {
            return Err(StoreError::BadArg("child level mismatch"));
        }
        self.refs.push(child);
        Ok(())
    }

    /// Parent-facing descriptor aggregated over the children.
    pub fn summarize(&self) -> Result<SubtreeRef, StoreError> {
        let first = self
            .refs
            .first()
            .ok_or(StoreError::BadArg("empty superblock cannot be summarized"))?;
        let last = self.refs[self.refs.len() - 1];
        let mut out = SubtreeRef::empty(self.id, NodeType::Inner, self.level);
        out.begin = first.begin;
        out.end = last.end;
        out.first = first.first;
        out.last = last.last;
        out.addr = self.prev;
        out.fanout_index = self.fanout_index;
        for child in &self.refs {
            out.count += child.count;
            out.sum += child.sum;
            if child.min < out.min {
                out.min = child.min;
                out.min_time = child.min_time;
            }
            if child.max > out.max {
                out.max = child.max;
                out.max_time = child.max_time;
            }
        }
        Ok(out)
    }

    pub fn commit(
        &self,
        store: &Arc<dyn BlockStore>,
    ) -> Result<(LogicAddr, SubtreeRef), StoreError> {
        let header = self.summarize()?;
        let mut payload = vec![0u8; self.refs.len() * SUBTREE_REF_SIZE];
        for (ix, child) in self.refs.iter().enumerate() {
            child.write_to(&mut payload[ix * SUBTREE_REF_SIZE..]);
        }
        let block = def::build_block(header, &payload)?;
        let addr = store.append_block(&block)?;
        let mut backref = header;
        backref.addr = addr;
        Ok((addr, backref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemStore;
    use crate::nbtree::leaf::Leaf;

    fn committed_leaf_ref(
        store: &Arc<dyn BlockStore>,
        fanout: u16,
        base_ts: u64,
    ) -> SubtreeRef {
        let mut leaf = Leaf::new(7, LogicAddr::EMPTY, fanout);
        for i in 0..10u64 {
            leaf.append(base_ts + i, (base_ts + i) as f64).expect("append");
        }
        let (_, backref) = leaf.commit(store).expect("commit");
        backref
    }

    #[test]
    fn superblock_aggregates_children() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let mut sblock = Superblock::new(7, LogicAddr::EMPTY, 0, 1);
        for k in 0..3u16 {
            let child = committed_leaf_ref(&store, k, 100 + u64::from(k) * 10);
            sblock.append_ref(child).expect("append ref");
        }
        let sref = sblock.summarize().expect("summarize");
        assert_eq!(sref.count, 30);
        assert_eq!(sref.begin, 100);
        assert_eq!(sref.end, 129);
        assert_eq!(sref.min, 100.0);
        assert_eq!(sref.max, 129.0);
        assert_eq!(sref.first, 100.0);
        assert_eq!(sref.last, 129.0);
    }

    #[test]
    fn superblock_commit_reload_round_trip() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let mut sblock = Superblock::new(7, LogicAddr::EMPTY, 4, 1);
        for k in 0..5u16 {
            sblock
                .append_ref(committed_leaf_ref(&store, k, 1000 + u64::from(k) * 100))
                .expect("append ref");
        }
        let (addr, _) = sblock.commit(&store).expect("commit");
        let reopened = Superblock::load(&store, addr).expect("load");
        assert_eq!(reopened.nelements(), 5);
        assert_eq!(reopened.level(), 1);
        assert_eq!(reopened.fanout_index(), 4);
        assert_eq!(reopened.refs()[2].begin, 1200);
        // Children keep their own fanout indices 0..n-1.
        for (ix, child) in reopened.refs().iter().enumerate() {
            assert_eq!(child.fanout_index as usize, ix);
            assert_eq!(child.level, 0);
        }
    }

    #[test]
    fn superblock_overflows_at_fanout() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let mut sblock = Superblock::new(7, LogicAddr::EMPTY, 0, 1);
        for k in 0..FANOUT {
            sblock
                .append_ref(committed_leaf_ref(&store, k, u64::from(k) * 10))
                .expect("append ref");
        }
        let extra = committed_leaf_ref(&store, 0, 99_999);
        assert!(matches!(
            sblock.append_ref(extra),
            Err(StoreError::Overflow)
        ));
    }

    #[test]
    fn superblock_rejects_level_mismatch() {
        let store: Arc<dyn BlockStore> = MemStore::new();
        let mut sblock = Superblock::new(7, LogicAddr::EMPTY, 0, 2);
        let child = committed_leaf_ref(&store, 0, 0);
        assert!(matches!(
            sblock.append_ref(child),
            Err(StoreError::BadArg(_))
        ));
    }
}
