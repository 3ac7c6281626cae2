use std::sync::Arc;

use nacre_common::{LogicAddr, ParamId, Timestamp, FANOUT};
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::blockstore::BlockStore;
use crate::error::StoreError;
use crate::nbtree::def::{NodeType, SubtreeRef};
use crate::nbtree::iter::{
    BoxedAggregateOperator, BoxedOperator, CombineAggregateOperator, ConcatIterator, Direction,
    GroupAggConcat, LeafAggregator, LeafFilter, LeafGroupAggregator, LeafIterator,
    SBlockAggregator, SBlockFilter, SBlockGroupAggregator, SBlockIterator, ValueFilter,
};
use crate::nbtree::leaf::{Leaf, LeafView};
use crate::nbtree::superblock::Superblock;

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Ok,
    /// At least one node was committed; the caller must persist the new
    /// rescue-point vector through the metadata sync worker.
    OkFlushNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// No on-disk state, the series is new.
    New,
    /// The tree was closed cleanly.
    Ok,
    /// Crash recovery must reconstruct the in-memory tops.
    Repair,
}

#[derive(Debug)]
struct LeafExtent {
    leaf: Leaf,
    last: LogicAddr,
    fanout_index: u16,
}

impl LeafExtent {
    fn fresh(id: ParamId, prev: LogicAddr, fanout_index: u16) -> Self {
        LeafExtent {
            leaf: Leaf::new(id, prev, fanout_index),
            last: prev,
            fanout_index,
        }
    }

    /// Create the extent that continues after the node at `prev`.
    fn open(
        store: &Arc<dyn BlockStore>,
        id: ParamId,
        prev: LogicAddr,
    ) -> Result<Self, StoreError> {
        if prev.is_empty() {
            return Ok(Self::fresh(id, LogicAddr::EMPTY, 0));
        }
        let view = LeafView::load(store, prev)?;
        let mut fanout = view.header().fanout_index + 1;
        if fanout == FANOUT {
            fanout = 0;
        }
        Ok(Self::fresh(id, prev, fanout))
    }

    fn advance(&mut self, id: ParamId, committed: LogicAddr) {
        self.fanout_index += 1;
        if self.fanout_index == FANOUT {
            self.fanout_index = 0;
        }
        self.last = committed;
        self.leaf = Leaf::new(id, self.last, self.fanout_index);
    }

    fn is_dirty(&self) -> bool {
        self.leaf.nelements() > 0
    }
}

#[derive(Debug)]
struct SBlockExtent {
    node: Superblock,
    last: LogicAddr,
    fanout_index: u16,
    level: u16,
}

impl SBlockExtent {
    fn fresh(id: ParamId, level: u16) -> Self {
        SBlockExtent {
            node: Superblock::new(id, LogicAddr::EMPTY, 0, level),
            last: LogicAddr::EMPTY,
            fanout_index: 0,
            level,
        }
    }

    /// Continue after the committed sibling at `prev`.
    fn after(
        store: &Arc<dyn BlockStore>,
        id: ParamId,
        prev: LogicAddr,
        level: u16,
    ) -> Result<Self, StoreError> {
        if prev.is_empty() {
            return Ok(Self::fresh(id, level));
        }
        let node = Superblock::load(store, prev)?;
        let mut fanout = node.fanout_index() + 1;
        if fanout == FANOUT {
            fanout = 0;
        }
        Ok(SBlockExtent {
            node: Superblock::new(id, prev, fanout, level),
            last: prev,
            fanout_index: fanout,
            level,
        })
    }

    /// Reopen a committed node to keep filling it (copy-on-write).
    fn reopen(
        store: &Arc<dyn BlockStore>,
        addr: LogicAddr,
    ) -> Result<Self, StoreError> {
        let node = Superblock::load(store, addr)?;
        let last = node.prev_addr();
        let fanout_index = node.fanout_index();
        let level = node.level();
        Ok(SBlockExtent {
            node,
            last,
            fanout_index,
            level,
        })
    }

    fn advance(&mut self, id: ParamId, committed: LogicAddr) {
        self.fanout_index += 1;
        if self.fanout_index == FANOUT {
            self.fanout_index = 0;
        }
        self.last = committed;
        self.node = Superblock::new(id, self.last, self.fanout_index, self.level);
    }

    fn is_dirty(&self) -> bool {
        self.node.nelements() > 0
    }
}

#[derive(Debug)]
enum Extent {
    Leaf(LeafExtent),
    SBlock(SBlockExtent),
}

impl Extent {
    fn is_dirty(&self) -> bool {
        match self {
            Extent::Leaf(e) => e.is_dirty(),
            Extent::SBlock(e) => e.is_dirty(),
        }
    }
}

/// Per-series stack of currently-writable nodes, one per tree level.
///
/// `extents[0]` is the leaf extent, `extents[k]` the level-k superblock
/// extent. The stack grows when a level overflows for the first time.
#[derive(Debug)]
pub struct ExtentsList {
    id: ParamId,
    store: Arc<dyn BlockStore>,
    extents: Vec<Extent>,
    rescue_points: Vec<LogicAddr>,
    initialized: bool,
    unreadable: bool,
    last_ts: Option<Timestamp>,
}

impl ExtentsList {
    pub fn new(id: ParamId, rescue_points: Vec<LogicAddr>, store: Arc<dyn BlockStore>) -> Self {
        ExtentsList {
            id,
            store,
            extents: Vec::new(),
            rescue_points,
            initialized: false,
            unreadable: false,
            last_ts: None,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Snapshot of the rescue-point vector.
    pub fn get_roots(&self) -> Vec<LogicAddr> {
        self.rescue_points.clone()
    }

    pub fn repair_status(rescue_points: &[LogicAddr]) -> RepairStatus {
        if rescue_points.is_empty() {
            return RepairStatus::New;
        }
        let non_empty = rescue_points.iter().filter(|a| !a.is_empty()).count();
        match rescue_points.last() {
            Some(last) if non_empty == 1 && !last.is_empty() => RepairStatus::Ok,
            _ => RepairStatus::Repair,
        }
    }

    pub fn force_init(&mut self) -> Result<(), StoreError> {
        if !self.initialized {
            self.init()?;
        }
        Ok(())
    }

    /// Append one data point.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<AppendOutcome, StoreError> {
        self.append_with(ts, value, true)
    }

    /// Append with explicit duplicate policy; WAL replay disables
    /// duplicates until the first point of a series lands.
    pub fn append_with(
        &mut self,
        ts: Timestamp,
        value: f64,
        allow_duplicates: bool,
    ) -> Result<AppendOutcome, StoreError> {
        if !self.initialized {
            self.init()?;
        }
        if self.unreadable {
            return Err(StoreError::Unavailable(
                *self.rescue_points.last().unwrap_or(&LogicAddr::EMPTY),
            ));
        }
        if !value.is_finite() {
            return Err(StoreError::BadValue);
        }
        if let Some(head) = self.last_ts {
            if ts < head || (ts == head && !allow_duplicates) {
                return Err(StoreError::LateWrite {
                    head,
                    attempted: ts,
                });
            }
        }
        if self.extents.is_empty() {
            self.extents.push(Extent::Leaf(LeafExtent::fresh(
                self.id,
                LogicAddr::EMPTY,
                0,
            )));
            self.rescue_points.push(LogicAddr::EMPTY);
        }
        let overflow = {
            let Extent::Leaf(leaf) = &mut self.extents[0] else {
                return Err(StoreError::BadArg("level 0 extent is not a leaf"));
            };
            match leaf.leaf.append(ts, value) {
                Ok(()) => false,
                Err(StoreError::Overflow) => true,
                Err(other) => return Err(other),
            }
        };
        if !overflow {
            self.last_ts = Some(ts);
            return Ok(AppendOutcome::Ok);
        }
        // The active leaf is full: commit it and cascade the refs up,
        // then retry into the fresh leaf.
        let mut committed = Vec::new();
        self.commit_level(0, false, &mut committed)?;
        self.update_rescue_points(&committed);
        let Extent::Leaf(leaf) = &mut self.extents[0] else {
            return Err(StoreError::BadArg("level 0 extent is not a leaf"));
        };
        leaf.leaf.append(ts, value)?;
        self.last_ts = Some(ts);
        Ok(AppendOutcome::OkFlushNeeded)
    }

    /// Commit the node at `level`, reset its extent and offer the
    /// resulting ref to the parent, committing full parents on the way.
    ///
    /// With `final_close` set no new levels are created; the topmost
    /// ref simply bubbles out as the tree root.
    fn commit_level(
        &mut self,
        level: usize,
        final_close: bool,
        committed: &mut Vec<(usize, LogicAddr)>,
    ) -> Result<(), StoreError> {
        let backref = match &mut self.extents[level] {
            Extent::Leaf(e) => {
                let (addr, backref) = e.leaf.commit(&self.store)?;
                e.advance(self.id, addr);
                committed.push((level, addr));
                backref
            }
            Extent::SBlock(e) => {
                let (addr, backref) = e.node.commit(&self.store)?;
                e.advance(self.id, addr);
                committed.push((level, addr));
                backref
            }
        };
        let parent = level + 1;
        if parent >= self.extents.len() {
            if final_close {
                // Closing: the last committed node is the root, nothing
                // above it is created.
                return Ok(());
            }
            self.extents
                .push(Extent::SBlock(SBlockExtent::fresh(self.id, parent as u16)));
            self.rescue_points.push(LogicAddr::EMPTY);
        }
        let parent_full = matches!(&self.extents[parent], Extent::SBlock(e) if e.node.is_full());
        if parent_full {
            // Room-making commit: even during close it may create the
            // level above, otherwise the full node's ref would be
            // dropped.
            self.commit_level(parent, false, committed)?;
        }
        match &mut self.extents[parent] {
            Extent::SBlock(e) => e.node.append_ref(backref)?,
            Extent::Leaf(_) => return Err(StoreError::BadArg("leaf extent above level 0")),
        }
        Ok(())
    }

    /// After a cascade, every committed level keeps the address of its
    /// newest committed node so that crash recovery can rebuild the
    /// parent's in-memory refs by walking the sibling chain backwards.
    fn update_rescue_points(&mut self, committed: &[(usize, LogicAddr)]) {
        for (level, addr) in committed {
            if *level < self.rescue_points.len() {
                self.rescue_points[*level] = *addr;
            }
        }
    }

    fn init(&mut self) -> Result<(), StoreError> {
        self.initialized = true;
        match Self::repair_status(&self.rescue_points) {
            RepairStatus::New => Ok(()),
            RepairStatus::Ok => self.open_clean(),
            RepairStatus::Repair => self.repair(),
        }
    }

    /// Reopen a cleanly closed tree: `[EMPTY, .., EMPTY, root]`.
    fn open_clean(&mut self) -> Result<(), StoreError> {
        let root_addr = *self
            .rescue_points
            .last()
            .ok_or(StoreError::BadArg("empty rescue vector"))?;
        debug!(id = self.id, addr = %root_addr, "opening tree");
        if self.rescue_points.len() < 2 {
            // A single leaf was the whole tree. Promote it under a new
            // level-1 root so appends can continue.
            let view = match LeafView::load(&self.store, root_addr) {
                Ok(view) => view,
                Err(StoreError::Unavailable(_)) => {
                    // The only node was recycled; the series restarts
                    // from scratch.
                    warn!(id = self.id, "tree root was recycled, starting empty");
                    self.rescue_points.clear();
                    return Ok(());
                }
                Err(other) => return Err(other),
            };
            let mut root = SBlockExtent::fresh(self.id, 1);
            root.node.append_ref(view.backref(root_addr))?;
            self.last_ts = Some(view.header().end);
            self.extents.push(Extent::Leaf(LeafExtent::open(
                &self.store,
                self.id,
                root_addr,
            )?));
            self.extents.push(Extent::SBlock(root));
            self.rescue_points = vec![LogicAddr::EMPTY, LogicAddr::EMPTY];
            return Ok(());
        }
        let root_level = (self.rescue_points.len() - 1) as u16;
        let root = SBlockExtent::reopen(&self.store, root_addr)?;
        self.last_ts = root.node.refs().last().map(|r| r.end);
        // Walk the rightmost spine to find the newest committed node of
        // every level. Each reopened level starts a fresh fanout window
        // (its parent-to-be is also fresh) but keeps the sibling
        // back-link for chain continuity.
        let mut spine: Vec<LogicAddr> = vec![LogicAddr::EMPTY; root_level as usize];
        let mut cursor = root.node.refs().last().copied();
        while let Some(child) = cursor {
            let Some(slot) = spine.get_mut(child.level as usize) else {
                return Err(StoreError::BadData(format!(
                    "child level {} does not fit under root level {root_level}",
                    child.level
                )));
            };
            *slot = child.addr;
            if child.level == 0 {
                break;
            }
            cursor = match Superblock::load(&self.store, child.addr) {
                Ok(node) => node.refs().last().copied(),
                // The spine runs into recycled history; deeper levels
                // simply start unlinked.
                Err(StoreError::Unavailable(_)) => None,
                Err(other) => return Err(other),
            };
        }
        self.extents
            .push(Extent::Leaf(LeafExtent::fresh(self.id, spine[0], 0)));
        for level in 1..root_level {
            let prev = spine[level as usize];
            self.extents.push(Extent::SBlock(SBlockExtent {
                node: Superblock::new(self.id, prev, 0, level),
                last: prev,
                fanout_index: 0,
                level,
            }));
        }
        self.extents.push(Extent::SBlock(root));
        Ok(())
    }

    /// Crash recovery: rebuild the in-memory top of every level from
    /// the rescue points, walking sibling chains backwards to recover
    /// refs that never reached a committed parent.
    fn repair(&mut self) -> Result<(), StoreError> {
        info!(id = self.id, points = ?self.rescue_points, "repairing tree");
        let rescue = self.rescue_points.clone();
        // Bottom of the stack: a fresh leaf continuing after the last
        // committed leaf.
        match LeafExtent::open(&self.store, self.id, rescue[0]) {
            Ok(extent) => self.extents.push(Extent::Leaf(extent)),
            Err(err) => {
                error!(id = self.id, %err, "cannot restore leaf level, series is unreadable");
                self.unreadable = true;
                return Ok(());
            }
        }
        for (level, seed) in rescue.iter().enumerate().skip(1) {
            let extent = match SBlockExtent::after(&self.store, self.id, *seed, level as u16) {
                Ok(extent) => extent,
                Err(err) => {
                    error!(id = self.id, level, %err, "cannot restore inner level, series is unreadable");
                    self.unreadable = true;
                    self.extents.clear();
                    return Ok(());
                }
            };
            self.extents.push(Extent::SBlock(extent));
        }
        // Replay unreferenced siblings upward, lowest level first.
        for level in 0..rescue.len() {
            let seed = rescue[level];
            if seed.is_empty() {
                continue;
            }
            let chain = match self.collect_unreferenced_chain(level, seed) {
                Ok(chain) => chain,
                Err(err) => {
                    error!(id = self.id, level, %err, "sibling chain walk failed, series is unreadable");
                    self.unreadable = true;
                    self.extents.clear();
                    return Ok(());
                }
            };
            let mut committed = Vec::new();
            for backref in chain {
                self.offer_ref(backref, &mut committed)?;
            }
            self.update_rescue_points(&committed);
        }
        self.last_ts = self.newest_timestamp()?;
        Ok(())
    }

    /// Walk the backward sibling chain starting at `seed`, collecting
    /// refs (in forward order) that are not recorded in any reopened
    /// parent. The walk is bounded by one fanout window.
    fn collect_unreferenced_chain(
        &self,
        level: usize,
        seed: LogicAddr,
    ) -> Result<Vec<SubtreeRef>, StoreError> {
        let known: FxHashSet<LogicAddr> = self
            .extents
            .get(level + 1)
            .map(|extent| match extent {
                Extent::SBlock(e) => e.node.refs().iter().map(|r| r.addr).collect(),
                Extent::Leaf(_) => FxHashSet::default(),
            })
            .unwrap_or_default();
        let mut chain = Vec::new();
        let mut cursor = seed;
        let mut prev_fanout = FANOUT;
        let mut steps = 0u16;
        while !cursor.is_empty() && steps <= FANOUT {
            let (backref, prev) = if level == 0 {
                let view = LeafView::load(&self.store, cursor)?;
                (view.backref(cursor), view.prev_addr())
            } else {
                let node = Superblock::load(&self.store, cursor)?;
                let mut backref = node.summarize()?;
                backref.addr = cursor;
                backref.fanout_index = node.fanout_index();
                (backref, node.prev_addr())
            };
            if backref.fanout_index >= prev_fanout || known.contains(&cursor) {
                // Crossed into the previous fanout window or into refs a
                // reopened parent already records.
                break;
            }
            prev_fanout = backref.fanout_index;
            chain.push(backref);
            cursor = prev;
            steps += 1;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Offer a committed node's ref to its parent level, creating the
    /// level if needed and cascading on overflow.
    fn offer_ref(
        &mut self,
        backref: SubtreeRef,
        committed: &mut Vec<(usize, LogicAddr)>,
    ) -> Result<(), StoreError> {
        let parent = backref.level as usize + 1;
        if parent >= self.extents.len() {
            self.extents
                .push(Extent::SBlock(SBlockExtent::fresh(self.id, parent as u16)));
            self.rescue_points.push(LogicAddr::EMPTY);
        }
        let parent_full = matches!(&self.extents[parent], Extent::SBlock(e) if e.node.is_full());
        if parent_full {
            self.commit_level(parent, false, committed)?;
        }
        match &mut self.extents[parent] {
            Extent::SBlock(e) => e.node.append_ref(backref),
            Extent::Leaf(_) => Err(StoreError::BadArg("leaf extent above level 0")),
        }
    }

    /// Largest timestamp reachable from the restored extents. The
    /// lowest superblock level references the newest committed leaf.
    fn newest_timestamp(&self) -> Result<Option<Timestamp>, StoreError> {
        for extent in self.extents.iter() {
            if let Extent::SBlock(e) = extent {
                if let Some(last) = e.node.refs().last() {
                    return Ok(Some(last.end));
                }
            }
        }
        Ok(None)
    }

    /// Force-commit every dirty extent bottom-to-top and return the
    /// final rescue vector: `EMPTY` everywhere except the root address
    /// in the last slot.
    pub fn close(&mut self) -> Result<Vec<LogicAddr>, StoreError> {
        if !self.initialized || self.unreadable {
            return Ok(self.rescue_points.clone());
        }
        debug!(id = self.id, "closing tree");
        let mut committed = Vec::new();
        for level in 0..self.extents.len() {
            if self.extents[level].is_dirty() {
                self.commit_level(level, true, &mut committed)?;
            }
        }
        if let Some((_, root)) = committed.iter().max_by_key(|(level, _)| *level) {
            let mut result = vec![LogicAddr::EMPTY; self.rescue_points.len()];
            if let Some(slot) = result.last_mut() {
                *slot = *root;
            }
            self.rescue_points = result;
        }
        #[cfg(debug_assertions)]
        self.check_consistency()?;
        self.extents.clear();
        self.initialized = false;
        Ok(self.rescue_points.clone())
    }

    /// Verify the committed tree under the root: child levels, fanout
    /// indices and aggregate sums must all be coherent (invariant check
    /// used by the close path in debug builds and by tests).
    pub fn check_consistency(&self) -> Result<(), StoreError> {
        let Some(root) = self.rescue_points.last().filter(|a| !a.is_empty()) else {
            return Ok(());
        };
        if self.rescue_points.len() < 2 {
            return Ok(());
        }
        self.check_subtree(*root)
    }

    fn check_subtree(&self, addr: LogicAddr) -> Result<(), StoreError> {
        let node = match Superblock::load(&self.store, addr) {
            Ok(node) => node,
            // Recycled subtrees are legal, they are simply gone.
            Err(StoreError::Unavailable(_)) => return Ok(()),
            Err(other) => return Err(other),
        };
        let mut prev_fanout: Option<u16> = None;
        for child in node.refs() {
            // Fanout indices are contiguous; a window may restart at 0
            // where a reopened node gained children after a restart.
            if let Some(prev) = prev_fanout {
                if child.fanout_index != prev + 1 && child.fanout_index != 0 {
                    panic!(
                        "corrupted superblock {addr}: fanout {} after {prev}",
                        child.fanout_index
                    );
                }
            }
            prev_fanout = Some(child.fanout_index);
            if child.level + 1 != node.level() {
                panic!(
                    "corrupted superblock {addr}: child level {} under level {}",
                    child.level,
                    node.level()
                );
            }
            // Recompute the child's aggregates from disk and compare
            // against the stored descriptor.
            let actual = match child.node_type {
                NodeType::Leaf => match LeafView::load(&self.store, child.addr) {
                    Ok(view) => {
                        // Decode the stream and refold, so a stale
                        // header cannot vouch for itself.
                        let (ts, xs) = view.read_all()?;
                        let mut backref = SubtreeRef::empty(self.id, NodeType::Leaf, 0);
                        backref.addr = child.addr;
                        for (ix, t) in ts.iter().enumerate() {
                            if backref.count == 0 {
                                backref.begin = *t;
                            }
                            backref.count += 1;
                            backref.end = *t;
                            backref.sum += xs[ix];
                            backref.min = backref.min.min(xs[ix]);
                            backref.max = backref.max.max(xs[ix]);
                        }
                        backref
                    }
                    Err(StoreError::Unavailable(_)) => continue,
                    Err(other) => return Err(other),
                },
                NodeType::Inner => match Superblock::load(&self.store, child.addr) {
                    Ok(sub) => {
                        self.check_subtree(child.addr)?;
                        let mut backref = sub.summarize()?;
                        backref.addr = child.addr;
                        backref.fanout_index = sub.fanout_index();
                        backref
                    }
                    Err(StoreError::Unavailable(_)) => continue,
                    Err(other) => return Err(other),
                },
            };
            if actual.count != child.count
                || actual.begin != child.begin
                || actual.end != child.end
                || (actual.sum - child.sum).abs() > 1e-6
                || actual.min != child.min
                || actual.max != child.max
            {
                panic!("corrupted superblock {addr}: child {} descriptor mismatch", child.addr);
            }
        }
        Ok(())
    }

    /// Iterate raw points in `[begin, end)`; `begin > end` scans
    /// backwards.
    pub fn search(&self, begin: Timestamp, end: Timestamp) -> Result<BoxedOperator, StoreError> {
        self.require_readable()?;
        let direction = Direction::of(begin, end);
        let mut iters: Vec<BoxedOperator> = Vec::with_capacity(self.extents.len());
        for extent in self.ordered_extents(direction) {
            iters.push(self.extent_scan(extent, begin, end)?);
        }
        Ok(Box::new(ConcatIterator::new(iters, direction)))
    }

    /// One aggregation result covering `[begin, end)`.
    pub fn aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<BoxedAggregateOperator, StoreError> {
        self.require_readable()?;
        let direction = Direction::of(begin, end);
        let mut iters: Vec<BoxedAggregateOperator> = Vec::with_capacity(self.extents.len());
        for extent in self.ordered_extents(direction) {
            iters.push(self.extent_aggregate(extent, begin, end)?);
        }
        Ok(Box::new(CombineAggregateOperator::new(iters, direction)))
    }

    /// Stream of per-bucket aggregates, `step`-wide from `begin`.
    pub fn group_aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<BoxedAggregateOperator, StoreError> {
        self.require_readable()?;
        if step == 0 {
            return Err(StoreError::BadArg("group-aggregate step must be positive"));
        }
        let direction = Direction::of(begin, end);
        let mut iters: Vec<BoxedAggregateOperator> = Vec::with_capacity(self.extents.len());
        for extent in self.ordered_extents(direction) {
            iters.push(self.extent_group_aggregate(extent, begin, end, step)?);
        }
        Ok(Box::new(GroupAggConcat::new(iters, direction)))
    }

    /// Filtering scan over `[begin, end)`.
    pub fn filter(
        &self,
        begin: Timestamp,
        end: Timestamp,
        filter: &ValueFilter,
    ) -> Result<BoxedOperator, StoreError> {
        self.require_readable()?;
        let direction = Direction::of(begin, end);
        let mut iters: Vec<BoxedOperator> = Vec::with_capacity(self.extents.len());
        for extent in self.ordered_extents(direction) {
            iters.push(self.extent_filter(extent, begin, end, filter)?);
        }
        Ok(Box::new(ConcatIterator::new(iters, direction)))
    }

    fn require_readable(&self) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::BadArg("extents list is not initialized"));
        }
        if self.unreadable {
            return Err(StoreError::Unavailable(
                *self.rescue_points.last().unwrap_or(&LogicAddr::EMPTY),
            ));
        }
        Ok(())
    }

    /// Forward scans visit the oldest data first, which lives under the
    /// highest extent.
    fn ordered_extents(&self, direction: Direction) -> Vec<&Extent> {
        match direction {
            Direction::Forward => self.extents.iter().rev().collect(),
            Direction::Backward => self.extents.iter().collect(),
        }
    }

    fn extent_scan(
        &self,
        extent: &Extent,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<BoxedOperator, StoreError> {
        match extent {
            Extent::Leaf(e) => {
                let (ts, xs) = e.leaf.read_all()?;
                Ok(Box::new(LeafIterator::new(ts, xs, begin, end)))
            }
            Extent::SBlock(e) => Ok(Box::new(SBlockIterator::from_refs(
                Arc::clone(&self.store),
                e.node.refs().to_vec(),
                begin,
                end,
            ))),
        }
    }

    fn extent_aggregate(
        &self,
        extent: &Extent,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<BoxedAggregateOperator, StoreError> {
        match extent {
            Extent::Leaf(e) => {
                let (ts, xs) = e.leaf.read_all()?;
                Ok(Box::new(LeafAggregator::from_points(ts, xs, begin, end)))
            }
            Extent::SBlock(e) => Ok(Box::new(SBlockAggregator::from_refs(
                Arc::clone(&self.store),
                e.node.refs().to_vec(),
                begin,
                end,
            ))),
        }
    }

    fn extent_group_aggregate(
        &self,
        extent: &Extent,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<BoxedAggregateOperator, StoreError> {
        match extent {
            Extent::Leaf(e) => {
                let (ts, xs) = e.leaf.read_all()?;
                Ok(Box::new(LeafGroupAggregator::from_points(
                    ts, xs, begin, end, step,
                )))
            }
            Extent::SBlock(e) => Ok(Box::new(SBlockGroupAggregator::from_refs(
                Arc::clone(&self.store),
                e.node.refs().to_vec(),
                begin,
                end,
                step,
            ))),
        }
    }

    fn extent_filter(
        &self,
        extent: &Extent,
        begin: Timestamp,
        end: Timestamp,
        filter: &ValueFilter,
    ) -> Result<BoxedOperator, StoreError> {
        match extent {
            Extent::Leaf(e) => {
                let (ts, xs) = e.leaf.read_all()?;
                Ok(Box::new(LeafFilter::new(ts, xs, begin, end, filter.clone())))
            }
            Extent::SBlock(e) => Ok(Box::new(SBlockFilter::from_refs(
                Arc::clone(&self.store),
                e.node.refs().to_vec(),
                begin,
                end,
                filter.clone(),
            ))),
        }
    }
}
