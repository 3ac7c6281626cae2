use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use nacre_common::{LogicAddr, BLOCK_SIZE};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::error::StoreError;
use crate::volume::{MetaVolume, Volume, VolumeRecord};

/// Aggregate counters reported by a block store.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStoreStats {
    pub block_size: usize,
    pub capacity: u64,
    pub nblocks: u64,
}

pub type PerVolumeStats = Vec<(String, BlockStoreStats)>;

/// Paged persistent block storage addressable by [`LogicAddr`].
///
/// All operations are serialized internally; callers may share one store
/// across threads behind an `Arc`.
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    /// Write one page and return its logical address.
    fn append_block(&self, block: &Block) -> Result<LogicAddr, StoreError>;

    /// Read the page at `addr`. Returns [`StoreError::Unavailable`] when
    /// the address belongs to a recycled generation.
    fn read_block(&self, addr: LogicAddr) -> Result<Block, StoreError>;

    fn exists(&self, addr: LogicAddr) -> bool;

    /// Persist all dirty volumes and the meta-volume.
    fn flush(&self) -> Result<(), StoreError>;

    fn stats(&self) -> BlockStoreStats;

    fn volume_stats(&self) -> PerVolumeStats;

    /// Smallest address that has not been written yet; an exclusive
    /// upper bound on every live address.
    fn top_address(&self) -> LogicAddr;

    /// Checksum used for block payloads.
    fn checksum(&self, data: &[u8]) -> u32 {
        crc32c::crc32c(data)
    }
}

struct FileInner {
    meta: MetaVolume,
    volumes: Vec<Volume>,
    current_volume: u32,
    current_gen: u32,
}

impl FileInner {
    fn open(meta_path: &Path, volume_paths: &[PathBuf]) -> Result<FileInner, StoreError> {
        let meta = MetaVolume::open_existing(meta_path)?;
        if meta.nvolumes() != volume_paths.len() {
            return Err(StoreError::BadData(format!(
                "meta-volume lists {} volumes, {} provided",
                meta.nvolumes(),
                volume_paths.len()
            )));
        }
        let mut volumes = Vec::with_capacity(volume_paths.len());
        for (ix, path) in volume_paths.iter().enumerate() {
            let rec = meta.record(ix as u32)?;
            volumes.push(Volume::open_existing(path, rec.capacity, rec.nblocks)?);
        }
        // Resume at the youngest generation that holds data; an empty
        // store starts at its oldest generation instead.
        let mut newest: Option<(u32, u32)> = None;
        let mut oldest = (meta.record(0)?.generation, 0u32);
        for ix in 0..meta.nvolumes() as u32 {
            let rec = meta.record(ix)?;
            if rec.nblocks > 0 && newest.map_or(true, |(gen, _)| rec.generation > gen) {
                newest = Some((rec.generation, ix));
            }
            if rec.generation < oldest.0 {
                oldest = (rec.generation, ix);
            }
        }
        let (current_gen, current_volume) = newest.unwrap_or(oldest);
        Ok(FileInner {
            meta,
            volumes,
            current_volume,
            current_gen,
        })
    }

    fn append(&mut self, block: &Block) -> Result<LogicAddr, StoreError> {
        let vol = &mut self.volumes[self.current_volume as usize];
        let offset = vol.append_block(block.data())?;
        self.meta.set_nblocks(self.current_volume, vol.nblocks())?;
        Ok(LogicAddr::new(self.current_gen, offset))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        for vol in &self.volumes {
            vol.flush()?;
        }
        self.meta.flush()
    }

    fn stats(&self) -> BlockStoreStats {
        let capacity = self.volumes.iter().map(|v| u64::from(v.capacity())).sum();
        let nblocks = self.volumes.iter().map(|v| u64::from(v.nblocks())).sum();
        BlockStoreStats {
            block_size: BLOCK_SIZE,
            capacity,
            nblocks,
        }
    }

    fn volume_stats(&self) -> PerVolumeStats {
        self.volumes
            .iter()
            .map(|v| {
                (
                    v.path().display().to_string(),
                    BlockStoreStats {
                        block_size: BLOCK_SIZE,
                        capacity: u64::from(v.capacity()),
                        nblocks: u64::from(v.nblocks()),
                    },
                )
            })
            .collect()
    }

    fn top_address(&self) -> LogicAddr {
        LogicAddr::new(
            self.current_gen,
            self.volumes[self.current_volume as usize].nblocks(),
        )
    }
}

/// Block store over a fixed set of volumes; the oldest generation is
/// recycled when the store wraps around.
#[derive(Debug)]
pub struct FixedSizeStore {
    inner: Mutex<FileInner>,
}

impl std::fmt::Debug for FileInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInner")
            .field("current_volume", &self.current_volume)
            .field("current_gen", &self.current_gen)
            .finish()
    }
}

impl FixedSizeStore {
    /// Create volume files and the meta-volume, then open the store.
    pub fn create(
        meta_path: &Path,
        volumes: &[(PathBuf, u32)],
    ) -> Result<Arc<FixedSizeStore>, StoreError> {
        if volumes.is_empty() {
            return Err(StoreError::BadArg("at least one volume is required"));
        }
        let mut records = Vec::with_capacity(volumes.len());
        for (ix, (path, capacity)) in volumes.iter().enumerate() {
            Volume::create_new(path, *capacity)?;
            records.push(VolumeRecord {
                id: ix as u32,
                capacity: *capacity,
                generation: ix as u32,
                nblocks: 0,
            });
        }
        MetaVolume::create_new(meta_path, &records)?;
        info!(volumes = volumes.len(), "fixed-size block store created");
        Self::open(meta_path, &volumes.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>())
    }

    pub fn open(
        meta_path: &Path,
        volume_paths: &[PathBuf],
    ) -> Result<Arc<FixedSizeStore>, StoreError> {
        let inner = FileInner::open(meta_path, volume_paths)?;
        Ok(Arc::new(FixedSizeStore {
            inner: Mutex::new(inner),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, FileInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Advance to the next volume cyclically, recycling its previous
    /// generation if it ever held data.
    fn handle_volume_transition(inner: &mut FileInner) -> Result<(), StoreError> {
        let nvol = inner.volumes.len() as u32;
        inner.current_volume = (inner.current_volume + 1) % nvol;
        let ix = inner.current_volume;
        let rec = inner.meta.record(ix)?;
        if rec.nblocks > 0 {
            let generation = rec.generation + nvol;
            warn!(
                volume = ix,
                old_generation = rec.generation,
                new_generation = generation,
                "recycling oldest volume"
            );
            inner.meta.set_generation(ix, generation)?;
            inner.meta.set_nblocks(ix, 0)?;
            inner.volumes[ix as usize].reset();
            inner.current_gen = generation;
        } else {
            inner.current_gen = rec.generation;
        }
        Ok(())
    }

    fn locate(
        inner: &FileInner,
        addr: LogicAddr,
    ) -> Result<(u32, u32), StoreError> {
        if addr.is_empty() {
            return Err(StoreError::Unavailable(addr));
        }
        let generation = addr.generation();
        let volume = generation % inner.volumes.len() as u32;
        let rec = inner.meta.record(volume)?;
        if rec.generation != generation || addr.offset() >= rec.nblocks {
            return Err(StoreError::Unavailable(addr));
        }
        Ok((volume, addr.offset()))
    }
}

impl BlockStore for FixedSizeStore {
    fn append_block(&self, block: &Block) -> Result<LogicAddr, StoreError> {
        let mut inner = self.lock();
        if inner.volumes[inner.current_volume as usize].is_full() {
            Self::handle_volume_transition(&mut inner)?;
        }
        inner.append(block)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Block, StoreError> {
        let inner = self.lock();
        let (volume, offset) = Self::locate(&inner, addr)?;
        let data = inner.volumes[volume as usize].read_block(offset)?;
        Ok(Block::new(addr, Bytes::from(data)))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        let inner = self.lock();
        Self::locate(&inner, addr).is_ok()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.lock().flush()
    }

    fn stats(&self) -> BlockStoreStats {
        self.lock().stats()
    }

    fn volume_stats(&self) -> PerVolumeStats {
        self.lock().volume_stats()
    }

    fn top_address(&self) -> LogicAddr {
        self.lock().top_address()
    }
}

/// Block store that grows by whole volume files instead of recycling.
///
/// The generation of an address is the index of its volume, so nothing
/// is ever overwritten.
#[derive(Debug)]
pub struct ExpandableStore {
    inner: Mutex<FileInner>,
    dir: PathBuf,
    basename: String,
}

impl ExpandableStore {
    pub fn create(
        dir: &Path,
        basename: &str,
        capacity: u32,
    ) -> Result<Arc<ExpandableStore>, StoreError> {
        let vol_path = Self::volume_path(dir, basename, 0);
        Volume::create_new(&vol_path, capacity)?;
        let records = [VolumeRecord {
            id: 0,
            capacity,
            generation: 0,
            nblocks: 0,
        }];
        MetaVolume::create_new(&Self::meta_path(dir, basename), &records)?;
        info!(dir = %dir.display(), "expandable block store created");
        Self::open(dir, basename)
    }

    pub fn open(dir: &Path, basename: &str) -> Result<Arc<ExpandableStore>, StoreError> {
        let meta = MetaVolume::open_existing(&Self::meta_path(dir, basename))?;
        let paths: Vec<PathBuf> = (0..meta.nvolumes() as u32)
            .map(|ix| Self::volume_path(dir, basename, ix))
            .collect();
        drop(meta);
        let mut inner = FileInner::open(&Self::meta_path(dir, basename), &paths)?;
        // The youngest volume is always the writable head here, even
        // when it is still empty.
        let last = inner.volumes.len() as u32 - 1;
        inner.current_volume = last;
        inner.current_gen = inner.meta.record(last)?.generation;
        Ok(Arc::new(ExpandableStore {
            inner: Mutex::new(inner),
            dir: dir.to_owned(),
            basename: basename.to_owned(),
        }))
    }

    pub fn meta_path(dir: &Path, basename: &str) -> PathBuf {
        dir.join(format!("{basename}.metavol"))
    }

    pub fn volume_path(dir: &Path, basename: &str, ix: u32) -> PathBuf {
        dir.join(format!("{basename}_{ix}.vol"))
    }

    fn lock(&self) -> MutexGuard<'_, FileInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create the next volume, sized like the previously registered one.
    fn grow(&self, inner: &mut FileInner) -> Result<(), StoreError> {
        let next = inner.volumes.len() as u32;
        let capacity = inner.meta.record(next - 1)?.capacity;
        let path = Self::volume_path(&self.dir, &self.basename, next);
        let volume = Volume::create_new(&path, capacity)?;
        inner.meta.add_volume(VolumeRecord {
            id: next,
            capacity,
            generation: next,
            nblocks: 0,
        })?;
        inner.volumes.push(volume);
        inner.current_volume = next;
        inner.current_gen = next;
        debug!(volume = next, "expandable store grew");
        Ok(())
    }

    fn locate(inner: &FileInner, addr: LogicAddr) -> Result<(u32, u32), StoreError> {
        if addr.is_empty() {
            return Err(StoreError::Unavailable(addr));
        }
        let volume = addr.generation();
        if volume as usize >= inner.volumes.len() {
            return Err(StoreError::Unavailable(addr));
        }
        let rec = inner.meta.record(volume)?;
        if rec.generation != volume || addr.offset() >= rec.nblocks {
            return Err(StoreError::Unavailable(addr));
        }
        Ok((volume, addr.offset()))
    }
}

impl BlockStore for ExpandableStore {
    fn append_block(&self, block: &Block) -> Result<LogicAddr, StoreError> {
        let mut inner = self.lock();
        if inner.volumes[inner.current_volume as usize].is_full() {
            self.grow(&mut inner)?;
        }
        inner.append(block)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Block, StoreError> {
        let inner = self.lock();
        let (volume, offset) = Self::locate(&inner, addr)?;
        let data = inner.volumes[volume as usize].read_block(offset)?;
        Ok(Block::new(addr, Bytes::from(data)))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        let inner = self.lock();
        Self::locate(&inner, addr).is_ok()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.lock().flush()
    }

    fn stats(&self) -> BlockStoreStats {
        self.lock().stats()
    }

    fn volume_stats(&self) -> PerVolumeStats {
        self.lock().volume_stats()
    }

    fn top_address(&self) -> LogicAddr {
        self.lock().top_address()
    }
}

#[derive(Debug, Default)]
struct MemInner {
    buffer: Vec<u8>,
    write_pos: u32,
    removed_pos: u32,
}

/// Memory-resident block store for tests.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Arc<MemStore> {
        Arc::new(MemStore::default())
    }

    /// Simulate recycling of every block below `first_live` blocks.
    pub fn remove(&self, first_live: u32) {
        let mut inner = self.lock();
        inner.removed_pos = inner.removed_pos.max(first_live);
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BlockStore for MemStore {
    fn append_block(&self, block: &Block) -> Result<LogicAddr, StoreError> {
        let mut inner = self.lock();
        inner.buffer.extend_from_slice(block.data());
        let offset = inner.write_pos;
        inner.write_pos += 1;
        Ok(LogicAddr::new(0, offset))
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Block, StoreError> {
        let inner = self.lock();
        if addr.is_empty()
            || addr.generation() != 0
            || addr.offset() >= inner.write_pos
            || addr.offset() < inner.removed_pos
        {
            return Err(StoreError::Unavailable(addr));
        }
        let at = addr.offset() as usize * BLOCK_SIZE;
        let data = Bytes::copy_from_slice(&inner.buffer[at..at + BLOCK_SIZE]);
        Ok(Block::new(addr, data))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        let inner = self.lock();
        !addr.is_empty()
            && addr.generation() == 0
            && addr.offset() < inner.write_pos
            && addr.offset() >= inner.removed_pos
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn stats(&self) -> BlockStoreStats {
        let inner = self.lock();
        BlockStoreStats {
            block_size: BLOCK_SIZE,
            capacity: u64::from(inner.write_pos),
            nblocks: u64::from(inner.write_pos),
        }
    }

    fn volume_stats(&self) -> PerVolumeStats {
        vec![("memory".to_string(), self.stats())]
    }

    fn top_address(&self) -> LogicAddr {
        LogicAddr::new(0, self.lock().write_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page(fill: u8) -> Block {
        Block::unaddressed(vec![fill; BLOCK_SIZE])
    }

    fn fixed_store(dir: &TempDir, nvol: u32, capacity: u32) -> Arc<FixedSizeStore> {
        let vols: Vec<(PathBuf, u32)> = (0..nvol)
            .map(|ix| (dir.path().join(format!("db_{ix}.vol")), capacity))
            .collect();
        FixedSizeStore::create(&dir.path().join("db.metavol"), &vols).expect("create")
    }

    #[test]
    fn fixed_store_append_read_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = fixed_store(&dir, 2, 4);
        let addr = store.append_block(&page(0x11)).expect("append");
        assert_eq!(addr, LogicAddr::new(0, 0));
        let block = store.read_block(addr).expect("read");
        assert_eq!(block.data()[0], 0x11);
        assert!(store.exists(addr));
        assert!(!store.exists(LogicAddr::new(0, 1)));
    }

    #[test]
    fn fixed_store_recycles_oldest_generation() {
        let dir = TempDir::new().expect("tempdir");
        let store = fixed_store(&dir, 2, 2);
        let mut addrs = Vec::new();
        // Fill both volumes, then wrap into the first one again.
        for fill in 0..6u8 {
            addrs.push(store.append_block(&page(fill)).expect("append"));
        }
        // Generation sequence: 0,0 then 1,1 then 2,2 (volume 0 recycled).
        assert_eq!(addrs[4].generation(), 2);
        assert!(!store.exists(addrs[0]));
        assert!(matches!(
            store.read_block(addrs[0]),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.exists(addrs[4]));
        assert_eq!(store.read_block(addrs[5]).expect("read").data()[0], 5);
    }

    #[test]
    fn fixed_store_reopen_resumes_at_youngest_generation() {
        let dir = TempDir::new().expect("tempdir");
        let paths: Vec<PathBuf> = (0..2).map(|ix| dir.path().join(format!("db_{ix}.vol"))).collect();
        {
            let store = fixed_store(&dir, 2, 2);
            for fill in 0..3u8 {
                store.append_block(&page(fill)).expect("append");
            }
            store.flush().expect("flush");
        }
        let store =
            FixedSizeStore::open(&dir.path().join("db.metavol"), &paths).expect("reopen");
        let addr = store.append_block(&page(9)).expect("append");
        assert_eq!(addr, LogicAddr::new(1, 1));
    }

    #[test]
    fn expandable_store_grows_instead_of_recycling() {
        let dir = TempDir::new().expect("tempdir");
        let store = ExpandableStore::create(dir.path(), "db", 2).expect("create");
        let mut addrs = Vec::new();
        for fill in 0..5u8 {
            addrs.push(store.append_block(&page(fill)).expect("append"));
        }
        assert_eq!(addrs[4], LogicAddr::new(2, 0));
        // Nothing was lost.
        for (ix, addr) in addrs.iter().enumerate() {
            assert_eq!(store.read_block(*addr).expect("read").data()[0], ix as u8);
        }
        assert_eq!(store.stats().capacity, 6);
    }

    #[test]
    fn memstore_remove_marks_blocks_unavailable() {
        let store = MemStore::new();
        let a0 = store.append_block(&page(1)).expect("append");
        let a1 = store.append_block(&page(2)).expect("append");
        store.remove(1);
        assert!(!store.exists(a0));
        assert!(store.exists(a1));
        assert!(matches!(
            store.read_block(a0),
            Err(StoreError::Unavailable(_))
        ));
    }
}
