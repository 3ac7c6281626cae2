use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nacre_common::BLOCK_SIZE;
use tracing::debug;

use crate::error::StoreError;

/// Fixed-capacity append-only page file.
///
/// A volume never shrinks; recycling is expressed by resetting the write
/// position and bumping the generation recorded in the meta-volume.
#[derive(Debug)]
pub struct Volume {
    file: File,
    path: PathBuf,
    capacity: u32,
    write_pos: u32,
}

impl Volume {
    /// Create a new volume file preallocated to `capacity` blocks.
    pub fn create_new(path: &Path, capacity: u32) -> Result<Volume, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(capacity) * BLOCK_SIZE as u64)?;
        debug!(path = %path.display(), capacity, "volume created");
        Ok(Volume {
            file,
            path: path.to_owned(),
            capacity,
            write_pos: 0,
        })
    }

    /// Open an existing volume. `write_pos` comes from the meta-volume,
    /// which is the source of truth for how many blocks are live.
    pub fn open_existing(path: &Path, capacity: u32, write_pos: u32) -> Result<Volume, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Volume {
            file,
            path: path.to_owned(),
            capacity,
            write_pos,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn nblocks(&self) -> u32 {
        self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.write_pos == self.capacity
    }

    /// Append one block, returning its offset within the volume.
    pub fn append_block(&mut self, data: &[u8]) -> Result<u32, StoreError> {
        if data.len() != BLOCK_SIZE {
            return Err(StoreError::BadArg("block must be exactly one page"));
        }
        if self.is_full() {
            return Err(StoreError::Overflow);
        }
        let offset = self.write_pos;
        self.file
            .write_all_at(data, u64::from(offset) * BLOCK_SIZE as u64)?;
        self.write_pos += 1;
        Ok(offset)
    }

    pub fn read_block(&self, offset: u32) -> Result<Vec<u8>, StoreError> {
        if offset >= self.write_pos {
            return Err(StoreError::BadArg("block offset out of range"));
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file
            .read_exact_at(&mut buf, u64::from(offset) * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    /// Drop all content; the caller is responsible for bumping the
    /// generation in the meta-volume.
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }
}

const META_RECORD_SIZE: usize = 32;

/// Per-volume bookkeeping stored in the meta-volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRecord {
    pub id: u32,
    pub capacity: u32,
    pub generation: u32,
    pub nblocks: u32,
}

impl VolumeRecord {
    fn encode(&self) -> [u8; META_RECORD_SIZE] {
        let mut buf = [0u8; META_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.capacity.to_le_bytes());
        buf[8..12].copy_from_slice(&self.generation.to_le_bytes());
        buf[12..16].copy_from_slice(&self.nblocks.to_le_bytes());
        let crc = crc32c::crc32c(&buf[0..META_RECORD_SIZE - 4]);
        buf[META_RECORD_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<VolumeRecord, StoreError> {
        let stored = u32::from_le_bytes(
            buf[META_RECORD_SIZE - 4..META_RECORD_SIZE]
                .try_into()
                .map_err(|_| StoreError::BadData("short meta record".into()))?,
        );
        let actual = crc32c::crc32c(&buf[0..META_RECORD_SIZE - 4]);
        if stored != actual {
            return Err(StoreError::BadData(format!(
                "meta-volume record checksum mismatch: {stored:#x} != {actual:#x}"
            )));
        }
        let word =
            |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(VolumeRecord {
            id: word(0),
            capacity: word(4),
            generation: word(8),
            nblocks: word(12),
        })
    }
}

/// Small fixed file that records generation and block count per volume.
#[derive(Debug)]
pub struct MetaVolume {
    file: File,
    path: PathBuf,
    records: Vec<VolumeRecord>,
    dirty: Vec<bool>,
}

impl MetaVolume {
    pub fn create_new(path: &Path, records: &[VolumeRecord]) -> Result<MetaVolume, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut meta = MetaVolume {
            file,
            path: path.to_owned(),
            records: records.to_vec(),
            dirty: vec![true; records.len()],
        };
        meta.flush()?;
        Ok(meta)
    }

    pub fn open_existing(path: &Path) -> Result<MetaVolume, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len % META_RECORD_SIZE != 0 {
            return Err(StoreError::BadData("truncated meta-volume".into()));
        }
        let count = len / META_RECORD_SIZE;
        let mut records = Vec::with_capacity(count);
        let mut buf = [0u8; META_RECORD_SIZE];
        for ix in 0..count {
            file.read_exact_at(&mut buf, (ix * META_RECORD_SIZE) as u64)?;
            records.push(VolumeRecord::decode(&buf)?);
        }
        Ok(MetaVolume {
            file,
            path: path.to_owned(),
            dirty: vec![false; records.len()],
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nvolumes(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, id: u32) -> Result<VolumeRecord, StoreError> {
        self.records
            .get(id as usize)
            .copied()
            .ok_or(StoreError::BadArg("unknown volume id"))
    }

    pub fn set_nblocks(&mut self, id: u32, nblocks: u32) -> Result<(), StoreError> {
        let rec = self
            .records
            .get_mut(id as usize)
            .ok_or(StoreError::BadArg("unknown volume id"))?;
        rec.nblocks = nblocks;
        self.dirty[id as usize] = true;
        Ok(())
    }

    pub fn set_generation(&mut self, id: u32, generation: u32) -> Result<(), StoreError> {
        let rec = self
            .records
            .get_mut(id as usize)
            .ok_or(StoreError::BadArg("unknown volume id"))?;
        rec.generation = generation;
        self.dirty[id as usize] = true;
        Ok(())
    }

    /// Register one more volume (expandable stores only).
    pub fn add_volume(&mut self, record: VolumeRecord) -> Result<(), StoreError> {
        if record.id as usize != self.records.len() {
            return Err(StoreError::BadArg("volume ids must be contiguous"));
        }
        self.records.push(record);
        self.dirty.push(true);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        for (ix, rec) in self.records.iter().enumerate() {
            if self.dirty[ix] {
                self.file
                    .write_all_at(&rec.encode(), (ix * META_RECORD_SIZE) as u64)?;
            }
        }
        self.file.sync_data()?;
        for flag in &mut self.dirty {
            *flag = false;
        }
        Ok(())
    }
}
