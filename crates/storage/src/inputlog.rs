use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nacre_common::{LogicAddr, ParamId, Timestamp};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Uncompressed frame size.
pub const WAL_BLOCK_SIZE: usize = 8192;

/// Data-point tuples per data frame.
pub const WAL_NUM_TUPLES: usize = 170;

const FRAME_HEADER_SIZE: usize = 16;
const FLEX_ENTRY_SIZE: usize = 16;
const WAL_MAGIC: u16 = 1;

const FRAME_EMPTY: u16 = 0;
const FRAME_DATA: u16 = 1;
const FRAME_FLEX: u16 = 2;

/// Process-wide monotonic frame sequencer; replay merges shards by the
/// sequence numbers it hands out.
#[derive(Debug, Default)]
pub struct LogSequencer {
    counter: AtomicU64,
}

impl LogSequencer {
    pub fn new() -> Arc<LogSequencer> {
        Arc::new(LogSequencer::default())
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// One decoded input-log record.
#[derive(Debug, Clone, PartialEq)]
pub enum InputLogRecord {
    DataPoint { timestamp: Timestamp, value: f64 },
    SeriesName(String),
    RescuePoints(Vec<LogicAddr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputLogRow {
    pub id: ParamId,
    pub record: InputLogRecord,
}

/// Result of a WAL append: on overflow the caller must close the stale
/// columns, wait for the metadata barrier and then rotate the shard.
#[derive(Debug, Clone, PartialEq)]
pub enum WalAppend {
    Ok,
    Overflow { stale_ids: Vec<ParamId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Data,
    Meta,
}

impl StreamKind {
    fn file_name(self, volume: u32, shard: u32) -> String {
        match self {
            StreamKind::Data => format!("datalog{volume}_{shard}.ils"),
            StreamKind::Meta => format!("metalog{volume}_{shard}.ils"),
        }
    }
}

/// Parse `datalog{V}_{S}.ils` / `metalog{V}_{S}.ils`.
fn parse_file_name(name: &str) -> Option<(StreamKind, u32, u32)> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix("datalog") {
        (StreamKind::Data, rest)
    } else if let Some(rest) = name.strip_prefix("metalog") {
        (StreamKind::Meta, rest)
    } else {
        return None;
    };
    let rest = rest.strip_suffix(".ils")?;
    let (volume, shard) = rest.split_once('_')?;
    Some((kind, volume.parse().ok()?, shard.parse().ok()?))
}

/// In-memory frame being filled by a writer.
#[derive(Debug)]
enum FrameBuf {
    Data {
        ids: Vec<u64>,
        timestamps: Vec<u64>,
        values: Vec<f64>,
    },
    Flex {
        values: Vec<u8>,
        entries: Vec<(u64, i32, u32)>,
    },
}

impl FrameBuf {
    fn new_data() -> FrameBuf {
        FrameBuf::Data {
            ids: Vec::with_capacity(WAL_NUM_TUPLES),
            timestamps: Vec::with_capacity(WAL_NUM_TUPLES),
            values: Vec::with_capacity(WAL_NUM_TUPLES),
        }
    }

    fn new_flex() -> FrameBuf {
        FrameBuf::Flex {
            values: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            FrameBuf::Data { ids, .. } => ids.is_empty(),
            FrameBuf::Flex { entries, .. } => entries.is_empty(),
        }
    }

    fn is_full(&self) -> bool {
        match self {
            FrameBuf::Data { ids, .. } => ids.len() >= WAL_NUM_TUPLES,
            FrameBuf::Flex { .. } => false,
        }
    }

    /// Whether a flex value of `len` bytes still fits next to one more
    /// index entry.
    fn flex_fits(&self, len: usize) -> bool {
        match self {
            FrameBuf::Flex { values, entries } => {
                FRAME_HEADER_SIZE + values.len() + len + FLEX_ENTRY_SIZE * (entries.len() + 1)
                    <= WAL_BLOCK_SIZE
            }
            FrameBuf::Data { .. } => false,
        }
    }

    fn encode(&self, sequence_number: u64) -> Vec<u8> {
        let mut page = vec![0u8; WAL_BLOCK_SIZE];
        let (ftype, size) = match self {
            FrameBuf::Data { ids, .. } => (FRAME_DATA, ids.len() as u32),
            FrameBuf::Flex { entries, .. } => (FRAME_FLEX, entries.len() as u32),
        };
        page[0..2].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        page[2..4].copy_from_slice(&ftype.to_le_bytes());
        page[4..8].copy_from_slice(&size.to_le_bytes());
        page[8..16].copy_from_slice(&sequence_number.to_le_bytes());
        match self {
            FrameBuf::Data {
                ids,
                timestamps,
                values,
            } => {
                let ids_at = FRAME_HEADER_SIZE;
                let ts_at = ids_at + WAL_NUM_TUPLES * 8;
                let xs_at = ts_at + WAL_NUM_TUPLES * 8;
                for (ix, id) in ids.iter().enumerate() {
                    page[ids_at + ix * 8..ids_at + ix * 8 + 8].copy_from_slice(&id.to_le_bytes());
                }
                for (ix, ts) in timestamps.iter().enumerate() {
                    page[ts_at + ix * 8..ts_at + ix * 8 + 8].copy_from_slice(&ts.to_le_bytes());
                }
                for (ix, x) in values.iter().enumerate() {
                    page[xs_at + ix * 8..xs_at + ix * 8 + 8].copy_from_slice(&x.to_le_bytes());
                }
            }
            FrameBuf::Flex { values, entries } => {
                page[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + values.len()].copy_from_slice(values);
                for (ix, (id, len, off)) in entries.iter().enumerate() {
                    let at = WAL_BLOCK_SIZE - FLEX_ENTRY_SIZE * (ix + 1);
                    let len_and_off = ((*len as u32 as u64) << 32) | u64::from(*off);
                    page[at..at + 8].copy_from_slice(&id.to_le_bytes());
                    page[at + 8..at + 16].copy_from_slice(&len_and_off.to_le_bytes());
                }
            }
        }
        page
    }
}

/// Decode one frame into `(sequence_number, rows)`.
fn decode_frame(page: &[u8]) -> Result<(u64, Vec<InputLogRow>), StoreError> {
    if page.len() != WAL_BLOCK_SIZE {
        return Err(StoreError::BadData("bad frame size".into()));
    }
    let u64_at = |at: usize| {
        u64::from_le_bytes([
            page[at],
            page[at + 1],
            page[at + 2],
            page[at + 3],
            page[at + 4],
            page[at + 5],
            page[at + 6],
            page[at + 7],
        ])
    };
    let magic = u16::from_le_bytes([page[0], page[1]]);
    if magic != WAL_MAGIC {
        return Err(StoreError::BadData(format!("bad frame magic {magic}")));
    }
    let ftype = u16::from_le_bytes([page[2], page[3]]);
    let size = u32::from_le_bytes([page[4], page[5], page[6], page[7]]) as usize;
    let seq = u64_at(8);
    let mut rows = Vec::with_capacity(size);
    match ftype {
        FRAME_EMPTY => {}
        FRAME_DATA => {
            if size > WAL_NUM_TUPLES {
                return Err(StoreError::BadData("data frame overflow".into()));
            }
            let ids_at = FRAME_HEADER_SIZE;
            let ts_at = ids_at + WAL_NUM_TUPLES * 8;
            let xs_at = ts_at + WAL_NUM_TUPLES * 8;
            for ix in 0..size {
                rows.push(InputLogRow {
                    id: u64_at(ids_at + ix * 8),
                    record: InputLogRecord::DataPoint {
                        timestamp: u64_at(ts_at + ix * 8),
                        value: f64::from_bits(u64_at(xs_at + ix * 8)),
                    },
                });
            }
        }
        FRAME_FLEX => {
            for ix in 0..size {
                let at = WAL_BLOCK_SIZE
                    .checked_sub(FLEX_ENTRY_SIZE * (ix + 1))
                    .ok_or_else(|| StoreError::BadData("flex frame overflow".into()))?;
                let id = u64_at(at);
                let len_and_off = u64_at(at + 8);
                let len = (len_and_off >> 32) as u32 as i32;
                let off = FRAME_HEADER_SIZE + (len_and_off as u32) as usize;
                let record = if len < 0 {
                    let bytes = page
                        .get(off..off + (-len) as usize)
                        .ok_or_else(|| StoreError::BadData("flex name out of range".into()))?;
                    InputLogRecord::SeriesName(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|_| StoreError::BadData("flex name is not utf-8".into()))?,
                    )
                } else {
                    let n = len as usize;
                    let bytes = page
                        .get(off..off + n * 8)
                        .ok_or_else(|| StoreError::BadData("flex array out of range".into()))?;
                    let points = bytes
                        .chunks_exact(8)
                        .map(|c| {
                            LogicAddr(u64::from_le_bytes([
                                c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                            ]))
                        })
                        .collect();
                    InputLogRecord::RescuePoints(points)
                };
                rows.push(InputLogRow { id, record });
            }
        }
        other => return Err(StoreError::BadData(format!("unknown frame type {other}"))),
    }
    Ok((seq, rows))
}

/// One append-only stream of LZ4-compressed frames.
#[derive(Debug)]
struct LogStream {
    kind: StreamKind,
    file: File,
    path: PathBuf,
    file_size: u64,
    frame: FrameBuf,
}

impl LogStream {
    fn create(dir: &Path, kind: StreamKind, volume: u32, shard: u32) -> Result<Self, StoreError> {
        let path = dir.join(kind.file_name(volume, shard));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "input-log stream created");
        Ok(LogStream {
            kind,
            file,
            path,
            file_size: 0,
            frame: match kind {
                StreamKind::Data => FrameBuf::new_data(),
                StreamKind::Meta => FrameBuf::new_flex(),
            },
        })
    }

    /// LZ4-compress and persist the current frame, then start a new one.
    fn flush_frame(&mut self, sequencer: &LogSequencer) -> Result<(), StoreError> {
        if self.frame.is_empty() {
            return Ok(());
        }
        let page = self.frame.encode(sequencer.next());
        let compressed = lz4_flex::block::compress(&page);
        self.file
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.file.write_all(&compressed)?;
        self.file_size += 4 + compressed.len() as u64;
        self.frame = match self.kind {
            StreamKind::Data => FrameBuf::new_data(),
            StreamKind::Meta => FrameBuf::new_flex(),
        };
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Single-shard write-ahead log: a data stream and a meta stream that
/// rotate together.
#[derive(Debug)]
pub struct InputLog {
    dir: PathBuf,
    shard_id: u32,
    max_volumes: usize,
    volume_size: u64,
    volume_counter: u32,
    sequencer: Arc<LogSequencer>,
    data: LogStream,
    meta: LogStream,
    /// Ids seen in the head data volume.
    head_ids: FxHashSet<ParamId>,
    /// Older volumes, oldest first: (data path, meta path, ids).
    old_volumes: VecDeque<(PathBuf, PathBuf, FxHashSet<ParamId>)>,
}

impl InputLog {
    pub fn create(
        dir: &Path,
        shard_id: u32,
        max_volumes: usize,
        volume_size: u64,
        sequencer: Arc<LogSequencer>,
    ) -> Result<InputLog, StoreError> {
        if max_volumes == 0 {
            return Err(StoreError::BadArg("input log needs at least one volume"));
        }
        let data = LogStream::create(dir, StreamKind::Data, 0, shard_id)?;
        let meta = LogStream::create(dir, StreamKind::Meta, 0, shard_id)?;
        Ok(InputLog {
            dir: dir.to_owned(),
            shard_id,
            max_volumes,
            volume_size,
            volume_counter: 0,
            sequencer,
            data,
            meta,
            head_ids: FxHashSet::default(),
            old_volumes: VecDeque::new(),
        })
    }

    fn overflow_status(&self) -> WalAppend {
        let head_full =
            self.data.file_size >= self.volume_size || self.meta.file_size >= self.volume_size;
        if !head_full {
            return WalAppend::Ok;
        }
        WalAppend::Overflow {
            stale_ids: self.stale_ids(),
        }
    }

    /// Ids that will leave the log on the next rotation: present in the
    /// oldest volume and in no younger one.
    fn stale_ids(&self) -> Vec<ParamId> {
        if self.old_volumes.len() + 1 < self.max_volumes {
            return Vec::new();
        }
        let Some((_, _, oldest)) = self.old_volumes.front() else {
            return Vec::new();
        };
        oldest
            .iter()
            .filter(|id| {
                !self.head_ids.contains(id)
                    && !self
                        .old_volumes
                        .iter()
                        .skip(1)
                        .any(|(_, _, ids)| ids.contains(id))
            })
            .copied()
            .collect()
    }

    /// Append one data point. The point is always recorded; an
    /// `Overflow` result additionally tells the caller to rotate.
    pub fn append(
        &mut self,
        id: ParamId,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<WalAppend, StoreError> {
        if self.data.frame.is_full() {
            self.data.flush_frame(&self.sequencer)?;
        }
        match &mut self.data.frame {
            FrameBuf::Data {
                ids,
                timestamps,
                values,
            } => {
                ids.push(id);
                timestamps.push(timestamp);
                values.push(value);
            }
            FrameBuf::Flex { .. } => {
                return Err(StoreError::BadArg("data stream holds data frames only"))
            }
        }
        self.head_ids.insert(id);
        Ok(self.overflow_status())
    }

    pub fn append_series_name(
        &mut self,
        id: ParamId,
        name: &str,
    ) -> Result<WalAppend, StoreError> {
        self.append_flex(id, -(name.len() as i32), name.as_bytes())
    }

    pub fn append_rescue_points(
        &mut self,
        id: ParamId,
        points: &[LogicAddr],
    ) -> Result<WalAppend, StoreError> {
        let mut bytes = Vec::with_capacity(points.len() * 8);
        for point in points {
            bytes.extend_from_slice(&point.0.to_le_bytes());
        }
        self.append_flex(id, points.len() as i32, &bytes)
    }

    fn append_flex(
        &mut self,
        id: ParamId,
        len: i32,
        bytes: &[u8],
    ) -> Result<WalAppend, StoreError> {
        if FRAME_HEADER_SIZE + bytes.len() + FLEX_ENTRY_SIZE > WAL_BLOCK_SIZE {
            return Err(StoreError::BadArg("flex record does not fit one frame"));
        }
        if !self.meta.frame.flex_fits(bytes.len()) {
            self.meta.flush_frame(&self.sequencer)?;
        }
        match &mut self.meta.frame {
            FrameBuf::Flex { values, entries } => {
                let off = values.len() as u32;
                values.extend_from_slice(bytes);
                entries.push((id, len, off));
            }
            FrameBuf::Data { .. } => {
                return Err(StoreError::BadArg("meta stream holds flex frames only"))
            }
        }
        Ok(self.overflow_status())
    }

    /// Persist the partial head frames.
    pub fn flush(&mut self) -> Result<WalAppend, StoreError> {
        self.data.flush_frame(&self.sequencer)?;
        self.meta.flush_frame(&self.sequencer)?;
        self.data.sync()?;
        self.meta.sync()?;
        Ok(self.overflow_status())
    }

    /// Open a fresh head volume, dropping the oldest one beyond
    /// `max_volumes`.
    pub fn rotate(&mut self) -> Result<(), StoreError> {
        self.data.flush_frame(&self.sequencer)?;
        self.meta.flush_frame(&self.sequencer)?;
        self.data.sync()?;
        self.meta.sync()?;
        let old_ids = std::mem::take(&mut self.head_ids);
        self.old_volumes.push_back((
            self.data.path.clone(),
            self.meta.path.clone(),
            old_ids,
        ));
        while self.old_volumes.len() + 1 > self.max_volumes {
            if let Some((data_path, meta_path, _)) = self.old_volumes.pop_front() {
                info!(path = %data_path.display(), "dropping oldest input-log volume");
                let _ = fs::remove_file(&data_path);
                let _ = fs::remove_file(&meta_path);
            }
        }
        self.volume_counter += 1;
        self.data = LogStream::create(&self.dir, StreamKind::Data, self.volume_counter, self.shard_id)?;
        self.meta = LogStream::create(&self.dir, StreamKind::Meta, self.volume_counter, self.shard_id)?;
        Ok(())
    }

    /// Remove every volume of this shard from disk.
    pub fn delete_files(&mut self) -> Result<(), StoreError> {
        let _ = fs::remove_file(&self.data.path);
        let _ = fs::remove_file(&self.meta.path);
        while let Some((data_path, meta_path, _)) = self.old_volumes.pop_front() {
            let _ = fs::remove_file(&data_path);
            let _ = fs::remove_file(&meta_path);
        }
        Ok(())
    }
}

/// Sequential reader over one shard's stream files (oldest volume
/// first), yielding decoded frames.
#[derive(Debug)]
struct ShardReader {
    files: VecDeque<PathBuf>,
    current: Option<File>,
    rows: VecDeque<InputLogRow>,
    seq: u64,
}

impl ShardReader {
    fn new(files: Vec<PathBuf>) -> ShardReader {
        ShardReader {
            files: files.into(),
            current: None,
            rows: VecDeque::new(),
            seq: u64::MAX,
        }
    }

    /// Ensure a decoded frame is buffered; false when the shard is
    /// exhausted. Undecodable frames are logged and skipped.
    fn fill(&mut self) -> bool {
        while self.rows.is_empty() {
            if self.current.is_none() {
                let Some(path) = self.files.pop_front() else {
                    return false;
                };
                match File::open(&path) {
                    Ok(file) => self.current = Some(file),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "cannot open log volume, skipping");
                        continue;
                    }
                }
            }
            let Some(file) = self.current.as_mut() else {
                return false;
            };
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(_) => {
                    // End of this volume.
                    self.current = None;
                    continue;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut compressed = vec![0u8; len];
            if file.read_exact(&mut compressed).is_err() {
                warn!("truncated input-log frame, skipping rest of volume");
                self.current = None;
                continue;
            }
            match lz4_flex::block::decompress(&compressed, WAL_BLOCK_SIZE)
                .map_err(|e| StoreError::BadData(e.to_string()))
                .and_then(|page| decode_frame(&page))
            {
                Ok((seq, rows)) => {
                    self.seq = seq;
                    self.rows = rows.into();
                }
                Err(err) => {
                    warn!(%err, "undecodable input-log frame, skipping");
                    continue;
                }
            }
        }
        true
    }
}

/// Fan-in reader over every shard of one stream kind, yielding rows
/// ordered by the frames' sequence numbers.
#[derive(Debug)]
pub struct InputLogReader {
    shards: Vec<ShardReader>,
}

impl InputLogReader {
    pub fn next_row(&mut self) -> Option<InputLogRow> {
        let mut best: Option<usize> = None;
        for ix in 0..self.shards.len() {
            if !self.shards[ix].fill() {
                continue;
            }
            best = match best {
                Some(b) if self.shards[b].seq <= self.shards[ix].seq => Some(b),
                _ => Some(ix),
            };
        }
        best.and_then(|ix| self.shards[ix].rows.pop_front())
    }
}

/// Multiplexes one [`InputLog`] per writer thread. A session acquires
/// its shard index once and passes it to every append.
#[derive(Debug)]
pub struct ShardedInputLog {
    shards: Vec<Mutex<InputLog>>,
    round_robin: AtomicU64,
}

impl ShardedInputLog {
    pub fn create(
        dir: &Path,
        concurrency: usize,
        max_volumes: usize,
        volume_size: u64,
    ) -> Result<Arc<ShardedInputLog>, StoreError> {
        if concurrency == 0 {
            return Err(StoreError::BadArg("need at least one shard"));
        }
        let sequencer = LogSequencer::new();
        let mut shards = Vec::with_capacity(concurrency);
        for shard_id in 0..concurrency {
            shards.push(Mutex::new(InputLog::create(
                dir,
                shard_id as u32,
                max_volumes,
                volume_size,
                Arc::clone(&sequencer),
            )?));
        }
        info!(shards = concurrency, max_volumes, volume_size, "input log created");
        Ok(Arc::new(ShardedInputLog {
            shards,
            round_robin: AtomicU64::new(0),
        }))
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Hand out shard indexes round-robin, one per session.
    pub fn assign_shard(&self) -> usize {
        (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize) % self.shards.len()
    }

    pub fn with_shard<R>(
        &self,
        shard: usize,
        f: impl FnOnce(&mut InputLog) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.lock_shard(shard)?;
        f(&mut guard)
    }

    fn lock_shard(&self, shard: usize) -> Result<MutexGuard<'_, InputLog>, StoreError> {
        let slot = self
            .shards
            .get(shard)
            .ok_or(StoreError::BadArg("shard index out of range"))?;
        Ok(match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    pub fn flush_all(&self) -> Result<(), StoreError> {
        for ix in 0..self.shards.len() {
            self.with_shard(ix, |log| log.flush().map(|_| ()))?;
        }
        Ok(())
    }

    pub fn delete_files(&self) -> Result<(), StoreError> {
        for ix in 0..self.shards.len() {
            self.with_shard(ix, |log| log.delete_files())?;
        }
        Ok(())
    }

    /// Count the shards that left logs behind in `dir`.
    pub fn find_logs(dir: &Path) -> Result<usize, StoreError> {
        let mut max_shard: Option<u32> = None;
        if !dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some((_, _, shard)) = parse_file_name(name) {
                    max_shard = Some(max_shard.map_or(shard, |m| m.max(shard)));
                }
            }
        }
        Ok(max_shard.map_or(0, |m| m as usize + 1))
    }

    /// Open a fan-in reader over the on-disk logs for one stream kind.
    fn open_reader(dir: &Path, kind: StreamKind) -> Result<InputLogReader, StoreError> {
        let mut per_shard: Vec<Vec<(u32, PathBuf)>> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some((k, volume, shard)) = parse_file_name(&name) else {
                continue;
            };
            if k != kind {
                continue;
            }
            if per_shard.len() <= shard as usize {
                per_shard.resize_with(shard as usize + 1, Vec::new);
            }
            per_shard[shard as usize].push((volume, entry.path()));
        }
        let shards = per_shard
            .into_iter()
            .map(|mut files| {
                files.sort_by_key(|(volume, _)| *volume);
                ShardReader::new(files.into_iter().map(|(_, path)| path).collect())
            })
            .collect();
        Ok(InputLogReader { shards })
    }

    /// Reader over the meta streams (series names, rescue points).
    pub fn open_meta_reader(dir: &Path) -> Result<InputLogReader, StoreError> {
        Self::open_reader(dir, StreamKind::Meta)
    }

    /// Reader over the data streams.
    pub fn open_data_reader(dir: &Path) -> Result<InputLogReader, StoreError> {
        Self::open_reader(dir, StreamKind::Data)
    }

    /// Remove all log files found in `dir` (after a completed replay).
    pub fn delete_found_logs(dir: &Path) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if parse_file_name(name).is_some() {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn frame_codec_round_trip() {
        let mut frame = FrameBuf::new_data();
        match &mut frame {
            FrameBuf::Data {
                ids,
                timestamps,
                values,
            } => {
                for i in 0..100u64 {
                    ids.push(i % 7);
                    timestamps.push(1000 + i);
                    values.push(i as f64 * 0.25);
                }
            }
            _ => unreachable!(),
        }
        let page = frame.encode(42);
        let (seq, rows) = decode_frame(&page).expect("decode");
        assert_eq!(seq, 42);
        assert_eq!(rows.len(), 100);
        assert_eq!(rows[10].id, 3);
        assert_eq!(
            rows[10].record,
            InputLogRecord::DataPoint {
                timestamp: 1010,
                value: 2.5
            }
        );
    }

    #[test]
    fn flex_frame_codec_round_trip() {
        let mut frame = FrameBuf::new_flex();
        match &mut frame {
            FrameBuf::Flex { values, entries } => {
                let name = b"cpu.user host=alpha";
                let off = values.len() as u32;
                values.extend_from_slice(name);
                entries.push((17, -(name.len() as i32), off));
                let rescue: Vec<u64> = vec![1, u64::MAX, 77];
                let off = values.len() as u32;
                for word in &rescue {
                    values.extend_from_slice(&word.to_le_bytes());
                }
                entries.push((17, rescue.len() as i32, off));
            }
            _ => unreachable!(),
        }
        let page = frame.encode(7);
        let (seq, rows) = decode_frame(&page).expect("decode");
        assert_eq!(seq, 7);
        assert_eq!(
            rows[0].record,
            InputLogRecord::SeriesName("cpu.user host=alpha".into())
        );
        assert_eq!(
            rows[1].record,
            InputLogRecord::RescuePoints(vec![
                LogicAddr(1),
                LogicAddr::EMPTY,
                LogicAddr(77)
            ])
        );
    }

    #[test]
    fn write_flush_read_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let sequencer = LogSequencer::new();
        let mut log =
            InputLog::create(dir.path(), 0, 4, 1 << 20, Arc::clone(&sequencer)).expect("create");
        log.append_series_name(5, "series five").expect("name");
        for ts in 0..1000u64 {
            log.append(5, ts, ts as f64).expect("append");
        }
        log.append_rescue_points(5, &[LogicAddr(3), LogicAddr::EMPTY])
            .expect("rescue");
        log.flush().expect("flush");

        let mut data = ShardedInputLog::open_data_reader(dir.path()).expect("reader");
        let mut count = 0u64;
        while let Some(row) = data.next_row() {
            assert_eq!(row.id, 5);
            match row.record {
                InputLogRecord::DataPoint { timestamp, value } => {
                    assert_eq!(timestamp, count);
                    assert_eq!(value, count as f64);
                }
                other => panic!("unexpected record {other:?}"),
            }
            count += 1;
        }
        assert_eq!(count, 1000);

        let mut meta = ShardedInputLog::open_meta_reader(dir.path()).expect("reader");
        let first = meta.next_row().expect("name row");
        assert_eq!(
            first.record,
            InputLogRecord::SeriesName("series five".into())
        );
        let second = meta.next_row().expect("rescue row");
        assert_eq!(
            second.record,
            InputLogRecord::RescuePoints(vec![LogicAddr(3), LogicAddr::EMPTY])
        );
        assert!(meta.next_row().is_none());
    }

    #[test]
    fn sharded_replay_is_sequence_ordered() {
        let dir = TempDir::new().expect("tempdir");
        let log = ShardedInputLog::create(dir.path(), 2, 4, 1 << 20).expect("create");
        // Interleave writes across the shards; frames flush at
        // different moments but sequence numbers keep the global order
        // recoverable at frame granularity.
        for ts in 0..2000u64 {
            let shard = (ts % 2) as usize;
            log.with_shard(shard, |l| l.append(shard as u64, ts, 1.0).map(|_| ()))
                .expect("append");
        }
        log.flush_all().expect("flush");
        drop(log);

        let mut reader = ShardedInputLog::open_data_reader(dir.path()).expect("reader");
        let mut per_shard_last = [0u64, 0];
        let mut rows = 0;
        while let Some(row) = reader.next_row() {
            let InputLogRecord::DataPoint { timestamp, .. } = row.record else {
                panic!("unexpected record");
            };
            // Within one shard, order must be exact.
            assert!(per_shard_last[row.id as usize] <= timestamp);
            per_shard_last[row.id as usize] = timestamp;
            rows += 1;
        }
        assert_eq!(rows, 2000);
    }

    #[test]
    fn rotation_reports_and_drops_stale_ids() {
        let dir = TempDir::new().expect("tempdir");
        let sequencer = LogSequencer::new();
        // Tiny volumes so a few hundred points overflow them.
        let mut log =
            InputLog::create(dir.path(), 0, 2, 512, Arc::clone(&sequencer)).expect("create");
        let mut rotations = 0;
        let mut saw_stale = false;
        for ts in 0..4000u64 {
            // Id 99 is written once at the start and never again.
            let id = if ts == 0 { 99 } else { ts % 3 };
            match log.append(id, ts, 0.5).expect("append") {
                WalAppend::Ok => {}
                WalAppend::Overflow { stale_ids } => {
                    if rotations >= 1 && !saw_stale {
                        // After the second overflow id 99 only lives in
                        // the oldest volume.
                        saw_stale = stale_ids.contains(&99);
                    }
                    log.rotate().expect("rotate");
                    rotations += 1;
                }
            }
        }
        assert!(rotations >= 2, "expected repeated rotation");
        assert!(saw_stale, "id 99 never reported stale");
        // Only max_volumes volumes remain on disk.
        let files = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with("datalog"))
                    .unwrap_or(false)
            })
            .count();
        assert!(files <= 2);
    }

    #[test]
    fn find_logs_counts_shards() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(ShardedInputLog::find_logs(dir.path()).expect("find"), 0);
        let log = ShardedInputLog::create(dir.path(), 3, 2, 1 << 20).expect("create");
        log.flush_all().expect("flush");
        drop(log);
        assert_eq!(ShardedInputLog::find_logs(dir.path()).expect("find"), 3);
    }
}
