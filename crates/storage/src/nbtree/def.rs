use nacre_common::{LogicAddr, ParamId, Timestamp, BLOCK_SIZE, NACRE_VERSION};

use crate::block::Block;
use crate::error::StoreError;

/// Size of the packed [`SubtreeRef`] header at byte 0 of every block.
pub const SUBTREE_REF_SIZE: usize = 110;

/// Bytes left for the payload after the header.
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - SUBTREE_REF_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeType {
    Leaf = 0,
    Inner = 1,
}

impl TryFrom<u16> for NodeType {
    type Error = StoreError;

    fn try_from(raw: u16) -> Result<Self, StoreError> {
        match raw {
            0 => Ok(NodeType::Leaf),
            1 => Ok(NodeType::Inner),
            other => Err(StoreError::BadData(format!("unknown node type {other}"))),
        }
    }
}

/// Fixed-size descriptor of a tree node.
///
/// Serves both as the self-header at byte 0 of a committed block and as
/// the child entry inside a parent superblock. The aggregate fields
/// describe the whole subtree under the node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeRef {
    pub count: u64,
    pub id: ParamId,
    pub begin: Timestamp,
    pub end: Timestamp,
    /// Previous sibling of the same series and level.
    pub addr: LogicAddr,
    pub min: f64,
    pub min_time: Timestamp,
    pub max: f64,
    pub max_time: Timestamp,
    pub sum: f64,
    pub first: f64,
    pub last: f64,
    pub node_type: NodeType,
    pub level: u16,
    pub payload_size: u16,
    pub version: u16,
    pub fanout_index: u16,
    pub checksum: u32,
}

impl SubtreeRef {
    pub fn empty(id: ParamId, node_type: NodeType, level: u16) -> Self {
        SubtreeRef {
            count: 0,
            id,
            begin: 0,
            end: 0,
            addr: LogicAddr::EMPTY,
            min: f64::MAX,
            min_time: 0,
            max: f64::MIN,
            max_time: 0,
            sum: 0.0,
            first: 0.0,
            last: 0.0,
            node_type,
            level,
            payload_size: 0,
            version: NACRE_VERSION,
            fanout_index: 0,
            checksum: 0,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= SUBTREE_REF_SIZE);
        out[0..8].copy_from_slice(&self.count.to_le_bytes());
        out[8..16].copy_from_slice(&self.id.to_le_bytes());
        out[16..24].copy_from_slice(&self.begin.to_le_bytes());
        out[24..32].copy_from_slice(&self.end.to_le_bytes());
        out[32..40].copy_from_slice(&self.addr.0.to_le_bytes());
        out[40..48].copy_from_slice(&self.min.to_le_bytes());
        out[48..56].copy_from_slice(&self.min_time.to_le_bytes());
        out[56..64].copy_from_slice(&self.max.to_le_bytes());
        out[64..72].copy_from_slice(&self.max_time.to_le_bytes());
        out[72..80].copy_from_slice(&self.sum.to_le_bytes());
        out[80..88].copy_from_slice(&self.first.to_le_bytes());
        out[88..96].copy_from_slice(&self.last.to_le_bytes());
        out[96..98].copy_from_slice(&(self.node_type as u16).to_le_bytes());
        out[98..100].copy_from_slice(&self.level.to_le_bytes());
        out[100..102].copy_from_slice(&self.payload_size.to_le_bytes());
        out[102..104].copy_from_slice(&self.version.to_le_bytes());
        out[104..106].copy_from_slice(&self.fanout_index.to_le_bytes());
        out[106..110].copy_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<SubtreeRef, StoreError> {
        if buf.len() < SUBTREE_REF_SIZE {
            return Err(StoreError::BadData("truncated subtree ref".into()));
        }
        let u64_at = |at: usize| {
            u64::from_le_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ])
        };
        let u16_at = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        Ok(SubtreeRef {
            count: u64_at(0),
            id: u64_at(8),
            begin: u64_at(16),
            end: u64_at(24),
            addr: LogicAddr(u64_at(32)),
            min: f64::from_bits(u64_at(40)),
            min_time: u64_at(48),
            max: f64::from_bits(u64_at(56)),
            max_time: u64_at(64),
            sum: f64::from_bits(u64_at(72)),
            first: f64::from_bits(u64_at(80)),
            last: f64::from_bits(u64_at(88)),
            node_type: NodeType::try_from(u16_at(96))?,
            level: u16_at(98),
            payload_size: u16_at(100),
            version: u16_at(102),
            fanout_index: u16_at(104),
            checksum: u32::from_le_bytes([buf[106], buf[107], buf[108], buf[109]]),
        })
    }

    /// True when `[begin, end]` intersects the closed query interval.
    pub fn overlaps(&self, lo: Timestamp, hi: Timestamp) -> bool {
        !(self.end < lo || hi < self.begin)
    }
}

/// Parse and verify the header of a committed block: version, checksum
/// over the payload region and, when given, the expected node type.
pub fn checked_header(block: &Block, expect: Option<NodeType>) -> Result<SubtreeRef, StoreError> {
    let header = SubtreeRef::read_from(block.data())?;
    if header.version != NACRE_VERSION {
        return Err(StoreError::BadData(format!(
            "unsupported block version {}",
            header.version
        )));
    }
    let payload_end = SUBTREE_REF_SIZE + header.payload_size as usize;
    if payload_end > BLOCK_SIZE {
        return Err(StoreError::BadData("payload size out of range".into()));
    }
    let actual = crc32c::crc32c(&block.data()[SUBTREE_REF_SIZE..payload_end]);
    if actual != header.checksum {
        return Err(StoreError::BadData(format!(
            "block {} checksum mismatch: {actual:#x} != {:#x}",
            block.addr(),
            header.checksum
        )));
    }
    if let Some(expected) = expect {
        if header.node_type != expected {
            return Err(StoreError::BadData(format!(
                "expected {expected:?} node, found {:?}",
                header.node_type
            )));
        }
    }
    Ok(header)
}

/// Assemble a page from a header and payload, filling in payload size
/// and checksum.
pub fn build_block(mut header: SubtreeRef, payload: &[u8]) -> Result<Block, StoreError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StoreError::BadArg("payload does not fit one page"));
    }
    header.payload_size = payload.len() as u16;
    header.checksum = crc32c::crc32c(payload);
    let mut page = vec![0u8; BLOCK_SIZE];
    header.write_to(&mut page[..SUBTREE_REF_SIZE]);
    page[SUBTREE_REF_SIZE..SUBTREE_REF_SIZE + payload.len()].copy_from_slice(payload);
    Ok(Block::unaddressed(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_ref_codec_round_trip() {
        let mut reference = SubtreeRef::empty(42, NodeType::Inner, 3);
        reference.count = 1000;
        reference.begin = 17;
        reference.end = 9000;
        reference.addr = LogicAddr::new(2, 55);
        reference.min = -1.5;
        reference.min_time = 20;
        reference.max = 88.25;
        reference.max_time = 8000;
        reference.sum = 1234.5;
        reference.first = -1.0;
        reference.last = 3.5;
        reference.payload_size = 330;
        reference.fanout_index = 7;
        reference.checksum = 0xdeadbeef;

        let mut buf = [0u8; SUBTREE_REF_SIZE];
        reference.write_to(&mut buf);
        let decoded = SubtreeRef::read_from(&buf).expect("decode");
        assert_eq!(decoded, reference);
    }

    #[test]
    fn checked_header_rejects_corruption() {
        let header = SubtreeRef::empty(1, NodeType::Leaf, 0);
        let block = build_block(header, &[1, 2, 3]).expect("build");
        assert!(checked_header(&block, Some(NodeType::Leaf)).is_ok());

        let mut raw = block.data().to_vec();
        raw[SUBTREE_REF_SIZE] ^= 0xff;
        let tampered = Block::unaddressed(raw);
        assert!(matches!(
            checked_header(&tampered, Some(NodeType::Leaf)),
            Err(StoreError::BadData(_))
        ));
    }

    #[test]
    fn overlap_test_is_inclusive() {
        let mut reference = SubtreeRef::empty(1, NodeType::Leaf, 0);
        reference.begin = 100;
        reference.end = 200;
        assert!(reference.overlaps(200, 300));
        assert!(reference.overlaps(50, 100));
        assert!(reference.overlaps(150, 160));
        assert!(!reference.overlaps(201, 300));
        assert!(!reference.overlaps(0, 99));
    }
}
