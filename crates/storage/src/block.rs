use bytes::Bytes;
use nacre_common::{LogicAddr, BLOCK_SIZE};

/// One immutable 4 KiB page read from (or about to be written to) the
/// block store.
///
/// The payload is a reference-counted [`Bytes`] buffer, so blocks can be
/// shared between operators without copying and released when the last
/// reader drops its handle.
#[derive(Debug, Clone)]
pub struct Block {
    addr: LogicAddr,
    data: Bytes,
}

impl Block {
    pub fn new(addr: LogicAddr, data: Bytes) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Block { addr, data }
    }

    /// Wrap a fully materialized page that has not been assigned an
    /// address yet.
    pub fn unaddressed(data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Block {
            addr: LogicAddr::EMPTY,
            data: Bytes::from(data),
        }
    }

    pub fn addr(&self) -> LogicAddr {
        self.addr
    }

    pub fn set_addr(&mut self, addr: LogicAddr) {
        self.addr = addr;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}
