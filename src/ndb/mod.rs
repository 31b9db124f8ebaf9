//! Node Database (NDB) layer: page allocation, block graph, node/subnode
//! trees, and snapshot contexts. See `spec.md` §4.1-4.5.

use std::io;
use thiserror::Error;

pub mod amap;
pub mod block;
pub mod block_id;
pub mod block_store;
pub mod btree;
pub mod context;
pub mod header;
pub mod node;
pub mod node_id;
pub mod page;

/// Every page is this many bytes (`spec.md` §3: "page size `P = 512`").
pub const PAGE_SIZE: usize = 512;

/// `spec.md` §3: "ANSI/Unicode flavor byte layouts (treated as a
/// `format_variant` enum parameterising field widths)". `Ansi` encodes
/// block ids in 32 bits, `Unicode` in 64 bits; node ids are always 32 bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FormatVariant {
    Ansi,
    Unicode,
}

impl FormatVariant {
    pub fn block_id_size(self) -> usize {
        match self {
            FormatVariant::Ansi => 4,
            FormatVariant::Unicode => 8,
        }
    }

    /// Size of a [`crate::ndb::block::BlockTrailer`] for this variant.
    pub fn block_trailer_size(self) -> usize {
        // raw_size: u16, signature: u16, crc: u32, block_id: variant-width
        2 + 2 + 4 + self.block_id_size()
    }

    /// Size of a [`crate::ndb::page::PageTrailer`] for this variant.
    pub fn page_trailer_size(self) -> usize {
        // page_type: u8, signature: u16, crc: u32, block_id: variant-width
        1 + 2 + 4 + self.block_id_size()
    }
}

#[derive(Error, Debug)]
pub enum NdbError {
    #[error("Invalid nidType: 0x{0:02X}")]
    InvalidNodeIdType(u8),
    #[error("Invalid nidIndex: 0x{0:08X}")]
    InvalidNodeIndex(u32),
    #[error("Invalid bidIndex: 0x{0:016X}")]
    InvalidBlockIndex(u64),
    #[error("Invalid PAGETRAILER ptype: 0x{0:02X}")]
    InvalidPageType(u8),
    #[error("Invalid PAGETRAILER dwCRC: 0x{0:08X} (expected 0x{1:08X})")]
    InvalidPageCrc(u32, u32),
    #[error("Invalid BLOCKTRAILER cb: 0x{0:04X}")]
    InvalidBlockSize(u16),
    #[error("Invalid BLOCKTRAILER dwCRC: 0x{0:08X} (expected 0x{1:08X})")]
    InvalidBlockCrc(u32, u32),
    #[error("Invalid block type tag: 0x{0:02X}")]
    InvalidBlockType(u8),
    #[error("Invalid data-tree level: {0}")]
    InvalidDataTreeLevel(u8),
    #[error("Page at offset 0x{0:X} is past end of file")]
    UnexpectedPage(u64),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Key not found: node id {0:?}")]
    NodeKeyNotFound(node_id::NodeId),
    #[error("Key not found: block id {0:?}")]
    BlockKeyNotFound(block_id::BlockId),
    #[error("Duplicate key: node id {0:?}")]
    DuplicateNodeKey(node_id::NodeId),
    #[error("Duplicate key: block id {0:?}")]
    DuplicateBlockKey(block_id::BlockId),
    #[error("Node save rejected: concurrent commit changed {0:?}")]
    NodeSaveError(node_id::NodeId),
    #[error("Invalid HEADER dwMagic: 0x{0:08X}")]
    InvalidHeaderMagic(u32),
    #[error("Header CRC mismatch")]
    InvalidHeaderCrc,
    #[error("Both header copies are corrupt")]
    BothHeadersCorrupt,
    #[error("Format error: {0}")]
    FormatError(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<&NdbError> for io::Error {
    fn from(err: &NdbError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err.to_string())
    }
}

impl From<NdbError> for io::Error {
    fn from(err: NdbError) -> io::Error {
        match err {
            NdbError::Io(err) => err,
            err => io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
        }
    }
}

pub type NdbResult<T> = Result<T, NdbError>;
