//! ## [Lists, Tables, and Properties (LTP) Layer](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/4c24c7d2-5c5a-4b99-88b2-f4b84cc293ae)
//!
//! Heap-on-node, BTree-on-heap, property context, table context and the
//! name-id map, layered on top of `ndb`'s node byte streams.

use std::io;
use thiserror::Error;

pub mod bth;
pub mod heap;
pub mod named_prop;
pub mod prop_context;
pub mod table_context;

#[derive(Error, Debug)]
pub enum LtpError {
    #[error("Node Database error: {0}")]
    NodeDatabaseError(#[from] crate::ndb::NdbError),
    #[error("Invalid HID hidIndex: 0x{0:04X}")]
    InvalidHeapIndex(u16),
    #[error("Invalid HNHDR bSig: 0x{0:02X}")]
    InvalidHeapNodeSignature(u8),
    #[error("Invalid HNHDR bClientSig: 0x{0:02X}")]
    InvalidHeapNodeTypeSignature(u8),
    #[error("Heap allocation of {0} bytes exceeds max page payload")]
    InvalidHeapPageAllocCount(u16),
    #[error("Invalid BTHHEADER bType: {0:?}")]
    InvalidHeapTreeNodeType(crate::ltp::heap::HeapNodeType),
    #[error("Invalid BTHHEADER cbKey: 0x{0:02X}")]
    InvalidHeapTreeKeySize(u8),
    #[error("Invalid BTHHEADER cbEnt: 0x{0:02X}")]
    InvalidHeapTreeDataSize(u8),
    #[error("Invalid PC BTH Record wPropType: 0x{0:04X}")]
    InvalidPropertyType(u16),
    #[error("String is not valid UTF-8: length = 0x{0:X}")]
    StringNotNullTerminated(usize),
    #[error("Row id not found: {0}")]
    RowNotFound(u32),
    #[error("Column not found: prop_id 0x{0:04X}")]
    ColumnNotFound(u16),
    #[error("Cell not set: prop_id 0x{0:04X}")]
    CellNotSet(u16),
    #[error("Column already exists: prop_id 0x{0:04X}")]
    DuplicateColumn(u16),
    #[error("Named property not found: {0:?}")]
    NamedPropertyNotFound(crate::ltp::named_prop::NamedPropertyKey),
}

impl From<LtpError> for io::Error {
    fn from(err: LtpError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

pub type LtpResult<T> = Result<T, LtpError>;
