//! Block id (`BID`): a monotonically increasing id for a physically stored
//! block. Per `spec.md` §6, bit 0 marks "internal" and bit 1 is reserved;
//! the remaining bits are the index. The on-disk width (32 vs 64 bits) is
//! selected by [`FormatVariant`](super::FormatVariant) rather than by a
//! duplicated type per variant.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::{FormatVariant, NdbError};

pub const MAX_BLOCK_INDEX: u64 = 1_u64.rotate_right(2) - 1;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    pub const NONE: BlockId = BlockId(0);

    pub fn new(is_internal: bool, index: u64) -> Result<Self, NdbError> {
        let shifted_index = index.rotate_left(2);
        if shifted_index & 0x3 != 0 {
            return Err(NdbError::InvalidBlockIndex(index));
        }
        Ok(Self(shifted_index | if is_internal { 0x1 } else { 0x0 }))
    }

    pub fn is_internal(&self) -> bool {
        self.0 & 0x1 == 0x1
    }

    pub fn index(&self) -> u64 {
        self.0 >> 2
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn read(f: &mut dyn Read, variant: FormatVariant) -> io::Result<Self> {
        let value = match variant {
            FormatVariant::Ansi => u64::from(f.read_u32::<LittleEndian>()?),
            FormatVariant::Unicode => f.read_u64::<LittleEndian>()?,
        };
        Ok(Self(value))
    }

    pub fn write(&self, f: &mut dyn Write, variant: FormatVariant) -> io::Result<()> {
        match variant {
            FormatVariant::Ansi => {
                let value: u32 = self
                    .0
                    .try_into()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "block id overflow"))?;
                f.write_u32::<LittleEndian>(value)
            }
            FormatVariant::Unicode => f.write_u64::<LittleEndian>(self.0),
        }
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u64 {
    fn from(value: BlockId) -> Self {
        value.0
    }
}
