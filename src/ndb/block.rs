//! Blocks: the physically stored, ref-counted unit backing node data
//! streams, subnode dictionaries, and data trees. `spec.md` §3: "Block is
//! a physically stored buffer addressed by a `block_id` ... Variants:
//! external, subnode_leaf / subnode_internal, data_tree_internal."
//!
//! Every variant shares one on-disk shape: a byte buffer rounded up to a
//! 64-byte boundary, followed by a [`BlockTrailer`]. `spec.md` §9 collapses
//! what would otherwise be a trait-per-variant hierarchy into this tagged
//! enum, matched on instead of dispatched virtually.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::{block_id::BlockId, node_id::NodeId, FormatVariant, NdbError, NdbResult};
use crate::crc::compute_crc;

/// Block buffers round up to this granularity before the trailer, same
/// slot size the allocation map itself uses.
const BLOCK_ALIGN: u16 = 64;

pub const fn aligned_block_len(raw_size: u16, trailer_size: u16) -> u16 {
    let total = raw_size + trailer_size;
    let tail = total % BLOCK_ALIGN;
    if tail == 0 {
        total
    } else {
        total - tail + BLOCK_ALIGN
    }
}

/// Largest payload an external block may carry before it must be split
/// into a data tree (`spec.md` §4.2: "sibling external blocks of size
/// `max_block_payload`").
pub fn max_block_payload(variant: FormatVariant) -> usize {
    super::PAGE_SIZE - variant.block_trailer_size()
}

/// `spec.md` §3: "block_trailer {raw size, id, signature, CRC}".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockTrailer {
    pub raw_size: u16,
    pub signature: u16,
    pub crc: u32,
    pub block_id: BlockId,
}

impl BlockTrailer {
    pub fn read(f: &mut dyn Read, variant: FormatVariant) -> io::Result<Self> {
        let raw_size = f.read_u16::<LittleEndian>()?;
        let signature = f.read_u16::<LittleEndian>()?;
        let crc = f.read_u32::<LittleEndian>()?;
        let block_id = BlockId::read(f, variant)?;
        Ok(Self {
            raw_size,
            signature,
            crc,
            block_id,
        })
    }

    pub fn write(&self, f: &mut dyn Write, variant: FormatVariant) -> io::Result<()> {
        f.write_u16::<LittleEndian>(self.raw_size)?;
        f.write_u16::<LittleEndian>(self.signature)?;
        f.write_u32::<LittleEndian>(self.crc)?;
        self.block_id.write(f, variant)
    }
}

/// One child of a [`Block::DataTreeInternal`]: the byte offset (within the
/// logical stream) where this child's span begins, and the block id that
/// holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataTreeEntry {
    pub start_offset: u64,
    pub child_id: BlockId,
}

/// One entry of a [`Block::SubnodeLeaf`]: `spec.md` §4.4 "subnodes form a
/// B+ tree keyed by `node_id`".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnodeLeafEntry {
    pub nid: NodeId,
    pub data_bid: BlockId,
    pub subnode_bid: BlockId,
}

/// One entry of a [`Block::SubnodeInternal`]: the lowest key reachable
/// through `child_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnodeInternalEntry {
    pub key: NodeId,
    pub child_id: BlockId,
}

#[derive(Clone, Debug)]
pub enum Block {
    External {
        data: Vec<u8>,
    },
    SubnodeLeaf {
        entries: Vec<SubnodeLeafEntry>,
    },
    SubnodeInternal {
        entries: Vec<SubnodeInternalEntry>,
    },
    DataTreeInternal {
        total_size: u64,
        entries: Vec<DataTreeEntry>,
    },
}

const TYPE_EXTERNAL: u8 = 0x00;
const TYPE_SUBNODE_LEAF: u8 = 0x01;
const TYPE_SUBNODE_INTERNAL: u8 = 0x02;
const TYPE_DATA_TREE_INTERNAL: u8 = 0x03;

impl Block {
    fn encode_body(&self, variant: FormatVariant) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Block::External { data } => {
                body.push(TYPE_EXTERNAL);
                body.extend_from_slice(data);
            }
            Block::SubnodeLeaf { entries } => {
                body.push(TYPE_SUBNODE_LEAF);
                body.write_u16::<LittleEndian>(entries.len() as u16)?;
                for entry in entries {
                    entry.nid.write(&mut body)?;
                    entry.data_bid.write(&mut body, variant)?;
                    entry.subnode_bid.write(&mut body, variant)?;
                }
            }
            Block::SubnodeInternal { entries } => {
                body.push(TYPE_SUBNODE_INTERNAL);
                body.write_u16::<LittleEndian>(entries.len() as u16)?;
                for entry in entries {
                    entry.key.write(&mut body)?;
                    entry.child_id.write(&mut body, variant)?;
                }
            }
            Block::DataTreeInternal {
                total_size,
                entries,
            } => {
                body.push(TYPE_DATA_TREE_INTERNAL);
                body.write_u64::<LittleEndian>(*total_size)?;
                body.write_u16::<LittleEndian>(entries.len() as u16)?;
                for entry in entries {
                    body.write_u64::<LittleEndian>(entry.start_offset)?;
                    entry.child_id.write(&mut body, variant)?;
                }
            }
        }
        Ok(body)
    }

    fn decode_body(variant: FormatVariant, body: &[u8]) -> NdbResult<Self> {
        let mut cursor = Cursor::new(body);
        let tag = cursor.read_u8()?;
        match tag {
            TYPE_EXTERNAL => {
                let mut data = Vec::new();
                cursor.read_to_end(&mut data)?;
                Ok(Block::External { data })
            }
            TYPE_SUBNODE_LEAF => {
                let count = cursor.read_u16::<LittleEndian>()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let nid = NodeId::read(&mut cursor)?;
                    let data_bid = BlockId::read(&mut cursor, variant)?;
                    let subnode_bid = BlockId::read(&mut cursor, variant)?;
                    entries.push(SubnodeLeafEntry {
                        nid,
                        data_bid,
                        subnode_bid,
                    });
                }
                Ok(Block::SubnodeLeaf { entries })
            }
            TYPE_SUBNODE_INTERNAL => {
                let count = cursor.read_u16::<LittleEndian>()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = NodeId::read(&mut cursor)?;
                    let child_id = BlockId::read(&mut cursor, variant)?;
                    entries.push(SubnodeInternalEntry { key, child_id });
                }
                Ok(Block::SubnodeInternal { entries })
            }
            TYPE_DATA_TREE_INTERNAL => {
                let total_size = cursor.read_u64::<LittleEndian>()?;
                let count = cursor.read_u16::<LittleEndian>()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let start_offset = cursor.read_u64::<LittleEndian>()?;
                    let child_id = BlockId::read(&mut cursor, variant)?;
                    entries.push(DataTreeEntry {
                        start_offset,
                        child_id,
                    });
                }
                Ok(Block::DataTreeInternal {
                    total_size,
                    entries,
                })
            }
            other => Err(NdbError::InvalidBlockType(other)),
        }
    }

    pub fn is_internal(&self) -> bool {
        !matches!(self, Block::External { .. })
    }

    /// Serializes to `{body, trailer}`, padded to the 64-byte alignment
    /// boundary the way `spec.md` §3 shows for block storage.
    pub fn encode(&self, variant: FormatVariant, block_id: BlockId, signature: u16) -> io::Result<Vec<u8>> {
        let body = self.encode_body(variant)?;
        let raw_size: u16 = body
            .len()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block body too large"))?;
        let crc = compute_crc(0, &body);

        let trailer = BlockTrailer {
            raw_size,
            signature,
            crc,
            block_id,
        };

        let padded_len = aligned_block_len(raw_size, variant.block_trailer_size() as u16);
        let mut out = body;
        out.resize(padded_len as usize - variant.block_trailer_size(), 0);
        trailer.write(&mut out, variant)?;
        Ok(out)
    }

    /// Decodes a block given its raw on-disk `raw_size` (from the BBT
    /// entry), validating the CRC and that `is_internal()` matches the
    /// block id's internal bit.
    pub fn decode(variant: FormatVariant, raw_size: u16, bytes: &[u8]) -> NdbResult<(Self, BlockTrailer)> {
        let trailer_size = variant.block_trailer_size();
        if bytes.len() < raw_size as usize + trailer_size {
            return Err(NdbError::FormatError(
                "block buffer shorter than declared size plus trailer".into(),
            ));
        }
        let body = &bytes[..raw_size as usize];
        let trailer_bytes = &bytes[bytes.len() - trailer_size..];
        let trailer = BlockTrailer::read(&mut Cursor::new(trailer_bytes), variant)?;

        if trailer.raw_size != raw_size {
            return Err(NdbError::InvalidBlockSize(trailer.raw_size));
        }
        let crc = compute_crc(0, body);
        if crc != trailer.crc {
            return Err(NdbError::InvalidBlockCrc(trailer.crc, crc));
        }

        let block = Self::decode_body(variant, body)?;
        if block.is_internal() != trailer.block_id.is_internal() {
            return Err(NdbError::FormatError(format!(
                "block {:?} internal-flag mismatch with its content tag",
                trailer.block_id
            )));
        }
        Ok((block, trailer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_block_round_trip() {
        let data = b"hello pst world".to_vec();
        let block = Block::External { data: data.clone() };
        let bid = BlockId::new(false, 4).unwrap();
        let bytes = block.encode(FormatVariant::Unicode, bid, 0).unwrap();

        let (back, trailer) = Block::decode(FormatVariant::Unicode, data.len() as u16, &bytes).unwrap();
        assert_eq!(trailer.block_id, bid);
        match back {
            Block::External { data: back_data } => assert_eq!(back_data, data),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_subnode_leaf_round_trip() {
        let entries = vec![SubnodeLeafEntry {
            nid: NodeId::new(super::super::node_id::NodeIdType::Attachment, 3).unwrap(),
            data_bid: BlockId::new(false, 5).unwrap(),
            subnode_bid: BlockId::NONE,
        }];
        let block = Block::SubnodeLeaf {
            entries: entries.clone(),
        };
        let bid = BlockId::new(true, 6).unwrap();
        let bytes = block.encode(FormatVariant::Ansi, bid, 0).unwrap();
        let raw_size = block.encode_body(FormatVariant::Ansi).unwrap().len() as u16;

        let (back, _trailer) = Block::decode(FormatVariant::Ansi, raw_size, &bytes).unwrap();
        match back {
            Block::SubnodeLeaf { entries: back_entries } => assert_eq!(back_entries, entries),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_data_tree_internal_round_trip() {
        let entries = vec![
            DataTreeEntry {
                start_offset: 0,
                child_id: BlockId::new(false, 10).unwrap(),
            },
            DataTreeEntry {
                start_offset: 480,
                child_id: BlockId::new(false, 12).unwrap(),
            },
        ];
        let block = Block::DataTreeInternal {
            total_size: 900,
            entries: entries.clone(),
        };
        let bid = BlockId::new(true, 14).unwrap();
        let bytes = block.encode(FormatVariant::Unicode, bid, 0).unwrap();
        let raw_size = block.encode_body(FormatVariant::Unicode).unwrap().len() as u16;

        let (back, _trailer) = Block::decode(FormatVariant::Unicode, raw_size, &bytes).unwrap();
        match back {
            Block::DataTreeInternal {
                total_size,
                entries: back_entries,
            } => {
                assert_eq!(total_size, 900);
                assert_eq!(back_entries, entries);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let block = Block::External {
            data: vec![1, 2, 3, 4],
        };
        let bid = BlockId::new(false, 1).unwrap();
        let mut bytes = block.encode(FormatVariant::Unicode, bid, 0).unwrap();
        bytes[0] ^= 0xFF;
        let err = Block::decode(FormatVariant::Unicode, 4, &bytes).unwrap_err();
        assert!(matches!(err, NdbError::InvalidBlockCrc(_, _)));
    }
}
