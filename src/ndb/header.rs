//! The file header: format variant, NBT/BBT roots, next-id counters, and
//! the AMap-valid flag. `spec.md` §3: "Written with a redundant copy and
//! CRC-protected so that torn writes can be detected."

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::{block_id::BlockId, FormatVariant, NdbError, NdbResult};
use crate::crc::compute_crc;

const HEADER_MAGIC: u32 = u32::from_be_bytes(*b"NDB!");
/// variant(1) + amap_valid(1) + padding(2) + nbt_root(8) + bbt_root(8)
/// + next_block_id(8) + next_page_no(4) + dlist_page_no(4)
/// + first_amap_page_no(4) + directory_offset(8) + directory_len(4)
/// + node_type_counters(32 * 4) = 180.
const HEADER_BODY_SIZE: usize = 180;
/// One header copy is the magic, the body, and its CRC.
const HEADER_COPY_SIZE: u64 = 4 + HEADER_BODY_SIZE as u64 + 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AmapStatus {
    Invalid,
    Valid,
}

/// The on-disk header, duplicated at offset 0 and offset
/// [`HEADER_COPY_SIZE`] so a torn write to one copy leaves the other
/// intact. `spec.md` §7: "The header's redundant copy allows open to retry
/// once."
#[derive(Clone, Debug)]
pub struct Header {
    pub variant: FormatVariant,
    pub nbt_root: BlockId,
    pub bbt_root: BlockId,
    pub next_block_id: u64,
    pub next_page_no: u32,
    pub amap_valid: AmapStatus,
    pub dlist_page_no: u32,
    pub first_amap_page_no: u32,
    /// Direct (offset, len) of the page directory — the flat table of
    /// every live NBT/BBT index page's location. Stored directly here
    /// rather than resolved through the BBT, since the BBT's own pages
    /// are listed in it (see `context.rs`'s module doc for why this
    /// sidesteps a self-referential lookup).
    pub directory_offset: u64,
    pub directory_len: u32,
    /// Monotonic per-[`crate::ndb::node_id::NodeIdType`] index counters,
    /// indexed by the 5-bit type tag.
    pub node_type_counters: [u32; 32],
}

impl Header {
    pub fn new(variant: FormatVariant) -> Self {
        Self {
            variant,
            nbt_root: BlockId::NONE,
            bbt_root: BlockId::NONE,
            next_block_id: 2,
            next_page_no: 0,
            amap_valid: AmapStatus::Valid,
            dlist_page_no: 0,
            first_amap_page_no: 0,
            directory_offset: 0,
            directory_len: 0,
            node_type_counters: [1; 32],
        }
    }

    fn encode_body(&self) -> io::Result<[u8; HEADER_BODY_SIZE]> {
        let mut buf = [0_u8; HEADER_BODY_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u8(match self.variant {
            FormatVariant::Ansi => 0,
            FormatVariant::Unicode => 1,
        })?;
        cursor.write_u8(match self.amap_valid {
            AmapStatus::Invalid => 0,
            AmapStatus::Valid => 1,
        })?;
        cursor.write_u16::<LittleEndian>(0)?; // padding
        self.nbt_root.write(&mut cursor, FormatVariant::Unicode)?;
        self.bbt_root.write(&mut cursor, FormatVariant::Unicode)?;
        cursor.write_u64::<LittleEndian>(self.next_block_id)?;
        cursor.write_u32::<LittleEndian>(self.next_page_no)?;
        cursor.write_u32::<LittleEndian>(self.dlist_page_no)?;
        cursor.write_u32::<LittleEndian>(self.first_amap_page_no)?;
        cursor.write_u64::<LittleEndian>(self.directory_offset)?;
        cursor.write_u32::<LittleEndian>(self.directory_len)?;
        for counter in &self.node_type_counters {
            cursor.write_u32::<LittleEndian>(*counter)?;
        }
        Ok(buf)
    }

    fn decode_body(buf: &[u8; HEADER_BODY_SIZE]) -> NdbResult<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let variant = match cursor.read_u8()? {
            0 => FormatVariant::Ansi,
            1 => FormatVariant::Unicode,
            other => return Err(NdbError::FormatError(format!("bad format tag {other}"))),
        };
        let amap_valid = match cursor.read_u8()? {
            0 => AmapStatus::Invalid,
            1 => AmapStatus::Valid,
            other => return Err(NdbError::FormatError(format!("bad amap status {other}"))),
        };
        cursor.read_u16::<LittleEndian>()?; // padding
        let nbt_root = BlockId::read(&mut cursor, FormatVariant::Unicode)?;
        let bbt_root = BlockId::read(&mut cursor, FormatVariant::Unicode)?;
        let next_block_id = cursor.read_u64::<LittleEndian>()?;
        let next_page_no = cursor.read_u32::<LittleEndian>()?;
        let dlist_page_no = cursor.read_u32::<LittleEndian>()?;
        let first_amap_page_no = cursor.read_u32::<LittleEndian>()?;
        let directory_offset = cursor.read_u64::<LittleEndian>()?;
        let directory_len = cursor.read_u32::<LittleEndian>()?;
        let mut node_type_counters = [0_u32; 32];
        for counter in node_type_counters.iter_mut() {
            *counter = cursor.read_u32::<LittleEndian>()?;
        }
        Ok(Self {
            variant,
            nbt_root,
            bbt_root,
            next_block_id,
            next_page_no,
            amap_valid,
            dlist_page_no,
            first_amap_page_no,
            directory_offset,
            directory_len,
            node_type_counters,
        })
    }

    /// Encodes one `{magic, body, crc}` copy.
    fn encode_copy(&self) -> io::Result<Vec<u8>> {
        let body = self.encode_body()?;
        let crc = compute_crc(0, &body);
        let mut out = Vec::with_capacity(HEADER_COPY_SIZE as usize);
        out.write_u32::<LittleEndian>(HEADER_MAGIC)?;
        out.extend_from_slice(&body);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    fn decode_copy(bytes: &[u8]) -> NdbResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != HEADER_MAGIC {
            return Err(NdbError::InvalidHeaderMagic(magic));
        }
        let mut body = [0_u8; HEADER_BODY_SIZE];
        cursor.read_exact(&mut body)?;
        let stored_crc = cursor.read_u32::<LittleEndian>()?;
        let computed_crc = compute_crc(0, &body);
        if stored_crc != computed_crc {
            return Err(NdbError::InvalidHeaderCrc);
        }
        Self::decode_body(&body)
    }

    /// Writes both redundant copies. `spec.md` §4.5: "new pages are
    /// written first, `flush()`; then header (with flipped CRC signature)
    /// is written, `flush()`." The two copies are written in the same
    /// order every time so a crash mid-write always leaves at least the
    /// second copy (the previous commit's header) intact.
    pub fn write(&self, device: &mut dyn crate::device::Device) -> io::Result<()> {
        let bytes = self.encode_copy()?;
        device.write_at(0, &bytes)?;
        device.flush()?;
        device.write_at(HEADER_COPY_SIZE, &bytes)?;
        device.flush()
    }

    /// Reads the header, falling back to the second copy if the first is
    /// torn or corrupt, and vice versa. `spec.md` §7: "the header's
    /// redundant copy allows open to retry once."
    pub fn read(device: &mut dyn crate::device::Device) -> NdbResult<Self> {
        let size = HEADER_COPY_SIZE as usize;
        let first = device
            .read_at(0, size)
            .map_err(NdbError::Io)
            .and_then(|bytes| Self::decode_copy(&bytes));
        if let Ok(header) = first {
            return Ok(header);
        }
        let second = device.read_at(HEADER_COPY_SIZE, size)?;
        Self::decode_copy(&second).map_err(|_| NdbError::BothHeadersCorrupt)
    }

    pub fn header_span(&self) -> u64 {
        HEADER_COPY_SIZE * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, MemoryDevice};

    #[test]
    fn test_header_round_trip() {
        let mut header = Header::new(FormatVariant::Unicode);
        header.nbt_root = BlockId::new(false, 9).unwrap();
        header.bbt_root = BlockId::new(false, 11).unwrap();
        header.next_block_id = 200;

        let mut device = MemoryDevice::new();
        device.grow(header.header_span()).unwrap();
        header.write(&mut device).unwrap();

        let back = Header::read(&mut device).unwrap();
        assert_eq!(back.nbt_root, header.nbt_root);
        assert_eq!(back.bbt_root, header.bbt_root);
        assert_eq!(back.next_block_id, 200);
    }

    #[test]
    fn test_header_survives_torn_first_copy() {
        let mut header = Header::new(FormatVariant::Ansi);
        header.next_block_id = 42;

        let mut device = MemoryDevice::new();
        device.grow(header.header_span()).unwrap();
        header.write(&mut device).unwrap();

        // Corrupt the first copy only - simulates a crash mid-write to it.
        let mut bytes = device.read_at(0, 4).unwrap();
        bytes[0] ^= 0xFF;
        device.write_at(0, &bytes).unwrap();

        let back = Header::read(&mut device).unwrap();
        assert_eq!(back.next_block_id, 42);
    }
}
