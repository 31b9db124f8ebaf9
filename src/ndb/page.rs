//! Page framing shared by every page type: allocation bitmaps (AMap/FMap),
//! the density list (DList), and the NBT/BBT index pages. `spec.md` §3:
//! "Every page is self-describing with a page-type tag and a CRC."

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::{block_id::BlockId, FormatVariant, NdbError, NdbResult, PAGE_SIZE};
use crate::crc::compute_crc;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageType {
    AllocationMap = 0x01,
    AllocationPageMap = 0x02,
    FreeMap = 0x03,
    FreePageMap = 0x04,
    DensityList = 0x05,
    NodeBTree = 0x06,
    BlockBTree = 0x07,
}

impl TryFrom<u8> for PageType {
    type Error = NdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PageType::AllocationMap),
            0x02 => Ok(PageType::AllocationPageMap),
            0x03 => Ok(PageType::FreeMap),
            0x04 => Ok(PageType::FreePageMap),
            0x05 => Ok(PageType::DensityList),
            0x06 => Ok(PageType::NodeBTree),
            0x07 => Ok(PageType::BlockBTree),
            _ => Err(NdbError::InvalidPageType(value)),
        }
    }
}

/// `spec.md` §6: "page trailer `{page_type, signature, CRC, block_id}`".
#[derive(Clone, Copy, Debug)]
pub struct PageTrailer {
    pub page_type: PageType,
    pub signature: u16,
    pub block_id: BlockId,
}

/// Serializes `content` (which must already be exactly one page's worth of
/// payload bytes, i.e. `PAGE_SIZE - variant.page_trailer_size()`) into a
/// full on-disk page with trailer and CRC.
pub fn encode_page(
    variant: FormatVariant,
    page_type: PageType,
    signature: u16,
    block_id: BlockId,
    content: &[u8],
) -> io::Result<Vec<u8>> {
    let trailer_size = variant.page_trailer_size();
    let payload_size = PAGE_SIZE - trailer_size;
    if content.len() != payload_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "page payload must be {payload_size} bytes, got {}",
                content.len()
            ),
        ));
    }

    let mut page = Vec::with_capacity(PAGE_SIZE);
    page.extend_from_slice(content);
    page.push(page_type as u8);
    page.write_u16::<LittleEndian>(signature)?;

    let crc = compute_crc(0, &page);
    page.write_u32::<LittleEndian>(crc)?;
    block_id.write(&mut page, variant)?;

    debug_assert_eq!(page.len(), PAGE_SIZE);
    Ok(page)
}

/// Splits a full on-disk page back into its payload and trailer, verifying
/// the CRC and expected type.
pub fn decode_page(
    variant: FormatVariant,
    page: &[u8],
    expected: PageType,
) -> NdbResult<(Vec<u8>, PageTrailer)> {
    if page.len() != PAGE_SIZE {
        return Err(NdbError::FormatError(format!(
            "page must be {PAGE_SIZE} bytes, got {}",
            page.len()
        )));
    }

    let trailer_size = variant.page_trailer_size();
    let payload_size = PAGE_SIZE - trailer_size;
    let payload = &page[..payload_size];
    let mut cursor = Cursor::new(&page[payload_size..]);

    let page_type = PageType::try_from(cursor.read_u8()?)?;
    if page_type != expected {
        return Err(NdbError::FormatError(format!(
            "expected page type {expected:?}, found {page_type:?}"
        )));
    }
    let signature = cursor.read_u16::<LittleEndian>()?;

    let crc_offset = payload_size + 1 + 2;
    let stored_crc = (&page[crc_offset..crc_offset + 4]).read_u32::<LittleEndian>()?;
    let computed_crc = compute_crc(0, &page[..crc_offset]);
    if stored_crc != computed_crc {
        return Err(NdbError::InvalidPageCrc(stored_crc, computed_crc));
    }

    let mut cursor = Cursor::new(&page[crc_offset + 4..]);
    let block_id = BlockId::read(&mut cursor, variant)?;

    Ok((
        payload.to_vec(),
        PageTrailer {
            page_type,
            signature,
            block_id,
        },
    ))
}

/// A bitmap page (AMap or FMap): one bit per 64-byte slot of the file
/// region it governs. `spec.md` §4.1: "one AMap page governs `8 ·
/// (P − header_bytes) · 64` file bytes".
pub struct MapPage {
    pub bits: Vec<u8>,
}

impl MapPage {
    pub fn payload_len(variant: FormatVariant) -> usize {
        PAGE_SIZE - variant.page_trailer_size()
    }

    pub fn new_empty(variant: FormatVariant) -> Self {
        Self {
            bits: vec![0_u8; Self::payload_len(variant)],
        }
    }

    pub fn slots_governed(variant: FormatVariant) -> usize {
        Self::payload_len(variant) * 8
    }

    pub fn bytes_governed(variant: FormatVariant) -> u64 {
        Self::slots_governed(variant) as u64 * 64
    }
}

/// One entry of the [`DensityListPage`]: which AMap page, and how many
/// free slots it currently reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DensityListEntry {
    pub amap_page_no: u32,
    pub free_slot_count: u32,
}

/// `spec.md` §4.1: "DList is an in-memory array of `(amap_page_no,
/// free_slot_count)` sorted by descending free count". Persisted as its own
/// page type so a reopen can rebuild the in-memory cache without rescanning
/// every AMap page.
#[derive(Clone, Debug, Default)]
pub struct DensityListPage {
    pub entries: Vec<DensityListEntry>,
}

impl DensityListPage {
    pub fn encode(&self, variant: FormatVariant, block_id: BlockId) -> io::Result<Vec<u8>> {
        let payload_len = PAGE_SIZE - variant.page_trailer_size();
        let mut content = Vec::with_capacity(payload_len);
        content.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            content.write_u32::<LittleEndian>(entry.amap_page_no)?;
            content.write_u32::<LittleEndian>(entry.free_slot_count)?;
        }
        content.resize(payload_len, 0);
        encode_page(variant, PageType::DensityList, 0, block_id, &content)
    }

    pub fn decode(variant: FormatVariant, page: &[u8]) -> NdbResult<Self> {
        let (payload, _trailer) = decode_page(variant, page, PageType::DensityList)?;
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let amap_page_no = cursor.read_u32::<LittleEndian>()?;
            let free_slot_count = cursor.read_u32::<LittleEndian>()?;
            entries.push(DensityListEntry {
                amap_page_no,
                free_slot_count,
            });
        }
        Ok(Self { entries })
    }
}
