//! ## Table Context (TC)
//!
//! `spec.md` §4.9: "A TC is a rectangular row-by-column store" backed by
//! a row-index BTH, a column descriptor array, and a row matrix that
//! starts as a single inline heap item and migrates to a dedicated
//! subnode once it outgrows one heap page.
//!
//! Grounded on the teacher's `ltp/table.rs` (`TCOLDESC` layout, the
//! width-group ordering, row-matrix paging) and `ndb/node.rs`'s subnode
//! API for the overflow path.

use super::{
    bth::Bth,
    heap::{HeapId, HeapNodeType, HeapOnNode},
    prop_context::PropertyType,
    LtpError, LtpResult,
};
use crate::device::Device;
use crate::ndb::{
    amap::AllocationMap,
    block::max_block_payload,
    block_store::BlockStore,
    node::Node,
    node_id::{NodeId, NodeIdType},
    FormatVariant,
};

const TC_TYPE_TAG: u8 = HeapNodeType::Table as u8;
const COLUMN_DESC_LEN: u16 = 7; // prop_id(2) + prop_type(2) + offset(2) + width(1)

fn row_matrix_nid() -> NodeId {
    NodeId::new(NodeIdType::Internal, 1).expect("valid reserved subnode id")
}

/// `spec.md` §4.9: "fixed-layout header listing each column's `prop_id`,
/// `type`, `byte offset` within a row, and width."
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ColumnDescriptor {
    prop_id: u16,
    prop_type: u16,
    offset: u16,
    width: u8,
}

impl ColumnDescriptor {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.prop_id.to_le_bytes());
        buf.extend_from_slice(&self.prop_type.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.push(self.width);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            prop_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            prop_type: u16::from_le_bytes([bytes[2], bytes[3]]),
            offset: u16::from_le_bytes([bytes[4], bytes[5]]),
            width: bytes[6],
        }
    }
}

/// Columns wider than 8 bytes, and anything variable-length, are stored
/// indirectly: the row holds a 4-byte `hid_or_nid` reference instead of
/// the value itself.
fn is_fixed(prop_type: PropertyType) -> bool {
    matches!(
        prop_type,
        PropertyType::Null
            | PropertyType::Boolean
            | PropertyType::Int16
            | PropertyType::Int32
            | PropertyType::Int64
            | PropertyType::Float64
    )
}

fn column_width(prop_type: PropertyType) -> u8 {
    match prop_type {
        PropertyType::Int64 | PropertyType::Float64 => 8,
        PropertyType::Int32 => 4,
        PropertyType::Int16 => 2,
        PropertyType::Boolean | PropertyType::Null => 1,
        _ => 4, // hid_or_nid
    }
}

fn bitmap_len(ncols: usize) -> u16 {
    ((ncols + 7) / 8) as u16
}

fn bitmap_offset(columns: &[ColumnDescriptor]) -> u16 {
    columns.iter().map(|c| c.width as u16).sum()
}

fn row_stride(columns: &[ColumnDescriptor]) -> u16 {
    bitmap_offset(columns) + bitmap_len(columns.len())
}

/// `spec.md` §4.9: "Columns are placed in four groups by width (8,4,2,1)".
fn relayout(columns: &mut Vec<ColumnDescriptor>) {
    columns.sort_by(|a, b| b.width.cmp(&a.width).then(a.prop_id.cmp(&b.prop_id)));
    let mut offset = 0_u16;
    for column in columns.iter_mut() {
        column.offset = offset;
        offset += column.width as u16;
    }
}

fn get_bit(row: &[u8], bitmap_offset: u16, index: usize) -> bool {
    let byte = row[bitmap_offset as usize + index / 8];
    (byte >> (index % 8)) & 1 != 0
}

fn set_bit(row: &mut [u8], bitmap_offset: u16, index: usize, value: bool) {
    let byte = &mut row[bitmap_offset as usize + index / 8];
    if value {
        *byte |= 1 << (index % 8);
    } else {
        *byte &= !(1 << (index % 8));
    }
}

fn rows_per_page(stride: u16, variant: FormatVariant) -> u32 {
    if stride == 0 {
        return u32::MAX;
    }
    (max_block_payload(variant) as u32 / stride as u32).max(1)
}

/// `spec.md` §4.9: "the row matrix is paged so the first row of each
/// page is aligned to the page boundary" — the byte offset of a dense
/// row number, leaving the page's tail bytes unused rather than letting
/// a row straddle a page.
fn row_offset(row_number: u32, stride: u16, variant: FormatVariant) -> u64 {
    let rpp = rows_per_page(stride, variant);
    let page = row_number / rpp;
    let slot = row_number % rpp;
    page as u64 * max_block_payload(variant) as u64 + slot as u64 * stride as u64
}

#[derive(Clone, Copy, Debug)]
enum RowStorage {
    Inline(HeapId),
    Subnode,
}

/// `spec.md` §4.9: row-by-column store over a heap/subnode-backed row
/// matrix.
pub struct TableContext {
    heap: HeapOnNode,
    header_hid: HeapId,
    columns: Vec<ColumnDescriptor>,
    row_count: u32,
    storage: RowStorage,
    row_index: Bth<u32, u32>,
    /// Kept materialized across calls once the matrix has migrated to a
    /// subnode, so writes accumulate the way `Node` itself accumulates
    /// dirty data until `save_node` is called.
    subnode: Option<Node>,
}

impl TableContext {
    pub fn create(
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let mut heap = HeapOnNode::create(HeapNodeType::Table, node, store, amap, device)?;
        let row_index: Bth<u32, u32> = Bth::create_detached(&mut heap, node, store, amap, device)?;
        let inline_hid = heap.allocate_heap_item(&[], node, store, amap, device)?;

        let mut tc = Self {
            heap,
            header_hid: HeapId::NONE,
            columns: Vec::new(),
            row_count: 0,
            storage: RowStorage::Inline(inline_hid),
            row_index,
            subnode: None,
        };
        let header_bytes = tc.encode_header();
        let header_hid = tc.heap.allocate_heap_item(&header_bytes, node, store, amap, device)?;
        tc.header_hid = header_hid;
        tc.heap.set_root_id(header_hid, node, store, amap, device)?;
        Ok(tc)
    }

    pub fn open(
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let heap = HeapOnNode::open(node, store, amap, device)?;
        let header_hid = heap.root_id();
        let bytes = heap.read(header_hid, node, store, amap, device)?;
        Self::decode_header(header_hid, &bytes, heap, node, store, amap, device)
    }

    fn stride(&self) -> u16 {
        row_stride(&self.columns)
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = vec![TC_TYPE_TAG, self.columns.len() as u8];
        for column in &self.columns {
            column.encode(&mut buf);
        }
        buf.extend_from_slice(&self.row_count.to_le_bytes());
        self.row_index.header_id().write(&mut buf).ok();
        match self.storage {
            RowStorage::Inline(hid) => {
                buf.push(0);
                buf.extend_from_slice(&u32::from(hid).to_le_bytes());
            }
            RowStorage::Subnode => {
                buf.push(1);
                buf.extend_from_slice(&0_u32.to_le_bytes());
            }
        }
        buf
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_header(
        header_hid: HeapId,
        bytes: &[u8],
        heap: HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        if bytes.first().copied() != Some(TC_TYPE_TAG) {
            return Err(LtpError::InvalidHeapNodeTypeSignature(bytes.first().copied().unwrap_or(0)));
        }
        let ncols = bytes[1] as usize;
        let mut columns = Vec::with_capacity(ncols);
        let mut cursor = 2_usize;
        for _ in 0..ncols {
            columns.push(ColumnDescriptor::decode(&bytes[cursor..cursor + COLUMN_DESC_LEN as usize]));
            cursor += COLUMN_DESC_LEN as usize;
        }
        let row_count = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let row_index_header = HeapId::read(&mut &bytes[cursor..cursor + 4])?;
        cursor += 4;
        let storage_tag = bytes[cursor];
        cursor += 1;
        let storage_ref = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        let storage = if storage_tag == 0 {
            RowStorage::Inline(HeapId::from(storage_ref))
        } else {
            RowStorage::Subnode
        };

        let row_index = Bth::open_detached(row_index_header, &heap, node, store, amap, device)?;
        Ok(Self {
            heap,
            header_hid,
            columns,
            row_count,
            storage,
            row_index,
            subnode: None,
        })
    }

    fn save_header(
        &mut self,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let bytes = self.encode_header();
        let new_hid = self.heap.re_allocate_heap_item(self.header_hid, &bytes, node, store, amap, device)?;
        self.header_hid = new_hid;
        self.heap.set_root_id(new_hid, node, store, amap, device)
    }

    fn ensure_subnode(
        &mut self,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        if self.subnode.is_some() {
            return Ok(());
        }
        let sub = match node.get_subnode_block(row_matrix_nid(), store, amap, device) {
            Ok(desc) => Node::new(desc.nid, desc.data_bid, desc.subnode_bid),
            Err(_) => node.create_subnode(row_matrix_nid()),
        };
        self.subnode = Some(sub);
        Ok(())
    }

    /// `spec.md` §4.9: "when a write grows the matrix past the inline
    /// threshold, TC migrates it to a subnode."
    fn migrate_to_subnode_if_needed(
        &mut self,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let RowStorage::Inline(hid) = self.storage else {
            return Ok(());
        };
        let needed = row_offset(self.row_count.saturating_sub(1).max(0), self.stride(), store.variant())
            + self.stride() as u64;
        if needed <= HeapOnNode::max_item_len(store.variant()) as u64 {
            return Ok(());
        }
        let bytes = self.heap.read(hid, node, store, amap, device)?;
        self.ensure_subnode(node, store, amap, device)?;
        let sub = self.subnode.as_mut().expect("just ensured");
        sub.resize(bytes.len() as u64, store, amap, device)?;
        sub.write(0, &bytes, store, amap, device)?;
        self.heap.free_heap_item(hid, node, store, amap, device)?;
        self.storage = RowStorage::Subnode;
        Ok(())
    }

    fn read_row(
        &mut self,
        row_number: u32,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Vec<u8>> {
        let stride = self.stride();
        let offset = row_offset(row_number, stride, store.variant());
        match self.storage {
            RowStorage::Inline(hid) => {
                let bytes = self.heap.read(hid, node, store, amap, device)?;
                let end = (offset as usize + stride as usize).min(bytes.len());
                let mut row = vec![0_u8; stride as usize];
                row[..end - offset as usize].copy_from_slice(&bytes[offset as usize..end]);
                Ok(row)
            }
            RowStorage::Subnode => {
                self.ensure_subnode(node, store, amap, device)?;
                let sub = self.subnode.as_mut().expect("just ensured");
                sub.read(offset, stride as u64, store, amap, device).map_err(LtpError::from)
            }
        }
    }

    fn write_row(
        &mut self,
        row_number: u32,
        bytes: &[u8],
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let stride = self.stride();
        let offset = row_offset(row_number, stride, store.variant());
        match self.storage {
            RowStorage::Inline(hid) => {
                let mut full = self.heap.read(hid, node, store, amap, device)?;
                let end = offset as usize + stride as usize;
                if full.len() < end {
                    full.resize(end, 0);
                }
                full[offset as usize..end].copy_from_slice(bytes);
                let new_hid = self.heap.re_allocate_heap_item(hid, &full, node, store, amap, device)?;
                self.storage = RowStorage::Inline(new_hid);
            }
            RowStorage::Subnode => {
                self.ensure_subnode(node, store, amap, device)?;
                let sub = self.subnode.as_mut().expect("just ensured");
                let cur = sub.size(store, amap, device)?;
                if cur < offset + stride as u64 {
                    sub.resize(offset + stride as u64, store, amap, device)?;
                }
                sub.write(offset, bytes, store, amap, device)?;
            }
        }
        Ok(())
    }

    /// `spec.md` §4.9: "`add_row(row_id)`: allocates a new row slot
    /// (appending), inserts into the row-index BTH."
    pub fn add_row(
        &mut self,
        row_id: u32,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let row_number = self.row_count;
        let stride = self.stride();
        self.write_row(row_number, &vec![0_u8; stride as usize], node, store, amap, device)?;
        self.row_count += 1;
        self.migrate_to_subnode_if_needed(node, store, amap, device)?;
        self.row_index.upsert(row_id, row_number, &mut self.heap, node, store, amap, device)?;
        self.save_header(node, store, amap, device)
    }

    /// `spec.md` §4.9: "`delete_row(i)`: swap-with-last then shrink;
    /// update row-index."
    pub fn delete_row(
        &mut self,
        row_id: u32,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let row_number = self
            .row_index
            .lookup(row_id, &self.heap, node, store, amap, device)
            .map_err(|_| LtpError::RowNotFound(row_id))?;
        let last = self.row_count - 1;
        if row_number != last {
            let last_row_id = self
                .row_index
                .iter(&self.heap, node, store, amap, device)?
                .into_iter()
                .find(|(_, n)| *n == last)
                .map(|(id, _)| id)
                .ok_or(LtpError::RowNotFound(row_id))?;
            let last_bytes = self.read_row(last, node, store, amap, device)?;
            self.write_row(row_number, &last_bytes, node, store, amap, device)?;
            self.row_index.upsert(last_row_id, row_number, &mut self.heap, node, store, amap, device)?;
        }
        self.row_index.remove(row_id, &mut self.heap, node, store, amap, device)?;
        self.row_count -= 1;
        self.save_header(node, store, amap, device)
    }

    /// `spec.md` §4.9: "`add_column(pid, type)`: appends a column
    /// descriptor and widens the row stride, migrating existing rows."
    pub fn add_column(
        &mut self,
        pid: u16,
        prop_type: PropertyType,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        if self.columns.iter().any(|c| c.prop_id == pid) {
            return Err(LtpError::DuplicateColumn(pid));
        }
        let old_columns = self.columns.clone();

        let mut rows = Vec::with_capacity(self.row_count as usize);
        for row_number in 0..self.row_count {
            rows.push(self.read_row(row_number, node, store, amap, device)?);
        }

        self.columns.push(ColumnDescriptor {
            prop_id: pid,
            prop_type: prop_type as u16,
            offset: 0,
            width: column_width(prop_type),
        });
        relayout(&mut self.columns);
        let new_stride = self.stride();
        let new_bitmap_offset = bitmap_offset(&self.columns);

        for (row_number, old_row) in rows.into_iter().enumerate() {
            let mut new_row = vec![0_u8; new_stride as usize];
            for (old_idx, old_col) in old_columns.iter().enumerate() {
                if !get_bit(&old_row, bitmap_offset(&old_columns), old_idx) {
                    continue;
                }
                let Some(new_idx) = self.columns.iter().position(|c| c.prop_id == old_col.prop_id) else {
                    continue;
                };
                let new_col = self.columns[new_idx];
                new_row[new_col.offset as usize..new_col.offset as usize + new_col.width as usize]
                    .copy_from_slice(&old_row[old_col.offset as usize..old_col.offset as usize + old_col.width as usize]);
                set_bit(&mut new_row, new_bitmap_offset, new_idx, true);
            }
            self.write_row(row_number as u32, &new_row, node, store, amap, device)?;
        }
        self.migrate_to_subnode_if_needed(node, store, amap, device)?;
        self.save_header(node, store, amap, device)
    }

    fn column(&self, pid: u16) -> LtpResult<ColumnDescriptor> {
        self.columns.iter().copied().find(|c| c.prop_id == pid).ok_or(LtpError::ColumnNotFound(pid))
    }

    fn row_number(
        &mut self,
        row_id: u32,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<u32> {
        self.row_index
            .lookup(row_id, &self.heap, node, store, amap, device)
            .map_err(|_| LtpError::RowNotFound(row_id))
    }

    /// `spec.md` §4.9: fixed-width columns write/read directly into the
    /// row's stride and set the existence bit.
    pub fn set_cell_value(
        &mut self,
        row_id: u32,
        pid: u16,
        bytes: &[u8],
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let column = self.column(pid)?;
        if bytes.len() != column.width as usize {
            return Err(LtpError::ColumnNotFound(pid));
        }
        let row_number = self.row_number(row_id, node, store, amap, device)?;
        let bitmap_off = bitmap_offset(&self.columns);
        let mut row = self.read_row(row_number, node, store, amap, device)?;
        row[column.offset as usize..column.offset as usize + column.width as usize].copy_from_slice(bytes);
        let idx = self.columns.iter().position(|c| c.prop_id == pid).unwrap();
        set_bit(&mut row, bitmap_off, idx, true);
        self.write_row(row_number, &row, node, store, amap, device)
    }

    pub fn get_cell_value(
        &mut self,
        row_id: u32,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Vec<u8>> {
        let column = self.column(pid)?;
        let row_number = self.row_number(row_id, node, store, amap, device)?;
        let bitmap_off = bitmap_offset(&self.columns);
        let row = self.read_row(row_number, node, store, amap, device)?;
        let idx = self.columns.iter().position(|c| c.prop_id == pid).unwrap();
        if !get_bit(&row, bitmap_off, idx) {
            return Err(LtpError::CellNotSet(pid));
        }
        Ok(row[column.offset as usize..column.offset as usize + column.width as usize].to_vec())
    }

    /// `spec.md` §4.9: "for heap/subnode-referenced columns, stores a
    /// 32-bit `hid_or_nid`; payload is written into the TC's heap (short
    /// blobs) or a fresh subnode (long blobs)."
    pub fn write_cell(
        &mut self,
        row_id: u32,
        pid: u16,
        bytes: &[u8],
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let column = self.column(pid)?;
        if is_fixed(PropertyType::try_from(column.prop_type)?) {
            return self.set_cell_value(row_id, pid, bytes, node, store, amap, device);
        }
        let row_number = self.row_number(row_id, node, store, amap, device)?;
        let existing_hid = match self.get_cell_value(row_id, pid, node, store, amap, device) {
            Ok(existing) => Some(HeapId::from(u32::from_le_bytes(existing.try_into().unwrap()))),
            Err(_) => None,
        };
        let hid = match existing_hid {
            Some(hid) => self.heap.re_allocate_heap_item(hid, bytes, node, store, amap, device)?,
            None => self.heap.allocate_heap_item(bytes, node, store, amap, device)?,
        };
        let bitmap_off = bitmap_offset(&self.columns);
        let mut row = self.read_row(row_number, node, store, amap, device)?;
        row[column.offset as usize..column.offset as usize + column.width as usize]
            .copy_from_slice(&u32::from(hid).to_le_bytes());
        let idx = self.columns.iter().position(|c| c.prop_id == pid).unwrap();
        set_bit(&mut row, bitmap_off, idx, true);
        self.write_row(row_number, &row, node, store, amap, device)
    }

    pub fn read_cell(
        &mut self,
        row_id: u32,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Vec<u8>> {
        let column = self.column(pid)?;
        if is_fixed(PropertyType::try_from(column.prop_type)?) {
            return self.get_cell_value(row_id, pid, node, store, amap, device);
        }
        let raw = self.get_cell_value(row_id, pid, node, store, amap, device)?;
        let hid = HeapId::from(u32::from_le_bytes(raw.try_into().unwrap()));
        self.heap.read(hid, node, store, amap, device)
    }

    /// `spec.md` §4.9: "`delete_cell_value(i, pid)`: clears existence bit
    /// and frees referenced storage."
    pub fn delete_cell_value(
        &mut self,
        row_id: u32,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let column = self.column(pid)?;
        let row_number = self.row_number(row_id, node, store, amap, device)?;
        let bitmap_off = bitmap_offset(&self.columns);
        let mut row = self.read_row(row_number, node, store, amap, device)?;
        let idx = self.columns.iter().position(|c| c.prop_id == pid).unwrap();
        if !get_bit(&row, bitmap_off, idx) {
            return Ok(());
        }
        if !is_fixed(PropertyType::try_from(column.prop_type)?) {
            let raw = &row[column.offset as usize..column.offset as usize + column.width as usize];
            let hid = HeapId::from(u32::from_le_bytes(raw.try_into().unwrap()));
            self.heap.free_heap_item(hid, node, store, amap, device)?;
        }
        set_bit(&mut row, bitmap_off, idx, false);
        self.write_row(row_number, &row, node, store, amap, device)
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// `spec.md` §4.9 analogue to `save_bth`/`save_property_bag`:
    /// finalizes the subnode (if the matrix migrated to one) and
    /// persists the row index and header.
    pub fn save_table_context(
        &mut self,
        node: &mut Node,
        store: &mut BlockStore,
        amap: &mut AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        if let Some(sub) = self.subnode.as_mut() {
            sub.save_node(store, amap, device)?;
            node.save_subnode(sub)?;
        }
        self.row_index.save_bth(&mut self.heap, node, store, amap, device)?;
        self.save_header(node, store, amap, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::ndb::block_id::BlockId;

    fn setup() -> (BlockStore, AllocationMap, MemoryDevice, Node) {
        let node = Node::new(NodeId::new(NodeIdType::HierarchyTable, 1).unwrap(), BlockId::NONE, BlockId::NONE);
        (
            BlockStore::new(FormatVariant::Unicode),
            AllocationMap::new(FormatVariant::Unicode, 0),
            MemoryDevice::new(),
            node,
        )
    }

    #[test]
    fn test_add_row_and_fixed_cell_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut tc = TableContext::create(&mut node, &store, &amap, &mut device).unwrap();
        tc.add_column(1, PropertyType::Int32, &mut node, &store, &amap, &mut device).unwrap();
        tc.add_row(100, &mut node, &store, &amap, &mut device).unwrap();
        tc.set_cell_value(100, 1, &42_i32.to_le_bytes(), &mut node, &store, &amap, &mut device).unwrap();
        let back = tc.get_cell_value(100, 1, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(i32::from_le_bytes(back.try_into().unwrap()), 42);
    }

    #[test]
    fn test_indirect_cell_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut tc = TableContext::create(&mut node, &store, &amap, &mut device).unwrap();
        tc.add_column(2, PropertyType::String, &mut node, &store, &amap, &mut device).unwrap();
        tc.add_row(1, &mut node, &store, &amap, &mut device).unwrap();
        tc.write_cell(1, 2, b"hello table", &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(
            tc.read_cell(1, 2, &mut node, &store, &amap, &mut device).unwrap(),
            b"hello table"
        );
    }

    #[test]
    fn test_delete_row_swap_with_last() {
        let (store, amap, mut device, mut node) = setup();
        let mut tc = TableContext::create(&mut node, &store, &amap, &mut device).unwrap();
        tc.add_column(1, PropertyType::Int32, &mut node, &store, &amap, &mut device).unwrap();
        for row_id in [10_u32, 20, 30] {
            tc.add_row(row_id, &mut node, &store, &amap, &mut device).unwrap();
            tc.set_cell_value(row_id, 1, &(row_id as i32).to_le_bytes(), &mut node, &store, &amap, &mut device).unwrap();
        }
        tc.delete_row(20, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(tc.row_count(), 2);
        assert!(tc.row_index.lookup(20, &tc.heap, &mut node, &store, &amap, &mut device).is_err());
        let remaining: Vec<u32> = tc
            .row_index
            .iter(&tc.heap, &mut node, &store, &amap, &mut device)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&10));
        assert!(remaining.contains(&30));
    }

    #[test]
    fn test_add_column_after_rows_migrates_existing_data() {
        let (store, amap, mut device, mut node) = setup();
        let mut tc = TableContext::create(&mut node, &store, &amap, &mut device).unwrap();
        tc.add_column(1, PropertyType::Int32, &mut node, &store, &amap, &mut device).unwrap();
        tc.add_row(1, &mut node, &store, &amap, &mut device).unwrap();
        tc.set_cell_value(1, 1, &7_i32.to_le_bytes(), &mut node, &store, &amap, &mut device).unwrap();

        tc.add_column(2, PropertyType::Boolean, &mut node, &store, &amap, &mut device).unwrap();
        let back = tc.get_cell_value(1, 1, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(i32::from_le_bytes(back.try_into().unwrap()), 7);
        assert!(tc.get_cell_value(1, 2, &mut node, &store, &amap, &mut device).is_err());
    }

    #[test]
    fn test_row_matrix_migrates_to_subnode_past_inline_threshold() {
        let (store, amap, mut device, mut node) = setup();
        let mut tc = TableContext::create(&mut node, &store, &amap, &mut device).unwrap();
        tc.add_column(1, PropertyType::Int64, &mut node, &store, &amap, &mut device).unwrap();
        for row_id in 0..2000_u32 {
            tc.add_row(row_id, &mut node, &store, &amap, &mut device).unwrap();
        }
        assert!(matches!(tc.storage, RowStorage::Subnode));
        tc.set_cell_value(999, 1, &123_i64.to_le_bytes(), &mut node, &store, &amap, &mut device).unwrap();
        let back = tc.get_cell_value(999, 1, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(i64::from_le_bytes(back.try_into().unwrap()), 123);
    }
}
