//! ## Property Context (PC)
//!
//! `spec.md` §4.8: "A PC is a BTH keyed by `prop_id` ... whose record is
//! `prop_entry {type, value_or_hid}`." Fixed-width types that fit in the
//! 4-byte `value_or_hid` field are stored inline; everything else is
//! stored as a heap item addressed by its `HeapId`.
//!
//! Grounded on the teacher's `ltp/prop_context.rs` and `ltp/prop_type.rs`
//! (property type tags, inline-vs-indirect split), generalized here to
//! support `write_prop`/`modify_prop`/`remove_prop` — the teacher's
//! version only ever reads an existing PC out of a parsed `.pst`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

use super::{
    bth::{Bth, BthValue},
    heap::{HeapId, HeapNodeType, HeapOnNode},
    LtpError, LtpResult,
};
use crate::device::Device;
use crate::ndb::{
    amap::AllocationMap,
    block_store::BlockStore,
    node::Node,
    node_id::{NodeId, NodeIdType},
};

/// Every property's subnode, if it has one, is keyed by its own property
/// id under `NodeIdType::Internal` — distinct pids never collide, since
/// subnode ids only need to be unique within one PC's own node.
fn prop_subnode_id(pid: u16) -> NodeId {
    NodeId::new(NodeIdType::Internal, pid as u32).expect("u16 pid fits the subnode index range")
}

/// `value_or_hid`'s low 5 bits are a [`HeapId`]'s reserved zero field, or
/// a spilled [`NodeId`]'s nonzero type tag — the hid/nid duality
/// `spec.md` §4.8 describes for wide property values.
fn value_or_hid_is_subnode(raw: u32) -> bool {
    raw & 0x1F != 0
}

/// [Property Data Types] — trimmed to the set this engine supports
/// end to end (read and write), rather than the teacher's full
/// MS-OXCDATA enumeration.
///
/// [Property Data Types]: https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/MS-OXCDATA/0c77892e-288e-435a-9c49-be1c20c7afdb
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PropertyType {
    Null = 0x0001,
    Int16 = 0x0002,
    Int32 = 0x0003,
    Float64 = 0x0005,
    Boolean = 0x000B,
    Int64 = 0x0014,
    String = 0x001F,
    Guid = 0x0048,
    Binary = 0x0102,
    MultiInt32 = 0x1003,
    MultiBinary = 0x1102,
}

impl TryFrom<u16> for PropertyType {
    type Error = LtpError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Null),
            0x0002 => Ok(Self::Int16),
            0x0003 => Ok(Self::Int32),
            0x0005 => Ok(Self::Float64),
            0x000B => Ok(Self::Boolean),
            0x0014 => Ok(Self::Int64),
            0x001F => Ok(Self::String),
            0x0048 => Ok(Self::Guid),
            0x0102 => Ok(Self::Binary),
            0x1003 => Ok(Self::MultiInt32),
            0x1102 => Ok(Self::MultiBinary),
            other => Err(LtpError::InvalidPropertyType(other)),
        }
    }
}

impl PropertyType {
    /// `spec.md` §4.8: "Fixed-width property types (≤ 4 bytes ...) store
    /// the value inline in `value_or_hid`". Returns the inline width, or
    /// `None` for types stored indirectly through a heap item.
    fn inline_width(self) -> Option<u8> {
        match self {
            Self::Null => Some(0),
            Self::Boolean => Some(1),
            Self::Int16 => Some(2),
            Self::Int32 => Some(4),
            _ => None,
        }
    }
}

/// A decoded property value. `spec.md` §4.8's `read_prop<T>`/
/// `write_prop<T>` generics, represented here as a closed enum since a
/// concrete trait-object split would need the same finite dispatch
/// anyway.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    Guid([u8; 16]),
    Binary(Vec<u8>),
    String(String),
    MultiInt32(Vec<i32>),
    MultiBinary(Vec<Vec<u8>>),
}

impl PropValue {
    pub fn prop_type(&self) -> PropertyType {
        match self {
            Self::Null => PropertyType::Null,
            Self::Int16(_) => PropertyType::Int16,
            Self::Int32(_) => PropertyType::Int32,
            Self::Int64(_) => PropertyType::Int64,
            Self::Float64(_) => PropertyType::Float64,
            Self::Boolean(_) => PropertyType::Boolean,
            Self::Guid(_) => PropertyType::Guid,
            Self::Binary(_) => PropertyType::Binary,
            Self::String(_) => PropertyType::String,
            Self::MultiInt32(_) => PropertyType::MultiInt32,
            Self::MultiBinary(_) => PropertyType::MultiBinary,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Null => {}
            Self::Boolean(b) => buf.push(*b as u8),
            Self::Int16(v) => buf.write_i16::<LittleEndian>(*v).unwrap(),
            Self::Int32(v) => buf.write_i32::<LittleEndian>(*v).unwrap(),
            Self::Int64(v) => buf.write_i64::<LittleEndian>(*v).unwrap(),
            Self::Float64(v) => buf.write_f64::<LittleEndian>(*v).unwrap(),
            Self::Guid(bytes) => buf.extend_from_slice(bytes),
            Self::Binary(bytes) => buf.extend_from_slice(bytes),
            Self::String(s) => buf.extend_from_slice(s.as_bytes()),
            Self::MultiInt32(values) => {
                buf.write_u32::<LittleEndian>(values.len() as u32).unwrap();
                for v in values {
                    buf.write_i32::<LittleEndian>(*v).unwrap();
                }
            }
            Self::MultiBinary(items) => {
                buf.write_u32::<LittleEndian>(items.len() as u32).unwrap();
                for item in items {
                    buf.write_u32::<LittleEndian>(item.len() as u32).unwrap();
                }
                for item in items {
                    buf.extend_from_slice(item);
                }
            }
        }
        buf
    }

    fn decode(prop_type: PropertyType, bytes: &[u8]) -> LtpResult<Self> {
        let mut cursor = Cursor::new(bytes);
        Ok(match prop_type {
            PropertyType::Null => Self::Null,
            PropertyType::Boolean => Self::Boolean(bytes.first().copied().unwrap_or(0) != 0),
            PropertyType::Int16 => Self::Int16(cursor.read_i16::<LittleEndian>()?),
            PropertyType::Int32 => Self::Int32(cursor.read_i32::<LittleEndian>()?),
            PropertyType::Int64 => Self::Int64(cursor.read_i64::<LittleEndian>()?),
            PropertyType::Float64 => Self::Float64(cursor.read_f64::<LittleEndian>()?),
            PropertyType::Guid => {
                let mut g = [0_u8; 16];
                g.copy_from_slice(bytes);
                Self::Guid(g)
            }
            PropertyType::Binary => Self::Binary(bytes.to_vec()),
            PropertyType::String => Self::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| LtpError::StringNotNullTerminated(bytes.len()))?,
            ),
            PropertyType::MultiInt32 => {
                let count = cursor.read_u32::<LittleEndian>()? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.read_i32::<LittleEndian>()?);
                }
                Self::MultiInt32(values)
            }
            PropertyType::MultiBinary => {
                let count = cursor.read_u32::<LittleEndian>()? as usize;
                let mut lens = Vec::with_capacity(count);
                for _ in 0..count {
                    lens.push(cursor.read_u32::<LittleEndian>()? as usize);
                }
                let mut items = Vec::with_capacity(count);
                let mut pos = cursor.position() as usize;
                for len in lens {
                    items.push(bytes[pos..pos + len].to_vec());
                    pos += len;
                }
                Self::MultiBinary(items)
            }
        })
    }
}

/// `prop_entry {type: 16, value_or_hid: 32}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PropEntry {
    prop_type: u16,
    value_or_hid: u32,
}

impl BthValue for PropEntry {
    const SIZE: u8 = 6;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.prop_type.to_le_bytes());
        buf.extend_from_slice(&self.value_or_hid.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            prop_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            value_or_hid: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }
}

/// `spec.md` §4.8: a BTH keyed by 16-bit property id.
pub struct PropertyContext {
    heap: HeapOnNode,
    bth: Bth<u16, PropEntry>,
    /// One entry per property whose value outgrew a single heap page,
    /// keyed by `pid`. Loaded lazily on first access, same as `TableContext`'s
    /// row-matrix subnode.
    subnodes: HashMap<u16, Node>,
}

impl PropertyContext {
    pub fn create(
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let mut heap = HeapOnNode::create(HeapNodeType::Properties, node, store, amap, device)?;
        let bth = Bth::create(&mut heap, node, store, amap, device)?;
        Ok(Self { heap, bth, subnodes: HashMap::new() })
    }

    pub fn open(
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let heap = HeapOnNode::open(node, store, amap, device)?;
        let bth = Bth::open(&heap, node, store, amap, device)?;
        Ok(Self { heap, bth, subnodes: HashMap::new() })
    }

    /// Loads (or creates) `pid`'s overflow subnode, caching it for
    /// subsequent reads/writes within this context the way
    /// `TableContext::ensure_subnode` caches the row matrix.
    fn ensure_subnode(
        &mut self,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<&mut Node> {
        if !self.subnodes.contains_key(&pid) {
            let sbnid = prop_subnode_id(pid);
            let sub = match node.get_subnode_block(sbnid, store, amap, device) {
                Ok(desc) => Node::new(desc.nid, desc.data_bid, desc.subnode_bid),
                Err(_) => node.create_subnode(sbnid),
            };
            self.subnodes.insert(pid, sub);
        }
        Ok(self.subnodes.get_mut(&pid).expect("just ensured"))
    }

    /// `spec.md` §4.8: "`read_prop<T>` resolves the entry, dispatches on
    /// `type`, and decodes."
    pub fn read_prop(
        &mut self,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<PropValue> {
        let entry = self.bth.lookup(pid, &self.heap, node, store, amap, device)?;
        let prop_type = PropertyType::try_from(entry.prop_type)?;
        match prop_type.inline_width() {
            Some(width) => {
                let bytes = entry.value_or_hid.to_le_bytes();
                PropValue::decode(prop_type, &bytes[..width as usize])
            }
            None if value_or_hid_is_subnode(entry.value_or_hid) => {
                let sub = self.ensure_subnode(pid, node, store, amap, device)?;
                let len = sub.size(store, amap, device)?;
                let bytes = sub.read(0, len, store, amap, device)?;
                PropValue::decode(prop_type, &bytes)
            }
            None => {
                let hid = HeapId::from(entry.value_or_hid);
                let bytes = self.heap.read(hid, node, store, amap, device)?;
                PropValue::decode(prop_type, &bytes)
            }
        }
    }

    /// Stores `encoded` as a heap item when it fits one heap page, or
    /// spills it to a dedicated subnode otherwise (`spec.md` §4.8: "wider
    /// types store a heap-id or subnode-id"). A property that has already
    /// migrated to a subnode stays there, matching `TableContext`'s
    /// one-way row-matrix migration.
    fn store_indirect(
        &mut self,
        pid: u16,
        encoded: &[u8],
        existing: Option<PropEntry>,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<u32> {
        let existing_is_subnode = existing
            .map(|e| value_or_hid_is_subnode(e.value_or_hid))
            .unwrap_or(false);
        let reused_hid = existing.and_then(|e| {
            if !value_or_hid_is_subnode(e.value_or_hid)
                && PropertyType::try_from(e.prop_type).ok()?.inline_width().is_none()
            {
                Some(HeapId::from(e.value_or_hid))
            } else {
                None
            }
        });

        if existing_is_subnode || encoded.len() as u16 > HeapOnNode::max_item_len(store.variant()) {
            let sbnid = prop_subnode_id(pid);
            let sub = self.ensure_subnode(pid, node, store, amap, device)?;
            sub.resize(encoded.len() as u64, store, amap, device)?;
            sub.write(0, encoded, store, amap, device)?;
            if let Some(hid) = reused_hid {
                self.heap.free_heap_item(hid, node, store, amap, device)?;
            }
            return Ok(u32::from(sbnid));
        }

        let hid = match reused_hid {
            Some(hid) => self.heap.re_allocate_heap_item(hid, encoded, node, store, amap, device)?,
            None => self.heap.allocate_heap_item(encoded, node, store, amap, device)?,
        };
        Ok(u32::from(hid))
    }

    fn store_entry(
        &mut self,
        pid: u16,
        value: &PropValue,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<PropEntry> {
        let prop_type = value.prop_type();
        let encoded = value.encode();
        let existing = self.bth.lookup(pid, &self.heap, node, store, amap, device).ok();

        let value_or_hid = match prop_type.inline_width() {
            Some(width) => {
                let mut bytes = [0_u8; 4];
                bytes[..width as usize].copy_from_slice(&encoded);
                u32::from_le_bytes(bytes)
            }
            None => self.store_indirect(pid, &encoded, existing, node, store, amap, device)?,
        };

        Ok(PropEntry {
            prop_type: prop_type as u16,
            value_or_hid,
        })
    }

    /// `spec.md` §4.8: insert-or-replace. If the new encoding fits the
    /// existing storage it is overwritten; otherwise fresh storage is
    /// allocated and the old storage freed.
    pub fn write_prop(
        &mut self,
        pid: u16,
        value: PropValue,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let entry = self.store_entry(pid, &value, node, store, amap, device)?;
        self.bth.upsert(pid, entry, &mut self.heap, node, store, amap, device)
    }

    /// Like [`PropertyContext::write_prop`], but fails if `pid` is not
    /// already present.
    pub fn modify_prop(
        &mut self,
        pid: u16,
        value: PropValue,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        self.bth.lookup(pid, &self.heap, node, store, amap, device)?;
        self.write_prop(pid, value, node, store, amap, device)
    }

    /// `spec.md` §4.8: "`remove_prop(pid)` deletes the BTH entry and
    /// frees storage."
    pub fn remove_prop(
        &mut self,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let entry = self.bth.lookup(pid, &self.heap, node, store, amap, device)?;
        if let Ok(prop_type) = PropertyType::try_from(entry.prop_type) {
            if prop_type.inline_width().is_none() {
                if value_or_hid_is_subnode(entry.value_or_hid) {
                    node.delete_subnode(prop_subnode_id(pid));
                    self.subnodes.remove(&pid);
                } else {
                    self.heap.free_heap_item(
                        HeapId::from(entry.value_or_hid),
                        node,
                        store,
                        amap,
                        device,
                    )?;
                }
            }
        }
        self.bth.remove(pid, &mut self.heap, node, store, amap, device)
    }

    /// `spec.md` §4.8: "`save_property_bag()` persists the BTH." Also
    /// finalizes any property that spilled to a subnode this session, the
    /// same way `TableContext::save_table_context` finalizes its row
    /// matrix subnode.
    pub fn save_property_bag(
        &mut self,
        node: &mut Node,
        store: &mut BlockStore,
        amap: &mut AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        for sub in self.subnodes.values_mut() {
            sub.save_node(store, amap, device)?;
            node.save_subnode(sub)?;
        }
        let bth = self.bth;
        bth.save_bth(&mut self.heap, node, store, amap, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::ndb::{block_id::BlockId, node_id::{NodeId, NodeIdType}, FormatVariant};

    fn setup() -> (BlockStore, AllocationMap, MemoryDevice, Node) {
        let node = Node::new(NodeId::new(NodeIdType::NormalMessage, 1).unwrap(), BlockId::NONE, BlockId::NONE);
        (
            BlockStore::new(FormatVariant::Unicode),
            AllocationMap::new(FormatVariant::Unicode, 0),
            MemoryDevice::new(),
            node,
        )
    }

    #[test]
    fn test_inline_and_heap_props_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();

        pc.write_prop(0x3001, PropValue::Int32(42), &mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(0x3002, PropValue::String("subject line".into()), &mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(0x3003, PropValue::Boolean(true), &mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(0x3004, PropValue::Int64(-99), &mut node, &store, &amap, &mut device).unwrap();

        assert_eq!(pc.read_prop(0x3001, &mut node, &store, &amap, &mut device).unwrap(), PropValue::Int32(42));
        assert_eq!(
            pc.read_prop(0x3002, &mut node, &store, &amap, &mut device).unwrap(),
            PropValue::String("subject line".into())
        );
        assert_eq!(pc.read_prop(0x3003, &mut node, &store, &amap, &mut device).unwrap(), PropValue::Boolean(true));
        assert_eq!(pc.read_prop(0x3004, &mut node, &store, &amap, &mut device).unwrap(), PropValue::Int64(-99));
    }

    #[test]
    fn test_overwrite_with_longer_string_reallocates() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(1, PropValue::String("short".into()), &mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(1, PropValue::String("a much longer replacement string".into()), &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(
            pc.read_prop(1, &mut node, &store, &amap, &mut device).unwrap(),
            PropValue::String("a much longer replacement string".into())
        );
    }

    #[test]
    fn test_remove_prop_then_missing() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(5, PropValue::Int16(7), &mut node, &store, &amap, &mut device).unwrap();
        pc.remove_prop(5, &mut node, &store, &amap, &mut device).unwrap();
        assert!(pc.read_prop(5, &mut node, &store, &amap, &mut device).is_err());
    }

    #[test]
    fn test_multi_value_array_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        pc.write_prop(9, PropValue::MultiInt32(vec![1, 2, 3, 4, 5]), &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(
            pc.read_prop(9, &mut node, &store, &amap, &mut device).unwrap(),
            PropValue::MultiInt32(vec![1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn test_modify_prop_requires_existing() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        assert!(pc.modify_prop(1, PropValue::Int16(1), &mut node, &store, &amap, &mut device).is_err());
    }

    #[test]
    fn test_oversized_value_spills_to_subnode() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        let max = HeapOnNode::max_item_len(FormatVariant::Unicode) as usize;
        let big = vec![0x5A_u8; max + 200];

        pc.write_prop(0x4001, PropValue::Binary(big.clone()), &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(
            pc.read_prop(0x4001, &mut node, &store, &amap, &mut device).unwrap(),
            PropValue::Binary(big)
        );
    }

    #[test]
    fn test_oversized_value_survives_save_and_reopen() {
        let (mut store, mut amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        let max = HeapOnNode::max_item_len(FormatVariant::Unicode) as usize;
        let big = vec![0x42_u8; max + 500];

        pc.write_prop(0x4002, PropValue::Binary(big.clone()), &mut node, &store, &amap, &mut device).unwrap();
        pc.save_property_bag(&mut node, &mut store, &mut amap, &mut device).unwrap();
        node.save_node(&mut store, &mut amap, &mut device).unwrap();

        let mut reopened = Node::new(node.nid, node.data_bid, node.subnode_bid);
        let mut reopened_pc = PropertyContext::open(&mut reopened, &store, &amap, &mut device).unwrap();
        assert_eq!(
            reopened_pc.read_prop(0x4002, &mut reopened, &store, &amap, &mut device).unwrap(),
            PropValue::Binary(big)
        );
    }

    #[test]
    fn test_remove_spilled_prop_then_missing() {
        let (store, amap, mut device, mut node) = setup();
        let mut pc = PropertyContext::create(&mut node, &store, &amap, &mut device).unwrap();
        let max = HeapOnNode::max_item_len(FormatVariant::Unicode) as usize;
        let big = vec![0x11_u8; max + 50];

        pc.write_prop(0x4003, PropValue::Binary(big), &mut node, &store, &amap, &mut device).unwrap();
        pc.remove_prop(0x4003, &mut node, &store, &amap, &mut device).unwrap();
        assert!(pc.read_prop(0x4003, &mut node, &store, &amap, &mut device).is_err());
    }
}
