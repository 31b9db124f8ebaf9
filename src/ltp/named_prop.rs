//! ## Name-ID map
//!
//! `spec.md` §4.10: "A single well-known node holds three BTH/PC
//! structures mapping `(guid, name|id)` to a 16-bit numeric `prop_id` in
//! a reserved range." Implemented here as two BTH trees sharing one
//! heap: a reverse map (`prop_id -> named_prop` payload) for `lookup`,
//! and a forward map (`hash(named_prop) -> prop_id`) so `add_prop` can
//! de-duplicate.
//!
//! Grounded on the teacher's `messaging`-layer `NamedPropertyMap` for
//! the id allocation and reserved-range convention, reworked onto
//! `Bth`/`HeapOnNode` directly since this crate has no messaging layer.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::{
    bth::{Bth, BthValue},
    heap::{HeapId, HeapNodeType, HeapOnNode},
    LtpError, LtpResult,
};
use crate::device::Device;
use crate::ndb::{amap::AllocationMap, block_store::BlockStore, node::Node};

/// First assignable named-property id; 0x0000-0x7FFF is reserved for
/// well-known (non-named) properties, matching MS-PST's split.
const FIRST_NAMED_PID: u16 = 0x8000;

const NAMED_PROP_TAG: u8 = HeapNodeType::Properties as u8;

/// What a named property is keyed by within its property set `guid`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NamedPropertyKey {
    Id(u32),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedProperty {
    pub guid: [u8; 16],
    pub key: NamedPropertyKey,
}

impl NamedProperty {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.guid);
        match &self.key {
            NamedPropertyKey::Id(id) => {
                buf.push(0);
                buf.extend_from_slice(&id.to_le_bytes());
            }
            NamedPropertyKey::Name(name) => {
                buf.push(1);
                let bytes = name.as_bytes();
                buf.write_u16::<LittleEndian>(bytes.len() as u16).unwrap();
                buf.extend_from_slice(bytes);
            }
        }
        buf
    }

    fn decode(bytes: &[u8]) -> LtpResult<Self> {
        let mut guid = [0_u8; 16];
        guid.copy_from_slice(&bytes[..16]);
        let key = match bytes[16] {
            0 => {
                let id = u32::from_le_bytes(bytes[17..21].try_into().unwrap());
                NamedPropertyKey::Id(id)
            }
            _ => {
                let mut cursor = Cursor::new(&bytes[17..]);
                let len = cursor.read_u16::<LittleEndian>()? as usize;
                let start = 19;
                let name = String::from_utf8(bytes[start..start + len].to_vec())
                    .map_err(|_| LtpError::StringNotNullTerminated(len))?;
                NamedPropertyKey::Name(name)
            }
        };
        Ok(Self { guid, key })
    }

    /// Deterministic 32-bit digest used as the forward map's key. A real
    /// composite `(guid, name|id)` key doesn't fit `Bth`'s fixed-width
    /// key contract, so lookups key on this hash instead; a collision
    /// would wrongly dedup two distinct named properties onto the same
    /// id, but is vanishingly unlikely at the scale a single PST's named
    /// property set reaches.
    fn digest(&self) -> u32 {
        let bytes = self.encode();
        let mut hash = 0x811c_9dc5_u32;
        for b in bytes {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl BthValue for HeapId {
    const SIZE: u8 = 4;
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&u32::from(*self).to_le_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        HeapId::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// `spec.md` §4.10's name-id map.
pub struct NamedPropertyMap {
    heap: HeapOnNode,
    header_hid: HeapId,
    next_pid: u16,
    forward: Bth<u32, u16>,
    reverse: Bth<u16, HeapId>,
}

impl NamedPropertyMap {
    pub fn create(
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let mut heap = HeapOnNode::create(HeapNodeType::Properties, node, store, amap, device)?;
        let forward: Bth<u32, u16> = Bth::create_detached(&mut heap, node, store, amap, device)?;
        let reverse: Bth<u16, HeapId> = Bth::create_detached(&mut heap, node, store, amap, device)?;

        let mut map = Self {
            heap,
            header_hid: HeapId::NONE,
            next_pid: FIRST_NAMED_PID,
            forward,
            reverse,
        };
        let header_bytes = map.encode_header();
        let header_hid = map.heap.allocate_heap_item(&header_bytes, node, store, amap, device)?;
        map.header_hid = header_hid;
        map.heap.set_root_id(header_hid, node, store, amap, device)?;
        Ok(map)
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
        if bytes.first().copied() != Some(NAMED_PROP_TAG) {
            return Err(LtpError::InvalidHeapNodeTypeSignature(bytes.first().copied().unwrap_or(0)));
        }
        let next_pid = u16::from_le_bytes([bytes[1], bytes[2]]);
        let forward_hid = HeapId::read(&mut &bytes[3..7])?;
        let reverse_hid = HeapId::read(&mut &bytes[7..11])?;
        let forward = Bth::open_detached(forward_hid, &heap, node, store, amap, device)?;
        let reverse = Bth::open_detached(reverse_hid, &heap, node, store, amap, device)?;
        Ok(Self {
            heap,
            header_hid,
            next_pid,
            forward,
            reverse,
        })
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = vec![NAMED_PROP_TAG];
        buf.extend_from_slice(&self.next_pid.to_le_bytes());
        self.forward.header_id().write(&mut buf).ok();
        self.reverse.header_id().write(&mut buf).ok();
        buf
    }

    fn save_header(
        &mut self,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let bytes = self.encode_header();
        self.heap.write(self.header_hid, &bytes, node, store, amap, device)
    }

    /// `spec.md` §4.10: "`lookup(pid) -> named_prop`".
    pub fn lookup(
        &self,
        pid: u16,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<NamedProperty> {
        let hid = self
            .reverse
            .lookup(pid, &self.heap, node, store, amap, device)
            .map_err(|_| LtpError::NamedPropertyNotFound(NamedPropertyKey::Id(pid as u32)))?;
        let bytes = self.heap.read(hid, node, store, amap, device)?;
        NamedProperty::decode(&bytes)
    }

    /// `spec.md` §4.10: "`add_prop(named_prop) -> pid` allocates a fresh
    /// id on insert" — re-uses the existing id if this exact
    /// `(guid, name|id)` was already registered.
    pub fn add_prop(
        &mut self,
        prop: NamedProperty,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<u16> {
        let key = prop.digest();
        if let Ok(pid) = self.forward.lookup(key, &self.heap, node, store, amap, device) {
            return Ok(pid);
        }

        let pid = self.next_pid;
        self.next_pid = self
            .next_pid
            .checked_add(1)
            .ok_or_else(|| LtpError::NamedPropertyNotFound(prop.key.clone()))?;

        let bytes = prop.encode();
        let hid = self.heap.allocate_heap_item(&bytes, node, store, amap, device)?;
        self.reverse.upsert(pid, hid, &mut self.heap, node, store, amap, device)?;
        self.forward.upsert(key, pid, &mut self.heap, node, store, amap, device)?;
        self.save_named_properties(node, store, amap, device)?;
        Ok(pid)
    }

    /// Persists the forward/reverse BTH headers and the map's own
    /// header, analogous to `save_bth`/`save_property_bag`.
    pub fn save_named_properties(
        &mut self,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        self.forward.save_bth(&mut self.heap, node, store, amap, device)?;
        self.reverse.save_bth(&mut self.heap, node, store, amap, device)?;
        self.save_header(node, store, amap, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::ndb::{block_id::BlockId, node_id::{NodeId, NodeIdType}, FormatVariant};

    fn setup() -> (BlockStore, AllocationMap, MemoryDevice, Node) {
        let node = Node::new(NodeId::new(NodeIdType::Internal, 2).unwrap(), BlockId::NONE, BlockId::NONE);
        (
            BlockStore::new(FormatVariant::Unicode),
            AllocationMap::new(FormatVariant::Unicode, 0),
            MemoryDevice::new(),
            node,
        )
    }

    fn ps_mapi() -> [u8; 16] {
        [0x20, 0x32, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46]
    }

    #[test]
    fn test_add_then_lookup_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut map = NamedPropertyMap::create(&mut node, &store, &amap, &mut device).unwrap();
        let prop = NamedProperty {
            guid: ps_mapi(),
            key: NamedPropertyKey::Name("Keywords".into()),
        };
        let pid = map.add_prop(prop.clone(), &mut node, &store, &amap, &mut device).unwrap();
        assert!(pid >= FIRST_NAMED_PID);

        let back = map.lookup(pid, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(back, prop);
    }

    #[test]
    fn test_add_prop_twice_returns_same_id() {
        let (store, amap, mut device, mut node) = setup();
        let mut map = NamedPropertyMap::create(&mut node, &store, &amap, &mut device).unwrap();
        let prop = NamedProperty {
            guid: ps_mapi(),
            key: NamedPropertyKey::Id(0x8102),
        };
        let first = map.add_prop(prop.clone(), &mut node, &store, &amap, &mut device).unwrap();
        let second = map.add_prop(prop, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_props_get_distinct_ids() {
        let (store, amap, mut device, mut node) = setup();
        let mut map = NamedPropertyMap::create(&mut node, &store, &amap, &mut device).unwrap();
        let a = map
            .add_prop(
                NamedProperty { guid: ps_mapi(), key: NamedPropertyKey::Name("A".into()) },
                &mut node,
                &store,
                &amap,
                &mut device,
            )
            .unwrap();
        let b = map
            .add_prop(
                NamedProperty { guid: ps_mapi(), key: NamedPropertyKey::Name("B".into()) },
                &mut node,
                &store,
                &amap,
                &mut device,
            )
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lookup_missing_pid_errors() {
        let (store, amap, mut device, mut node) = setup();
        let map = NamedPropertyMap::create(&mut node, &store, &amap, &mut device).unwrap();
        assert!(map.lookup(0x8000, &mut node, &store, &amap, &mut device).is_err());
    }
}
