//! ## BTree-on-Heap (BTH)
//!
//! `spec.md` §4.7: "A B+ tree whose keys and record values are
//! parameters `(K, V)`." Every node of the tree — leaf or intermediate —
//! is a single heap item, so splitting and merging happens at the
//! granularity of [`HeapOnNode`] allocations rather than whole blocks.
//! The recursive insert/remove shape mirrors `ndb::node`'s subnode tree
//! (`sn_upsert`/`sn_remove`), generalized here to caller-supplied key and
//! value codecs instead of a single hardcoded entry type.

use std::marker::PhantomData;

use super::{
    heap::{HeapId, HeapNodeType, HeapOnNode},
    LtpError, LtpResult,
};
use crate::device::Device;
use crate::ndb::{amap::AllocationMap, block_store::BlockStore, node::Node};

/// A key storable in a [`Bth`]. `spec.md` §4.7: "root is a `bth_header`
/// heap item: {signature, key size, entry size, levels, root heap id}."
pub trait BthKey: Copy + Ord + std::fmt::Debug {
    const SIZE: u8;
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Self;
}

/// A record value storable in a [`Bth`].
pub trait BthValue: Clone + std::fmt::Debug {
    const SIZE: u8;
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Self;
}

impl BthKey for u16 {
    const SIZE: u8 = 2;
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl BthKey for u32 {
    const SIZE: u8 = 4;
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl BthValue for u16 {
    const SIZE: u8 = 2;
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl BthValue for u32 {
    const SIZE: u8 = 4;
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

const BTH_TYPE_TAG: u8 = HeapNodeType::Tree as u8;

fn key_size(key_size: u8) -> LtpResult<()> {
    match key_size {
        2 | 4 | 8 | 16 => Ok(()),
        invalid => Err(LtpError::InvalidHeapTreeKeySize(invalid)),
    }
}

fn entry_size(entry_size: u8) -> LtpResult<()> {
    match entry_size {
        1..=32 => Ok(()),
        invalid => Err(LtpError::InvalidHeapTreeDataSize(invalid)),
    }
}

/// `spec.md` §4.7's `bth_header`, plus the `(K, V)` type parameters
/// fixing the byte widths this particular tree's nodes use.
#[derive(Clone, Copy, Debug)]
pub struct Bth<K, V> {
    header_hid: HeapId,
    levels: u8,
    root: HeapId,
    _marker: PhantomData<(K, V)>,
}

impl<K: BthKey, V: BthValue> Bth<K, V> {
    fn capacity_leaf(variant: crate::ndb::FormatVariant) -> usize {
        let page_room = HeapOnNode::max_item_len(variant) as usize;
        (page_room / (K::SIZE as usize + V::SIZE as usize)).max(2)
    }

    fn capacity_internal(variant: crate::ndb::FormatVariant) -> usize {
        let page_room = HeapOnNode::max_item_len(variant) as usize;
        (page_room / (K::SIZE as usize + 4)).max(2)
    }

    /// `spec.md` §4.7: creates an empty tree and writes its header item,
    /// wiring it as the heap's root.
    pub fn create(
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        key_size(K::SIZE)?;
        entry_size(V::SIZE)?;
        let mut bth = Self {
            header_hid: HeapId::NONE,
            levels: 0,
            root: HeapId::NONE,
            _marker: PhantomData,
        };
        let header_bytes = bth.encode_header();
        let hid = heap.allocate_heap_item(&header_bytes, node, store, amap, device)?;
        bth.header_hid = hid;
        heap.set_root_id(hid, node, store, amap, device)?;
        Ok(bth)
    }

    /// `spec.md` §4.7: opens a tree whose header item is the heap's
    /// current root.
    pub fn open(
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let hid = heap.root_id();
        let bytes = heap.read(hid, node, store, amap, device)?;
        Self::decode_header(hid, &bytes)
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = vec![BTH_TYPE_TAG, K::SIZE, V::SIZE, self.levels];
        self.root.write(&mut buf).ok();
        buf
    }

    fn decode_header(header_hid: HeapId, bytes: &[u8]) -> LtpResult<Self> {
        if bytes.first().copied() != Some(BTH_TYPE_TAG) {
            return Err(LtpError::InvalidHeapTreeNodeType(HeapNodeType::Tree));
        }
        key_size(bytes[1])?;
        entry_size(bytes[2])?;
        let levels = bytes[3];
        let root = HeapId::read(&mut &bytes[4..8])?;
        Ok(Self {
            header_hid,
            levels,
            root,
            _marker: PhantomData,
        })
    }

    /// Like [`Bth::create`], but the header item is left as a free-floating
    /// heap item instead of being wired as the heap's root — for callers
    /// (the table context's row index) that embed the header hid inside
    /// their own heap-rooted structure instead.
    pub fn create_detached(
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        key_size(K::SIZE)?;
        entry_size(V::SIZE)?;
        let mut bth = Self {
            header_hid: HeapId::NONE,
            levels: 0,
            root: HeapId::NONE,
            _marker: PhantomData,
        };
        let header_bytes = bth.encode_header();
        bth.header_hid = heap.allocate_heap_item(&header_bytes, node, store, amap, device)?;
        Ok(bth)
    }

    /// Opens a tree whose header item is `header_hid`, rather than the
    /// heap's root (see [`Bth::create_detached`]).
    pub fn open_detached(
        header_hid: HeapId,
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Self> {
        let bytes = heap.read(header_hid, node, store, amap, device)?;
        Self::decode_header(header_hid, &bytes)
    }

    pub fn header_id(&self) -> HeapId {
        self.header_hid
    }

    /// Tree depth below the root: `0` means the root item is itself a
    /// leaf page.
    pub fn levels(&self) -> u8 {
        self.levels
    }

    /// `spec.md` §4.7: `save_bth()` — persists the header item (root hid
    /// and level count) after tree mutations.
    pub fn save_bth(
        &self,
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        let bytes = self.encode_header();
        heap.write(self.header_hid, &bytes, node, store, amap, device)
    }

    fn decode_leaf(bytes: &[u8]) -> Vec<(K, V)> {
        let stride = K::SIZE as usize + V::SIZE as usize;
        bytes
            .chunks_exact(stride)
            .map(|chunk| (K::decode(&chunk[..K::SIZE as usize]), V::decode(&chunk[K::SIZE as usize..])))
            .collect()
    }

    fn encode_leaf(entries: &[(K, V)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(entries.len() * (K::SIZE as usize + V::SIZE as usize));
        for (k, v) in entries {
            k.encode(&mut buf);
            v.encode(&mut buf);
        }
        buf
    }

    fn decode_internal(bytes: &[u8]) -> Vec<(K, HeapId)> {
        let stride = K::SIZE as usize + 4;
        bytes
            .chunks_exact(stride)
            .map(|chunk| {
                let key = K::decode(&chunk[..K::SIZE as usize]);
                let mut rest = &chunk[K::SIZE as usize..];
                (key, HeapId::read(&mut rest).expect("in-memory read"))
            })
            .collect()
    }

    fn encode_internal(entries: &[(K, HeapId)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(entries.len() * (K::SIZE as usize + 4));
        for (k, hid) in entries {
            k.encode(&mut buf);
            hid.write(&mut buf).ok();
        }
        buf
    }

    /// `spec.md` §4.7: standard B-tree lookup.
    pub fn lookup(
        &self,
        key: K,
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<V> {
        if self.root.is_none() {
            return Err(LtpError::InvalidHeapIndex(0));
        }
        self.lookup_in(self.root, self.levels, key, heap, node, store, amap, device)
    }

    #[allow(clippy::too_many_arguments)]
    fn lookup_in(
        &self,
        id: HeapId,
        level: u8,
        key: K,
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<V> {
        let bytes = heap.read(id, node, store, amap, device)?;
        if level == 0 {
            Self::decode_leaf(&bytes)
                .into_iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .ok_or(LtpError::InvalidHeapIndex(0))
        } else {
            let entries = Self::decode_internal(&bytes);
            let idx = entries.partition_point(|(k, _)| *k <= key).saturating_sub(1);
            self.lookup_in(entries[idx].1, level - 1, key, heap, node, store, amap, device)
        }
    }

    pub fn iter(
        &self,
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<Vec<(K, V)>> {
        if self.root.is_none() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.collect(self.root, self.levels, heap, node, store, amap, device, &mut out)?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn collect(
        &self,
        id: HeapId,
        level: u8,
        heap: &HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
        out: &mut Vec<(K, V)>,
    ) -> LtpResult<()> {
        let bytes = heap.read(id, node, store, amap, device)?;
        if level == 0 {
            out.extend(Self::decode_leaf(&bytes));
        } else {
            for (_, child) in Self::decode_internal(&bytes) {
                self.collect(child, level - 1, heap, node, store, amap, device, out)?;
            }
        }
        Ok(())
    }

    /// `spec.md` §4.7: insert-or-replace (the engine's "modify" — BTH
    /// itself has no separate insert-only mode; callers enforcing
    /// duplicate-key rejection check [`Bth::lookup`] first, as the
    /// property and table contexts do).
    pub fn upsert(
        &mut self,
        key: K,
        value: V,
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        if self.root.is_none() {
            let bytes = Self::encode_leaf(&[(key, value)]);
            self.root = heap.allocate_heap_item(&bytes, node, store, amap, device)?;
            self.levels = 0;
            return Ok(());
        }

        match self.upsert_in(self.root, self.levels, key, value, heap, node, store, amap, device)? {
            UpsertOutcome::Done(id) => {
                self.root = id;
            }
            UpsertOutcome::Split(left, split_key, right) => {
                let entries = vec![(K::decode(&vec_zero::<K>()), left), (split_key, right)];
                let bytes = Self::encode_internal(&entries);
                self.root = heap.allocate_heap_item(&bytes, node, store, amap, device)?;
                self.levels += 1;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_in(
        &self,
        id: HeapId,
        level: u8,
        key: K,
        value: V,
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<UpsertOutcome<K>> {
        if level == 0 {
            let mut entries = Self::decode_leaf(&heap.read(id, node, store, amap, device)?);
            match entries.binary_search_by_key(&key, |(k, _)| *k) {
                Ok(idx) => entries[idx] = (key, value),
                Err(idx) => entries.insert(idx, (key, value)),
            }
            if entries.len() <= Self::capacity_leaf(store.variant()) {
                let bytes = Self::encode_leaf(&entries);
                let new_id = heap.re_allocate_heap_item(id, &bytes, node, store, amap, device)?;
                Ok(UpsertOutcome::Done(new_id))
            } else {
                let mid = entries.len() / 2;
                let right = entries.split_off(mid);
                let split_key = right[0].0;
                let left_bytes = Self::encode_leaf(&entries);
                let right_bytes = Self::encode_leaf(&right);
                let left_id = heap.re_allocate_heap_item(id, &left_bytes, node, store, amap, device)?;
                let right_id = heap.allocate_heap_item(&right_bytes, node, store, amap, device)?;
                Ok(UpsertOutcome::Split(left_id, split_key, right_id))
            }
        } else {
            let mut entries = Self::decode_internal(&heap.read(id, node, store, amap, device)?);
            let idx = entries.partition_point(|(k, _)| *k <= key).saturating_sub(1);
            match self.upsert_in(entries[idx].1, level - 1, key, value, heap, node, store, amap, device)? {
                UpsertOutcome::Done(new_child) => {
                    entries[idx].1 = new_child;
                    let bytes = Self::encode_internal(&entries);
                    let new_id = heap.re_allocate_heap_item(id, &bytes, node, store, amap, device)?;
                    Ok(UpsertOutcome::Done(new_id))
                }
                UpsertOutcome::Split(left, split_key, right) => {
                    entries[idx].1 = left;
                    entries.insert(idx + 1, (split_key, right));
                    if entries.len() <= Self::capacity_internal(store.variant()) {
                        let bytes = Self::encode_internal(&entries);
                        let new_id = heap.re_allocate_heap_item(id, &bytes, node, store, amap, device)?;
                        Ok(UpsertOutcome::Done(new_id))
                    } else {
                        let mid = entries.len() / 2;
                        let right_entries = entries.split_off(mid);
                        let split_key = right_entries[0].0;
                        let left_bytes = Self::encode_internal(&entries);
                        let right_bytes = Self::encode_internal(&right_entries);
                        let left_id = heap.re_allocate_heap_item(id, &left_bytes, node, store, amap, device)?;
                        let right_id = heap.allocate_heap_item(&right_bytes, node, store, amap, device)?;
                        Ok(UpsertOutcome::Split(left_id, split_key, right_id))
                    }
                }
            }
        }
    }

    /// `spec.md` §4.7: remove by key; underflow is not rebalanced below a
    /// single leaf, the same pragmatic tradeoff the subnode tree makes
    /// (`ndb::node`'s module doc), since BTH trees here stay small.
    pub fn remove(
        &mut self,
        key: K,
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<()> {
        if self.root.is_none() {
            return Err(LtpError::InvalidHeapIndex(0));
        }
        let (new_root, found) = self.remove_in(self.root, self.levels, key, heap, node, store, amap, device)?;
        if !found {
            return Err(LtpError::InvalidHeapIndex(0));
        }
        self.root = new_root;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_in(
        &self,
        id: HeapId,
        level: u8,
        key: K,
        heap: &mut HeapOnNode,
        node: &mut Node,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> LtpResult<(HeapId, bool)> {
        if level == 0 {
            let mut entries = Self::decode_leaf(&heap.read(id, node, store, amap, device)?);
            match entries.iter().position(|(k, _)| *k == key) {
                None => Ok((id, false)),
                Some(idx) => {
                    entries.remove(idx);
                    let bytes = Self::encode_leaf(&entries);
                    let new_id = heap.re_allocate_heap_item(id, &bytes, node, store, amap, device)?;
                    Ok((new_id, true))
                }
            }
        } else {
            let mut entries = Self::decode_internal(&heap.read(id, node, store, amap, device)?);
            let idx = entries.partition_point(|(k, _)| *k <= key).saturating_sub(1);
            let (new_child, found) =
                self.remove_in(entries[idx].1, level - 1, key, heap, node, store, amap, device)?;
            if !found {
                return Ok((id, false));
            }
            entries[idx].1 = new_child;
            let bytes = Self::encode_internal(&entries);
            let new_id = heap.re_allocate_heap_item(id, &bytes, node, store, amap, device)?;
            Ok((new_id, true))
        }
    }
}

enum UpsertOutcome<K> {
    Done(HeapId),
    Split(HeapId, K, HeapId),
}

fn vec_zero<K: BthKey>() -> Vec<u8> {
    vec![0_u8; K::SIZE as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::ndb::{amap::AllocationMap, block_id::BlockId, node_id::{NodeId, NodeIdType}, FormatVariant};

    fn setup() -> (BlockStore, AllocationMap, MemoryDevice, Node) {
        let node = Node::new(NodeId::new(NodeIdType::HeapNode, 1).unwrap(), BlockId::NONE, BlockId::NONE);
        (
            BlockStore::new(FormatVariant::Unicode),
            AllocationMap::new(FormatVariant::Unicode, 0),
            MemoryDevice::new(),
            node,
        )
    }

    #[test]
    fn test_insert_lookup_round_trip() {
        let (store, amap, mut device, mut node) = setup();
        let mut heap = HeapOnNode::create(HeapNodeType::Tree, &mut node, &store, &amap, &mut device).unwrap();
        let mut bth: Bth<u16, u32> = Bth::create(&mut heap, &mut node, &store, &amap, &mut device).unwrap();

        for i in 0..50u16 {
            bth.upsert(i, i as u32 * 10, &mut heap, &mut node, &store, &amap, &mut device).unwrap();
        }
        for i in 0..50u16 {
            let v = bth.lookup(i, &heap, &mut node, &store, &amap, &mut device).unwrap();
            assert_eq!(v, i as u32 * 10);
        }
        assert!(bth.levels > 0);
    }

    #[test]
    fn test_remove_then_missing() {
        let (store, amap, mut device, mut node) = setup();
        let mut heap = HeapOnNode::create(HeapNodeType::Tree, &mut node, &store, &amap, &mut device).unwrap();
        let mut bth: Bth<u16, u32> = Bth::create(&mut heap, &mut node, &store, &amap, &mut device).unwrap();

        bth.upsert(1, 100, &mut heap, &mut node, &store, &amap, &mut device).unwrap();
        bth.remove(1, &mut heap, &mut node, &store, &amap, &mut device).unwrap();
        assert!(bth.lookup(1, &heap, &mut node, &store, &amap, &mut device).is_err());
    }

    #[test]
    fn test_iter_returns_all_in_order() {
        let (store, amap, mut device, mut node) = setup();
        let mut heap = HeapOnNode::create(HeapNodeType::Tree, &mut node, &store, &amap, &mut device).unwrap();
        let mut bth: Bth<u16, u32> = Bth::create(&mut heap, &mut node, &store, &amap, &mut device).unwrap();
        for i in (0..30u16).rev() {
            bth.upsert(i, i as u32, &mut heap, &mut node, &store, &amap, &mut device).unwrap();
        }
        let all = bth.iter(&heap, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(all.len(), 30);
    }

    #[test]
    fn test_header_persists_across_reopen() {
        let (store, amap, mut device, mut node) = setup();
        let mut heap = HeapOnNode::create(HeapNodeType::Tree, &mut node, &store, &amap, &mut device).unwrap();
        let mut bth: Bth<u16, u32> = Bth::create(&mut heap, &mut node, &store, &amap, &mut device).unwrap();
        bth.upsert(7, 70, &mut heap, &mut node, &store, &amap, &mut device).unwrap();
        bth.save_bth(&mut heap, &mut node, &store, &amap, &mut device).unwrap();

        let reopened: Bth<u16, u32> = Bth::open(&heap, &mut node, &store, &amap, &mut device).unwrap();
        let v = reopened.lookup(7, &heap, &mut node, &store, &amap, &mut device).unwrap();
        assert_eq!(v, 70);
    }
}
