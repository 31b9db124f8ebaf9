//! Node byte-stream view and the subnode tree. `spec.md` §4.4: "A node
//! binds `{nid, data_bid, subnode_bid, db_context}` and offers a
//! byte-stream interface."
//!
//! A [`Node`] is a thin, lazily-materialized handle: its data stream is
//! only pulled from storage the first time a caller reads or writes it,
//! and edits stay in memory until [`Node::save_node`] stages them. The
//! surrounding context (not this module) owns the [`BlockStore`],
//! [`AllocationMap`] and [`Device`] — every method that touches storage
//! takes them as explicit parameters, the same calling convention
//! [`BlockStore`] itself uses.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::instrument;

use super::{
    amap::AllocationMap,
    block::{max_block_payload, Block, SubnodeInternalEntry, SubnodeLeafEntry},
    block_id::BlockId,
    block_store::BlockStore,
    node_id::NodeId,
    FormatVariant, NdbError, NdbResult,
};
use crate::device::Device;

/// A subnode descriptor, as held by the parent's subnode tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnodeDescriptor {
    pub nid: NodeId,
    pub data_bid: BlockId,
    pub subnode_bid: BlockId,
}

/// `spec.md` §4.4: a byte-stream-backed object identified by `nid`.
pub struct Node {
    pub nid: NodeId,
    pub data_bid: BlockId,
    pub subnode_bid: BlockId,
    pub parent_nid: Option<NodeId>,
    dirty_data: Option<Vec<u8>>,
    pending_subnode_edits: Vec<SubnodeEdit>,
    /// Block ids superseded by in-memory edits, to be released once the
    /// owning context commits (`spec.md` §4.3's "pending free list").
    pub freed: Vec<BlockId>,
}

enum SubnodeEdit {
    Upsert(SubnodeDescriptor),
    Delete(NodeId),
}

impl Node {
    pub fn new(nid: NodeId, data_bid: BlockId, subnode_bid: BlockId) -> Self {
        Self {
            nid,
            data_bid,
            subnode_bid,
            parent_nid: None,
            dirty_data: None,
            pending_subnode_edits: Vec::new(),
            freed: Vec::new(),
        }
    }

    fn materialize(
        &mut self,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<&mut Vec<u8>> {
        if self.dirty_data.is_none() {
            let bytes = store.read_stream(self.data_bid, amap, device)?;
            self.dirty_data = Some(bytes);
        }
        Ok(self.dirty_data.as_mut().expect("just materialized"))
    }

    pub fn size(
        &mut self,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<u64> {
        Ok(self.materialize(store, amap, device)?.len() as u64)
    }

    pub fn read(
        &mut self,
        offset: u64,
        len: u64,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<Vec<u8>> {
        let data = self.materialize(store, amap, device)?;
        let start = offset.min(data.len() as u64) as usize;
        let end = (offset + len).min(data.len() as u64) as usize;
        Ok(data[start..end].to_vec())
    }

    /// Typed read, treating the stream as a packed little-endian struct
    /// starting at `offset` (`spec.md` §4.4: "typed `read<T>(off)` helpers
    /// treating the stream as a packed structure").
    pub fn read_u32_at(
        &mut self,
        offset: u64,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<u32> {
        let bytes = self.read(offset, 4, store, amap, device)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        Ok(cursor.read_u32::<LittleEndian>()?)
    }

    pub fn write(
        &mut self,
        offset: u64,
        bytes: &[u8],
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<()> {
        let data = self.materialize(store, amap, device)?;
        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn resize(
        &mut self,
        new_size: u64,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<()> {
        let data = self.materialize(store, amap, device)?;
        data.resize(new_size as usize, 0);
        Ok(())
    }

    /// Flushes pending data and subnode edits into fresh blocks, per
    /// `spec.md` §4.4: "serialises all pending data edits into (possibly
    /// new) blocks ... and — if subnode edits are pending — serialises the
    /// subnode tree."
    #[instrument(skip(self, store, amap, device))]
    pub fn save_node(
        &mut self,
        store: &mut BlockStore,
        amap: &mut AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<()> {
        if let Some(data) = self.dirty_data.take() {
            let old = self.data_bid;
            self.data_bid = store.write_stream(&data, amap, device)?;
            if !old.is_none() {
                self.freed.push(old);
            }
        }

        if !self.pending_subnode_edits.is_empty() {
            let mut root = if self.subnode_bid.is_none() {
                None
            } else {
                Some(self.subnode_bid)
            };
            for edit in std::mem::take(&mut self.pending_subnode_edits) {
                root = match edit {
                    SubnodeEdit::Upsert(desc) => Some(sn_upsert(
                        root,
                        desc,
                        store,
                        amap,
                        device,
                        &mut self.freed,
                    )?),
                    SubnodeEdit::Delete(nid) => {
                        sn_remove(root, nid, store, amap, device, &mut self.freed)?
                    }
                };
            }
            self.subnode_bid = root.unwrap_or(BlockId::NONE);
        }
        Ok(())
    }

    /// `spec.md` §4.4: "`create_subnode(sbnid)` returns a new `node` whose
    /// `parent_nid = nid`."
    pub fn create_subnode(&self, sbnid: NodeId) -> Node {
        let mut child = Node::new(sbnid, BlockId::NONE, BlockId::NONE);
        child.parent_nid = Some(self.nid);
        child
    }

    /// Stages `child`'s descriptor into this node's subnode dirty map.
    /// `child` must already have been `save_node`d so its block ids are
    /// current.
    pub fn save_subnode(&mut self, child: &Node) -> NdbResult<()> {
        if child.dirty_data.is_some() || !child.pending_subnode_edits.is_empty() {
            return Err(NdbError::InvalidArgument(
                "save_subnode called before child.save_node".into(),
            ));
        }
        self.pending_subnode_edits
            .push(SubnodeEdit::Upsert(SubnodeDescriptor {
                nid: child.nid,
                data_bid: child.data_bid,
                subnode_bid: child.subnode_bid,
            }));
        Ok(())
    }

    pub fn delete_subnode(&mut self, sbnid: NodeId) {
        self.pending_subnode_edits.push(SubnodeEdit::Delete(sbnid));
    }

    /// Looks up a subnode descriptor by key, consulting pending edits
    /// first. `spec.md` §4.4: "missing lookup fails with `key_not_found<K>`".
    pub fn get_subnode_block(
        &self,
        sbnid: NodeId,
        store: &BlockStore,
        amap: &AllocationMap,
        device: &mut dyn Device,
    ) -> NdbResult<SubnodeDescriptor> {
        for edit in self.pending_subnode_edits.iter().rev() {
            match edit {
                SubnodeEdit::Upsert(desc) if desc.nid == sbnid => return Ok(*desc),
                SubnodeEdit::Delete(nid) if *nid == sbnid => {
                    return Err(NdbError::NodeKeyNotFound(sbnid))
                }
                _ => {}
            }
        }
        if self.subnode_bid.is_none() {
            return Err(NdbError::NodeKeyNotFound(sbnid));
        }
        sn_lookup(self.subnode_bid, sbnid, store, amap, device)
    }
}

fn sn_capacity_leaf(variant: FormatVariant) -> usize {
    let entry_size = 4 + 2 * variant.block_id_size();
    ((max_block_payload(variant) - 3) / entry_size).max(2)
}

fn sn_capacity_internal(variant: FormatVariant) -> usize {
    let entry_size = 4 + variant.block_id_size();
    ((max_block_payload(variant) - 3) / entry_size).max(2)
}

fn sn_lookup(
    id: BlockId,
    nid: NodeId,
    store: &BlockStore,
    amap: &AllocationMap,
    device: &mut dyn Device,
) -> NdbResult<SubnodeDescriptor> {
    match store.read_block(id, amap, device)? {
        Block::SubnodeLeaf { entries } => entries
            .into_iter()
            .find(|e| e.nid == nid)
            .map(|e| SubnodeDescriptor {
                nid: e.nid,
                data_bid: e.data_bid,
                subnode_bid: e.subnode_bid,
            })
            .ok_or(NdbError::NodeKeyNotFound(nid)),
        Block::SubnodeInternal { entries } => {
            let idx = entries.partition_point(|e| e.key <= nid).saturating_sub(1);
            sn_lookup(entries[idx].child_id, nid, store, amap, device)
        }
        other => Err(NdbError::FormatError(format!(
            "block {id:?} is not a subnode tree node: {other:?}"
        ))),
    }
}

enum SnInsertOutcome {
    Done(BlockId),
    Split(BlockId, NodeId, BlockId),
}

fn sn_upsert(
    root: Option<BlockId>,
    desc: SubnodeDescriptor,
    store: &mut BlockStore,
    amap: &mut AllocationMap,
    device: &mut dyn Device,
    freed: &mut Vec<BlockId>,
) -> NdbResult<BlockId> {
    let root = match root {
        None => {
            let block = Block::SubnodeLeaf {
                entries: vec![SubnodeLeafEntry {
                    nid: desc.nid,
                    data_bid: desc.data_bid,
                    subnode_bid: desc.subnode_bid,
                }],
            };
            return store.write_raw_block(&block, amap, device);
        }
        Some(id) => id,
    };

    match sn_upsert_in(root, desc, store, amap, device, freed)? {
        SnInsertOutcome::Done(id) => Ok(id),
        SnInsertOutcome::Split(left, split_key, right) => {
            let block = Block::SubnodeInternal {
                entries: vec![
                    SubnodeInternalEntry {
                        key: NodeId::default(),
                        child_id: left,
                    },
                    SubnodeInternalEntry {
                        key: split_key,
                        child_id: right,
                    },
                ],
            };
            store.write_raw_block(&block, amap, device)
        }
    }
}

fn sn_upsert_in(
    id: BlockId,
    desc: SubnodeDescriptor,
    store: &mut BlockStore,
    amap: &mut AllocationMap,
    device: &mut dyn Device,
    freed: &mut Vec<BlockId>,
) -> NdbResult<SnInsertOutcome> {
    let variant = store.variant();
    match store.read_block(id, amap, device)? {
        Block::SubnodeLeaf { mut entries } => {
            freed.push(id);
            match entries.binary_search_by_key(&desc.nid, |e| e.nid) {
                Ok(idx) => {
                    entries[idx] = SubnodeLeafEntry {
                        nid: desc.nid,
                        data_bid: desc.data_bid,
                        subnode_bid: desc.subnode_bid,
                    };
                }
                Err(idx) => entries.insert(
                    idx,
                    SubnodeLeafEntry {
                        nid: desc.nid,
                        data_bid: desc.data_bid,
                        subnode_bid: desc.subnode_bid,
                    },
                ),
            }

            if entries.len() <= sn_capacity_leaf(variant) {
                let new_id =
                    store.write_raw_block(&Block::SubnodeLeaf { entries }, amap, device)?;
                Ok(SnInsertOutcome::Done(new_id))
            } else {
                let mid = entries.len() / 2;
                let right_entries = entries.split_off(mid);
                let split_key = right_entries[0].nid;
                let left_id =
                    store.write_raw_block(&Block::SubnodeLeaf { entries }, amap, device)?;
                let right_id = store.write_raw_block(
                    &Block::SubnodeLeaf {
                        entries: right_entries,
                    },
                    amap,
                    device,
                )?;
                Ok(SnInsertOutcome::Split(left_id, split_key, right_id))
            }
        }
        Block::SubnodeInternal { mut entries } => {
            freed.push(id);
            let idx = entries
                .partition_point(|e| e.key <= desc.nid)
                .saturating_sub(1);
            let child_outcome =
                sn_upsert_in(entries[idx].child_id, desc, store, amap, device, freed)?;
            match child_outcome {
                SnInsertOutcome::Done(new_child) => {
                    entries[idx].child_id = new_child;
                    let new_id = store.write_raw_block(
                        &Block::SubnodeInternal { entries },
                        amap,
                        device,
                    )?;
                    Ok(SnInsertOutcome::Done(new_id))
                }
                SnInsertOutcome::Split(left, split_key, right) => {
                    entries[idx].child_id = left;
                    entries.insert(
                        idx + 1,
                        SubnodeInternalEntry {
                            key: split_key,
                            child_id: right,
                        },
                    );
                    if entries.len() <= sn_capacity_internal(variant) {
                        let new_id = store.write_raw_block(
                            &Block::SubnodeInternal { entries },
                            amap,
                            device,
                        )?;
                        Ok(SnInsertOutcome::Done(new_id))
                    } else {
                        let mid = entries.len() / 2;
                        let right_entries = entries.split_off(mid);
                        let split_key = right_entries[0].key;
                        let left_id = store.write_raw_block(
                            &Block::SubnodeInternal { entries },
                            amap,
                            device,
                        )?;
                        let right_id = store.write_raw_block(
                            &Block::SubnodeInternal {
                                entries: right_entries,
                            },
                            amap,
                            device,
                        )?;
                        Ok(SnInsertOutcome::Split(left_id, split_key, right_id))
                    }
                }
            }
        }
        other => Err(NdbError::FormatError(format!(
            "block {id:?} is not a subnode tree node: {other:?}"
        ))),
    }
}

/// Removal never rebalances below a single leaf; a subnode tree this
/// small in practice stays a single page for most nodes, so underflow
/// merging is skipped in favor of leaving sparse leaves — the same
/// pragmatic tradeoff noted in `DESIGN.md`.
fn sn_remove(
    root: Option<BlockId>,
    nid: NodeId,
    store: &mut BlockStore,
    amap: &mut AllocationMap,
    device: &mut dyn Device,
    freed: &mut Vec<BlockId>,
) -> NdbResult<Option<BlockId>> {
    let Some(root) = root else {
        return Err(NdbError::NodeKeyNotFound(nid));
    };
    let (new_id, found) = sn_remove_in(root, nid, store, amap, device, freed)?;
    if !found {
        return Err(NdbError::NodeKeyNotFound(nid));
    }
    Ok(Some(new_id))
}

fn sn_remove_in(
    id: BlockId,
    nid: NodeId,
    store: &mut BlockStore,
    amap: &mut AllocationMap,
    device: &mut dyn Device,
    freed: &mut Vec<BlockId>,
) -> NdbResult<(BlockId, bool)> {
    match store.read_block(id, amap, device)? {
        Block::SubnodeLeaf { mut entries } => match entries.iter().position(|e| e.nid == nid) {
            None => Ok((id, false)),
            Some(idx) => {
                freed.push(id);
                let removed = entries.remove(idx);
                if !removed.data_bid.is_none() {
                    freed.push(removed.data_bid);
                }
                if !removed.subnode_bid.is_none() {
                    freed.push(removed.subnode_bid);
                }
                let new_id = store.write_raw_block(&Block::SubnodeLeaf { entries }, amap, device)?;
                Ok((new_id, true))
            }
        },
        Block::SubnodeInternal { mut entries } => {
            let idx = entries.partition_point(|e| e.key <= nid).saturating_sub(1);
            let (new_child, found) =
                sn_remove_in(entries[idx].child_id, nid, store, amap, device, freed)?;
            if !found {
                return Ok((id, false));
            }
            freed.push(id);
            entries[idx].child_id = new_child;
            let new_id =
                store.write_raw_block(&Block::SubnodeInternal { entries }, amap, device)?;
            Ok((new_id, true))
        }
        other => Err(NdbError::FormatError(format!(
            "block {id:?} is not a subnode tree node: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::ndb::node_id::NodeIdType;

    fn setup() -> (BlockStore, AllocationMap, MemoryDevice) {
        (
            BlockStore::new(FormatVariant::Unicode),
            AllocationMap::new(FormatVariant::Unicode, 0),
            MemoryDevice::new(),
        )
    }

    #[test]
    fn test_node_write_read_round_trip() {
        let (mut store, mut amap, mut device) = setup();
        let mut node = Node::new(
            NodeId::new(NodeIdType::NormalMessage, 1).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        node.write(0, b"hello world", &store, &amap, &mut device)
            .unwrap();
        node.save_node(&mut store, &mut amap, &mut device).unwrap();
        assert!(!node.data_bid.is_none());

        let read_back = node.read(0, 11, &store, &amap, &mut device).unwrap();
        assert_eq!(read_back, b"hello world");
    }

    #[test]
    fn test_resize_grows_with_zero_fill() {
        let (mut store, mut amap, mut device) = setup();
        let mut node = Node::new(
            NodeId::new(NodeIdType::Attachment, 2).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        node.write(0, b"ab", &store, &amap, &mut device).unwrap();
        node.resize(5, &store, &amap, &mut device).unwrap();
        let data = node.read(0, 5, &store, &amap, &mut device).unwrap();
        assert_eq!(data, vec![b'a', b'b', 0, 0, 0]);
    }

    #[test]
    fn test_subnode_create_save_and_lookup() {
        let (mut store, mut amap, mut device) = setup();
        let mut parent = Node::new(
            NodeId::new(NodeIdType::NormalFolder, 10).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        let sbnid = NodeId::new(NodeIdType::HeapNode, 1).unwrap();
        let mut child = parent.create_subnode(sbnid);
        child
            .write(0, b"child bytes", &store, &amap, &mut device)
            .unwrap();
        child.save_node(&mut store, &mut amap, &mut device).unwrap();
        parent.save_subnode(&child).unwrap();
        parent.save_node(&mut store, &mut amap, &mut device).unwrap();

        let desc = parent
            .get_subnode_block(sbnid, &store, &amap, &mut device)
            .unwrap();
        assert_eq!(desc.nid, sbnid);
        assert_eq!(desc.data_bid, child.data_bid);
    }

    #[test]
    fn test_subnode_missing_lookup_errors() {
        let (store, amap, mut device) = setup();
        let parent = Node::new(
            NodeId::new(NodeIdType::NormalFolder, 11).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        let missing = NodeId::new(NodeIdType::HeapNode, 99).unwrap();
        assert!(matches!(
            parent.get_subnode_block(missing, &store, &amap, &mut device),
            Err(NdbError::NodeKeyNotFound(_))
        ));
    }

    #[test]
    fn test_subnode_split_across_many_children() {
        let (mut store, mut amap, mut device) = setup();
        let mut parent = Node::new(
            NodeId::new(NodeIdType::NormalFolder, 20).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        for i in 1..200u32 {
            let sbnid = NodeId::new(NodeIdType::HeapNode, i).unwrap();
            let mut child = parent.create_subnode(sbnid);
            child
                .write(0, format!("child-{i}").as_bytes(), &store, &amap, &mut device)
                .unwrap();
            child.save_node(&mut store, &mut amap, &mut device).unwrap();
            parent.save_subnode(&child).unwrap();
            parent.save_node(&mut store, &mut amap, &mut device).unwrap();
        }

        for i in [1u32, 57, 199] {
            let sbnid = NodeId::new(NodeIdType::HeapNode, i).unwrap();
            let desc = parent
                .get_subnode_block(sbnid, &store, &amap, &mut device)
                .unwrap();
            assert_eq!(desc.nid, sbnid);
        }
    }

    #[test]
    fn test_subnode_delete_then_missing() {
        let (mut store, mut amap, mut device) = setup();
        let mut parent = Node::new(
            NodeId::new(NodeIdType::NormalFolder, 30).unwrap(),
            BlockId::NONE,
            BlockId::NONE,
        );
        let sbnid = NodeId::new(NodeIdType::HeapNode, 5).unwrap();
        let child = parent.create_subnode(sbnid);
        parent.save_subnode(&child).unwrap();
        parent.save_node(&mut store, &mut amap, &mut device).unwrap();

        parent.delete_subnode(sbnid);
        parent.save_node(&mut store, &mut amap, &mut device).unwrap();

        assert!(matches!(
            parent.get_subnode_block(sbnid, &store, &amap, &mut device),
            Err(NdbError::NodeKeyNotFound(_))
        ));
    }
}
