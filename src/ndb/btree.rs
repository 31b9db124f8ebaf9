//! Copy-on-write B+ tree shared by the Node BTree (NBT) and Block BTree
//! (BBT). `spec.md` §4.3: "Both are copy-on-write B+ trees stored as
//! page-sized blocks ... insert/modify/remove produce a new path: the
//! target leaf is cloned, mutated, assigned a fresh `block_id`; its parent
//! is cloned with the child pointer rewritten; and so on to the root."

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::HashMap,
    io::{self, Cursor},
};

use super::{
    block_id::BlockId,
    node_id::NodeId,
    page::{decode_page, encode_page, PageType},
    FormatVariant, NdbError, NdbResult, PAGE_SIZE,
};

/// A key type storable in a [`CowBTree`].
pub trait BtKey: Copy + Ord + Default + std::fmt::Debug {
    fn encoded_size(variant: FormatVariant) -> usize;
    fn encode(&self, buf: &mut Vec<u8>, variant: FormatVariant) -> io::Result<()>;
    fn decode(cursor: &mut Cursor<&[u8]>, variant: FormatVariant) -> io::Result<Self>;

    /// `spec.md` §4.4: "missing lookup fails with `key_not_found<K>`" —
    /// each concrete key produces the error variant typed for its kind.
    fn not_found_error(self) -> NdbError {
        NdbError::FormatError(format!("key not found: {self:?}"))
    }

    /// `spec.md` §4.4: "Duplicate key insert fails with
    /// `duplicate_key<node_id>`".
    fn duplicate_error(self) -> NdbError {
        NdbError::FormatError(format!("duplicate key: {self:?}"))
    }
}

/// A leaf record type storable in a [`CowBTree`].
pub trait BtValue: Clone + std::fmt::Debug {
    fn encoded_size(variant: FormatVariant) -> usize;
    fn encode(&self, buf: &mut Vec<u8>, variant: FormatVariant) -> io::Result<()>;
    fn decode(cursor: &mut Cursor<&[u8]>, variant: FormatVariant) -> io::Result<Self>;
}

impl BtKey for NodeId {
    fn encoded_size(_variant: FormatVariant) -> usize {
        4
    }

    fn encode(&self, buf: &mut Vec<u8>, _variant: FormatVariant) -> io::Result<()> {
        self.write(buf)
    }

    fn decode(cursor: &mut Cursor<&[u8]>, _variant: FormatVariant) -> io::Result<Self> {
        NodeId::read(cursor)
    }

    fn not_found_error(self) -> NdbError {
        NdbError::NodeKeyNotFound(self)
    }

    fn duplicate_error(self) -> NdbError {
        NdbError::DuplicateNodeKey(self)
    }
}

impl BtKey for BlockId {
    fn encoded_size(variant: FormatVariant) -> usize {
        variant.block_id_size()
    }

    fn encode(&self, buf: &mut Vec<u8>, variant: FormatVariant) -> io::Result<()> {
        self.write(buf, variant)
    }

    fn decode(cursor: &mut Cursor<&[u8]>, variant: FormatVariant) -> io::Result<Self> {
        BlockId::read(cursor, variant)
    }

    fn not_found_error(self) -> NdbError {
        NdbError::BlockKeyNotFound(self)
    }

    fn duplicate_error(self) -> NdbError {
        NdbError::DuplicateBlockKey(self)
    }
}

#[cfg(test)]
impl BtKey for u16 {
    fn encoded_size(_variant: FormatVariant) -> usize {
        2
    }

    fn encode(&self, buf: &mut Vec<u8>, _variant: FormatVariant) -> io::Result<()> {
        buf.write_u16::<LittleEndian>(*self)
    }

    fn decode(cursor: &mut Cursor<&[u8]>, _variant: FormatVariant) -> io::Result<Self> {
        cursor.read_u16::<LittleEndian>()
    }
}

/// NBT leaf record (`spec.md` §3: "node descriptor (in NBT leaf):
/// `{node_id, data_bid, subnode_bid, parent_nid}`").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NbtEntry {
    pub data_bid: BlockId,
    pub subnode_bid: BlockId,
    pub parent_nid: NodeId,
}

impl BtValue for NbtEntry {
    fn encoded_size(variant: FormatVariant) -> usize {
        variant.block_id_size() * 2 + 4
    }

    fn encode(&self, buf: &mut Vec<u8>, variant: FormatVariant) -> io::Result<()> {
        self.data_bid.write(buf, variant)?;
        self.subnode_bid.write(buf, variant)?;
        self.parent_nid.write(buf)
    }

    fn decode(cursor: &mut Cursor<&[u8]>, variant: FormatVariant) -> io::Result<Self> {
        let data_bid = BlockId::read(cursor, variant)?;
        let subnode_bid = BlockId::read(cursor, variant)?;
        let parent_nid = NodeId::read(cursor)?;
        Ok(Self {
            data_bid,
            subnode_bid,
            parent_nid,
        })
    }
}

/// BBT leaf record: `block_id → (file_offset, size, ref_count)`
/// (`spec.md` §3: "the block index (BBT) maps `block_id → (file_offset,
/// size, ref_count)`").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BbtEntry {
    pub offset: u64,
    pub size: u16,
    pub ref_count: u32,
}

impl BtValue for BbtEntry {
    fn encoded_size(_variant: FormatVariant) -> usize {
        8 + 2 + 4
    }

    fn encode(&self, buf: &mut Vec<u8>, _variant: FormatVariant) -> io::Result<()> {
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u16::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.ref_count)
    }

    fn decode(cursor: &mut Cursor<&[u8]>, _variant: FormatVariant) -> io::Result<Self> {
        let offset = cursor.read_u64::<LittleEndian>()?;
        let size = cursor.read_u16::<LittleEndian>()?;
        let ref_count = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            offset,
            size,
            ref_count,
        })
    }
}

#[derive(Clone, Debug)]
enum BtNode<K, E> {
    Leaf(Vec<(K, E)>),
    /// `(lowest key reachable through child, child)`, kept sorted by key.
    Internal(Vec<(K, BlockId)>),
}

enum InsertOutcome<K> {
    Done(BlockId),
    Split(BlockId, K, BlockId),
}

enum RemoveOutcome<K> {
    Ok(BlockId),
    Underflow(BlockId),
}

/// Whether an on-tree mutation must find the key present, absent, or
/// doesn't care (`spec.md` §4.4: "Duplicate key insert fails with
/// `duplicate_key<node_id>`; missing lookup fails with `key_not_found<K>`").
#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    InsertOnly,
    ModifyOnly,
}

/// A copy-on-write B+ tree. Every mutating call assigns fresh [`BlockId`]s
/// along the edited path (via `alloc`) and records the superseded ids in
/// [`CowBTree::freed`] for the caller to release once no context still
/// observes them (`spec.md` §4.5).
#[derive(Clone)]
pub struct CowBTree<K: BtKey, E: BtValue> {
    variant: FormatVariant,
    capacity: usize,
    root: Option<BlockId>,
    pages: HashMap<BlockId, BtNode<K, E>>,
    pub freed: Vec<BlockId>,
}

impl<K: BtKey, E: BtValue> CowBTree<K, E> {
    /// Computes a generous per-page fan-out from the page payload size and
    /// this tree's key/value encoding (`spec.md` §4.7's fan-out formula,
    /// applied here to index pages rather than heap items).
    pub fn capacity_for(variant: FormatVariant) -> usize {
        let payload = PAGE_SIZE - variant.page_trailer_size() - 2;
        let entry_size = K::encoded_size(variant) + E::encoded_size(variant).max(variant.block_id_size());
        (payload / entry_size).max(4)
    }

    pub fn new(variant: FormatVariant) -> Self {
        Self {
            variant,
            capacity: Self::capacity_for(variant),
            root: None,
            pages: HashMap::new(),
            freed: Vec::new(),
        }
    }

    pub fn root_id(&self) -> Option<BlockId> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn min_occupancy(&self) -> usize {
        self.capacity.div_ceil(2)
    }

    pub fn lookup(&self, key: K) -> NdbResult<E> {
        let Some(root) = self.root else {
            return Err(key.not_found_error());
        };
        self.lookup_in(root, key)
    }

    fn lookup_in(&self, block_id: BlockId, key: K) -> NdbResult<E> {
        match self.pages.get(&block_id) {
            Some(BtNode::Leaf(entries)) => entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| key.not_found_error()),
            Some(BtNode::Internal(entries)) => {
                let child = Self::child_for_key(entries, key)?;
                self.lookup_in(child, key)
            }
            None => Err(NdbError::FormatError(format!(
                "dangling tree page {block_id:?}"
            ))),
        }
    }

    fn child_for_key(entries: &[(K, BlockId)], key: K) -> NdbResult<BlockId> {
        entries
            .iter()
            .rev()
            .find(|(k, _)| *k <= key)
            .map(|(_, c)| *c)
            .or_else(|| entries.first().map(|(_, c)| *c))
            .ok_or_else(|| NdbError::FormatError("internal tree page has no entries".into()))
    }

    /// Returns every `(key, value)` pair in ascending key order. Used by
    /// callers that need a full scan (tests, rebuild, diagnostics) rather
    /// than the hot lookup path.
    pub fn iter_sorted(&self) -> Vec<(K, E)> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect(root, &mut out);
        }
        out.sort_by_key(|(k, _)| *k);
        out
    }

    fn collect(&self, block_id: BlockId, out: &mut Vec<(K, E)>) {
        match self.pages.get(&block_id) {
            Some(BtNode::Leaf(entries)) => out.extend(entries.iter().cloned()),
            Some(BtNode::Internal(entries)) => {
                for (_, child) in entries {
                    self.collect(*child, out);
                }
            }
            None => {}
        }
    }

    pub fn insert(&mut self, key: K, value: E, alloc: &mut dyn FnMut() -> BlockId) -> NdbResult<()> {
        self.write(key, value, WriteMode::InsertOnly, alloc)
    }

    pub fn modify(&mut self, key: K, value: E, alloc: &mut dyn FnMut() -> BlockId) -> NdbResult<()> {
        self.write(key, value, WriteMode::ModifyOnly, alloc)
    }

    fn write(
        &mut self,
        key: K,
        value: E,
        mode: WriteMode,
        alloc: &mut dyn FnMut() -> BlockId,
    ) -> NdbResult<()> {
        let Some(root) = self.root else {
            if mode == WriteMode::ModifyOnly {
                return Err(key.not_found_error());
            }
            let new_root = alloc();
            self.pages.insert(new_root, BtNode::Leaf(vec![(key, value)]));
            self.root = Some(new_root);
            return Ok(());
        };

        match self.insert_in(root, key, value, mode, alloc)? {
            InsertOutcome::Done(new_root) => {
                if new_root != root {
                    self.freed.push(root);
                }
                self.root = Some(new_root);
            }
            InsertOutcome::Split(left, split_key, right) => {
                self.freed.push(root);
                let new_root = alloc();
                self.pages.insert(
                    new_root,
                    BtNode::Internal(vec![(K::min_sentinel(), left), (split_key, right)]),
                );
                self.root = Some(new_root);
            }
        }
        Ok(())
    }

    fn insert_in(
        &mut self,
        block_id: BlockId,
        key: K,
        value: E,
        mode: WriteMode,
        alloc: &mut dyn FnMut() -> BlockId,
    ) -> NdbResult<InsertOutcome<K>> {
        let node = self
            .pages
            .get(&block_id)
            .cloned()
            .ok_or_else(|| NdbError::FormatError(format!("dangling tree page {block_id:?}")))?;

        match node {
            BtNode::Leaf(mut entries) => {
                let pos = entries.binary_search_by_key(&key, |(k, _)| *k);
                match (pos, mode) {
                    (Ok(_), WriteMode::InsertOnly) => return Err(key.duplicate_error()),
                    (Err(_), WriteMode::ModifyOnly) => return Err(key.not_found_error()),
                    (Ok(i), WriteMode::ModifyOnly) => entries[i] = (key, value),
                    (Err(i), WriteMode::InsertOnly) => entries.insert(i, (key, value)),
                    _ => unreachable!(),
                }

                if entries.len() <= self.capacity {
                    let new_id = alloc();
                    self.pages.insert(new_id, BtNode::Leaf(entries));
                    Ok(InsertOutcome::Done(new_id))
                } else {
                    let mid = entries.len() / 2;
                    let right_entries = entries.split_off(mid);
                    let split_key = right_entries[0].0;
                    let left_id = alloc();
                    let right_id = alloc();
                    self.pages.insert(left_id, BtNode::Leaf(entries));
                    self.pages.insert(right_id, BtNode::Leaf(right_entries));
                    Ok(InsertOutcome::Split(left_id, split_key, right_id))
                }
            }
            BtNode::Internal(mut entries) => {
                let idx = Self::child_index_for_key(&entries, key)?;
                let child = entries[idx].1;
                match self.insert_in(child, key, value, mode, alloc)? {
                    InsertOutcome::Done(new_child) => {
                        entries[idx].1 = new_child;
                        let new_id = alloc();
                        self.pages.insert(new_id, BtNode::Internal(entries));
                        Ok(InsertOutcome::Done(new_id))
                    }
                    InsertOutcome::Split(left, split_key, right) => {
                        entries[idx].1 = left;
                        entries.insert(idx + 1, (split_key, right));

                        if entries.len() <= self.capacity {
                            let new_id = alloc();
                            self.pages.insert(new_id, BtNode::Internal(entries));
                            Ok(InsertOutcome::Done(new_id))
                        } else {
                            let mid = entries.len() / 2;
                            let right_entries = entries.split_off(mid);
                            let split_key = right_entries[0].0;
                            let left_id = alloc();
                            let right_id = alloc();
                            self.pages.insert(left_id, BtNode::Internal(entries));
                            self.pages.insert(right_id, BtNode::Internal(right_entries));
                            Ok(InsertOutcome::Split(left_id, split_key, right_id))
                        }
                    }
                }
            }
        }
    }

    fn child_index_for_key(entries: &[(K, BlockId)], key: K) -> NdbResult<usize> {
        entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, (k, _))| *k <= key)
            .map(|(i, _)| i)
            .or(if entries.is_empty() { None } else { Some(0) })
            .ok_or_else(|| NdbError::FormatError("internal tree page has no entries".into()))
    }

    pub fn remove(&mut self, key: K, alloc: &mut dyn FnMut() -> BlockId) -> NdbResult<()> {
        let Some(root) = self.root else {
            return Err(key.not_found_error());
        };

        match self.remove_in(root, key, alloc)? {
            RemoveOutcome::Ok(new_root) | RemoveOutcome::Underflow(new_root) => {
                if new_root != root {
                    self.freed.push(root);
                }
                // Collapse a root that now only routes to a single child.
                if let Some(BtNode::Internal(entries)) = self.pages.get(&new_root) {
                    if entries.len() == 1 {
                        let only_child = entries[0].1;
                        self.freed.push(new_root);
                        self.root = Some(only_child);
                        return Ok(());
                    }
                }
                self.root = Some(new_root);
            }
        }
        Ok(())
    }

    fn remove_in(
        &mut self,
        block_id: BlockId,
        key: K,
        alloc: &mut dyn FnMut() -> BlockId,
    ) -> NdbResult<RemoveOutcome<K>> {
        let node = self
            .pages
            .get(&block_id)
            .cloned()
            .ok_or_else(|| NdbError::FormatError(format!("dangling tree page {block_id:?}")))?;

        match node {
            BtNode::Leaf(mut entries) => {
                let pos = entries
                    .binary_search_by_key(&key, |(k, _)| *k)
                    .map_err(|_| key.not_found_error())?;
                entries.remove(pos);

                let new_id = alloc();
                self.pages.insert(new_id, BtNode::Leaf(entries.clone()));
                if entries.len() < self.min_occupancy() && !entries.is_empty() {
                    Ok(RemoveOutcome::Underflow(new_id))
                } else {
                    Ok(RemoveOutcome::Ok(new_id))
                }
            }
            BtNode::Internal(mut entries) => {
                let idx = Self::child_index_for_key(&entries, key)?;
                let child = entries[idx].1;

                match self.remove_in(child, key, alloc)? {
                    RemoveOutcome::Ok(new_child) => {
                        entries[idx].1 = new_child;
                        let new_id = alloc();
                        self.pages.insert(new_id, BtNode::Internal(entries));
                        Ok(RemoveOutcome::Ok(new_id))
                    }
                    RemoveOutcome::Underflow(new_child) => {
                        entries[idx].1 = new_child;
                        self.fix_underflow(entries, idx, alloc)
                    }
                }
            }
        }
    }

    /// Rebalances an underflowed child at `idx` by borrowing from the left
    /// sibling, then the right sibling, then merging with the right
    /// sibling, per `spec.md` §4.3's stated preference order.
    fn fix_underflow(
        &mut self,
        mut entries: Vec<(K, BlockId)>,
        idx: usize,
        alloc: &mut dyn FnMut() -> BlockId,
    ) -> NdbResult<RemoveOutcome<K>> {
        let child_id = entries[idx].1;
        let child = self.pages.get(&child_id).cloned().unwrap();

        if idx > 0 {
            let left_id = entries[idx - 1].1;
            let left = self.pages.get(&left_id).cloned().unwrap();
            if Self::len_of(&left) > self.min_occupancy() {
                let (new_left, new_child, new_child_key) = Self::borrow_from_left(left, child);
                let new_left_id = alloc();
                let new_child_id = alloc();
                self.pages.insert(new_left_id, new_left);
                self.pages.insert(new_child_id, new_child);
                entries[idx - 1].1 = new_left_id;
                entries[idx].0 = new_child_key;
                entries[idx].1 = new_child_id;
                let new_id = alloc();
                self.pages.insert(new_id, BtNode::Internal(entries));
                return Ok(RemoveOutcome::Ok(new_id));
            }
        }

        if idx + 1 < entries.len() {
            let right_id = entries[idx + 1].1;
            let right = self.pages.get(&right_id).cloned().unwrap();
            if Self::len_of(&right) > self.min_occupancy() {
                let (new_child, new_right, new_right_key) = Self::borrow_from_right(child, right);
                let new_child_id = alloc();
                let new_right_id = alloc();
                self.pages.insert(new_child_id, new_child);
                self.pages.insert(new_right_id, new_right);
                entries[idx].1 = new_child_id;
                entries[idx + 1].0 = new_right_key;
                entries[idx + 1].1 = new_right_id;
                let new_id = alloc();
                self.pages.insert(new_id, BtNode::Internal(entries));
                return Ok(RemoveOutcome::Ok(new_id));
            }

            let merged = Self::merge(child, right);
            let merged_id = alloc();
            self.pages.insert(merged_id, merged);
            entries.remove(idx + 1);
            entries[idx].1 = merged_id;

            return Ok(if entries.len() < self.min_occupancy() {
                RemoveOutcome::Underflow(Self::finish_internal(self, entries, alloc))
            } else {
                RemoveOutcome::Ok(Self::finish_internal(self, entries, alloc))
            });
        }

        // No right sibling: merge with left instead (idx must be > 0 here
        // since a single-child root is collapsed by the caller).
        let left_id = entries[idx - 1].1;
        let left = self.pages.get(&left_id).cloned().unwrap();
        let merged = Self::merge(left, child);
        let merged_id = alloc();
        self.pages.insert(merged_id, merged);
        entries.remove(idx);
        entries[idx - 1].1 = merged_id;

        Ok(if entries.len() < self.min_occupancy() {
            RemoveOutcome::Underflow(Self::finish_internal(self, entries, alloc))
        } else {
            RemoveOutcome::Ok(Self::finish_internal(self, entries, alloc))
        })
    }

    fn finish_internal(
        &mut self,
        entries: Vec<(K, BlockId)>,
        alloc: &mut dyn FnMut() -> BlockId,
    ) -> BlockId {
        let new_id = alloc();
        self.pages.insert(new_id, BtNode::Internal(entries));
        new_id
    }

    fn len_of(node: &BtNode<K, E>) -> usize {
        match node {
            BtNode::Leaf(entries) => entries.len(),
            BtNode::Internal(entries) => entries.len(),
        }
    }

    fn borrow_from_left(left: BtNode<K, E>, child: BtNode<K, E>) -> (BtNode<K, E>, BtNode<K, E>, K) {
        match (left, child) {
            (BtNode::Leaf(mut l), BtNode::Leaf(mut c)) => {
                let moved = l.pop().unwrap();
                let key = moved.0;
                c.insert(0, moved);
                (BtNode::Leaf(l), BtNode::Leaf(c), key)
            }
            (BtNode::Internal(mut l), BtNode::Internal(mut c)) => {
                let moved = l.pop().unwrap();
                let key = moved.0;
                c.insert(0, moved);
                (BtNode::Internal(l), BtNode::Internal(c), key)
            }
            _ => unreachable!("sibling nodes are always at the same tree level"),
        }
    }

    fn borrow_from_right(child: BtNode<K, E>, right: BtNode<K, E>) -> (BtNode<K, E>, BtNode<K, E>, K) {
        match (child, right) {
            (BtNode::Leaf(mut c), BtNode::Leaf(mut r)) => {
                let moved = r.remove(0);
                c.push(moved);
                let next_key = r[0].0;
                (BtNode::Leaf(c), BtNode::Leaf(r), next_key)
            }
            (BtNode::Internal(mut c), BtNode::Internal(mut r)) => {
                let moved = r.remove(0);
                c.push(moved);
                let next_key = r[0].0;
                (BtNode::Internal(c), BtNode::Internal(r), next_key)
            }
            _ => unreachable!("sibling nodes are always at the same tree level"),
        }
    }

    fn merge(left: BtNode<K, E>, right: BtNode<K, E>) -> BtNode<K, E> {
        match (left, right) {
            (BtNode::Leaf(mut l), BtNode::Leaf(r)) => {
                l.extend(r);
                BtNode::Leaf(l)
            }
            (BtNode::Internal(mut l), BtNode::Internal(r)) => {
                l.extend(r);
                BtNode::Internal(l)
            }
            _ => unreachable!("sibling nodes are always at the same tree level"),
        }
    }

    /// Encodes every reachable page as `(block_id, on-disk page bytes)`,
    /// for a commit to hand to the allocation map and device.
    pub fn dump_pages(&self, page_type: PageType) -> NdbResult<Vec<(BlockId, Vec<u8>)>> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.dump_from(root, page_type, &mut out)?;
        }
        Ok(out)
    }

    fn dump_from(
        &self,
        block_id: BlockId,
        page_type: PageType,
        out: &mut Vec<(BlockId, Vec<u8>)>,
    ) -> NdbResult<()> {
        let node = self
            .pages
            .get(&block_id)
            .ok_or_else(|| NdbError::FormatError(format!("dangling tree page {block_id:?}")))?;

        let payload_len = PAGE_SIZE - self.variant.page_trailer_size();
        let mut payload = Vec::with_capacity(payload_len);
        match node {
            BtNode::Leaf(entries) => {
                payload.push(1_u8);
                payload.write_u16::<LittleEndian>(entries.len() as u16)?;
                for (k, v) in entries {
                    k.encode(&mut payload, self.variant)?;
                    v.encode(&mut payload, self.variant)?;
                }
            }
            BtNode::Internal(entries) => {
                payload.push(0_u8);
                payload.write_u16::<LittleEndian>(entries.len() as u16)?;
                for (k, child) in entries {
                    k.encode(&mut payload, self.variant)?;
                    child.encode(&mut payload, self.variant)?;
                }
                for (_, child) in entries {
                    self.dump_from(*child, page_type, out)?;
                }
            }
        }
        payload.resize(payload_len, 0);
        let bytes = encode_page(self.variant, page_type, 0, block_id, &payload)?;
        out.push((block_id, bytes));
        Ok(())
    }

    /// Reconstructs a tree by walking pages starting at `root`, as on
    /// database open.
    pub fn load(
        variant: FormatVariant,
        page_type: PageType,
        root: BlockId,
        read_page: &mut dyn FnMut(BlockId) -> NdbResult<Vec<u8>>,
    ) -> NdbResult<Self> {
        let mut tree = Self::new(variant);
        tree.root = Some(root);
        tree.load_from(root, page_type, read_page)?;
        Ok(tree)
    }

    fn load_from(
        &mut self,
        block_id: BlockId,
        page_type: PageType,
        read_page: &mut dyn FnMut(BlockId) -> NdbResult<Vec<u8>>,
    ) -> NdbResult<()> {
        let bytes = read_page(block_id)?;
        let (payload, _trailer) = decode_page(self.variant, &bytes, page_type)?;
        let mut cursor = Cursor::new(payload.as_slice());
        let is_leaf = cursor.read_u8()? == 1;
        let count = cursor.read_u16::<LittleEndian>()? as usize;

        if is_leaf {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let k = K::decode(&mut cursor, self.variant)?;
                let v = E::decode(&mut cursor, self.variant)?;
                entries.push((k, v));
            }
            self.pages.insert(block_id, BtNode::Leaf(entries));
        } else {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let k = K::decode(&mut cursor, self.variant)?;
                let child = BlockId::decode(&mut cursor, self.variant)?;
                entries.push((k, child));
            }
            let children: Vec<BlockId> = entries.iter().map(|(_, c)| *c).collect();
            self.pages.insert(block_id, BtNode::Internal(entries));
            for child in children {
                self.load_from(child, page_type, read_page)?;
            }
        }
        Ok(())
    }
}

/// A sentinel key lower than any real key, used as the left-edge routing
/// key of a freshly split root. Every `BtKey` this crate uses (`NodeId`,
/// `BlockId`, the plain integer keys in tests) has an all-zero minimum
/// value, so `Default` always gives a safe lower bound.
trait MinSentinel {
    fn min_sentinel() -> Self;
}

impl<T: BtKey> MinSentinel for T {
    fn min_sentinel() -> Self {
        T::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_seq(start: u64) -> impl FnMut() -> BlockId {
        let mut next = start;
        move || {
            let id = BlockId::new(false, next).unwrap();
            next += 1;
            id
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut tree: CowBTree<NodeId, NbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(100);
        let entry = NbtEntry {
            data_bid: BlockId::new(false, 2).unwrap(),
            subnode_bid: BlockId::NONE,
            parent_nid: NodeId::from(0),
        };
        let nid = NodeId::new(super::super::node_id::NodeIdType::NormalMessage, 1).unwrap();
        tree.insert(nid, entry, &mut alloc).unwrap();
        assert_eq!(tree.lookup(nid).unwrap(), entry);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut tree: CowBTree<NodeId, NbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(200);
        let entry = NbtEntry {
            data_bid: BlockId::new(false, 2).unwrap(),
            subnode_bid: BlockId::NONE,
            parent_nid: NodeId::from(0),
        };
        let nid = NodeId::new(super::super::node_id::NodeIdType::NormalMessage, 5).unwrap();
        tree.insert(nid, entry, &mut alloc).unwrap();
        assert!(tree.insert(nid, entry, &mut alloc).is_err());
    }

    #[test]
    fn test_missing_modify_rejected() {
        let mut tree: CowBTree<NodeId, NbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(300);
        let entry = NbtEntry {
            data_bid: BlockId::new(false, 2).unwrap(),
            subnode_bid: BlockId::NONE,
            parent_nid: NodeId::from(0),
        };
        let nid = NodeId::new(super::super::node_id::NodeIdType::NormalMessage, 9).unwrap();
        assert!(tree.modify(nid, entry, &mut alloc).is_err());
    }

    #[test]
    fn test_split_and_scenario_s2() {
        let mut tree: CowBTree<u16, BbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(1000);
        let entry = |k: u16| BbtEntry {
            offset: 0,
            size: 0,
            ref_count: k as u32,
        };
        tree.insert(900, entry(9000), &mut alloc).unwrap();
        for k in 1000..1450u16 {
            tree.insert(k, entry(k * 10), &mut alloc).unwrap();
        }
        assert_eq!(tree.lookup(900).unwrap().ref_count, 9000);
        assert_eq!(tree.lookup(1449).unwrap().ref_count, 14490);
    }

    #[test]
    fn test_remove_then_missing() {
        let mut tree: CowBTree<u16, BbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(2000);
        let entry = BbtEntry {
            offset: 0,
            size: 0,
            ref_count: 1,
        };
        for k in 0..20u16 {
            tree.insert(k, entry, &mut alloc).unwrap();
        }
        for k in 0..20u16 {
            assert!(tree.lookup(k).is_ok());
        }
        tree.remove(10, &mut alloc).unwrap();
        assert!(tree.lookup(10).is_err());
        for k in (0..20u16).filter(|k| *k != 10) {
            assert!(tree.lookup(k).is_ok());
        }
    }

    #[test]
    fn test_keys_remain_sorted_after_churn() {
        let mut tree: CowBTree<u16, BbtEntry> = CowBTree::new(FormatVariant::Unicode);
        let mut alloc = alloc_seq(3000);
        let entry = BbtEntry {
            offset: 0,
            size: 0,
            ref_count: 1,
        };
        for k in (0..200u16).step_by(2) {
            tree.insert(k, entry, &mut alloc).unwrap();
        }
        for k in (0..100u16).step_by(4) {
            tree.remove(k, &mut alloc).unwrap();
        }
        let dump = tree.iter_sorted();
        let keys: Vec<u16> = dump.iter().map(|(k, _)| *k).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert!(keys.windows(2).all(|w| w[0] != w[1]));
    }
}
