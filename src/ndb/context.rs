//! Snapshot/overlay database contexts. `spec.md` §4.5: "A context is a
//! snapshot view plus a staging overlay."
//!
//! A [`DbContext`] owns a full in-memory working copy of the NBT, the
//! block store (which carries the BBT), and the allocation map — built by
//! cloning its parent's state at fork time rather than tracking a sparse
//! diff. That trades memory for a much simpler merge step: a successful
//! `commit` just replaces the parent's working copy outright, once a
//! rebase check confirms the parent's snapshot roots haven't moved since
//! the fork.
//!
//! The underlying [`Device`] and a single commit mutex are shared by every
//! context descended from the same root (`spec.md` §5: "shared resources:
//! the device ... are shared and mutex-guarded"); everything else
//! (NBT, BBT, AMap) is a private working copy per context.
//!
//! NBT and BBT index pages are not resolved through block ref-counting:
//! doing so for the BBT's own pages would be self-referential. Instead
//! every live index page's file offset is tracked in a flat
//! [`PageDirectory`], itself located directly via `Header::directory_offset`
//! — a deliberate simplification over a fully self-hosting BBT, recorded in
//! `DESIGN.md`. The allocation map's bitmap itself is never persisted: the
//! directory plus the BBT's content entries are exactly the information
//! `AllocationMap::rebuild` needs, so opening an existing file always
//! rebuilds it instead of reading a serialized bitmap back.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::instrument;

use super::{
    amap::AllocationMap,
    block_id::BlockId,
    block_store::BlockStore,
    btree::{CowBTree, NbtEntry},
    header::{AmapStatus, Header},
    node::{Node, SubnodeDescriptor},
    node_id::{NodeId, NodeIdType},
    page::PageType,
    FormatVariant, NdbError, NdbResult, PAGE_SIZE,
};
use crate::device::{Device, FileDevice};

/// Flat `block_id -> absolute file offset` table for every live NBT/BBT
/// page (every page is exactly [`PAGE_SIZE`], so no length is needed).
#[derive(Clone, Default)]
struct PageDirectory {
    entries: HashMap<BlockId, u64>,
}

impl PageDirectory {
    fn encode(&self, variant: FormatVariant) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (id, offset) in &self.entries {
            id.write(&mut out, variant)?;
            out.write_u64::<LittleEndian>(*offset)?;
        }
        Ok(out)
    }

    fn decode(variant: FormatVariant, bytes: &[u8]) -> NdbResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            let id = BlockId::read(&mut cursor, variant)?;
            let offset = cursor.read_u64::<LittleEndian>()?;
            entries.insert(id, offset);
        }
        Ok(Self { entries })
    }
}

/// `spec.md` §4.5: "the root context maintains a per-block observer count
/// — the number of live descendant contexts whose snapshot still includes
/// that block. Physical AMap release is deferred until the count drops to
/// zero." Shared by every context descended from the same root, so a
/// block a sibling context forked earlier still depends on can never be
/// physically overwritten out from under it on the shared device.
#[derive(Default)]
struct SharedArena {
    observer_counts: RwLock<HashMap<BlockId, u32>>,
    deferred_frees: Mutex<HashMap<BlockId, (u64, u64)>>,
}

impl SharedArena {
    fn observe(&self, ids: &[BlockId]) {
        let mut counts = self.observer_counts.write().expect("observer lock poisoned");
        for &id in ids {
            *counts.entry(id).or_insert(0) += 1;
        }
    }

    fn release_observer(&self, ids: &[BlockId]) {
        let mut counts = self.observer_counts.write().expect("observer lock poisoned");
        for &id in ids {
            if let Some(count) = counts.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&id);
                }
            }
        }
    }

    fn is_observed(&self, id: BlockId) -> bool {
        self.observer_counts
            .read()
            .expect("observer lock poisoned")
            .contains_key(&id)
    }

    fn defer(&self, id: BlockId, offset: u64, size: u64) {
        self.deferred_frees
            .lock()
            .expect("deferred frees lock poisoned")
            .insert(id, (offset, size));
    }

    /// Pulls out every deferred span whose observer count has since
    /// dropped to zero, for the caller to fold back into its own AMap.
    fn take_reclaimable(&self) -> Vec<(u64, u64)> {
        let mut deferred = self
            .deferred_frees
            .lock()
            .expect("deferred frees lock poisoned");
        let counts = self.observer_counts.read().expect("observer lock poisoned");
        let ready: Vec<BlockId> = deferred
            .keys()
            .filter(|id| !counts.contains_key(id))
            .copied()
            .collect();
        ready
            .into_iter()
            .map(|id| deferred.remove(&id).expect("key came from this map"))
            .collect()
    }
}

/// `spec.md` §4.5: a snapshot view plus a staging overlay. The root
/// context's parent is `None`; every forked context's is `Some`.
pub struct DbContext {
    parent: Option<Arc<Mutex<DbContext>>>,
    device: Arc<Mutex<Box<dyn Device + Send>>>,
    commit_mutex: Arc<Mutex<()>>,
    shared: Arc<SharedArena>,
    /// Every block id this context observed at fork time, i.e. still held
    /// by its parent's snapshot — decremented from `shared` on drop.
    observed_blocks: Vec<BlockId>,
    variant: FormatVariant,
    snapshot_nbt_root: Option<BlockId>,
    snapshot_bbt_root: Option<BlockId>,
    nbt: CowBTree<NodeId, NbtEntry>,
    block_store: BlockStore,
    amap: AllocationMap,
    directory: PageDirectory,
    node_type_counters: [u32; 32],
}

impl Drop for DbContext {
    fn drop(&mut self) {
        if !self.observed_blocks.is_empty() {
            self.shared.release_observer(&self.observed_blocks);
        }
    }
}

impl DbContext {
    /// `spec.md` §4.5 + §1: opens (or creates) the file at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_database(path: impl AsRef<Path>) -> NdbResult<DbContext> {
        let default_variant = FormatVariant::Unicode;
        let file_exists = path.as_ref().exists();
        let mut device: Box<dyn Device + Send> = if file_exists {
            Box::new(FileDevice::open(path)?)
        } else {
            Box::new(FileDevice::create(path)?)
        };

        let (header, directory, nbt, block_store) = if file_exists && device.size()? > 0 {
            let header = Header::read(&mut *device)?;
            let directory = if header.directory_len == 0 {
                PageDirectory::default()
            } else {
                let bytes =
                    device.read_at(header.directory_offset, header.directory_len as usize)?;
                PageDirectory::decode(header.variant, &bytes)?
            };

            let nbt = if header.nbt_root.is_none() {
                CowBTree::new(header.variant)
            } else {
                CowBTree::load(
                    header.variant,
                    PageType::NodeBTree,
                    header.nbt_root,
                    &mut |id| read_directory_page(&directory, &mut *device, id),
                )?
            };

            let block_store = if header.bbt_root.is_none() {
                BlockStore::new(header.variant)
            } else {
                BlockStore::load(
                    header.variant,
                    header.bbt_root,
                    header.next_block_id,
                    &mut |id| read_directory_page(&directory, &mut *device, id),
                )?
            };

            (header, directory, nbt, block_store)
        } else {
            let header = Header::new(default_variant);
            device.grow(header.header_span())?;
            header.write(&mut *device)?;
            (
                header,
                PageDirectory::default(),
                CowBTree::new(default_variant),
                BlockStore::new(default_variant),
            )
        };

        let mut amap = AllocationMap::new(header.variant, header.header_span());
        let region_start = header.header_span();
        let mut occupied: Vec<(u64, u64)> = directory
            .entries
            .values()
            .map(|&abs| (abs - region_start, PAGE_SIZE as u64))
            .collect();
        for (_, entry) in block_store.bbt.iter_sorted() {
            occupied.push((entry.offset, entry.size as u64));
        }
        if header.directory_len > 0 {
            occupied.push((
                header.directory_offset - region_start,
                header.directory_len as u64,
            ));
        }
        amap.rebuild(occupied.into_iter(), &mut *device)?;

        Ok(DbContext {
            parent: None,
            device: Arc::new(Mutex::new(device)),
            commit_mutex: Arc::new(Mutex::new(())),
            shared: Arc::new(SharedArena::default()),
            observed_blocks: Vec::new(),
            variant: header.variant,
            snapshot_nbt_root: nbt.root_id(),
            snapshot_bbt_root: block_store.bbt.root_id(),
            nbt,
            block_store,
            amap,
            directory,
            node_type_counters: header.node_type_counters,
        })
    }

    pub fn variant(&self) -> FormatVariant {
        self.variant
    }

    /// `spec.md` §4.5: forks a snapshot + overlay view from `self`, sharing
    /// the device and commit mutex but cloning the NBT/BBT/AMap working
    /// sets. Every block currently in the parent's BBT is registered as
    /// observed by the new context, so its physical span can't be reused
    /// by a later commit while this fork still depends on it.
    pub fn create_context(self_arc: &Arc<Mutex<DbContext>>) -> DbContext {
        let locked = self_arc.lock().expect("context mutex poisoned");
        let observed_blocks: Vec<BlockId> = locked
            .block_store
            .bbt
            .iter_sorted()
            .map(|(id, _)| id)
            .collect();
        locked.shared.observe(&observed_blocks);
        DbContext {
            parent: Some(Arc::clone(self_arc)),
            device: Arc::clone(&locked.device),
            commit_mutex: Arc::clone(&locked.commit_mutex),
            shared: Arc::clone(&locked.shared),
            observed_blocks,
            variant: locked.variant,
            snapshot_nbt_root: locked.nbt.root_id(),
            snapshot_bbt_root: locked.block_store.bbt.root_id(),
            nbt: locked.nbt.clone(),
            block_store: locked.block_store.clone(),
            amap: locked.amap.clone(),
            directory: locked.directory.clone(),
            node_type_counters: locked.node_type_counters,
        }
    }

    fn with_device<R>(&self, f: impl FnOnce(&mut dyn Device) -> R) -> R {
        let mut device = self.device.lock().expect("device mutex poisoned");
        f(&mut **device)
    }

    /// Lends the LTP layer read-only access to the block store, allocation
    /// map and device underneath a context, so `ltp::*` types can stay
    /// generic over `(store, amap, device)` instead of depending on
    /// `DbContext` directly.
    pub fn with_ltp<R>(
        &self,
        f: impl FnOnce(&BlockStore, &AllocationMap, &mut dyn Device) -> R,
    ) -> R {
        let mut device = self.device.lock().expect("device mutex poisoned");
        f(&self.block_store, &self.amap, &mut **device)
    }

    /// Mutable counterpart of [`DbContext::with_ltp`], needed by the one LTP
    /// save path (`TableContext::save_table_context`) that materializes a
    /// subnode through `Node::save_node`.
    pub fn with_ltp_mut<R>(
        &mut self,
        f: impl FnOnce(&mut BlockStore, &mut AllocationMap, &mut dyn Device) -> R,
    ) -> R {
        let device = Arc::clone(&self.device);
        let mut device = device.lock().expect("device mutex poisoned");
        f(&mut self.block_store, &mut self.amap, &mut **device)
    }

    /// Allocates the next index for `id_type` and mints a fresh [`NodeId`].
    pub fn allocate_node_id(&mut self, id_type: NodeIdType) -> NdbResult<NodeId> {
        let slot = id_type as u8 as usize;
        let index = self.node_type_counters[slot];
        self.node_type_counters[slot] += 1;
        NodeId::new(id_type, index)
    }

    /// `spec.md` §4.4: creates a brand new, empty-stream node of the given
    /// type; the caller writes to it and calls [`DbContext::save_node`].
    pub fn create_node(&mut self, id_type: NodeIdType) -> NdbResult<Node> {
        let nid = self.allocate_node_id(id_type)?;
        Ok(Node::new(nid, BlockId::NONE, BlockId::NONE))
    }

    pub fn open_node(&self, nid: NodeId) -> NdbResult<Node> {
        let entry = self.nbt.lookup(nid)?;
        let mut node = Node::new(nid, entry.data_bid, entry.subnode_bid);
        if entry.parent_nid != NodeId::default() {
            node.parent_nid = Some(entry.parent_nid);
        }
        Ok(node)
    }

    pub fn read_node(&self, node: &mut Node, offset: u64, len: u64) -> NdbResult<Vec<u8>> {
        self.with_device(|device| node.read(offset, len, &self.block_store, &self.amap, device))
    }

    pub fn write_node(&mut self, node: &mut Node, offset: u64, data: &[u8]) -> NdbResult<()> {
        let device = Arc::clone(&self.device);
        let mut device = device.lock().expect("device mutex poisoned");
        node.write(offset, data, &self.block_store, &self.amap, &mut **device)
    }

    /// Routes a block release through the shared observer-count table
    /// (`spec.md` §4.5): the physical AMap span is only freed once no live
    /// descendant context's snapshot still depends on this exact block id;
    /// otherwise it's parked in the shared `deferred_frees` table until it
    /// is.
    fn release_block(&mut self, id: BlockId) -> NdbResult<()> {
        self.reclaim_deferred_frees();
        if let Some((offset, size)) = self.block_store.drop_ref(id)? {
            if self.shared.is_observed(id) {
                self.shared.defer(id, offset, size);
            } else {
                self.amap.free_allocation(offset, size)?;
            }
        }
        Ok(())
    }

    /// Folds back any deferred span whose observer count has since dropped
    /// to zero, so space held up by a now-gone sibling context eventually
    /// comes back instead of leaking for the life of the root.
    fn reclaim_deferred_frees(&mut self) {
        for (offset, size) in self.shared.take_reclaimable() {
            let _ = self.amap.free_allocation(offset, size);
        }
    }

    /// Flushes `node`'s pending data/subnode edits into blocks and stages
    /// its descriptor into the NBT overlay.
    pub fn save_node(&mut self, node: &mut Node, insert: bool) -> NdbResult<()> {
        {
            let block_store = &mut self.block_store;
            let amap = &mut self.amap;
            let device = Arc::clone(&self.device);
            let mut device = device.lock().expect("device mutex poisoned");
            node.save_node(block_store, amap, &mut **device)?;
        }

        // Blocks superseded by the edit just flushed above are released now
        // that the new ones are safely staged (`spec.md` §4.3's "pending
        // free list").
        for bid in std::mem::take(&mut node.freed) {
            self.release_block(bid)?;
        }

        let entry = NbtEntry {
            data_bid: node.data_bid,
            subnode_bid: node.subnode_bid,
            parent_nid: node.parent_nid.unwrap_or_default(),
        };
        let block_store = &mut self.block_store;
        let mut alloc = || block_store.mint_internal_id();
        if insert {
            self.nbt.insert(node.nid, entry, &mut alloc)
        } else {
            self.nbt.modify(node.nid, entry, &mut alloc)
        }
    }

    /// Removes `nid` from the NBT and releases the superseded entry's own
    /// data/subnode blocks, the same way `save_node` releases a node's
    /// previous blocks when overwritten.
    pub fn delete_node(&mut self, nid: NodeId) -> NdbResult<()> {
        let entry = self.nbt.lookup(nid)?;
        {
            let block_store = &mut self.block_store;
            let mut alloc = || block_store.mint_internal_id();
            self.nbt.remove(nid, &mut alloc)?;
        }
        if !entry.data_bid.is_none() {
            self.release_block(entry.data_bid)?;
        }
        if !entry.subnode_bid.is_none() {
            self.release_block(entry.subnode_bid)?;
        }
        Ok(())
    }

    /// `spec.md` §4.4: "`create_subnode(sbnid)` returns a new `node` whose
    /// `parent_nid = nid`."
    pub fn create_subnode(&self, parent: &Node, sbnid: NodeId) -> Node {
        parent.create_subnode(sbnid)
    }

    pub fn save_subnode(&mut self, parent: &mut Node, child: &Node) -> NdbResult<()> {
        parent.save_subnode(child)
    }

    pub fn get_subnode_block(
        &self,
        parent: &Node,
        sbnid: NodeId,
    ) -> NdbResult<SubnodeDescriptor> {
        self.with_device(|device| parent.get_subnode_block(sbnid, &self.block_store, &self.amap, device))
    }

    /// `spec.md` §4.5: "`commit_db()` merges the overlay into the parent
    /// (or to disk for the root)."
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> NdbResult<()> {
        let _guard = self.commit_mutex.lock().expect("commit mutex poisoned");
        match self.parent.clone() {
            None => {
                let device = Arc::clone(&self.device);
                let mut device = device.lock().expect("device mutex poisoned");
                self.commit_to_disk(&mut **device)
            }
            Some(parent) => self.commit_to_parent(&parent),
        }
    }

    fn commit_to_parent(&mut self, parent: &Arc<Mutex<DbContext>>) -> NdbResult<()> {
        let mut parent = parent.lock().expect("context mutex poisoned");
        if parent.nbt.root_id() != self.snapshot_nbt_root
            || parent.block_store.bbt.root_id() != self.snapshot_bbt_root
        {
            return Err(NdbError::NodeSaveError(NodeId::default()));
        }
        parent.nbt = self.nbt.clone();
        parent.block_store = self.block_store.clone();
        parent.amap = self.amap.clone();
        parent.directory = self.directory.clone();
        parent.node_type_counters = self.node_type_counters;
        self.snapshot_nbt_root = parent.nbt.root_id();
        self.snapshot_bbt_root = parent.block_store.bbt.root_id();
        Ok(())
    }

    /// `spec.md` §4.5 point 3: "new pages are written first, `flush()`;
    /// then header ... is written, `flush()`."
    fn commit_to_disk(&mut self, device: &mut dyn Device) -> NdbResult<()> {
        self.reclaim_deferred_frees();
        for (id, bytes) in self.nbt.dump_pages(PageType::NodeBTree)? {
            let addr = self.amap.allocate(bytes.len() as u64, device)?;
            let offset = self.amap.file_offset(addr);
            device.write_at(offset, &bytes)?;
            self.directory.entries.insert(id, offset);
        }
        for (id, bytes) in self.block_store.bbt.dump_pages(PageType::BlockBTree)? {
            let addr = self.amap.allocate(bytes.len() as u64, device)?;
            let offset = self.amap.file_offset(addr);
            device.write_at(offset, &bytes)?;
            self.directory.entries.insert(id, offset);
        }

        let dirty: Vec<(BlockId, Vec<u8>)> = self
            .block_store
            .dirty_bytes()
            .map(|(id, bytes)| (id, bytes.clone()))
            .collect();
        for (id, bytes) in dirty {
            let entry = self.block_store.bbt.lookup(id)?;
            let offset = self.amap.file_offset(entry.offset);
            device.write_at(offset, &bytes)?;
        }
        self.block_store.clear_dirty();
        device.flush()?;

        let directory_bytes = self.directory.encode(self.variant)?;
        let dir_addr = self
            .amap
            .allocate(directory_bytes.len().max(1) as u64, device)?;
        let dir_offset = self.amap.file_offset(dir_addr);
        device.write_at(dir_offset, &directory_bytes)?;

        let header = Header {
            variant: self.variant,
            nbt_root: self.nbt.root_id().unwrap_or(BlockId::NONE),
            bbt_root: self.block_store.bbt.root_id().unwrap_or(BlockId::NONE),
            next_block_id: self.block_store.next_index(),
            next_page_no: self.amap.page_count() as u32,
            amap_valid: AmapStatus::Invalid,
            dlist_page_no: 0,
            first_amap_page_no: 0,
            directory_offset: dir_offset,
            directory_len: directory_bytes.len() as u32,
            node_type_counters: self.node_type_counters,
        };
        header.write(device)?;

        self.snapshot_nbt_root = self.nbt.root_id();
        self.snapshot_bbt_root = self.block_store.bbt.root_id();
        Ok(())
    }
}

fn read_directory_page(
    directory: &PageDirectory,
    device: &mut dyn Device,
    id: BlockId,
) -> NdbResult<Vec<u8>> {
    let offset = *directory
        .entries
        .get(&id)
        .ok_or(NdbError::UnexpectedPage(0))?;
    Ok(device.read_at(offset, PAGE_SIZE)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_node_write_save_commit_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let mut ctx = DbContext::open_database(&path).unwrap();

        let mut node = ctx.create_node(NodeIdType::NormalMessage).unwrap();
        let nid = node.nid;
        ctx.write_node(&mut node, 0, b"hello context").unwrap();
        ctx.save_node(&mut node, true).unwrap();
        ctx.commit().unwrap();

        let mut reopened = ctx.open_node(nid).unwrap();
        let back = ctx.read_node(&mut reopened, 0, 13).unwrap();
        assert_eq!(back, b"hello context");
    }

    #[test]
    fn test_reopen_after_commit_preserves_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let nid;
        {
            let mut ctx = DbContext::open_database(&path).unwrap();
            let mut node = ctx.create_node(NodeIdType::NormalFolder).unwrap();
            nid = node.nid;
            ctx.write_node(&mut node, 0, b"persisted").unwrap();
            ctx.save_node(&mut node, true).unwrap();
            ctx.commit().unwrap();
        }

        let ctx = DbContext::open_database(&path).unwrap();
        let mut node = ctx.open_node(nid).unwrap();
        let back = ctx.read_node(&mut node, 0, 9).unwrap();
        assert_eq!(back, b"persisted");
    }

    #[test]
    fn test_child_context_commits_into_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let root = Arc::new(Mutex::new(DbContext::open_database(&path).unwrap()));

        let mut child = DbContext::create_context(&root);
        let mut node = child.create_node(NodeIdType::Attachment).unwrap();
        let nid = node.nid;
        child.write_node(&mut node, 0, b"from child").unwrap();
        child.save_node(&mut node, true).unwrap();
        child.commit().unwrap();

        let parent = root.lock().unwrap();
        assert!(parent.nbt.lookup(nid).is_ok());
    }

    #[test]
    fn test_stale_rebase_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let root = Arc::new(Mutex::new(DbContext::open_database(&path).unwrap()));

        let mut child_a = DbContext::create_context(&root);
        let mut child_b = DbContext::create_context(&root);

        let mut node_a = child_a.create_node(NodeIdType::NormalMessage).unwrap();
        child_a.write_node(&mut node_a, 0, b"a").unwrap();
        child_a.save_node(&mut node_a, true).unwrap();
        child_a.commit().unwrap();

        let mut node_b = child_b.create_node(NodeIdType::NormalMessage).unwrap();
        child_b.write_node(&mut node_b, 0, b"b").unwrap();
        child_b.save_node(&mut node_b, true).unwrap();
        let err = child_b.commit().unwrap_err();
        assert!(matches!(err, NdbError::NodeSaveError(_)));
    }
}
