//! Read/write storage engine for a PST-style page-oriented container
//! format: a page-allocated node database (`ndb`) of copy-on-write B+
//! trees carrying ref-counted blocks, topped by a heap/BTree-on-heap
//! property and table layer (`ltp`).
//!
//! [`Database`] is the top-level facade: it owns a root [`ndb::context::DbContext`]
//! behind an `Arc<Mutex<_>>` so [`Database::fork`] can hand out independent
//! snapshot-plus-overlay views that share the same underlying [`device::Device`]
//! and commit path (see `ndb::context` for the snapshot/merge semantics).

use std::{
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use thiserror::Error;

pub mod device;
pub mod ltp;
pub mod ndb;

mod block_sig;
mod crc;

use device::Device;
use ltp::{
    named_prop::NamedPropertyMap, prop_context::PropertyContext, table_context::TableContext,
    LtpError,
};
use ndb::{
    context::DbContext,
    node::Node,
    node_id::{NodeId, NodeIdType},
    NdbError, NdbResult,
};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Node Database error: {0}")]
    Ndb(#[from] NdbError),
    #[error("LTP layer error: {0}")]
    Ltp(#[from] LtpError),
}

impl From<DatabaseError> for io::Error {
    fn from(err: DatabaseError) -> io::Error {
        match err {
            DatabaseError::Ndb(err) => err.into(),
            DatabaseError::Ltp(err) => err.into(),
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Top-level handle onto a database file (or an in-memory one in tests):
/// a shared, mutex-guarded [`DbContext`] plus the convenience methods that
/// wire the `ndb` node layer into the `ltp` heap/property/table layer.
///
/// Cloning a `Database` (via [`Clone`]) shares the same context — use
/// [`Database::fork`] to get an independent snapshot view instead.
#[derive(Clone)]
pub struct Database {
    ctx: Arc<Mutex<DbContext>>,
}

impl Database {
    /// Opens (or creates) the database file at `path` as the root context.
    pub fn open(path: impl AsRef<Path>) -> NdbResult<Self> {
        let ctx = DbContext::open_database(path)?;
        Ok(Self { ctx: Arc::new(Mutex::new(ctx)) })
    }

    /// The on-disk format variant this database was opened (or created) as.
    pub fn variant(&self) -> ndb::FormatVariant {
        self.ctx.lock().expect("context mutex poisoned").variant()
    }

    /// Forks a snapshot-plus-overlay view from `self` (`spec.md` §4.5):
    /// the new context sees `self`'s committed state but stages its own
    /// edits until its own [`Database::commit`] merges them back.
    pub fn fork(&self) -> Self {
        let forked = DbContext::create_context(&self.ctx);
        Self { ctx: Arc::new(Mutex::new(forked)) }
    }

    /// Merges this context's overlay into its parent (or to disk, for the
    /// root context). Fails with [`NdbError::NodeSaveError`] if the parent
    /// has moved on since this context was forked.
    pub fn commit(&self) -> NdbResult<()> {
        self.ctx.lock().expect("context mutex poisoned").commit()
    }

    pub fn create_node(&self, id_type: NodeIdType) -> NdbResult<Node> {
        self.ctx.lock().expect("context mutex poisoned").create_node(id_type)
    }

    pub fn open_node(&self, nid: NodeId) -> NdbResult<Node> {
        self.ctx.lock().expect("context mutex poisoned").open_node(nid)
    }

    pub fn read_node(&self, node: &mut Node, offset: u64, len: u64) -> NdbResult<Vec<u8>> {
        self.ctx.lock().expect("context mutex poisoned").read_node(node, offset, len)
    }

    pub fn write_node(&self, node: &mut Node, offset: u64, data: &[u8]) -> NdbResult<()> {
        self.ctx.lock().expect("context mutex poisoned").write_node(node, offset, data)
    }

    /// Flushes `node`'s dirty data/subnodes into blocks and stages its
    /// descriptor into the NBT overlay. `insert` selects the NBT upsert
    /// path: `true` for a brand-new node, `false` to update an existing one.
    pub fn save_node(&self, node: &mut Node, insert: bool) -> NdbResult<()> {
        self.ctx.lock().expect("context mutex poisoned").save_node(node, insert)
    }

    pub fn delete_node(&self, nid: NodeId) -> NdbResult<()> {
        self.ctx.lock().expect("context mutex poisoned").delete_node(nid)
    }

    /// Lends a `ltp`-layer type read-only access to this context's block
    /// store, allocation map and device, for operations the convenience
    /// methods below don't wrap directly (e.g. `PropertyContext::write_prop`,
    /// `TableContext::add_row`, `NamedPropertyMap::add_prop`).
    pub fn with_ltp<R>(&self, f: impl FnOnce(&ndb::block_store::BlockStore, &ndb::amap::AllocationMap, &mut dyn Device) -> R) -> R {
        self.ctx.lock().expect("context mutex poisoned").with_ltp(f)
    }

    pub fn create_property_context(&self, node: &mut Node) -> DatabaseResult<PropertyContext> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| PropertyContext::create(node, store, amap, device))?)
    }

    pub fn open_property_context(&self, node: &mut Node) -> DatabaseResult<PropertyContext> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| PropertyContext::open(node, store, amap, device))?)
    }

    /// Like `save_table_context`, this needs mutable access to the block
    /// store and allocation map: a property that spilled to a subnode
    /// materializes real blocks on save.
    pub fn save_property_context(
        &self,
        pc: &mut PropertyContext,
        node: &mut Node,
    ) -> DatabaseResult<()> {
        let mut ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp_mut(|store, amap, device| pc.save_property_bag(node, store, amap, device))?)
    }

    pub fn create_table_context(&self, node: &mut Node) -> DatabaseResult<TableContext> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| TableContext::create(node, store, amap, device))?)
    }

    pub fn open_table_context(&self, node: &mut Node) -> DatabaseResult<TableContext> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| TableContext::open(node, store, amap, device))?)
    }

    /// Unlike the other `save_*` methods, this one needs mutable access to
    /// the block store and allocation map: a table whose row matrix
    /// migrated to a subnode materializes real blocks on save.
    pub fn save_table_context(&self, tc: &mut TableContext, node: &mut Node) -> DatabaseResult<()> {
        let mut ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp_mut(|store, amap, device| {
            tc.save_table_context(node, store, amap, device)
        })?)
    }

    pub fn create_named_property_map(&self, node: &mut Node) -> DatabaseResult<NamedPropertyMap> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| NamedPropertyMap::create(node, store, amap, device))?)
    }

    pub fn open_named_property_map(&self, node: &mut Node) -> DatabaseResult<NamedPropertyMap> {
        let ctx = self.ctx.lock().expect("context mutex poisoned");
        Ok(ctx.with_ltp(|store, amap, device| NamedPropertyMap::open(node, store, amap, device))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_database_open_write_commit_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let db = Database::open(&path).unwrap();

        let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
        let nid = node.nid;
        db.write_node(&mut node, 0, b"hello database").unwrap();
        db.save_node(&mut node, true).unwrap();
        db.commit().unwrap();

        let mut reopened = db.open_node(nid).unwrap();
        let back = db.read_node(&mut reopened, 0, 14).unwrap();
        assert_eq!(back, b"hello database");
    }

    #[test]
    fn test_fork_sees_parent_state_then_commits_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let db = Database::open(&path).unwrap();

        let mut node = db.create_node(NodeIdType::NormalFolder).unwrap();
        let nid = node.nid;
        db.write_node(&mut node, 0, b"parent data").unwrap();
        db.save_node(&mut node, true).unwrap();
        db.commit().unwrap();

        let child = db.fork();
        let mut seen = child.open_node(nid).unwrap();
        let back = child.read_node(&mut seen, 0, 11).unwrap();
        assert_eq!(back, b"parent data");

        child.write_node(&mut seen, 0, b"child wrote").unwrap();
        child.save_node(&mut seen, false).unwrap();
        child.commit().unwrap();

        let mut from_parent = db.open_node(nid).unwrap();
        let back = db.read_node(&mut from_parent, 0, 11).unwrap();
        assert_eq!(back, b"child wrote");
    }

    #[test]
    fn test_property_context_round_trips_through_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ndb");
        let db = Database::open(&path).unwrap();

        let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
        let mut pc = db.create_property_context(&mut node).unwrap();

        db.with_ltp(|store, amap, device| {
            pc.write_prop(0x3001, ltp::prop_context::PropValue::Int32(7), &mut node, store, amap, device)
        })
        .unwrap();
        db.save_property_context(&mut pc, &mut node).unwrap();
        db.save_node(&mut node, true).unwrap();
        db.commit().unwrap();

        let mut reopened = db.open_node(node.nid).unwrap();
        let mut reloaded = db.open_property_context(&mut reopened).unwrap();
        let value = db
            .with_ltp(|store, amap, device| reloaded.read_prop(0x3001, &mut reopened, store, amap, device))
            .unwrap();
        assert!(matches!(value, ltp::prop_context::PropValue::Int32(7)));
    }
}
