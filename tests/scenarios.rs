//! End-to-end scenarios exercised against the public `Database` facade,
//! plus a couple of universal invariants that don't already have a
//! colocated unit test closer to the code they cover.
//!
//! The concrete scenarios here are adaptations of fixed, literal-address
//! walkthroughs that assumed a pre-built sample file (specific node ids
//! and byte offsets baked in by an existing on-disk fixture). This crate
//! starts every test from an empty database, so each scenario below
//! reproduces the same *mechanism* (the thing actually being tested)
//! against ids this crate allocates itself rather than the literal values.

use ndbstore::ltp::prop_context::PropValue;
use ndbstore::ndb::amap::AllocationMap;
use ndbstore::ndb::block_id::BlockId;
use ndbstore::ndb::block_store::BlockStore;
use ndbstore::ndb::btree::BbtEntry;
use ndbstore::ndb::node::Node;
use ndbstore::ndb::node_id::{NodeId, NodeIdType};
use ndbstore::ndb::FormatVariant;
use ndbstore::ndb::NdbError;
use ndbstore::{ltp, Database};

fn temp_db_path(name: &str) -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    // leak the tempdir so the file outlives this function; each test gets
    // its own directory so parallel runs don't collide.
    let path = dir.path().join(name);
    std::mem::forget(dir);
    path
}

/// S1 — AMap commit/abort, adapted: the allocation-level begin/allocate/
/// commit/abort properties are already covered directly against
/// `AllocationMap` in `ndb::amap`'s own tests. What's left to prove at
/// this layer is the two halves visible through `Database`: (a) a real
/// write survives commit + reopen, and (b) an edit that's never committed
/// — the context-level analogue of `abort` — leaves no trace once the
/// context holding it is dropped.
#[test]
fn s1_commit_persists_abort_leaves_no_trace() {
    let path = temp_db_path("s1.ndb");
    let db = Database::open(&path).unwrap();

    let payload = b"committed payload";
    let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
    let nid = node.nid;
    db.write_node(&mut node, 0, payload).unwrap();
    db.save_node(&mut node, true).unwrap();
    db.commit().unwrap();

    let mut reopened = db.open_node(nid).unwrap();
    assert_eq!(
        db.read_node(&mut reopened, 0, payload.len() as u64).unwrap(),
        payload
    );

    // Fork, write, save, but never commit; dropping the fork is this
    // layer's "abort".
    let forked = db.fork();
    let mut scratch = forked.create_node(NodeIdType::NormalMessage).unwrap();
    let scratch_nid = scratch.nid;
    forked.write_node(&mut scratch, 0, b"never committed").unwrap();
    forked.save_node(&mut scratch, true).unwrap();
    drop(forked);

    assert!(matches!(
        db.open_node(scratch_nid),
        Err(NdbError::NodeKeyNotFound(_))
    ));
}

/// S2 — BTH insert and lookup, run directly against `Bth` the way the
/// heap/tree layer tests do (no `Database` needed: a BTH only needs its
/// own node/store/amap/device triple).
#[test]
fn s2_bth_insert_and_lookup() {
    use ndbstore::device::MemoryDevice;
    use ndbstore::ltp::bth::Bth;
    use ndbstore::ltp::heap::HeapNodeType;

    let store = BlockStore::new(FormatVariant::Unicode);
    let amap = AllocationMap::new(FormatVariant::Unicode, 0);
    let mut device = MemoryDevice::new();
    let mut node = Node::new(
        NodeId::new(NodeIdType::HeapNode, 0x42).unwrap(),
        BlockId::NONE,
        BlockId::NONE,
    );

    let mut heap =
        ltp::heap::HeapOnNode::create(HeapNodeType::Tree, &mut node, &store, &amap, &mut device)
            .unwrap();
    let mut bth: Bth<u16, u32> =
        Bth::create(&mut heap, &mut node, &store, &amap, &mut device).unwrap();

    bth.upsert(900, 9000, &mut heap, &mut node, &store, &amap, &mut device)
        .unwrap();
    for k in 1000..1450u16 {
        bth.upsert(k, k as u32 * 10, &mut heap, &mut node, &store, &amap, &mut device)
            .unwrap();
    }

    assert_eq!(
        bth.lookup(900, &heap, &mut node, &store, &amap, &mut device)
            .unwrap(),
        9000
    );
    assert_eq!(
        bth.lookup(1449, &heap, &mut node, &store, &amap, &mut device)
            .unwrap(),
        14490
    );
    assert!(bth.levels() >= 1);
}

/// S3 — PC typed round-trip. The engine's `PropertyType` set is trimmed
/// to signed widths (no separate unsigned tags, see `DESIGN.md`), so
/// "ushort"/"ulong" map onto `Int16`/`Int32` — both literal values fit
/// comfortably in the signed range.
#[test]
fn s3_property_context_typed_round_trip() {
    let path = temp_db_path("s3.ndb");
    let db = Database::open(&path).unwrap();

    let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
    let mut pc = db.create_property_context(&mut node).unwrap();
    db.with_ltp(|store, amap, device| {
        pc.write_prop(0x2, PropValue::Int16(22222), &mut node, store, amap, device)?;
        pc.write_prop(0x3, PropValue::Int32(333333333), &mut node, store, amap, device)?;
        pc.write_prop(
            0x6,
            PropValue::String("test_value_wstring".to_string()),
            &mut node,
            store,
            amap,
            device,
        )
    })
    .unwrap();
    db.save_property_context(&mut pc, &mut node).unwrap();
    db.save_node(&mut node, true).unwrap();
    db.commit().unwrap();

    let nid = node.nid;
    let mut reopened_node = db.open_node(nid).unwrap();
    let mut reopened_pc = db.open_property_context(&mut reopened_node).unwrap();
    let (a, b, c) = db
        .with_ltp(|store, amap, device| {
            let a = reopened_pc.read_prop(0x2, &mut reopened_node, store, amap, device)?;
            let b = reopened_pc.read_prop(0x3, &mut reopened_node, store, amap, device)?;
            let c = reopened_pc.read_prop(0x6, &mut reopened_node, store, amap, device)?;
            Ok::<_, ndbstore::ltp::LtpError>((a, b, c))
        })
        .unwrap();
    assert_eq!(a, PropValue::Int16(22222));
    assert_eq!(b, PropValue::Int32(333333333));
    assert_eq!(c, PropValue::String("test_value_wstring".to_string()));
}

/// S4 — TC add/delete. `TableContext` keeps its row index private, so
/// "the remaining row-ids equal the original set minus the removed one"
/// is checked the way any external caller would: by probing each known
/// id for presence/absence rather than enumerating the index directly.
#[test]
fn s4_table_context_add_delete_round_trip() {
    let path = temp_db_path("s4.ndb");
    let db = Database::open(&path).unwrap();

    let mut node = db.create_node(NodeIdType::ContentsTable).unwrap();
    let mut tc = db.create_table_context(&mut node).unwrap();
    db.with_ltp(|store, amap, device| {
        tc.add_column(1, ltp::prop_context::PropertyType::Int32, &mut node, store, amap, device)?;
        for row_id in [10_u32, 20, 30] {
            tc.add_row(row_id, &mut node, store, amap, device)?;
            tc.set_cell_value(
                row_id,
                1,
                &(row_id as i32).to_le_bytes(),
                &mut node,
                store,
                amap,
                device,
            )?;
        }
        tc.delete_row(20, &mut node, store, amap, device)
    })
    .unwrap();
    db.save_table_context(&mut tc, &mut node).unwrap();
    db.save_node(&mut node, true).unwrap();
    db.commit().unwrap();

    let nid = node.nid;
    let mut reopened_node = db.open_node(nid).unwrap();
    let mut reopened_tc = db.open_table_context(&mut reopened_node).unwrap();
    assert_eq!(reopened_tc.row_count(), 2);
    db.with_ltp(|store, amap, device| {
        assert!(reopened_tc
            .get_cell_value(20, 1, &mut reopened_node, store, amap, device)
            .is_err());
        for row_id in [10_i32, 30] {
            let back = reopened_tc
                .get_cell_value(row_id as u32, 1, &mut reopened_node, store, amap, device)
                .unwrap();
            assert_eq!(i32::from_le_bytes(back.try_into().unwrap()), row_id);
        }
    });
}

/// S5 — Snapshot isolation: a context forked *before* a sibling's edit
/// never observes that edit unless it re-forks after a commit.
#[test]
fn s5_snapshot_isolation() {
    let path = temp_db_path("s5.ndb");
    let db = Database::open(&path).unwrap();

    let child = db.fork();

    let mut node = db.create_node(NodeIdType::NormalFolder).unwrap();
    let nid = node.nid;
    db.write_node(&mut node, 0, b"root only").unwrap();
    db.save_node(&mut node, true).unwrap();

    assert!(matches!(
        child.open_node(nid),
        Err(NdbError::NodeKeyNotFound(_))
    ));
}

/// S6 — Conflict rollback: a child whose parent has moved on since the
/// fork gets `NodeSaveError` on commit, and its own pre-fork snapshot
/// stays intact and readable afterward.
#[test]
fn s6_conflict_rollback_preserves_snapshot() {
    let path = temp_db_path("s6.ndb");
    let db = Database::open(&path).unwrap();

    let pre_fork_state = b"pre-fork state";
    let mut existing = db.create_node(NodeIdType::NormalFolder).unwrap();
    let existing_nid = existing.nid;
    db.write_node(&mut existing, 0, pre_fork_state).unwrap();
    db.save_node(&mut existing, true).unwrap();
    db.commit().unwrap();

    let child = db.fork();

    // Root moves on after the fork.
    let mut other = db.create_node(NodeIdType::NormalFolder).unwrap();
    db.write_node(&mut other, 0, b"root moved on").unwrap();
    db.save_node(&mut other, true).unwrap();
    db.commit().unwrap();

    // Child's own edit, then a commit attempt that should be rejected.
    let mut child_edit = child.create_node(NodeIdType::NormalMessage).unwrap();
    child.write_node(&mut child_edit, 0, b"child edit").unwrap();
    child.save_node(&mut child_edit, true).unwrap();
    assert!(matches!(child.commit(), Err(NdbError::NodeSaveError(_))));

    // The rejected commit didn't corrupt the child's own pre-fork view.
    let mut still_there = child.open_node(existing_nid).unwrap();
    assert_eq!(
        child
            .read_node(&mut still_there, 0, pre_fork_state.len() as u64)
            .unwrap(),
        pre_fork_state
    );
}

/// S7 — Reference tracking, adapted: each context owns a full clone of
/// the block store rather than sharing one ref-counted table (see
/// `DESIGN.md`), so "an earlier-snapshot context keeps a superseded block
/// alive" shows up as that context's own clone still holding the old
/// bytes after the owning root has released and reclaimed them.
#[test]
fn s7_superseded_block_survives_in_earlier_snapshot() {
    let path = temp_db_path("s7.ndb");
    let db = Database::open(&path).unwrap();

    let v1 = b"version one";
    let v2 = b"version two superseding the first block";
    let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
    let nid = node.nid;
    db.write_node(&mut node, 0, v1).unwrap();
    db.save_node(&mut node, true).unwrap();
    db.commit().unwrap();

    let child = db.fork();

    db.write_node(&mut node, 0, v2).unwrap();
    db.save_node(&mut node, false).unwrap();
    db.commit().unwrap();

    // The child's own clone was taken before the overwrite, so it still
    // resolves the old block even though root has released it.
    let mut seen_by_child = child.open_node(nid).unwrap();
    assert_eq!(
        child.read_node(&mut seen_by_child, 0, v1.len() as u64).unwrap(),
        v1
    );

    drop(child);

    let mut reopened = db.open_node(nid).unwrap();
    assert_eq!(
        db.read_node(&mut reopened, 0, v2.len() as u64).unwrap(),
        v2
    );
}

/// S8 — AMap rebuild, adapted: the allocation bitmap is never persisted
/// at all (`ndb::context` rebuilds it from the BBT and page directory on
/// every open, see `DESIGN.md`), so there is no `fAMapValid` flag to
/// clear. What the scenario actually needs proven — a reopen correctly
/// reconstructs allocation state, and further allocation keeps working
/// afterward — is exactly what a full close/reopen cycle plus one more
/// write exercises.
#[test]
fn s8_amap_rebuilds_on_reopen_and_keeps_allocating() {
    let path = temp_db_path("s8.ndb");
    let db = Database::open(&path).unwrap();

    let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
    let nid = node.nid;
    db.write_node(&mut node, 0, b"rebuilt from bbt").unwrap();
    db.save_node(&mut node, true).unwrap();
    db.commit().unwrap();
    drop(db);

    let reopened_db = Database::open(&path).unwrap();
    let mut reopened_node = reopened_db.open_node(nid).unwrap();
    assert_eq!(
        reopened_db.read_node(&mut reopened_node, 0, 16).unwrap(),
        b"rebuilt from bbt"
    );

    let mut another = reopened_db.create_node(NodeIdType::NormalMessage).unwrap();
    reopened_db
        .write_node(&mut another, 0, b"post-rebuild allocation still works")
        .unwrap();
    reopened_db.save_node(&mut another, true).unwrap();
    reopened_db.commit().unwrap();
}

/// NBT law: lookups return the last-written value across an
/// insert/modify/remove interleaving, and a removed key raises
/// `key_not_found` (`spec.md` §8's "NBT/BBT laws").
#[test]
fn nbt_lookup_returns_last_written_value() {
    let path = temp_db_path("nbt-laws.ndb");
    let db = Database::open(&path).unwrap();

    let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
    let nid = node.nid;
    db.write_node(&mut node, 0, b"first").unwrap();
    db.save_node(&mut node, true).unwrap();

    db.write_node(&mut node, 0, b"second").unwrap();
    db.save_node(&mut node, false).unwrap();
    db.commit().unwrap();

    let mut reopened = db.open_node(nid).unwrap();
    assert_eq!(db.read_node(&mut reopened, 0, 6).unwrap(), b"second");

    db.delete_node(nid).unwrap();
    db.commit().unwrap();
    assert!(matches!(
        db.open_node(nid),
        Err(NdbError::NodeKeyNotFound(_))
    ));
}

/// S9 — OS-thread concurrency, create case (`spec.md` §5, adapted from
/// `threadsafetytest.cpp`'s `test_mutex_node_create`): several real
/// threads each fork their own context, create a disjoint batch of
/// nodes, and race to commit. Unlike the teacher's single in-process
/// mutex that always lets every context's edits land, this crate's
/// commit is an optimistic rebase check (`s6`), so a thread whose
/// snapshot went stale while another thread committed first re-forks
/// from the new root and replays its batch — the natural retry loop for
/// a CAS-style commit protocol. What's under test is that the shared
/// `commit_mutex`/`SharedArena`/`Device` plumbing survives genuine
/// concurrent access without deadlock or corruption, and that every
/// thread's nodes land exactly once.
#[test]
fn s9_concurrent_threads_create_distinct_nodes() {
    let path = temp_db_path("s9.ndb");
    let db = Database::open(&path).unwrap();

    const THREAD_COUNT: usize = 4;
    const NODES_PER_THREAD: usize = 5;

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || loop {
                let child = db.fork();
                let mut created = Vec::with_capacity(NODES_PER_THREAD);
                for i in 0..NODES_PER_THREAD {
                    let mut node = child.create_node(NodeIdType::NormalMessage).unwrap();
                    let payload = format!("thread {t} node {i}");
                    child.write_node(&mut node, 0, payload.as_bytes()).unwrap();
                    child.save_node(&mut node, true).unwrap();
                    created.push(node.nid);
                }
                match child.commit() {
                    Ok(()) => return created,
                    Err(NdbError::NodeSaveError(_)) => continue,
                    Err(err) => panic!("unexpected commit error: {err:?}"),
                }
            })
        })
        .collect();

    let mut all_nids = Vec::new();
    for handle in handles {
        all_nids.extend(handle.join().expect("worker thread panicked"));
    }

    assert_eq!(all_nids.len(), THREAD_COUNT * NODES_PER_THREAD);
    let unique: std::collections::HashSet<_> = all_nids.iter().collect();
    assert_eq!(unique.len(), all_nids.len(), "every thread's nodes should land exactly once");

    for nid in &all_nids {
        assert!(db.open_node(*nid).is_ok());
    }
}

/// S10 — OS-thread concurrency, delete case (`threadsafetytest.cpp`'s
/// `test_mutex_node_delete`): several pre-existing nodes are deleted
/// concurrently by different threads, each through its own forked
/// context and retry-on-conflict loop. Exercises `delete_node`'s
/// observer-gated block release (`DESIGN.md`'s "Cross-context reference
/// tracking") under real concurrent drops rather than a single-threaded
/// call.
#[test]
fn s10_concurrent_threads_delete_distinct_nodes() {
    let path = temp_db_path("s10.ndb");
    let db = Database::open(&path).unwrap();

    const THREAD_COUNT: usize = 4;
    let mut nids = Vec::with_capacity(THREAD_COUNT);
    for t in 0..THREAD_COUNT {
        let mut node = db.create_node(NodeIdType::NormalMessage).unwrap();
        db.write_node(&mut node, 0, format!("victim {t}").as_bytes()).unwrap();
        db.save_node(&mut node, true).unwrap();
        nids.push(node.nid);
    }
    db.commit().unwrap();

    let handles: Vec<_> = nids
        .iter()
        .copied()
        .map(|nid| {
            let db = db.clone();
            std::thread::spawn(move || loop {
                let child = db.fork();
                child.delete_node(nid).unwrap();
                match child.commit() {
                    Ok(()) => return,
                    Err(NdbError::NodeSaveError(_)) => continue,
                    Err(err) => panic!("unexpected commit error: {err:?}"),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    for nid in nids {
        assert!(matches!(db.open_node(nid), Err(NdbError::NodeKeyNotFound(_))));
    }
}

/// Reference-counted block release (`spec.md` §4.3's pending free list):
/// a block shared by two references survives one `release`, and its BBT
/// entry and AMap span are reclaimed only once the last reference drops.
#[test]
fn block_store_release_reclaims_amap_span_at_zero_refs() {
    use ndbstore::device::MemoryDevice;

    let mut store = BlockStore::new(FormatVariant::Unicode);
    let mut amap = AllocationMap::new(FormatVariant::Unicode, 0);
    let mut device = MemoryDevice::new();

    let id = store.write_stream(b"shared bytes", &mut amap, &mut device).unwrap();
    store.add_ref(id).unwrap();

    let entry: BbtEntry = store.bbt.lookup(id).unwrap();
    assert!(amap.is_allocated(entry.offset, entry.size as u64).unwrap());

    assert!(store.release(id, &mut amap).unwrap().is_none());
    assert!(amap.is_allocated(entry.offset, entry.size as u64).unwrap());

    assert_eq!(store.release(id, &mut amap).unwrap(), Some(id));
    assert!(store.bbt.lookup(id).is_err());
    assert!(!amap.is_allocated(entry.offset, entry.size as u64).unwrap());
}
