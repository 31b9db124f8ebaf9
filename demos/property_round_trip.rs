//! Writes a handful of typed properties into a node's property context,
//! commits, reopens, and prints them back. Mirrors the teacher's
//! `read_store_props` walk over a parsed property bag.
use clap::Parser;
use ndbstore::ltp::prop_context::PropValue;
use ndbstore::ndb::node_id::NodeIdType;
use ndbstore::Database;

mod args;

fn main() -> anyhow::Result<()> {
    let args = args::Args::try_parse()?;
    let db = Database::open(&args.file)?;

    let mut node = db.create_node(NodeIdType::NormalMessage)?;
    let nid = node.nid;
    let mut pc = db.create_property_context(&mut node)?;
    db.with_ltp(|store, amap, device| {
        pc.write_prop(0x3001, PropValue::String("Demo Subject".to_string()), &mut node, store, amap, device)?;
        pc.write_prop(0xe08, PropValue::Int32(42), &mut node, store, amap, device)
    })?;
    db.save_property_context(&mut pc, &mut node)?;
    db.save_node(&mut node, true)?;
    db.commit()?;
    drop(db);

    let reopened = Database::open(&args.file)?;
    let mut node = reopened.open_node(nid)?;
    let mut pc = reopened.open_property_context(&mut node)?;
    let (subject, size) = reopened.with_ltp(|store, amap, device| {
        let subject = pc.read_prop(0x3001, &mut node, store, amap, device)?;
        let size = pc.read_prop(0xe08, &mut node, store, amap, device)?;
        Ok::<_, ndbstore::ltp::LtpError>((subject, size))
    })?;

    println!("0x3001 (subject): {subject:?}");
    println!("0x0e08 (message size): {size:?}");

    Ok(())
}
