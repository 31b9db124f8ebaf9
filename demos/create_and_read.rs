//! Creates a node, writes a payload, commits it to disk, then reopens the
//! database fresh and reads the node back. Mirrors the teacher's
//! `read_root_folder` walk, but against data this run wrote itself rather
//! than a pre-built sample file.
use clap::Parser;
use ndbstore::ndb::node_id::NodeIdType;
use ndbstore::Database;

mod args;

fn main() -> anyhow::Result<()> {
    let args = args::Args::try_parse()?;
    let db = Database::open(&args.file)?;

    let payload = b"hello from the demo binary";
    let mut node = db.create_node(NodeIdType::NormalMessage)?;
    let nid = node.nid;
    db.write_node(&mut node, 0, payload)?;
    db.save_node(&mut node, true)?;
    db.commit()?;

    println!("Wrote node {nid:?} ({} bytes), committed.", payload.len());
    drop(db);

    let reopened = Database::open(&args.file)?;
    let mut node = reopened.open_node(nid)?;
    let bytes = reopened.read_node(&mut node, 0, payload.len() as u64)?;
    println!("Read back: {:?}", String::from_utf8_lossy(&bytes));

    Ok(())
}
