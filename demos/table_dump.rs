//! Builds a small table context with a few rows, commits, reopens, and
//! dumps the surviving rows. Mirrors the teacher's row-matrix walk in
//! `read_root_folder`/`read_ipm_subtree`, driving a table this run built
//! itself instead of one parsed from a sample file.
use clap::Parser;
use ndbstore::ltp::prop_context::PropertyType;
use ndbstore::ndb::node_id::NodeIdType;
use ndbstore::Database;

mod args;

const ROW_IDS: [u32; 3] = [1, 2, 3];
const AMOUNT_COLUMN: u16 = 0x10;

fn main() -> anyhow::Result<()> {
    let args = args::Args::try_parse()?;
    let db = Database::open(&args.file)?;

    let mut node = db.create_node(NodeIdType::ContentsTable)?;
    let nid = node.nid;
    let mut tc = db.create_table_context(&mut node)?;
    db.with_ltp(|store, amap, device| {
        tc.add_column(AMOUNT_COLUMN, PropertyType::Int32, &mut node, store, amap, device)?;
        for row_id in ROW_IDS {
            tc.add_row(row_id, &mut node, store, amap, device)?;
            tc.set_cell_value(
                row_id,
                AMOUNT_COLUMN,
                &(row_id as i32 * 100).to_le_bytes(),
                &mut node,
                store,
                amap,
                device,
            )?;
        }
        tc.delete_row(2, &mut node, store, amap, device)
    })?;
    db.save_table_context(&mut tc, &mut node)?;
    db.save_node(&mut node, true)?;
    db.commit()?;
    drop(db);

    let reopened = Database::open(&args.file)?;
    let mut node = reopened.open_node(nid)?;
    let mut tc = reopened.open_table_context(&mut node)?;
    println!("Row count: {}", tc.row_count());
    reopened.with_ltp(|store, amap, device| {
        for row_id in ROW_IDS {
            match tc.get_cell_value(row_id, AMOUNT_COLUMN, &mut node, store, amap, device) {
                Ok(bytes) => println!(
                    "row {row_id}: {}",
                    i32::from_le_bytes(bytes.try_into().unwrap())
                ),
                Err(_) => println!("row {row_id}: deleted"),
            }
        }
    });

    Ok(())
}
