//! Opens a database and reports its format variant, mirroring the
//! teacher's `read_header` demo but against a file this engine can also
//! write, not just parse.
use clap::Parser;
use ndbstore::Database;

mod args;

fn main() -> anyhow::Result<()> {
    let args = args::Args::try_parse()?;
    let db = Database::open(&args.file)?;

    println!("File: {}", args.file);
    println!("Variant: {:?}", db.variant());

    Ok(())
}
