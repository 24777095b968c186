//! `irmin-ppidx`: dumps a `FileStore`'s hash index as one text line per entry
//! (`hash offset length kind`), in pack offset order.

use anyhow::{Context, Result};
use clap::Parser;
use irmin_core::store::FileStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "List the pack index entries of an Irmin-style store")]
struct Args {
    /// Store root directory (contains `store.pack` and `store.index`).
    root: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let store = FileStore::open(&args.root)
        .with_context(|| format!("opening pack store at {}", args.root.display()))?;

    for (hash, offset, length, kind) in store.iter_index()? {
        println!("{} {} {} {:?}", hash, offset, length, kind);
    }
    Ok(())
}
