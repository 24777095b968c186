//! `irmin-ppcf`: dumps a store's control file as a JSON object.

use anyhow::{Context, Result};
use clap::Parser;
use irmin_core::control;
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Pretty-print an Irmin-style control file as JSON")]
struct Args {
    /// Path to the control file (typically `<store_root>/store.control`).
    path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let payload = control::read_control_file(&args.path)
        .with_context(|| format!("reading control file at {}", args.path.display()))?;

    let json = serde_json::to_string_pretty(&payload).context("serialising control payload")?;
    println!("{json}");
    Ok(())
}
