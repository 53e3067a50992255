//! Srcbundle CLI: aggregate a directory into one document.

use anyhow::Result;
use clap::Parser;
use srcbundle::engine::arg_parser::Cli;
use srcbundle::engine::handle_run;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
