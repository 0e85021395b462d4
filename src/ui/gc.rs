use anyhow::{bail, ensure, Result};
use camino::Utf8Path;
use clap::Parser;

use crate::config::Configuration;
use crate::gc;

/// Reclaim space from objects no ref can reach
#[derive(Debug, Parser)]
pub struct Args {
    /// Only rewrite a packfile if it's over this percent garbage
    #[arg(long)]
    threshold: Option<u32>,

    /// Set compression level to # (0-9, 9 is highest)
    #[arg(long)]
    compress: Option<i32>,
}

pub fn run(config: &Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let threshold = args.threshold.unwrap_or(config.gc_threshold);
    ensure!(
        threshold <= 100,
        "threshold must be an integer percentage value"
    );
    let compression = args.compress.unwrap_or(config.compression);
    ensure!(
        (0..=9).contains(&compression),
        "compression level must be between 0 and 9"
    );

    let opts = gc::Options {
        threshold,
        compression,
        ..Default::default()
    };
    let stats = gc::run(repository, &opts)?;
    if stats.errors > 0 {
        bail!("{} errors encountered during gc", stats.errors);
    }
    Ok(())
}
