//! Utilities for checking magic bytes and writing files without tearing.

use std::io::prelude::*;

use anyhow::{ensure, Context, Result};
use camino::Utf8Path;

/// Checks for the given magic bytes at the start of the file
pub fn check_magic<R: Read>(r: &mut R, expected: &[u8]) -> Result<()> {
    let mut magic: [u8; 8] = [0; 8];
    r.read_exact(&mut magic)?;
    ensure!(
        magic == expected,
        "Expected magic bytes {}, found {}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&magic)
    );
    Ok(())
}

/// Writes `bytes` to a temp file in the target's directory,
/// then renames it into place so readers never see a partial file.
pub fn write_atomically(to: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let dir = to
        .parent()
        .with_context(|| format!("{to} has no parent directory"))?;
    let mut fh = tempfile::Builder::new()
        .prefix("temp-burrow-")
        .tempfile_in(dir)
        .with_context(|| format!("Couldn't open temporary file in {dir}"))?;
    fh.write_all(bytes)
        .with_context(|| format!("Couldn't write {to}"))?;
    fh.as_file().sync_all()?;
    fh.persist(to)
        .with_context(|| format!("Couldn't persist {to}"))?;
    Ok(())
}
