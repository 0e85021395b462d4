//! Per-entry filesystem metadata, stored as a stream of CBOR records.
//!
//! Each directory carries a hidden metadata file (the `.bupm` entry) whose
//! stream starts with the directory's own record, followed by one record
//! per non-directory child in sorted order. Subdirectories get theirs from
//! their own `.bupm`.

use std::io::Read;

use anyhow::{Context, Result};
use serde::Deserialize as _;
use serde_derive::{Deserialize, Serialize};

/// Backup-relevant metadata from a `stat()` call.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub size: u64,
    pub access_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
}

impl Metadata {
    /// Read the next record from a metadata stream.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut de = serde_cbor::Deserializer::from_reader(r);
        Metadata::deserialize(&mut de).context("Couldn't decode metadata record")
    }

    /// Append this record to a metadata stream.
    pub fn write<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        serde_cbor::to_writer(w, self).context("Couldn't encode metadata record")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(seed: u32) -> Metadata {
        Metadata {
            mode: 0o100644,
            user_id: seed,
            group_id: seed,
            size: seed as u64 * 10,
            access_time: 1700000000 + seed as i64,
            modify_time: 1700000000,
            change_time: 1700000000,
        }
    }

    #[test]
    fn stream_round_trip() -> Result<()> {
        let records = [record(1), record(2), record(3)];
        let mut stream = Vec::new();
        for r in &records {
            r.write(&mut stream)?;
        }

        let mut reader = stream.as_slice();
        for expected in &records {
            assert_eq!(&Metadata::read(&mut reader)?, expected);
        }
        // Stream exhausted: the next read fails rather than making
        // something up.
        assert!(Metadata::read(&mut reader).is_err());
        Ok(())
    }
}
