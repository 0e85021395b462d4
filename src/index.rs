//! Read and write the `.idx` files that sit next to each pack.
//!
//! An index is the sorted table of every object in its pack: where the
//! record starts, how big it is compressed and uncompressed, and what kind
//! of object it holds. GC counts and probes these without ever touching
//! the pack itself.

use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::file_util::check_magic;
use crate::hashing::{ObjectId, ID_LEN};
use crate::object::Kind;

const MAGIC_BYTES: &[u8] = b"BRWPIDX1";

/// One object's row in a pack index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IndexEntry {
    pub id: ObjectId,
    pub kind: Kind,
    /// Byte offset of the compressed record in the pack file.
    pub offset: u64,
    pub compressed_length: u32,
    pub length: u32,
}

/// A loaded pack index: entries sorted by ID.
#[derive(Debug)]
pub struct PackIndex {
    entries: Vec<IndexEntry>,
}

impl PackIndex {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let fh = File::open(path).with_context(|| format!("Couldn't open {path}"))?;
        Self::from_reader(&mut BufReader::new(fh))
            .with_context(|| format!("Couldn't load pack index {path}"))
    }

    fn from_reader<R: Read>(r: &mut R) -> Result<Self> {
        check_magic(r, MAGIC_BYTES).context("Wrong magic bytes for pack index")?;

        let mut count = [0; 4];
        r.read_exact(&mut count)?;
        let count = u32::from_be_bytes(count) as usize;

        let mut entries = Vec::with_capacity(count);
        let mut previous: Option<ObjectId> = None;
        for _ in 0..count {
            let entry = read_entry(r)?;
            if let Some(prev) = previous {
                ensure!(prev <= entry.id, "Pack index entries out of order");
            }
            previous = Some(entry.id);
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The i-th object ID, in sorted order.
    pub fn id_at(&self, i: usize) -> &ObjectId {
        &self.entries[i].id
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lookup(id).is_some()
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.id.cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }
}

fn read_entry<R: Read>(r: &mut R) -> Result<IndexEntry> {
    let mut id = [0; ID_LEN];
    r.read_exact(&mut id)?;
    let id = ObjectId::from_bytes(&id)?;

    let mut kind = [0; 1];
    r.read_exact(&mut kind)?;
    let kind = Kind::from_wire(kind[0])?;

    let mut offset = [0; 8];
    r.read_exact(&mut offset)?;
    let offset = u64::from_be_bytes(offset);

    let mut compressed_length = [0; 4];
    r.read_exact(&mut compressed_length)?;
    let compressed_length = u32::from_be_bytes(compressed_length);

    let mut length = [0; 4];
    r.read_exact(&mut length)?;
    let length = u32::from_be_bytes(length);

    Ok(IndexEntry {
        id,
        kind,
        offset,
        compressed_length,
        length,
    })
}

/// Write the index for a finished pack. Entries are sorted by ID here;
/// pass them in whatever order the pack was written.
pub fn to_writer<W: Write>(w: &mut W, entries: &[IndexEntry]) -> Result<()> {
    let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    w.write_all(MAGIC_BYTES)?;
    w.write_all(&(sorted.len() as u32).to_be_bytes())?;
    for entry in sorted {
        w.write_all(entry.id.as_bytes())?;
        w.write_all(&[entry.kind.to_wire()])?;
        w.write_all(&entry.offset.to_be_bytes())?;
        w.write_all(&entry.compressed_length.to_be_bytes())?;
        w.write_all(&entry.length.to_be_bytes())?;
    }
    Ok(())
}

/// The pack file an index describes: `foo.idx` -> `foo.pack`.
pub fn pack_path(idx_path: &Utf8Path) -> Utf8PathBuf {
    idx_path.with_extension("pack")
}
