//! Build, read, and write compressed packs of objects.
//!
//! A pack is magic bytes followed by individually zstd-compressed object
//! records; all addressing (offsets, lengths, kinds) lives in the `.idx`
//! written beside it, so a reader can pull one object without streaming
//! the rest.

use std::fs::File;
use std::io::prelude::*;
use std::io::SeekFrom;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::*;
use tempfile::NamedTempFile;

use crate::file_util::check_magic;
use crate::hashing::ObjectId;
use crate::index::{self, IndexEntry, PackIndex};
use crate::object::{id_of, Kind};

const MAGIC_BYTES: &[u8] = b"BRWPACK1";

/// How much (uncompressed) data we aim to put in each pack.
pub const DEFAULT_TARGET_SIZE: u64 = 1024 * 1024 * 100; // 100 MB

/// Called with `Some(path)` whenever a pack is finalized. Deferred cleanup
/// hangs off this: files a finished pack supersedes are safe to delete only
/// once the callback fires. Callers that buffer cleanup should invoke their
/// callback once more with `None` after [`PackWriter::close`], since the
/// writer may never have finalized anything.
pub type OnPackFinish<'a> = Box<dyn FnMut(Option<&Utf8Path>) -> Result<()> + 'a>;

pub struct PackWriter<'a> {
    pack_dir: Utf8PathBuf,
    compression: i32,
    target_size: u64,
    on_pack_finish: OnPackFinish<'a>,
    current: Option<OpenPack>,
}

struct OpenPack {
    fh: NamedTempFile,
    entries: Vec<IndexEntry>,
    /// Where the next record lands in the file.
    offset: u64,
    bytes_written: u64,
}

impl<'a> PackWriter<'a> {
    pub fn new(
        pack_dir: &Utf8Path,
        compression: i32,
        target_size: u64,
        on_pack_finish: OnPackFinish<'a>,
    ) -> Self {
        Self {
            pack_dir: pack_dir.to_owned(),
            compression,
            target_size,
            on_pack_finish,
            current: None,
        }
    }

    /// Write the given object, starting a fresh pack when the current one
    /// has reached the target size.
    pub fn write(&mut self, id: &ObjectId, kind: Kind, bytes: &[u8]) -> Result<()> {
        assert!(bytes.len() <= u32::MAX as usize);

        if self.current.is_none() {
            self.current = Some(self.begin()?);
        }

        let compressed = zstd::bulk::compress(bytes, self.compression)
            .with_context(|| format!("Couldn't compress object {id}"))?;
        assert!(compressed.len() <= u32::MAX as usize);

        let current = self.current.as_mut().unwrap();
        current.fh.write_all(&compressed)?;
        current.entries.push(IndexEntry {
            id: *id,
            kind,
            offset: current.offset,
            compressed_length: compressed.len() as u32,
            length: bytes.len() as u32,
        });
        current.offset += compressed.len() as u64;
        current.bytes_written += bytes.len() as u64;
        trace!("Wrote {kind} {id} into pack");

        if current.bytes_written >= self.target_size {
            self.finish_current()?;
        }
        Ok(())
    }

    /// Finalize any pack in flight.
    pub fn close(mut self) -> Result<()> {
        if self.current.is_some() {
            self.finish_current()
        } else {
            Ok(())
        }
    }

    fn begin(&self) -> Result<OpenPack> {
        let mut fh = tempfile::Builder::new()
            .prefix("temp-burrow-")
            .suffix(".pack")
            .tempfile_in(&self.pack_dir)
            .context("Couldn't open temporary packfile for writing")?;
        fh.write_all(MAGIC_BYTES)?;
        Ok(OpenPack {
            fh,
            entries: Vec::new(),
            offset: MAGIC_BYTES.len() as u64,
            bytes_written: 0,
        })
    }

    fn finish_current(&mut self) -> Result<()> {
        let current = self
            .current
            .take()
            .expect("finish_current called with no pack in flight");
        assert!(!current.entries.is_empty());

        // A pack is named by the hash of its contents, in write order.
        let mut manifest = Vec::with_capacity(current.entries.len() * 20);
        for entry in &current.entries {
            manifest.extend_from_slice(entry.id.as_bytes());
        }
        let id = ObjectId::hash(&manifest);

        // Persist the pack before its index: an index must never point at
        // a pack that isn't durably on disk.
        current.fh.as_file().sync_all()?;
        let pack_path = self.pack_dir.join(format!("pack-{id}.pack"));
        let persisted = current
            .fh
            .persist(&pack_path)
            .with_context(|| format!("Couldn't persist finished pack to {pack_path}"))?;
        debug!(
            "Pack pack-{}.pack finished ({} bytes)",
            id,
            persisted.metadata()?.len()
        );

        let mut idx_fh = tempfile::Builder::new()
            .prefix("temp-burrow-")
            .suffix(".idx")
            .tempfile_in(&self.pack_dir)
            .context("Couldn't open temporary pack index for writing")?;
        index::to_writer(&mut idx_fh, &current.entries)?;
        idx_fh.as_file().sync_all()?;
        let idx_path = self.pack_dir.join(format!("pack-{id}.idx"));
        idx_fh
            .persist(&idx_path)
            .with_context(|| format!("Couldn't persist pack index to {idx_path}"))?;

        (self.on_pack_finish)(Some(&pack_path))
    }
}

/// A pack we can read objects back out of.
#[derive(Debug)]
pub struct Pack {
    pub path: Utf8PathBuf,
    pub index: PackIndex,
}

impl Pack {
    /// Open the pack described by the given `.idx` file.
    pub fn open(idx_path: &Utf8Path) -> Result<Self> {
        let index = PackIndex::load(idx_path)?;
        Ok(Self {
            path: index::pack_path(idx_path),
            index,
        })
    }

    /// Read the object at the given index entry,
    /// verifying its contents match its ID.
    pub fn read(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut fh =
            File::open(&self.path).with_context(|| format!("Couldn't open {}", self.path))?;
        check_magic(&mut fh, MAGIC_BYTES)
            .with_context(|| format!("Wrong magic bytes for packfile {}", self.path))?;
        fh.seek(SeekFrom::Start(entry.offset))?;

        let mut compressed = vec![0; entry.compressed_length as usize];
        fh.read_exact(&mut compressed)
            .with_context(|| format!("Couldn't read object {} from {}", entry.id, self.path))?;
        let bytes = zstd::bulk::decompress(&compressed, entry.length as usize)
            .with_context(|| format!("Decompression of object {} failed", entry.id))?;

        let calculated = id_of(entry.kind, &bytes);
        ensure!(
            calculated == entry.id,
            "Calculated hash of object ({}) doesn't match its ID ({})",
            calculated,
            entry.id
        );
        Ok(bytes)
    }

    /// Fetch an object by ID if this pack has it.
    pub fn get(&self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>> {
        match self.index.lookup(id) {
            Some(entry) => Ok(Some((entry.kind, self.read(entry)?))),
            None => Ok(None),
        }
    }
}
