//! Random access over file contents, chunked or not.
//!
//! A big file is stored as a split tree: entries named by byte offset
//! (relative to the containing subtree), blobs at the leaves, subtrees in
//! between. Reading at an offset means descending to the right leaf and
//! streaming depth-first from there; nothing here ever materializes the
//! whole file.

use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

use anyhow::{ensure, Context, Result};

use crate::hashing::ObjectId;
use crate::object::{self, Kind};
use crate::repo::Repository;

/// One row of a split tree: `(offset, is_dir, child)`.
#[derive(Debug, Copy, Clone)]
struct SplitEntry {
    ofs: u64,
    is_dir: bool,
    id: ObjectId,
}

fn split_tree_decode(repo: &Repository, id: &ObjectId) -> Result<Vec<SplitEntry>> {
    let (kind, bytes) = repo.cat(id)?;
    ensure!(
        kind == Kind::Tree,
        "Split node {} is a {}, not a tree",
        id,
        kind
    );
    let mut entries = Vec::new();
    for entry in object::decode_tree(&bytes)? {
        let ofs = u64::from_str_radix(&entry.name, 16)
            .with_context(|| format!("Split entry {:?} isn't a hex offset", entry.name))?;
        entries.push(SplitEntry {
            ofs,
            is_dir: object::is_dir(entry.mode),
            id: entry.id,
        });
    }
    ensure!(!entries.is_empty(), "Split tree {} is empty", id);
    ensure!(
        entries[0].ofs == 0,
        "Split tree {} doesn't start at offset 0",
        id
    );
    ensure!(
        entries.windows(2).all(|w| w[0].ofs < w[1].ofs),
        "Split tree {} entries out of order",
        id
    );
    Ok(entries)
}

/// Total length of the blobs joined from `id`.
pub(crate) fn join_len(repo: &Repository, id: &ObjectId) -> Result<u64> {
    let mut total = 0;
    for chunk in repo.join(*id) {
        total += chunk?.len() as u64;
    }
    Ok(total)
}

/// Offset and length of a split tree's final chunk,
/// walking the rightmost path down to a leaf.
fn last_chunk_info(repo: &Repository, id: &ObjectId) -> Result<(u64, u64)> {
    let entries = split_tree_decode(repo, id)?;
    let last = entries.last().unwrap();
    if last.is_dir {
        let (sub_ofs, sub_len) = last_chunk_info(repo, &last.id)?;
        Ok((last.ofs + sub_ofs, sub_len))
    } else {
        Ok((last.ofs, join_len(repo, &last.id)?))
    }
}

/// Logical size of a chunked file.
pub(crate) fn total_size(repo: &Repository, id: &ObjectId) -> Result<u64> {
    let (last_ofs, last_len) = last_chunk_info(repo, id)?;
    Ok(last_ofs + last_len)
}

/// Lazily yields a split tree's blob contents in offset order,
/// starting at `start_ofs` within the file.
struct ChunkIter {
    repo: Rc<Repository>,
    stack: Vec<Frame>,
}

struct Frame {
    entries: Vec<SplitEntry>,
    next: usize,
    /// Bytes to skip at this level, relative to the subtree's origin.
    skip: u64,
}

impl ChunkIter {
    fn new(repo: Rc<Repository>, root: &ObjectId, start_ofs: u64) -> Result<Self> {
        let mut it = Self {
            repo,
            stack: Vec::new(),
        };
        it.push_tree(root, start_ofs)?;
        Ok(it)
    }

    fn push_tree(&mut self, id: &ObjectId, skip: u64) -> Result<()> {
        let entries = split_tree_decode(&self.repo, id)?;
        // Start at the last entry whose offset is <= the skip point;
        // everything before it is entirely before our start.
        let mut first = 0;
        while first + 1 < entries.len() && entries[first + 1].ofs <= skip {
            first += 1;
        }
        self.stack.push(Frame {
            entries,
            next: first,
            skip,
        });
        Ok(())
    }

    fn step(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if frame.next >= frame.entries.len() {
                self.stack.pop();
                continue;
            }
            let entry = frame.entries[frame.next];
            frame.next += 1;
            let skip = frame.skip.saturating_sub(entry.ofs);

            if entry.is_dir {
                self.push_tree(&entry.id, skip)?;
                continue;
            }
            let (kind, bytes) = self.repo.cat(&entry.id)?;
            ensure!(
                kind == Kind::Blob,
                "Split leaf {} is a {}, not a blob",
                entry.id,
                kind
            );
            let skip = (skip as usize).min(bytes.len());
            return Ok(Some(bytes[skip..].to_vec()));
        }
    }
}

/// Feeds reads from a chunk stream (or a single joined blob),
/// tracking the offset the next byte will come from.
struct ChunkReader {
    it: Option<ChunkIter>,
    blob: Vec<u8>,
    pos: usize,
    ofs: u64,
}

impl ChunkReader {
    fn new(repo: Rc<Repository>, id: &ObjectId, chunked: bool, start_ofs: u64) -> Result<Self> {
        if chunked {
            Ok(Self {
                it: Some(ChunkIter::new(repo, id, start_ofs)?),
                blob: Vec::new(),
                pos: 0,
                ofs: start_ofs,
            })
        } else {
            let mut bytes = Vec::new();
            for chunk in repo.join(*id) {
                bytes.extend(chunk?);
            }
            let pos = (start_ofs as usize).min(bytes.len());
            Ok(Self {
                it: None,
                blob: bytes,
                pos,
                ofs: start_ofs,
            })
        }
    }

    fn next(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while out.len() < count {
            if self.pos >= self.blob.len() {
                let next = match &mut self.it {
                    Some(it) => it.step()?,
                    None => None,
                };
                match next {
                    Some(blob) => {
                        self.blob = blob;
                        self.pos = 0;
                    }
                    None => self.it = None,
                }
            }
            if self.pos < self.blob.len() {
                let want = (count - out.len()).min(self.blob.len() - self.pos);
                out.extend_from_slice(&self.blob[self.pos..self.pos + want]);
                self.pos += want;
            }
            if self.it.is_none() && self.pos >= self.blob.len() {
                break;
            }
        }
        self.ofs += out.len() as u64;
        Ok(out)
    }
}

/// A seekable reader over one file's contents.
///
/// The underlying chunk stream only runs forward; seeking somewhere
/// non-contiguous throws it away and a later read rebuilds it at the new
/// offset. A failed read also tears the stream down, since its offset can
/// no longer be trusted.
pub struct FileReader {
    repo: Rc<Repository>,
    id: ObjectId,
    size: u64,
    chunked: bool,
    ofs: u64,
    reader: Option<ChunkReader>,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader").field("id", &self.id).finish()
    }
}

impl FileReader {
    pub(crate) fn new(repo: Rc<Repository>, id: ObjectId, size: u64, chunked: bool) -> Self {
        Self {
            repo,
            id,
            size,
            chunked,
            ofs: 0,
            reader: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Move to the given offset, clamped to the file's size.
    pub fn seek(&mut self, ofs: u64) {
        self.ofs = ofs.min(self.size);
    }

    pub fn tell(&self) -> u64 {
        self.ofs
    }

    /// Read up to `count` bytes from the current offset, crossing chunk
    /// boundaries as needed. Reads past the end return short (or empty).
    pub fn read(&mut self, count: usize) -> Result<Vec<u8>> {
        let rebuild = match &self.reader {
            Some(r) => r.ofs != self.ofs,
            None => true,
        };
        if rebuild {
            self.reader = Some(ChunkReader::new(
                self.repo.clone(),
                &self.id,
                self.chunked,
                self.ofs,
            )?);
        }
        let buf = match self.reader.as_mut().unwrap().next(count) {
            Ok(buf) => buf,
            Err(e) => {
                // Our offsets would be all screwed up otherwise.
                self.reader = None;
                return Err(e);
            }
        };
        self.ofs += buf.len() as u64;
        Ok(buf)
    }

    /// Read from the current offset through the end of the file.
    pub fn read_rest(&mut self) -> Result<Vec<u8>> {
        let left = (self.size - self.ofs) as usize;
        self.read(left)
    }

    /// The whole file, from the top.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.seek(0);
        self.read_rest()
    }

    pub fn close(self) {}
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = FileReader::read(self, buf.len()).map_err(io::Error::other)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::End(d) => self.size as i128 + d as i128,
            SeekFrom::Current(d) => self.ofs as i128 + d as i128,
        };
        self.ofs = target.clamp(0, self.size as i128) as u64;
        Ok(self.ofs)
    }
}
