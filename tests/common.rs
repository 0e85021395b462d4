#![allow(dead_code)]

use std::collections::HashSet;

use anyhow::Result;
use assert_cmd::Command;
use camino::{Utf8Path, Utf8PathBuf};

use burrow::hashing::ObjectId;
use burrow::metadata::Metadata;
use burrow::object::{self, Kind, TreeEntry};
use burrow::pack::{PackWriter, DEFAULT_TARGET_SIZE};
use burrow::repo::Repository;

pub fn cli_run(repo_path: &Utf8Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.arg("--repository").arg(repo_path.as_str());
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8Path::from_path(dir.path())
        .expect("temp dir isn't UTF-8")
        .to_owned()
}

pub fn files_in(p: &Utf8Path) -> impl Iterator<Item = std::path::PathBuf> {
    walkdir::WalkDir::new(p)
        .into_iter()
        .map(|e| e.expect("couldn't walk dir"))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

/// Deterministic filler for fixture file contents.
pub fn pattern_bytes(len: usize, seed: u32) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
        .collect()
}

pub fn meta_record(mode: u32, seed: u32) -> Metadata {
    Metadata {
        mode,
        user_id: 1000 + seed,
        group_id: 1000,
        size: seed as u64 * 7,
        access_time: 1700000000 + seed as i64,
        modify_time: 1700000000,
        change_time: 1700000000,
    }
}

/// Concatenated CBOR records, as stored in a `.bupm` blob.
pub fn bupm_stream(records: &[Metadata]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in records {
        r.write(&mut out).expect("CBOR encoding failed");
    }
    out
}

/// Builds fixture repositories: objects grouped into packs, refs on top.
///
/// No backup/split machinery here; tests assemble trees straight out of
/// the object codecs.
pub struct RepoBuilder {
    packs: Vec<Vec<(ObjectId, Kind, Vec<u8>)>>,
    seen: HashSet<ObjectId>,
    refs: Vec<(String, ObjectId)>,
}

impl Default for RepoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepoBuilder {
    pub fn new() -> Self {
        Self {
            packs: vec![Vec::new()],
            seen: HashSet::new(),
            refs: Vec::new(),
        }
    }

    fn put(&mut self, kind: Kind, bytes: Vec<u8>) -> ObjectId {
        let id = object::id_of(kind, &bytes);
        if self.seen.insert(id) {
            self.packs.last_mut().unwrap().push((id, kind, bytes));
        }
        id
    }

    /// Everything added after this lands in a separate pack.
    pub fn new_pack(&mut self) {
        if !self.packs.last().unwrap().is_empty() {
            self.packs.push(Vec::new());
        }
    }

    pub fn blob(&mut self, bytes: &[u8]) -> ObjectId {
        self.put(Kind::Blob, bytes.to_vec())
    }

    pub fn tree(&mut self, entries: &[TreeEntry]) -> Result<ObjectId> {
        let bytes = object::encode_tree(entries)?;
        Ok(self.put(Kind::Tree, bytes))
    }

    /// A flat split tree over the given chunks, entries named by offset.
    pub fn chunked(&mut self, chunks: &[&[u8]]) -> Result<ObjectId> {
        let mut entries = Vec::new();
        let mut ofs = 0u64;
        for chunk in chunks {
            let id = self.blob(chunk);
            entries.push(split_entry(ofs, id, false));
            ofs += chunk.len() as u64;
        }
        self.tree(&entries)
    }

    /// One level of a split tree from `(offset, child, is_subtree)` rows.
    pub fn split_tree(&mut self, rows: &[(u64, ObjectId, bool)]) -> Result<ObjectId> {
        let entries: Vec<TreeEntry> = rows
            .iter()
            .map(|(ofs, id, is_dir)| split_entry(*ofs, *id, *is_dir))
            .collect();
        self.tree(&entries)
    }

    pub fn commit(&mut self, tree: ObjectId, parents: &[ObjectId], time: i64) -> ObjectId {
        let commit = object::Commit {
            tree,
            parents: parents.to_vec(),
            author: String::from("You <you@example.com>"),
            author_time: time,
            message: String::from("backup\n"),
        };
        self.put(Kind::Commit, object::encode_commit(&commit))
    }

    pub fn branch(&mut self, name: &str, id: ObjectId) {
        self.refs.push((format!("refs/heads/{name}"), id));
    }

    pub fn tag(&mut self, name: &str, id: ObjectId) {
        self.refs.push((format!("refs/tags/{name}"), id));
    }

    pub fn build(&self, dir: &Utf8Path) -> Result<Repository> {
        Repository::init(dir)?;
        let repo = Repository::open(dir)?;
        let pack_dir = repo.pack_dir();
        for group in &self.packs {
            if group.is_empty() {
                continue;
            }
            let mut writer =
                PackWriter::new(&pack_dir, 1, DEFAULT_TARGET_SIZE, Box::new(|_| Ok(())));
            for (id, kind, bytes) in group {
                writer.write(id, *kind, bytes)?;
            }
            writer.close()?;
        }
        for (name, id) in &self.refs {
            repo.update_ref(name, id)?;
        }
        // Reopen so the new packs are visible.
        Repository::open(dir)
    }
}

fn split_entry(ofs: u64, id: ObjectId, is_dir: bool) -> TreeEntry {
    TreeEntry {
        mode: if is_dir {
            object::MODE_DIR
        } else {
            object::MODE_FILE
        },
        name: format!("{ofs:016x}"),
        id,
    }
}

pub fn file_entry(name: &str, id: ObjectId) -> TreeEntry {
    TreeEntry {
        mode: object::MODE_FILE,
        name: name.to_owned(),
        id,
    }
}

pub fn dir_entry(name: &str, id: ObjectId) -> TreeEntry {
    TreeEntry {
        mode: object::MODE_DIR,
        name: name.to_owned(),
        id,
    }
}

pub fn symlink_entry(name: &str, id: ObjectId) -> TreeEntry {
    TreeEntry {
        mode: object::MODE_SYMLINK,
        name: name.to_owned(),
        id,
    }
}

/// A chunked-file entry: the stored object is a split tree,
/// so the name gets mangled and the mode says "directory".
pub fn chunked_entry(name: &str, id: ObjectId) -> TreeEntry {
    TreeEntry {
        mode: object::MODE_DIR,
        name: object::mangle_name(name, object::BupMode::Chunked),
        id,
    }
}
