//! Repository layout and object access.
//!
//! A repository is a directory of packs (`objects/pack/*.pack` + `.idx`),
//! refs (`refs/heads/*`, `refs/tags/*`, one hex hash per file), and a
//! reflog (`logs/refs/...`, appended by [`Repository::update_ref`]).
//! Everything content-addressed goes through [`Repository::cat`].

use std::fs;
use std::io::prelude::*;

use anyhow::{anyhow, bail, ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use log::*;
use rustc_hash::FxHashSet;

use crate::hashing::ObjectId;
use crate::object::{self, Kind};
use crate::pack::Pack;

pub const PACK_DIR: &str = "objects/pack";
pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
pub const LOGS_DIR: &str = "logs";

pub struct Repository {
    dir: Utf8PathBuf,
    packs: Vec<Pack>,
}

impl Repository {
    /// Create the directory skeleton for a new repository.
    pub fn init(dir: &Utf8Path) -> Result<()> {
        ensure!(
            !dir.join("objects").exists(),
            "{} is already a repository",
            dir
        );
        for sub in [PACK_DIR, "refs/heads", "refs/tags", LOGS_DIR] {
            fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("Couldn't create {}/{}", dir, sub))?;
        }
        info!("Initialized repository at {}", dir);
        Ok(())
    }

    /// Open a repository, loading every pack index under `objects/pack/`.
    pub fn open(dir: &Utf8Path) -> Result<Self> {
        let pack_dir = dir.join(PACK_DIR);
        ensure!(pack_dir.is_dir(), "{} is not a repository", dir);

        let mut packs = Vec::new();
        for idx in list_idx_files(&pack_dir)? {
            packs.push(Pack::open(&idx)?);
        }
        debug!("Opened repository {} ({} packs)", dir, packs.len());
        Ok(Self {
            dir: dir.to_owned(),
            packs,
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn pack_dir(&self) -> Utf8PathBuf {
        self.dir.join(PACK_DIR)
    }

    /// Fetch an object by ID.
    pub fn cat(&self, id: &ObjectId) -> Result<(Kind, Vec<u8>)> {
        for pack in &self.packs {
            if let Some(found) = pack.get(id)? {
                return Ok(found);
            }
        }
        bail!("Object {} not found in any pack", id);
    }

    /// Lazily concatenate the blobs reachable from `id`:
    /// a blob is itself, a tree is its entries' blobs in order.
    pub fn join(&self, id: ObjectId) -> Join<'_> {
        Join {
            repo: self,
            stack: vec![id],
        }
    }

    /// All refs, heads then tags, each sorted by name.
    /// Names are fully qualified (`refs/heads/...`, `refs/tags/...`).
    pub fn list_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let mut refs = self.refs_in(HEADS_PREFIX)?;
        refs.extend(self.refs_in(TAGS_PREFIX)?);
        Ok(refs)
    }

    fn refs_in(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        let dir = self.dir.join(prefix.trim_end_matches('/'));
        let mut refs = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Couldn't list refs in {dir}"))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| anyhow!("Ref name {:?} isn't UTF-8", n))?;
            let full = format!("{prefix}{name}");
            refs.push((full.clone(), self.read_ref(&full)?));
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    /// Read the commit a fully-qualified ref points at.
    pub fn read_ref(&self, name: &str) -> Result<ObjectId> {
        let path = self.dir.join(name);
        let text =
            fs::read_to_string(&path).with_context(|| format!("Couldn't read ref {name}"))?;
        text.trim()
            .parse()
            .with_context(|| format!("Ref {name} doesn't contain an object ID"))
    }

    /// Point a fully-qualified ref at a commit,
    /// recording the move in the reflog.
    pub fn update_ref(&self, name: &str, id: &ObjectId) -> Result<()> {
        ensure!(
            name.starts_with(HEADS_PREFIX) || name.starts_with(TAGS_PREFIX),
            "Refusing to update ref {} outside refs/",
            name
        );
        let path = self.dir.join(name);
        let old = if path.exists() {
            self.read_ref(name)?.to_string()
        } else {
            "0".repeat(40)
        };
        crate::file_util::write_atomically(&path, format!("{id}\n").as_bytes())?;

        let log_path = self.dir.join(LOGS_DIR).join(name);
        fs::create_dir_all(log_path.parent().unwrap())?;
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Couldn't open reflog {log_path}"))?;
        writeln!(log, "{} {} {}", old, id, Utc::now().timestamp())?;
        debug!("Updated {name} to {id}");
        Ok(())
    }

    /// Walk a commit's history, yielding `(commit, author time)` pairs,
    /// newest first.
    pub fn rev_list(&self, head: ObjectId) -> Result<Vec<(ObjectId, i64)>> {
        let mut pending = vec![head];
        let mut seen = FxHashSet::default();
        let mut revs = Vec::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let (kind, bytes) = self.cat(&id)?;
            ensure!(kind == Kind::Commit, "{} is a {}, not a commit", id, kind);
            let commit = object::decode_commit(&bytes)
                .with_context(|| format!("Couldn't parse commit {id}"))?;
            revs.push((id, commit.author_time));
            pending.extend(commit.parents);
        }
        revs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(revs)
    }

    /// Author times for the given commits.
    pub fn get_commit_dates(&self, ids: &[ObjectId]) -> Result<Vec<i64>> {
        ids.iter()
            .map(|id| {
                let (kind, bytes) = self.cat(id)?;
                ensure!(kind == Kind::Commit, "{} is a {}, not a commit", id, kind);
                Ok(object::decode_commit(&bytes)?.author_time)
            })
            .collect()
    }
}

/// The `.idx` files in a pack directory, sorted by name.
pub fn list_idx_files(pack_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut found = Vec::new();
    for entry in
        fs::read_dir(pack_dir).with_context(|| format!("Couldn't list packs in {pack_dir}"))?
    {
        let path = Utf8PathBuf::from_path_buf(entry?.path())
            .map_err(|p| anyhow!("Pack path {} isn't UTF-8", p.display()))?;
        if path.extension() == Some("idx") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Lazy blob concatenation; see [`Repository::join`].
pub struct Join<'a> {
    repo: &'a Repository,
    stack: Vec<ObjectId>,
}

impl Iterator for Join<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.stack.pop()?;
            match self.repo.cat(&id) {
                Err(e) => return Some(Err(e)),
                Ok((Kind::Blob, bytes)) => return Some(Ok(bytes)),
                Ok((Kind::Tree, bytes)) => match object::decode_tree(&bytes) {
                    Err(e) => return Some(Err(e)),
                    Ok(entries) => {
                        self.stack.extend(entries.iter().rev().map(|e| e.id));
                    }
                },
                Ok((Kind::Commit, _)) => {
                    return Some(Err(anyhow!("Can't join commit {}", id)));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn repo_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8Path::from_path(dir.path())
            .expect("temp dir isn't UTF-8")
            .to_owned()
    }

    #[test]
    fn init_then_open() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let dir = repo_dir(&dir);
        Repository::init(&dir)?;
        // Double init is refused.
        assert!(Repository::init(&dir).is_err());

        let repo = Repository::open(&dir)?;
        assert!(repo.list_refs()?.is_empty());
        assert!(repo.cat(&ObjectId::hash(b"anything")).is_err());
        Ok(())
    }

    #[test]
    fn open_requires_repository() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        assert!(Repository::open(&repo_dir(&dir)).is_err());
        Ok(())
    }

    #[test]
    fn refs_and_reflog() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let dir = repo_dir(&dir);
        Repository::init(&dir)?;
        let repo = Repository::open(&dir)?;

        let first = ObjectId::hash(b"first commit");
        let second = ObjectId::hash(b"second commit");
        repo.update_ref("refs/heads/main", &first)?;
        repo.update_ref("refs/heads/main", &second)?;
        repo.update_ref("refs/tags/v1", &first)?;
        assert!(repo.update_ref("refs/../escape", &first).is_err());

        assert_eq!(repo.read_ref("refs/heads/main")?, second);
        let refs = repo.list_refs()?;
        let names: Vec<&str> = refs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["refs/heads/main", "refs/tags/v1"]);

        // Both moves of main are in its reflog.
        let log = fs::read_to_string(dir.join("logs/refs/heads/main"))?;
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().last().unwrap().contains(&second.to_string()));
        Ok(())
    }
}
