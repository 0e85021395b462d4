//! A virtual file system over the repository's contents.
//!
//! The VFS exposes refs and their history as a navigable, read-only tree:
//! branches at the top level, every reachable commit under `/.commit`
//! (fanned out by the first hex byte so no directory gets enormous), and
//! tags under `/.tag`. Below a commit sits the backed-up tree itself, with
//! name mangling and chunked files translated back into plain files.
//!
//! Nodes materialize their children lazily and drop them again on
//! [`Node::release`]; parent links are weak, so a child never keeps its
//! parent alive.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use log::*;
use rustc_hash::FxHashMap;

use crate::hashing::ObjectId;
use crate::metadata::Metadata;
use crate::object::{
    self, BupMode, Kind, METADATA_NAME, MODE_DIR, MODE_FILE, MODE_SYMLINK,
};
use crate::repo::{Repository, HEADS_PREFIX, TAGS_PREFIX};

pub mod reader;

pub use reader::FileReader;

/// How many levels of symlinks we'll chase before giving up.
const MAX_SYMLINK_DEPTH: u32 = 100;

/// The VFS error family. These travel inside [`anyhow::Error`]; callers
/// that behave differently per kind (like [`Node::try_resolve`]) downcast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NoSuchFile(String),
    #[error("{0}")]
    NotDir(String),
    #[error("{0}")]
    NotFile(String),
    #[error("{0}")]
    TooManySymlinks(String),
}

fn is_no_such_file(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::NoSuchFile(_)))
}

thread_local! {
    static SYMLINK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Holds one level of symlink dereference; the count drops with the guard,
/// so every exit path gives the level back.
struct SymrefGuard;

impl SymrefGuard {
    fn enter(fullname: &str) -> Result<Self> {
        SYMLINK_DEPTH.with(|depth| {
            if depth.get() > MAX_SYMLINK_DEPTH {
                bail!(Error::TooManySymlinks(format!(
                    "too many levels of symlinks: {fullname}"
                )));
            }
            depth.set(depth.get() + 1);
            Ok(SymrefGuard)
        })
    }
}

impl Drop for SymrefGuard {
    fn drop(&mut self) {
        SYMLINK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// What a node is, plus any variant-specific state.
enum NodeKind {
    /// The top of the tree: branches, `.commit`, `.tag`.
    Root,
    /// `/.commit`: 256 buckets keyed by the first hex byte of each commit.
    CommitDir,
    /// One `/.commit/xx` bucket. Filled in by [`CommitDir`]'s expansion,
    /// expanded into directories on demand.
    CommitList {
        commits: RefCell<FxHashMap<String, (ObjectId, i64)>>,
    },
    /// `/.tag`: a symlink per tag into `/.commit`.
    TagDir,
    /// A branch: a symlink per commit, named by commit date.
    BranchList,
    /// A stored directory (or a commit, which reads as its root tree).
    Dir {
        metadata_file: RefCell<Option<Rc<Node>>>,
    },
    /// A stored file, possibly chunked.
    File {
        bup_mode: BupMode,
        cached_size: Cell<Option<u64>>,
    },
    /// A stored symlink; the blob is the target text.
    Symlink,
    /// A synthesized symlink that exists only in the VFS.
    FakeSymlink { target: String },
}

pub struct Node {
    me: Weak<Node>,
    parent: Weak<Node>,
    repo: Rc<Repository>,
    name: String,
    mode: u32,
    id: ObjectId,
    ctime: Cell<i64>,
    mtime: Cell<i64>,
    atime: Cell<i64>,
    kind: NodeKind,
    subs: RefCell<Option<BTreeMap<String, Rc<Node>>>>,
    meta: RefCell<Option<Metadata>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("name", &self.name).finish()
    }
}

fn new_node(
    parent: Option<&Rc<Node>>,
    repo: Rc<Repository>,
    name: &str,
    mode: u32,
    id: ObjectId,
    kind: NodeKind,
) -> Rc<Node> {
    Rc::new_cyclic(|me| Node {
        me: me.clone(),
        parent: parent.map(Rc::downgrade).unwrap_or_else(Weak::new),
        repo,
        name: name.to_owned(),
        mode,
        id,
        ctime: Cell::new(0),
        mtime: Cell::new(0),
        atime: Cell::new(0),
        kind,
        subs: RefCell::new(None),
        meta: RefCell::new(None),
    })
}

/// Build the root of the VFS for the given repository.
pub fn root(repo: Rc<Repository>) -> Rc<Node> {
    new_node(None, repo, "/", MODE_DIR, ObjectId::zero(), NodeKind::Root)
}

impl Node {
    fn rc(&self) -> Rc<Node> {
        self.me.upgrade().expect("node outlived its Rc")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn parent(&self) -> Option<Rc<Node>> {
        self.parent.upgrade()
    }

    pub fn ctime(&self) -> i64 {
        self.ctime.get()
    }

    pub fn mtime(&self) -> i64 {
        self.mtime.get()
    }

    pub fn atime(&self) -> i64 {
        self.atime.get()
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink | NodeKind::FakeSymlink { .. })
    }

    /// Number of hard links. Always one; the repository has no link objects.
    pub fn nlinks(&self) -> u32 {
        1
    }

    /// This node's full path from the top (or from `stop_at`, exclusive).
    pub fn fullname(&self, stop_at: Option<&Rc<Node>>) -> String {
        match self.parent() {
            Some(p) if stop_at.map_or(true, |s| !Rc::ptr_eq(&p, s)) => {
                let base = p.fullname(stop_at);
                if base.ends_with('/') {
                    format!("{base}{}", self.name)
                } else {
                    format!("{base}/{}", self.name)
                }
            }
            _ => self.name.clone(),
        }
    }

    /// The very top of the tree.
    pub fn top(&self) -> Rc<Node> {
        match self.parent() {
            Some(p) => p.top(),
            None => self.rc(),
        }
    }

    /// The top of the backup set this node sits in: the commit's own root
    /// directory, or the VFS root for nodes outside any backup.
    pub fn fs_top(&self) -> Rc<Node> {
        match self.parent() {
            Some(p) if !matches!(p.kind, NodeKind::CommitList { .. }) => p.fs_top(),
            _ => self.rc(),
        }
    }

    fn ensure_subs(&self) -> Result<()> {
        if self.subs.borrow().is_none() {
            let built = self.mksubs()?;
            *self.subs.borrow_mut() = Some(built);
        }
        Ok(())
    }

    /// This node's children, sorted by name.
    pub fn subs(&self) -> Result<Vec<Rc<Node>>> {
        self.ensure_subs()?;
        Ok(self
            .subs
            .borrow()
            .as_ref()
            .unwrap()
            .values()
            .cloned()
            .collect())
    }

    /// The child named `name`.
    pub fn sub(&self, name: &str) -> Result<Rc<Node>> {
        if matches!(
            self.kind,
            NodeKind::File { .. } | NodeKind::Symlink | NodeKind::FakeSymlink { .. }
        ) {
            bail!(Error::NotDir(format!("{} is not a directory", self.name)));
        }
        self.ensure_subs()?;
        self.subs
            .borrow()
            .as_ref()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                anyhow!(Error::NoSuchFile(format!(
                    "no file {:?} in {:?}",
                    name, self.name
                )))
            })
    }

    /// Size in bytes: file content length, symlink target length,
    /// zero for everything else. Cached for files.
    pub fn size(&self) -> Result<u64> {
        match &self.kind {
            NodeKind::File {
                bup_mode,
                cached_size,
            } => {
                if let Some(size) = cached_size.get() {
                    return Ok(size);
                }
                trace!("Calculating size of {}", self.name);
                let size = match bup_mode {
                    BupMode::Chunked => reader::total_size(&self.repo, &self.id)?,
                    BupMode::Normal => reader::join_len(&self.repo, &self.id)?,
                };
                cached_size.set(Some(size));
                Ok(size)
            }
            NodeKind::Symlink | NodeKind::FakeSymlink { .. } => {
                Ok(self.readlink()?.len() as u64)
            }
            _ => Ok(0),
        }
    }

    /// Open the node for reading. Fails with [`Error::NotFile`] on
    /// anything that isn't file-shaped.
    pub fn open(&self) -> Result<FileReader> {
        match &self.kind {
            NodeKind::File { bup_mode, .. } => Ok(FileReader::new(
                self.repo.clone(),
                self.id,
                self.size()?,
                *bup_mode == BupMode::Chunked,
            )),
            // A stored symlink reads like a file whose content is its target.
            NodeKind::Symlink => Ok(FileReader::new(
                self.repo.clone(),
                self.id,
                self.size()?,
                false,
            )),
            _ => bail!(Error::NotFile(format!(
                "{} is not a regular file",
                self.name
            ))),
        }
    }

    /// The path this link points at.
    pub fn readlink(&self) -> Result<String> {
        match &self.kind {
            NodeKind::Symlink => {
                let mut bytes = Vec::new();
                for chunk in self.repo.join(self.id) {
                    bytes.extend(chunk?);
                }
                String::from_utf8(bytes)
                    .with_context(|| format!("Symlink {} target isn't UTF-8", self.name))
            }
            NodeKind::FakeSymlink { target } => Ok(target.clone()),
            _ => bail!(Error::NotFile(format!("{} is not a symlink", self.name))),
        }
    }

    fn dereference_inner(&self) -> Result<Rc<Node>> {
        let target = self.readlink()?;
        let parent = self.parent().ok_or_else(|| {
            anyhow!(Error::NoSuchFile(format!(
                "no parent dir for {}",
                self.name
            )))
        })?;
        match parent.lresolve_in(&target, true) {
            Err(e) if is_no_such_file(&e) => Err(anyhow!(Error::NoSuchFile(format!(
                "{}: broken symlink to {:?}",
                self.fullname(None),
                target
            )))),
            other => other,
        }
    }

    /// The node this link points at, resolved against the link's parent
    /// without leaving the backup set. Counts against the symlink depth
    /// cap; a missing target fails with [`Error::NoSuchFile`].
    pub fn dereference(&self) -> Result<Rc<Node>> {
        let _guard = SymrefGuard::enter(&self.fullname(None))?;
        self.dereference_inner()
    }

    fn lresolve_parts(&self, parts: &[&str]) -> Result<Rc<Node>> {
        if self.is_symlink() {
            // A link anywhere but the end of a finished walk gets chased.
            // The guard stays alive through the continuation so a chain of
            // links counts as hops, not as fresh resolutions.
            let _guard = SymrefGuard::enter(&self.fullname(None))?;
            let target = self.dereference_inner()?;
            return target.lresolve_parts(parts);
        }
        let Some((first, rest)) = parts.split_first() else {
            return Ok(self.rc());
        };
        match *first {
            "." => self.lresolve_parts(rest),
            ".." => match self.parent() {
                Some(p) => p.lresolve_parts(rest),
                None => Err(anyhow!(Error::NoSuchFile(format!(
                    "no parent dir for {}",
                    self.name
                )))),
            },
            name => {
                let child = self.sub(name)?;
                if rest.is_empty() {
                    // The caller asked about the name itself; leave a final
                    // symlink un-dereferenced, like lstat().
                    Ok(child)
                } else {
                    child.lresolve_parts(rest)
                }
            }
        }
    }

    fn lresolve_in(&self, path: &str, stay_inside_fs: bool) -> Result<Rc<Node>> {
        if path.is_empty() {
            return Ok(self.rc());
        }
        let (start, path) = match path.strip_prefix('/') {
            Some(stripped) => {
                let start = if stay_inside_fs {
                    self.fs_top()
                } else {
                    self.top()
                };
                (start, stripped)
            }
            None => (self.rc(), path),
        };
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() || path.ends_with('/') {
            parts.push(".");
        }
        start.lresolve_parts(&parts)
    }

    /// Walk into a given sub-path of this node. If the last element is a
    /// symlink, leave it as a symlink, don't resolve it (like lstat()).
    pub fn lresolve(&self, path: &str) -> Result<Rc<Node>> {
        self.lresolve_in(path, false)
    }

    /// Like [`Node::lresolve`], and dereference the result if it was
    /// a symlink.
    pub fn resolve(&self, path: &str) -> Result<Rc<Node>> {
        self.lresolve(path)?.lresolve(".")
    }

    /// Like [`Node::resolve`], but don't worry if the final link uses an
    /// invalid path; return the unresolved link instead. Errors about
    /// intermediate nodes still propagate.
    pub fn try_resolve(&self, path: &str) -> Result<Rc<Node>> {
        let n = self.lresolve(path)?;
        match n.lresolve(".") {
            Err(e) if is_no_such_file(&e) => Ok(n),
            other => other,
        }
    }

    /// This node's metadata record, if its directory carries one.
    pub fn metadata(&self) -> Result<Option<Metadata>> {
        if matches!(self.kind, NodeKind::Dir { .. }) {
            self.populate_metadata(false)?;
        } else if self.meta.borrow().is_none() {
            if let Some(p) = self.parent() {
                p.populate_metadata(true)?;
            }
        }
        Ok(self.meta.borrow().clone())
    }

    /// Read this directory's metadata stream once and hand each record to
    /// its owner: the first is ours, the rest belong to non-directory
    /// children in sorted order.
    fn populate_metadata(&self, force: bool) -> Result<()> {
        let NodeKind::Dir { metadata_file } = &self.kind else {
            return Ok(());
        };
        if self.meta.borrow().is_some() && !force {
            return Ok(());
        }
        self.ensure_subs()?;
        let bupm = match metadata_file.borrow().clone() {
            Some(bupm) => bupm,
            None => return Ok(()),
        };
        let mut stream = bupm.open()?;
        let dir_meta = Metadata::read(&mut stream)
            .with_context(|| format!("Couldn't read metadata for {}", self.name))?;
        for sub in self.subs()? {
            if !object::is_dir(sub.mode) {
                *sub.meta.borrow_mut() = Some(Metadata::read(&mut stream).with_context(
                    || format!("Couldn't read metadata for {}", sub.name),
                )?);
            }
        }
        *self.meta.borrow_mut() = Some(dir_meta);
        Ok(())
    }

    /// This directory's hidden metadata file, if any.
    pub fn metadata_file(&self) -> Result<Option<Rc<Node>>> {
        match &self.kind {
            NodeKind::Dir { metadata_file } => {
                self.ensure_subs()?;
                Ok(metadata_file.borrow().clone())
            }
            _ => Ok(None),
        }
    }

    /// Drop cached children and metadata. They come back (at a cost) on
    /// the next access.
    pub fn release(&self) {
        *self.meta.borrow_mut() = None;
        *self.subs.borrow_mut() = None;
        if let NodeKind::Dir { metadata_file } = &self.kind {
            *metadata_file.borrow_mut() = None;
        }
    }

    fn mksubs(&self) -> Result<BTreeMap<String, Rc<Node>>> {
        match &self.kind {
            NodeKind::Root => self.subs_of_root(),
            NodeKind::CommitDir => self.subs_of_commit_dir(),
            NodeKind::CommitList { commits } => self.subs_of_commit_list(commits),
            NodeKind::TagDir => self.subs_of_tag_dir(),
            NodeKind::BranchList => self.subs_of_branch_list(),
            NodeKind::Dir { metadata_file } => self.subs_of_dir(metadata_file),
            NodeKind::File { .. } | NodeKind::Symlink | NodeKind::FakeSymlink { .. } => {
                Ok(BTreeMap::new())
            }
        }
    }

    fn subs_of_root(&self) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let mut subs = BTreeMap::new();
        subs.insert(
            String::from(".commit"),
            new_node(
                Some(&me),
                self.repo.clone(),
                ".commit",
                MODE_DIR,
                ObjectId::zero(),
                NodeKind::CommitDir,
            ),
        );
        subs.insert(
            String::from(".tag"),
            new_node(
                Some(&me),
                self.repo.clone(),
                ".tag",
                MODE_DIR,
                ObjectId::zero(),
                NodeKind::TagDir,
            ),
        );

        let heads: Vec<(String, ObjectId)> = self
            .repo
            .list_refs()?
            .into_iter()
            .filter_map(|(name, id)| {
                name.strip_prefix(HEADS_PREFIX).map(|n| (n.to_owned(), id))
            })
            .collect();
        let ids: Vec<ObjectId> = heads.iter().map(|(_, id)| *id).collect();
        let dates = self.repo.get_commit_dates(&ids)?;
        for ((name, id), date) in heads.into_iter().zip(dates) {
            let branch = new_node(
                Some(&me),
                self.repo.clone(),
                &name,
                MODE_DIR,
                id,
                NodeKind::BranchList,
            );
            branch.ctime.set(date);
            branch.mtime.set(date);
            subs.insert(name, branch);
        }
        Ok(subs)
    }

    fn subs_of_commit_dir(&self) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let mut subs: BTreeMap<String, Rc<Node>> = BTreeMap::new();
        for (ref_name, ref_id) in self.repo.list_refs()? {
            let revs = self
                .repo
                .rev_list(ref_id)
                .with_context(|| format!("While listing {ref_name}"))?;
            for (commit, date) in revs {
                let hex = commit.to_string();
                let container = &hex[..2];
                let dirname = hex[2..].to_owned();

                let list = subs.entry(container.to_owned()).or_insert_with(|| {
                    new_node(
                        Some(&me),
                        self.repo.clone(),
                        container,
                        MODE_DIR,
                        ObjectId::zero(),
                        NodeKind::CommitList {
                            commits: RefCell::new(FxHashMap::default()),
                        },
                    )
                });
                let NodeKind::CommitList { commits } = &list.kind else {
                    unreachable!()
                };
                if commits.borrow().contains_key(&dirname) {
                    // Refs share history; the rest of this one is
                    // already present.
                    break;
                }
                commits.borrow_mut().insert(dirname, (commit, date));
            }
        }
        Ok(subs)
    }

    fn subs_of_commit_list(
        &self,
        commits: &RefCell<FxHashMap<String, (ObjectId, i64)>>,
    ) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let mut subs = BTreeMap::new();
        for (name, (id, date)) in commits.borrow().iter() {
            let dir = new_node(
                Some(&me),
                self.repo.clone(),
                name,
                MODE_DIR,
                *id,
                NodeKind::Dir {
                    metadata_file: RefCell::new(None),
                },
            );
            dir.ctime.set(*date);
            dir.mtime.set(*date);
            subs.insert(name.clone(), dir);
        }
        Ok(subs)
    }

    fn subs_of_tag_dir(&self) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let mut subs = BTreeMap::new();
        for (ref_name, id) in self.repo.list_refs()? {
            let Some(name) = ref_name.strip_prefix(TAGS_PREFIX) else {
                continue;
            };
            let date = self.repo.get_commit_dates(&[id])?[0];
            let tag = new_node(
                Some(&me),
                self.repo.clone(),
                name,
                MODE_SYMLINK,
                ObjectId::zero(),
                NodeKind::FakeSymlink {
                    target: commit_target(&id),
                },
            );
            tag.ctime.set(date);
            tag.mtime.set(date);
            subs.insert(name.to_owned(), tag);
        }
        Ok(subs)
    }

    fn subs_of_branch_list(&self) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let mut subs = BTreeMap::new();

        let revs = self.repo.rev_list(self.id)?;
        ensure!(!revs.is_empty(), "Branch {} has no commits", self.name);

        for (commit, date) in &revs {
            let when = Local
                .timestamp_opt(*date, 0)
                .single()
                .with_context(|| format!("Commit {commit} has a nonsense date"))?;
            let link = new_node(
                Some(&me),
                self.repo.clone(),
                &date_name(&when),
                MODE_SYMLINK,
                ObjectId::zero(),
                NodeKind::FakeSymlink {
                    target: commit_target(commit),
                },
            );
            link.ctime.set(*date);
            link.mtime.set(*date);
            subs.insert(link.name.clone(), link);
        }

        let (commit, date) = revs[0];
        let latest = new_node(
            Some(&me),
            self.repo.clone(),
            "latest",
            MODE_SYMLINK,
            ObjectId::zero(),
            NodeKind::FakeSymlink {
                target: commit_target(&commit),
            },
        );
        latest.ctime.set(date);
        latest.mtime.set(date);
        subs.insert(String::from("latest"), latest);
        Ok(subs)
    }

    fn subs_of_dir(
        &self,
        metadata_file: &RefCell<Option<Rc<Node>>>,
    ) -> Result<BTreeMap<String, Rc<Node>>> {
        let me = self.rc();
        let (kind, bytes) = self.repo.cat(&self.id)?;
        let tree_bytes = match kind {
            Kind::Tree => bytes,
            // A commit reads as its root tree.
            Kind::Commit => {
                let commit = object::decode_commit(&bytes)?;
                let (tree_kind, tree_bytes) = self.repo.cat(&commit.tree)?;
                ensure!(
                    tree_kind == Kind::Tree,
                    "Commit {} names {} as its tree, but it's a {}",
                    self.id,
                    commit.tree,
                    tree_kind
                );
                tree_bytes
            }
            Kind::Blob => bail!("{} is a blob, not a directory", self.id),
        };

        let mut subs = BTreeMap::new();
        for entry in object::decode_tree(&tree_bytes)? {
            if entry.name == METADATA_NAME {
                let bup_mode = if object::is_dir(entry.mode) {
                    BupMode::Chunked
                } else {
                    BupMode::Normal
                };
                *metadata_file.borrow_mut() = Some(new_node(
                    Some(&me),
                    self.repo.clone(),
                    METADATA_NAME,
                    MODE_FILE,
                    entry.id,
                    NodeKind::File {
                        bup_mode,
                        cached_size: Cell::new(None),
                    },
                ));
                continue;
            }

            let (name, bup_mode) = object::demangle_name(&entry.name);
            let mode = if bup_mode == BupMode::Chunked {
                // The object is a split tree, but it reads as a file.
                MODE_FILE
            } else {
                entry.mode
            };

            let node = if object::is_dir(mode) {
                new_node(
                    Some(&me),
                    self.repo.clone(),
                    name,
                    mode,
                    entry.id,
                    NodeKind::Dir {
                        metadata_file: RefCell::new(None),
                    },
                )
            } else if object::is_symlink(mode) {
                new_node(
                    Some(&me),
                    self.repo.clone(),
                    name,
                    mode,
                    entry.id,
                    NodeKind::Symlink,
                )
            } else {
                new_node(
                    Some(&me),
                    self.repo.clone(),
                    name,
                    mode,
                    entry.id,
                    NodeKind::File {
                        bup_mode,
                        cached_size: Cell::new(None),
                    },
                )
            };
            subs.insert(name.to_owned(), node);
        }
        Ok(subs)
    }
}

/// The `/.commit/xx/rest` path for a commit, relative to a node one level
/// below the root (a branch or the tag dir).
fn commit_target(id: &ObjectId) -> String {
    let hex = id.to_string();
    format!("../.commit/{}/{}", &hex[..2], &hex[2..])
}

/// Commit-date link names: local time, second granularity.
/// Commits sharing a second collide, and the older one wins.
fn date_name<Tz: TimeZone>(when: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    when.format("%Y-%m-%d-%H%M%S").to_string()
}
