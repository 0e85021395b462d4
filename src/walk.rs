//! Walk every object reachable from a root hash.
//!
//! The walk is lazy and finite, but does *not* deduplicate: an object
//! referenced from several places is yielded once per reference. Callers
//! that care collect into a set; the GC bloom filter dedupes implicitly.

use anyhow::{Context, Result};

use crate::hashing::ObjectId;
use crate::object::{self, Kind};
use crate::repo::Repository;

/// A predicate that stops traversal at matching objects
/// (they are neither yielded nor descended into).
pub type StopAt<'a> = Box<dyn Fn(&ObjectId) -> bool + 'a>;

pub struct ObjectWalker<'a> {
    repo: &'a Repository,
    pending: Vec<ObjectId>,
    stop_at: Option<StopAt<'a>>,
}

/// Start a walk from the given commit or tree.
pub fn walk_object(repo: &Repository, root: ObjectId) -> ObjectWalker<'_> {
    ObjectWalker {
        repo,
        pending: vec![root],
        stop_at: None,
    }
}

impl<'a> ObjectWalker<'a> {
    pub fn with_stop_at(mut self, stop_at: StopAt<'a>) -> Self {
        self.stop_at = Some(stop_at);
        self
    }

    fn step(&mut self) -> Result<Option<(ObjectId, Kind)>> {
        loop {
            let id = match self.pending.pop() {
                Some(id) => id,
                None => return Ok(None),
            };
            if let Some(stop) = &self.stop_at {
                if stop(&id) {
                    continue;
                }
            }
            let (kind, bytes) = self
                .repo
                .cat(&id)
                .with_context(|| format!("Couldn't walk object {id}"))?;
            match kind {
                Kind::Commit => {
                    let commit = object::decode_commit(&bytes)
                        .with_context(|| format!("Couldn't parse commit {id}"))?;
                    self.pending.push(commit.tree);
                    self.pending.extend(commit.parents);
                }
                Kind::Tree => {
                    let entries = object::decode_tree(&bytes)
                        .with_context(|| format!("Couldn't parse tree {id}"))?;
                    self.pending.extend(entries.iter().map(|e| e.id));
                }
                Kind::Blob => {}
            }
            return Ok(Some((id, kind)));
        }
    }
}

impl Iterator for ObjectWalker<'_> {
    type Item = Result<(ObjectId, Kind)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}
