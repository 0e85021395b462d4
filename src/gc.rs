//! Reachability-driven garbage collection over the pack directory.
//!
//! The drill: count objects, build an approximate live set from every ref,
//! clear the derived indexes that would otherwise point at deleted objects,
//! then sweep pack by pack. A pack that's entirely dead is deleted, a pack
//! that's mostly live is kept as-is, and anything in between has its live
//! objects rewritten into fresh packs before the original goes away.
//!
//! A source pack is never deleted before the new pack holding its survivors
//! is durably on disk, so the worst failure mode is leftover garbage, never
//! missing data. Re-running after a partial sweep is safe.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::*;

use crate::bloom::BloomSet;
use crate::pack::{Pack, PackWriter, DEFAULT_TARGET_SIZE};
use crate::repo::{self, Repository, LOGS_DIR};
use crate::walk::walk_object;

/// The repo-level bloom filter, a derived index we clear before sweeping.
pub const REPO_BLOOM_NAME: &str = "burrow.bloom";

const MIDX_EXTENSION: &str = "midx";

#[derive(Debug, Clone)]
pub struct Options {
    /// Rewrite a pack only when at least this percent of it is garbage.
    pub threshold: u32,
    /// zstd level for rewritten packs.
    pub compression: i32,
    pub target_pack_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threshold: 10,
            compression: 1,
            target_pack_size: DEFAULT_TARGET_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    /// Objects in the pack directory before the run.
    pub before: u64,
    /// Objects in the pack directory after the run.
    pub after: u64,
    /// Non-fatal errors accumulated along the way (failed removals, etc.).
    pub errors: usize,
}

type SavedErrors = Rc<RefCell<usize>>;

fn save_error(errors: &SavedErrors, context: &str, e: impl std::fmt::Display) {
    warn!("gc: {context}: {e}");
    *errors.borrow_mut() += 1;
}

/// Total object count across every pack index in the directory.
pub fn count_objects(pack_dir: &Utf8Path) -> Result<u64> {
    let mut count = 0;
    for idx_path in repo::list_idx_files(pack_dir)? {
        count += crate::index::PackIndex::load(&idx_path)?.len() as u64;
    }
    Ok(count)
}

/// The live set plus the temp file it lives in.
/// Dropping it unlinks the file, whatever else happened.
struct ScopedBloom {
    set: BloomSet,
    path: Utf8PathBuf,
}

impl Drop for ScopedBloom {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("gc: couldn't remove {}: {e}", self.path);
        }
    }
}

/// Build a bloom set holding every object reachable from any ref.
///
/// `existing_count` (the total across all packs) bounds the number of
/// distinct live objects, so a set sized for it keeps the false-positive
/// rate low. The cost of a false positive is retaining a dead object,
/// never losing a live one.
fn find_live_objects(repo: &Repository, existing_count: u64) -> Result<ScopedBloom> {
    let temp = tempfile::Builder::new()
        .prefix("tmp-gc-")
        .suffix(".bloom")
        .tempfile_in(repo.pack_dir())
        .context("Couldn't create temporary bloom filter")?;
    let path = Utf8PathBuf::from_path_buf(temp.into_temp_path().keep()?)
        .map_err(|p| anyhow::anyhow!("Bloom path {} isn't UTF-8", p.display()))?;

    let mut live = ScopedBloom {
        set: BloomSet::create(&path, existing_count)?,
        path,
    };
    for (ref_name, ref_id) in repo.list_refs()? {
        debug!("gc: walking {ref_name}");
        for item in walk_object(repo, ref_id) {
            let (id, _kind) = item.with_context(|| format!("While walking {ref_name}"))?;
            live.set.add(&id);
        }
    }
    info!(
        "gc: expecting to retain about {:.2}% unnecessary objects",
        live.set.pfalse_positive()
    );
    Ok(live)
}

/// Remove every multi-pack index and the repo-level bloom filter.
/// They'd point at objects the sweep is about to delete.
fn clear_derived_indexes(pack_dir: &Utf8Path, errors: &SavedErrors) {
    let entries = match fs::read_dir(pack_dir) {
        Ok(entries) => entries,
        Err(e) => {
            save_error(errors, "couldn't list pack directory", e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(MIDX_EXTENSION) {
            if let Err(e) = fs::remove_file(&path) {
                save_error(errors, "couldn't remove midx", e);
            }
        }
    }
    let bloom = pack_dir.join(REPO_BLOOM_NAME);
    if bloom.exists() {
        if let Err(e) = fs::remove_file(&bloom) {
            save_error(errors, "couldn't remove bloom filter", e);
        }
    }
}

/// Drop the reflog so unreachable commits can't be revived from it.
fn expire_reflog(repo_dir: &Utf8Path, errors: &SavedErrors) {
    let logs = repo_dir.join(LOGS_DIR);
    let entries = match fs::read_dir(&logs) {
        Ok(entries) => entries,
        Err(e) => {
            save_error(errors, "couldn't list reflog", e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            save_error(errors, "couldn't expire reflog", e);
        }
    }
}

/// Traverse all the packs, preserving the (probably) live data.
fn sweep(
    repo: &Repository,
    live: &BloomSet,
    existing_count: u64,
    opts: &Options,
    errors: SavedErrors,
) -> Result<()> {
    let pack_dir = repo.pack_dir();

    let stale_files: Rc<RefCell<Vec<Utf8PathBuf>>> = Rc::new(RefCell::new(Vec::new()));
    let remove_stale_files = {
        let stale_files = stale_files.clone();
        let errors = errors.clone();
        move |new_pack: Option<&Utf8Path>| -> Result<()> {
            if let Some(p) = new_pack {
                info!("gc: created {}", p.file_name().unwrap_or(p.as_str()));
            }
            for p in stale_files.borrow_mut().drain(..) {
                info!("gc: removing {}", p.file_name().unwrap_or(p.as_str()));
                if let Err(e) = fs::remove_file(&p) {
                    save_error(&errors, "couldn't remove stale file", e);
                }
            }
            Ok(())
        }
    };

    let mut writer = PackWriter::new(
        &pack_dir,
        opts.compression,
        opts.target_pack_size,
        Box::new(remove_stale_files.clone()),
    );

    let mut collect_count: u64 = 0;
    for idx_path in repo::list_idx_files(&pack_dir)? {
        let pack = Pack::open(&idx_path)?;
        let n = pack.index.len() as u64;
        let live_count = pack
            .index
            .entries()
            .iter()
            .filter(|e| live.contains(&e.id))
            .count() as u64;
        collect_count += live_count;

        let pack_path = crate::index::pack_path(&idx_path);
        let name = idx_path.file_name().unwrap_or(idx_path.as_str());

        if live_count == 0 {
            info!("gc: deleting {name}");
            stale_files.borrow_mut().push(idx_path);
            stale_files.borrow_mut().push(pack_path);
            continue;
        }

        // Keep the pack untouched unless at least `threshold` percent
        // of it is garbage.
        if live_count * 100 > (100 - opts.threshold as u64) * n {
            info!("gc: keeping {name} ({}% live)", live_count * 100 / n);
            continue;
        }

        info!(
            "gc: rewriting {name} ({:.2}% live)",
            live_count as f64 / n as f64 * 100.0
        );
        for entry in pack.index.entries() {
            if live.contains(&entry.id) {
                let bytes = pack.read(entry)?;
                writer.write(&entry.id, entry.kind, &bytes)?;
            }
        }
        stale_files.borrow_mut().push(idx_path);
        stale_files.borrow_mut().push(pack_path);
    }

    debug!("gc: preserved {collect_count} of {existing_count} objects");

    // Nothing should have recreated the derived indexes mid-sweep.
    ensure!(
        !pack_dir.join(REPO_BLOOM_NAME).exists(),
        "Bloom filter reappeared during sweep"
    );
    ensure!(
        !fs::read_dir(&pack_dir)?.flatten().any(|e| {
            e.path().extension().and_then(|x| x.to_str()) == Some(MIDX_EXTENSION)
        }),
        "Multi-pack index reappeared during sweep"
    );

    writer.close()?;
    // In case nothing was written, sweep the remaining stale files ourselves.
    remove_stale_files(None)
}

/// Run a full collection against the given repository.
pub fn run(repo_dir: &Utf8Path, opts: &Options) -> Result<Stats> {
    ensure!(
        opts.threshold <= 100,
        "threshold must be an integer percentage value"
    );

    let repo = Repository::open(repo_dir)?;
    let pack_dir = repo.pack_dir();

    let existing_count = count_objects(&pack_dir)?;
    info!("gc: found {existing_count} objects");
    if existing_count == 0 {
        info!("gc: nothing to collect");
        return Ok(Stats::default());
    }

    let errors: SavedErrors = Rc::new(RefCell::new(0));
    let live = find_live_objects(&repo, existing_count)?;

    info!("gc: clearing midx files and bloom filter");
    clear_derived_indexes(&pack_dir, &errors);
    info!("gc: clearing reflog");
    expire_reflog(repo.dir(), &errors);
    info!("gc: removing unreachable data");
    sweep(&repo, &live.set, existing_count, opts, errors.clone())?;

    let after = count_objects(&pack_dir)?;
    info!(
        "gc: discarded {:.0}% of objects",
        (existing_count - after) as f64 / existing_count as f64 * 100.0
    );

    let errors = *errors.borrow();
    if errors > 0 {
        warn!("gc: {errors} errors encountered");
    }
    Ok(Stats {
        before: existing_count,
        after,
        errors,
    })
}
