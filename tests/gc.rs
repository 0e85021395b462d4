use std::collections::HashSet;

use anyhow::Result;
use camino::Utf8Path;
use tempfile::tempdir;

mod common;

use common::*;

use burrow::gc;
use burrow::hashing::ObjectId;
use burrow::object::TreeEntry;
use burrow::repo::Repository;
use burrow::walk::walk_object;

fn pack_files(dir: &Utf8Path) -> HashSet<String> {
    files_in(&dir.join("objects/pack"))
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".pack") || name.ends_with(".idx"))
        .collect()
}

/// One pack holding exactly ten objects, nine of them reachable:
/// a commit, its tree, and seven blobs, plus one dead blob.
fn boundary_repo(dir: &Utf8Path) -> Result<(Vec<ObjectId>, ObjectId)> {
    let mut b = RepoBuilder::new();
    let blobs: Vec<ObjectId> = (0..7)
        .map(|i| b.blob(format!("file contents {i}").as_bytes()))
        .collect();
    let entries: Vec<TreeEntry> = blobs
        .iter()
        .enumerate()
        .map(|(i, id)| file_entry(&format!("file{i}.txt"), *id))
        .collect();
    let tree = b.tree(&entries)?;
    let commit = b.commit(tree, &[], 1700000000);
    let dead = b.blob(b"nobody references this");
    b.branch("main", commit);
    b.build(dir)?;

    let mut live = blobs;
    live.push(tree);
    live.push(commit);
    Ok((live, dead))
}

fn gc_options(threshold: u32) -> gc::Options {
    gc::Options {
        threshold,
        ..Default::default()
    }
}

#[test]
fn threshold_boundary_keeps() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);
    let (live, dead) = boundary_repo(&dir)?;

    // 90% live, threshold 11: not enough garbage to bother.
    let before = pack_files(&dir);
    let stats = gc::run(&dir, &gc_options(11))?;
    assert_eq!(stats.before, 10);
    assert_eq!(stats.after, 10);
    assert_eq!(stats.errors, 0);
    assert_eq!(pack_files(&dir), before);

    // The dead blob is still around, bit-identical pack and all.
    let repo = Repository::open(&dir)?;
    repo.cat(&dead)?;
    for id in &live {
        repo.cat(id)?;
    }
    Ok(())
}

#[test]
fn threshold_boundary_rewrites() -> Result<()> {
    // 90% live: thresholds 10 and 9 both trigger a rewrite
    // (the pack must be *more* than (100 - threshold)% live to survive).
    for threshold in [10, 9] {
        let dir = tempdir()?;
        let dir = utf8_dir(&dir);
        let (live, dead) = boundary_repo(&dir)?;

        let before = pack_files(&dir);
        let stats = gc::run(&dir, &gc_options(threshold))?;
        assert_eq!(stats.before, 10);
        assert_eq!(stats.after, 9);
        assert_eq!(stats.errors, 0);
        assert_ne!(pack_files(&dir), before);

        let repo = Repository::open(&dir)?;
        for id in &live {
            repo.cat(id)?;
        }
        assert!(repo.cat(&dead).is_err());
    }
    Ok(())
}

#[test]
fn all_dead_pack_is_deleted() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);

    let mut b = RepoBuilder::new();
    let hello = b.blob(b"hello");
    let goodbye = b.blob(b"goodbye");
    let tree = b.tree(&[file_entry("hello.txt", hello), file_entry("goodbye.txt", goodbye)])?;
    let commit = b.commit(tree, &[], 1700000000);
    b.branch("main", commit);
    // A second pack nothing references at all.
    b.new_pack();
    let dead: Vec<ObjectId> = (0..5u8).map(|i| b.blob(&[i; 64])).collect();
    b.build(&dir)?;

    let before = pack_files(&dir);
    assert_eq!(before.len(), 4); // two packs, two indexes

    let stats = gc::run(&dir, &gc_options(10))?;
    assert_eq!(stats.before, 9);
    assert_eq!(stats.after, 4);
    assert_eq!(stats.errors, 0);

    // The live pack survives untouched; the dead pack and its index
    // are gone, and no rewritten pack appeared in their place.
    let after = pack_files(&dir);
    assert_eq!(after.len(), 2);
    assert!(after.is_subset(&before));

    let repo = Repository::open(&dir)?;
    for id in [hello, goodbye, tree, commit] {
        repo.cat(&id)?;
    }
    for id in &dead {
        assert!(repo.cat(id).is_err());
    }
    Ok(())
}

#[test]
fn empty_repo_collects_nothing() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);

    cli_run(&dir)?.arg("init").assert().success();

    let run = cli_run(&dir)?.arg("gc").assert().success();
    let output = std::str::from_utf8(&run.get_output().stderr).unwrap();
    assert!(output.contains("nothing to collect"));
    Ok(())
}

#[test]
fn preserves_reachable_and_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);

    let mut b = RepoBuilder::new();
    let readme = b.blob(b"# backups\n");
    let chunked = b.chunked(&[&pattern_bytes(4096, 1), &pattern_bytes(4096, 2)])?;
    let tree1 = b.tree(&[file_entry("README.md", readme), chunked_entry("big.dat", chunked)])?;
    let c1 = b.commit(tree1, &[], 1700000000);
    let extra = b.blob(b"second revision\n");
    let tree2 = b.tree(&[
        file_entry("README.md", readme),
        file_entry("notes.txt", extra),
        chunked_entry("big.dat", chunked),
    ])?;
    let c2 = b.commit(tree2, &[c1], 1700003600);
    b.branch("main", c2);
    b.tag("v1", c1);
    // Some garbage from an abandoned backup.
    b.new_pack();
    b.blob(b"orphaned chunk");
    let repo = b.build(&dir)?;

    // Everything reachable before the collection...
    let mut reachable = HashSet::new();
    for (_name, ref_id) in repo.list_refs()? {
        for item in walk_object(&repo, ref_id) {
            reachable.insert(item?.0);
        }
    }
    assert!(!reachable.is_empty());

    let first = gc::run(&dir, &gc_options(10))?;
    assert_eq!(first.errors, 0);
    assert!(first.after <= first.before);

    // ...is still retrievable afterwards.
    let repo = Repository::open(&dir)?;
    for id in &reachable {
        repo.cat(id)?;
    }

    // A second run with no writes in between deletes and rewrites nothing.
    let files = pack_files(&dir);
    let second = gc::run(&dir, &gc_options(10))?;
    assert_eq!(second.before, first.after);
    assert_eq!(second.after, second.before);
    assert_eq!(pack_files(&dir), files);
    Ok(())
}

#[test]
fn clears_derived_indexes_and_reflog() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);

    let mut b = RepoBuilder::new();
    let blob = b.blob(b"contents");
    let tree = b.tree(&[file_entry("file.txt", blob)])?;
    let commit = b.commit(tree, &[], 1700000000);
    b.branch("main", commit);
    b.build(&dir)?;

    // Plant stale derived indexes.
    let pack_dir = dir.join("objects/pack");
    std::fs::write(pack_dir.join("burrow.bloom"), b"stale")?;
    std::fs::write(pack_dir.join("aaaa.midx"), b"stale")?;
    // update_ref left a reflog behind.
    assert!(dir.join("logs/refs/heads/main").exists());

    let stats = gc::run(&dir, &gc_options(10))?;
    assert_eq!(stats.errors, 0);

    assert!(!pack_dir.join("burrow.bloom").exists());
    assert!(!pack_dir.join("aaaa.midx").exists());
    assert!(!dir.join("logs/refs/heads/main").exists());
    // No temp bloom left behind either.
    assert!(!std::fs::read_dir(&pack_dir)?.flatten().any(|e| {
        e.file_name().to_string_lossy().ends_with(".bloom")
    }));
    Ok(())
}

#[test]
fn gc_from_the_command_line() -> Result<()> {
    let dir = tempdir()?;
    let dir = utf8_dir(&dir);

    let mut b = RepoBuilder::new();
    let blob = b.blob(b"some file");
    let tree = b.tree(&[file_entry("file.txt", blob)])?;
    let commit = b.commit(tree, &[], 1700000000);
    b.branch("main", commit);
    b.new_pack();
    b.blob(b"garbage");
    b.build(&dir)?;

    let run = cli_run(&dir)?
        .args(["gc", "--threshold", "10", "--compress", "3"])
        .assert()
        .success();
    let output = std::str::from_utf8(&run.get_output().stderr).unwrap();
    assert!(output.contains("discarded"));

    // Out-of-range arguments are refused.
    cli_run(&dir)?
        .args(["gc", "--threshold", "101"])
        .assert()
        .failure();
    cli_run(&dir)?
        .args(["gc", "--compress", "10"])
        .assert()
        .failure();
    Ok(())
}
