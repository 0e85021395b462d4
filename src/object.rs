//! The git-style object model: kinds, tree and commit codecs, name mangling.
//!
//! Everything in the repository is one of three kinds of object, addressed
//! by the hash of its serialized form. Trees use git's binary entry format;
//! commits are the usual text format. On top of that sits the name-mangling
//! scheme that lets a chunked file masquerade as a tree without colliding
//! with real file names.

use std::fmt;

use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::hashing::{self, ObjectId, ID_LEN};

/// What an object is: the repository stores nothing else.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kind {
    Commit,
    Tree,
    Blob,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Commit => "commit",
            Kind::Tree => "tree",
            Kind::Blob => "blob",
        }
    }

    /// Single-byte form used in pack records and indexes.
    pub fn to_wire(self) -> u8 {
        match self {
            Kind::Commit => 0,
            Kind::Tree => 1,
            Kind::Blob => 2,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Kind::Commit),
            1 => Ok(Kind::Tree),
            2 => Ok(Kind::Blob),
            other => bail!("Unknown object kind {}", other),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hashes an object's bytes into its ID, header included.
pub fn id_of(kind: Kind, bytes: &[u8]) -> ObjectId {
    hashing::hash_object(kind.as_str(), bytes)
}

// Tree entry modes, straight out of `man inode`.
pub const MODE_DIR: u32 = 0o40000;
pub const MODE_FILE: u32 = 0o100644;
pub const MODE_SYMLINK: u32 = 0o120000;

const MODE_TYPE_MASK: u32 = 0o170000;

pub fn is_dir(mode: u32) -> bool {
    mode & MODE_TYPE_MASK == MODE_DIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & MODE_TYPE_MASK == MODE_SYMLINK
}

/// One `(mode, name, hash)` row of a tree object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub id: ObjectId,
}

/// Serialize tree entries into git's binary format,
/// sorting them by name first.
pub fn encode_tree(entries: &[TreeEntry]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = Vec::new();
    for entry in sorted {
        ensure!(
            !entry.name.is_empty() && !entry.name.contains(['/', '\0']),
            "Invalid tree entry name {:?}",
            entry.name
        );
        out.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
        out.extend_from_slice(entry.id.as_bytes());
    }
    Ok(out)
}

/// Decode a tree object's bytes into its entries, in stored (name) order.
pub fn decode_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| anyhow!("Tree entry missing mode delimiter"))?;
        let mode = u32::from_str_radix(
            std::str::from_utf8(&rest[..space]).context("Tree entry mode isn't UTF-8")?,
            8,
        )
        .context("Tree entry mode isn't octal")?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == b'\0')
            .ok_or_else(|| anyhow!("Tree entry missing name delimiter"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .context("Tree entry name isn't UTF-8")?
            .to_owned();
        rest = &rest[nul + 1..];

        ensure!(rest.len() >= ID_LEN, "Tree entry truncated after {:?}", name);
        let id = ObjectId::from_bytes(&rest[..ID_LEN])?;
        rest = &rest[ID_LEN..];

        entries.push(TreeEntry { mode, name, id });
    }
    Ok(entries)
}

/// How a tree entry's content is stored: a plain blob,
/// or a split tree of chunks for files too big for one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BupMode {
    Normal,
    Chunked,
}

/// The directory-metadata sentinel; never exposed as a child.
pub const METADATA_NAME: &str = ".bupm";

/// Mangle a name for storage: chunked files get a `.bup` suffix
/// (their object is really a tree), and names that would demangle
/// by accident get a `.bupl` escape.
pub fn mangle_name(name: &str, bup_mode: BupMode) -> String {
    match bup_mode {
        BupMode::Chunked => format!("{name}.bup"),
        BupMode::Normal if name.ends_with(".bup") || name.ends_with(".bupl") => {
            format!("{name}.bupl")
        }
        BupMode::Normal => name.to_owned(),
    }
}

/// Undo [`mangle_name`], yielding the display name and how the entry
/// is stored.
pub fn demangle_name(mangled: &str) -> (&str, BupMode) {
    if let Some(name) = mangled.strip_suffix(".bupl") {
        (name, BupMode::Normal)
    } else if let Some(name) = mangled.strip_suffix(".bup") {
        (name, BupMode::Chunked)
    } else {
        (mangled, BupMode::Normal)
    }
}

/// A parsed commit: the bits we care about, anyway.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: String,
    /// Author time, seconds since the epoch.
    pub author_time: i64,
    pub message: String,
}

/// Serialize a commit into its text format.
pub fn encode_commit(commit: &Commit) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("tree {}\n", commit.tree));
    for parent in &commit.parents {
        out.push_str(&format!("parent {}\n", parent));
    }
    out.push_str(&format!(
        "author {} {} +0000\n\n{}",
        commit.author, commit.author_time, commit.message
    ));
    out.into_bytes()
}

/// Parse a commit object's bytes.
pub fn decode_commit(bytes: &[u8]) -> Result<Commit> {
    let text = std::str::from_utf8(bytes).context("Commit isn't UTF-8")?;
    let (header, message) = text
        .split_once("\n\n")
        .ok_or_else(|| anyhow!("Commit missing header/message separator"))?;

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut author_time = None;

    for line in header.lines() {
        if let Some(hex) = line.strip_prefix("tree ") {
            tree = Some(hex.parse().context("Bad tree line in commit")?);
        } else if let Some(hex) = line.strip_prefix("parent ") {
            parents.push(hex.parse().context("Bad parent line in commit")?);
        } else if let Some(rest) = line.strip_prefix("author ") {
            // `<name> <epoch> <tz>`; split the timestamp off the end.
            let mut fields = rest.rsplitn(3, ' ');
            let _tz = fields.next();
            let epoch = fields
                .next()
                .ok_or_else(|| anyhow!("Author line missing timestamp"))?;
            author_time = Some(
                epoch
                    .parse::<i64>()
                    .with_context(|| format!("Bad author timestamp {:?}", epoch))?,
            );
            author = Some(fields.next().unwrap_or("").to_owned());
        }
    }

    Ok(Commit {
        tree: tree.ok_or_else(|| anyhow!("Commit missing tree line"))?,
        parents,
        author: author.ok_or_else(|| anyhow!("Commit missing author line"))?,
        author_time: author_time.ok_or_else(|| anyhow!("Commit missing author time"))?,
        message: message.to_owned(),
    })
}
