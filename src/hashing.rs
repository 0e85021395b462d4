//! Tools for hashing everything we care about into a unique [`ObjectId`]

use std::fmt;

use anyhow::{ensure, Context, Result};
use sha1::{digest::Output, Digest, Sha1};

type Sha1Digest = Output<Sha1>;

/// The length of an [`ObjectId`] in bytes.
pub const ID_LEN: usize = 20;

/// The hash (a SHA-1) used to identify all objects in our system.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: Sha1Digest,
}

impl ObjectId {
    /// Calculates an ID from the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha1::digest(bytes),
        }
    }

    fn from_digest(digest: Sha1Digest) -> Self {
        Self { digest }
    }

    /// The all-zeroes ID, used for synthetic nodes that don't correspond
    /// to a stored object.
    pub fn zero() -> Self {
        Self {
            digest: Sha1Digest::default(),
        }
    }

    /// Builds an ID from its raw 20-byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == ID_LEN,
            "Expected a {}-byte object ID, got {} bytes",
            ID_LEN,
            bytes.len()
        );
        Ok(Self::from_digest(*Sha1Digest::from_slice(bytes)))
    }

    /// The raw 20-byte form, as stored in trees, indexes, and bloom filters.
    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// Gets a git-like shortened version of the hash that's unique enough
    /// for most UI uses.
    pub fn short_name(&self) -> String {
        let mut full = format!("{}", self);
        let _rest = full.split_off(8);
        full
    }
}

/// Hashes an object the way git does: a `<kind> <length>\0` header,
/// then the object's bytes.
pub fn hash_object(kind: &str, bytes: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, bytes.len()).as_bytes());
    hasher.update(bytes);
    ObjectId::from_digest(hasher.finalize())
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", hex::encode(self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as hex"))?;
        Self::from_bytes(&bytes)
    }
}
