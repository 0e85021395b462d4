//! A fixed-capacity bloom filter over object IDs, stored on disk.
//!
//! The bit array is memory-mapped, so a set sized for millions of objects
//! costs no more RAM than the pages we actually touch. Object IDs are
//! already cryptographic hashes, so the k probe positions are just windows
//! of the ID itself masked down to the (power-of-two) bit count.
//!
//! False positives happen at the advertised rate; false negatives never do.

use std::fs::OpenOptions;

use anyhow::{ensure, Context, Result};
use camino::Utf8Path;
use log::*;
use memmap2::MmapMut;

use crate::hashing::ObjectId;

const MAGIC_BYTES: &[u8] = b"BRWBLOOM";

// magic(8) + k(1) + log2 bits(1) + pad(2) + entry count(4)
const HEADER_LEN: usize = 16;

/// Bits allotted per expected object when sizing a new set.
const BITS_PER_OBJECT: u64 = 10;

const MIN_LOG2_BITS: u32 = 12;
const MAX_LOG2_BITS: u32 = 32;

/// Where the ID windows for each probe start. IDs are 20 bytes, so probes
/// past the fifth reuse shifted windows.
const PROBE_OFFSETS: [usize; 8] = [0, 4, 8, 12, 16, 2, 6, 10];

pub struct BloomSet {
    map: MmapMut,
    k: u32,
    bit_mask: u64,
    entries: u32,
}

impl BloomSet {
    /// Create a set at `path` sized for `expected` distinct IDs,
    /// picking the bit count and probe count automatically.
    pub fn create(path: &Utf8Path, expected: u64) -> Result<Self> {
        let expected = expected.max(1);
        let log2_bits = (expected * BITS_PER_OBJECT)
            .next_power_of_two()
            .trailing_zeros()
            .clamp(MIN_LOG2_BITS, MAX_LOG2_BITS);
        let nbits = 1u64 << log2_bits;
        let k = ((nbits as f64 / expected as f64) * std::f64::consts::LN_2).round() as u32;
        let k = k.clamp(1, PROBE_OFFSETS.len() as u32);
        debug!("Creating bloom filter {path}: 2^{log2_bits} bits, k={k}");

        let fh = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Couldn't create bloom filter {path}"))?;
        fh.set_len(HEADER_LEN as u64 + nbits / 8)?;
        let mut map = unsafe { MmapMut::map_mut(&fh)? };
        map[..8].copy_from_slice(MAGIC_BYTES);
        map[8] = k as u8;
        map[9] = log2_bits as u8;

        Ok(Self {
            map,
            k,
            bit_mask: nbits - 1,
            entries: 0,
        })
    }

    /// Open an existing set.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let fh = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Couldn't open bloom filter {path}"))?;
        let map = unsafe { MmapMut::map_mut(&fh)? };
        ensure!(
            map.len() >= HEADER_LEN && &map[..8] == MAGIC_BYTES,
            "Wrong magic bytes for bloom filter {path}"
        );
        let k = map[8] as u32;
        let log2_bits = map[9] as u32;
        ensure!(
            k >= 1 && k <= PROBE_OFFSETS.len() as u32 && log2_bits <= MAX_LOG2_BITS,
            "Implausible bloom filter header in {path}"
        );
        let nbits = 1u64 << log2_bits;
        ensure!(
            map.len() as u64 == HEADER_LEN as u64 + nbits / 8,
            "Bloom filter {path} is the wrong size for its header"
        );
        let entries = u32::from_be_bytes(map[12..16].try_into().unwrap());
        Ok(Self {
            map,
            k,
            bit_mask: nbits - 1,
            entries,
        })
    }

    fn probes(&self, id: &ObjectId) -> impl Iterator<Item = u64> + '_ {
        let bytes: [u8; 20] = id.as_bytes().try_into().expect("IDs are 20 bytes");
        (0..self.k as usize).map(move |i| {
            let o = PROBE_OFFSETS[i];
            let window = u32::from_be_bytes(bytes[o..o + 4].try_into().unwrap());
            window as u64 & self.bit_mask
        })
    }

    /// Add an ID. Idempotent.
    pub fn add(&mut self, id: &ObjectId) {
        let mut all_set = true;
        let probes: Vec<u64> = self.probes(id).collect();
        for bit in probes {
            let byte = HEADER_LEN + (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            all_set &= self.map[byte] & mask != 0;
            self.map[byte] |= mask;
        }
        if !all_set {
            self.entries += 1;
        }
    }

    /// Check membership: false positives at the advertised rate,
    /// never false negatives.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.probes(id).all(|bit| {
            let byte = HEADER_LEN + (bit / 8) as usize;
            self.map[byte] & (1u8 << (bit % 8)) != 0
        })
    }

    /// Estimated false-positive rate, as a percentage.
    pub fn pfalse_positive(&self) -> f64 {
        let n = self.entries as f64;
        let m = (self.bit_mask + 1) as f64;
        let k = self.k as f64;
        (1.0 - (-k * n / m).exp()).powf(k) * 100.0
    }

    /// Flush the set to disk and close it.
    pub fn close(mut self) -> Result<()> {
        let entries = self.entries;
        self.map[12..16].copy_from_slice(&entries.to_be_bytes());
        self.map.flush().context("Couldn't flush bloom filter")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use camino::Utf8PathBuf;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn bloom_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8Path::from_path(dir.path())
            .expect("temp dir isn't UTF-8")
            .join("test.bloom")
    }

    #[test]
    fn no_false_negatives() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let path = bloom_path(&dir);
        let mut set = BloomSet::create(&path, 1000)?;

        let ids: Vec<ObjectId> = (0..1000u32)
            .map(|i| ObjectId::hash(&i.to_be_bytes()))
            .collect();
        for id in &ids {
            set.add(id);
        }
        for id in &ids {
            assert!(set.contains(id));
        }
        Ok(())
    }

    #[test]
    fn mostly_excludes_strangers() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let path = bloom_path(&dir);
        let mut set = BloomSet::create(&path, 1000)?;
        for i in 0..1000u32 {
            set.add(&ObjectId::hash(&i.to_be_bytes()));
        }

        let false_positives = (1000..11000u32)
            .filter(|i| set.contains(&ObjectId::hash(&i.to_be_bytes())))
            .count();
        // Sized at ten bits per entry, the advertised rate is well under 1%.
        assert!(set.pfalse_positive() < 1.0);
        assert!(
            false_positives < 200,
            "{false_positives} false positives out of 10000"
        );
        Ok(())
    }

    #[test]
    fn survives_reopen() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let path = bloom_path(&dir);

        let mut set = BloomSet::create(&path, 10)?;
        let id = ObjectId::hash(b"hello");
        set.add(&id);
        let p = set.pfalse_positive();
        assert!(p > 0.0);
        set.close()?;

        let reopened = BloomSet::open(&path)?;
        assert!(reopened.contains(&id));
        assert!(!reopened.contains(&ObjectId::hash(b"goodbye")));
        assert_eq!(reopened.pfalse_positive(), p);
        Ok(())
    }

    #[test]
    fn add_is_idempotent() -> Result<()> {
        init();

        let dir = tempfile::tempdir()?;
        let path = bloom_path(&dir);
        let mut set = BloomSet::create(&path, 10)?;
        let id = ObjectId::hash(b"hello");
        set.add(&id);
        let p = set.pfalse_positive();
        set.add(&id);
        assert_eq!(set.pfalse_positive(), p);
        Ok(())
    }
}
