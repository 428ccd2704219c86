//! Bloom filter sidecar for fast negative lookups.
//!
//! Every SSTable carries a bloom filter over its keys. A point read probes
//! the filter before touching the data file: "definitely absent" answers
//! skip the mmap scan entirely, "maybe present" answers fall through to the
//! sparse index. Sized for a 1% false-positive rate.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Target false-positive rate for SSTable filters.
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Safety cap when deserializing; a filter this large is corruption.
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// A bit-vector bloom filter with `k` hash functions derived by double
/// hashing: `h(i) = h1 + i * h2`, both FNV-1a with different seeds.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = (expected_items.max(1)) as f64;

        // Optimal bit count: m = -n * ln(p) / ln(2)^2
        let m = (-n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);

        // Optimal hash count: k = (m/n) * ln(2)
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);

        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means the key is definitely absent; `true` means it may be
    /// present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            if self.bits[(idx / 8) as usize] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Sidecar layout (big-endian):
    /// `num_bits:u64 | num_hashes:u32 | bits_len:u32 | bits`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.num_bits)?;
        writer.write_u32::<BigEndian>(self.num_hashes)?;
        writer.write_u32::<BigEndian>(self.bits.len() as u32)?;
        writer.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let num_bits = reader.read_u64::<BigEndian>()?;
        let num_hashes = reader.read_u32::<BigEndian>()?;
        let bits_len = reader.read_u32::<BigEndian>()? as usize;

        if num_bits == 0 || num_hashes == 0 || bits_len > MAX_BLOOM_BYTES {
            return Err(Error::Corruption(format!(
                "implausible bloom filter header: bits={num_bits} hashes={num_hashes} bytes={bits_len}"
            )));
        }

        let mut bits = vec![0u8; bits_len];
        reader.read_exact(&mut bits)?;

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn bit_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf29ce484222325),
        fnv1a_64(key, 0x517cc1b727220a95),
    )
}

/// FNV-1a 64-bit hash with a configurable basis.
fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_found() {
        let mut filter = BloomFilter::new(100, BLOOM_FALSE_POSITIVE_RATE);
        for i in 0..100 {
            filter.insert(format!("key_{i}").as_bytes());
        }
        for i in 0..100 {
            assert!(filter.may_contain(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let mut filter = BloomFilter::new(1000, BLOOM_FALSE_POSITIVE_RATE);
        for i in 0..1000 {
            filter.insert(format!("member_{i}").as_bytes());
        }

        let false_positives = (0..10_000)
            .filter(|i| filter.may_contain(format!("absent_{i}").as_bytes()))
            .count();

        // 1% target; allow generous slack to keep the test deterministic.
        assert!(
            false_positives < 300,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut filter = BloomFilter::new(50, BLOOM_FALSE_POSITIVE_RATE);
        filter.insert(b"alpha");
        filter.insert(b"beta");

        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        let restored = BloomFilter::read_from(&mut buf.as_slice()).unwrap();

        assert!(restored.may_contain(b"alpha"));
        assert!(restored.may_contain(b"beta"));
        assert_eq!(restored.num_bits, filter.num_bits);
        assert_eq!(restored.num_hashes, filter.num_hashes);
    }

    #[test]
    fn test_binary_keys() {
        let mut filter = BloomFilter::new(10, BLOOM_FALSE_POSITIVE_RATE);
        let key = vec![0x00, 0xff, 0x7c, 0x0a];
        filter.insert(&key);
        assert!(filter.may_contain(&key));
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let mut buf = Vec::new();
        BloomFilter::new(10, 0.01).write_to(&mut buf).unwrap();
        buf[0..8].copy_from_slice(&0u64.to_be_bytes()); // zero num_bits

        assert!(matches!(
            BloomFilter::read_from(&mut buf.as_slice()),
            Err(Error::Corruption(_))
        ));
    }
}
