//! Sparse index sidecar: every Nth key mapped to its data-file offset.
//!
//! A point read binary-searches the index for the floor entry (largest
//! indexed key <= target) and the ceiling entry (smallest indexed key >
//! target). The data file is then scanned only between those two offsets,
//! bounding the work to one index interval regardless of table size.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// The sparse index for one SSTable: `(key, frame_offset)` pairs in key
/// order, one per index interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseIndex {
    entries: Vec<(Vec<u8>, u64)>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn push(&mut self, key: Vec<u8>, offset: u64) {
        debug_assert!(self
            .entries
            .last()
            .map_or(true, |(last, _)| last.as_slice() < key.as_slice()));
        self.entries.push((key, offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Byte range of the data file that can contain `key`: the floor entry's
    /// offset (or 0 when `key` precedes every indexed key) up to the ceiling
    /// entry's offset (or `None`, meaning end of file).
    pub fn scan_range(&self, key: &[u8]) -> (u64, Option<u64>) {
        match self
            .entries
            .binary_search_by(|(indexed, _)| indexed.as_slice().cmp(key))
        {
            Ok(idx) => {
                let end = self.entries.get(idx + 1).map(|(_, offset)| *offset);
                (self.entries[idx].1, end)
            }
            Err(0) => {
                let end = self.entries.first().map(|(_, offset)| *offset);
                (0, end)
            }
            Err(idx) => {
                let end = self.entries.get(idx).map(|(_, offset)| *offset);
                (self.entries[idx - 1].1, end)
            }
        }
    }

    /// Sidecar layout: repeated `key_len:u32 | key | offset:u64`, big-endian.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (key, offset) in &self.entries {
            writer.write_u32::<BigEndian>(key.len() as u32)?;
            writer.write_all(key)?;
            writer.write_u64::<BigEndian>(*offset)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut entries = Vec::new();

        loop {
            let key_len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let offset = reader.read_u64::<BigEndian>()?;

            entries.push((key, offset));
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> SparseIndex {
        let mut index = SparseIndex::new();
        index.push(b"apple".to_vec(), 0);
        index.push(b"banana".to_vec(), 100);
        index.push(b"cherry".to_vec(), 200);
        index
    }

    #[test]
    fn test_scan_range_exact_match() {
        let index = sample_index();
        assert_eq!(index.scan_range(b"banana"), (100, Some(200)));
    }

    #[test]
    fn test_scan_range_between_entries() {
        let index = sample_index();
        assert_eq!(index.scan_range(b"apricot"), (0, Some(100)));
        assert_eq!(index.scan_range(b"blueberry"), (100, Some(200)));
    }

    #[test]
    fn test_scan_range_before_first() {
        let index = sample_index();
        assert_eq!(index.scan_range(b"aardvark"), (0, Some(0)));
    }

    #[test]
    fn test_scan_range_after_last() {
        let index = sample_index();
        assert_eq!(index.scan_range(b"date"), (200, None));
    }

    #[test]
    fn test_scan_range_empty_index() {
        let index = SparseIndex::new();
        assert_eq!(index.scan_range(b"anything"), (0, None));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let index = sample_index();
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();

        let restored = SparseIndex::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, index);
    }

    #[test]
    fn test_empty_serialization_roundtrip() {
        let index = SparseIndex::new();
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();

        let restored = SparseIndex::read_from(&mut buf.as_slice()).unwrap();
        assert!(restored.is_empty());
    }
}
