//! SSTable: an immutable, sorted-by-key run of entries on disk.
//!
//! Each table lives in its own directory with three files:
//!
//! ```text
//! sstables/sstable_000042/
//!     data     framed entries in key order
//!     bloom    bloom filter over the keys
//!     index    sparse index: every Nth key -> data-frame offset
//! ```
//!
//! The data file reuses the WAL's frame layout (`len | payload | crc32`),
//! so random-access reads can start at any indexed offset and walk forward
//! frame by frame. Reads go through a shared read-only mmap; the file never
//! changes after the writer fsyncs it, so no synchronization is needed.
//!
//! A table becomes visible only when its metadata is committed to a level
//! manifest, which happens after all three files are durable. Reads can
//! therefore never observe a torn table.

pub mod bloom;
pub mod index;

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::error::{Error, Result};
use bloom::{BloomFilter, BLOOM_FALSE_POSITIVE_RATE};
use index::SparseIndex;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const DATA_FILE: &str = "data";
pub const BLOOM_FILE: &str = "bloom";
pub const INDEX_FILE: &str = "index";

/// Every Nth entry gets a sparse-index record.
pub const INDEX_INTERVAL: usize = 4;

/// Manifest metadata describing one SSTable. This is the durable record a
/// level manifest keeps for each live table; the in-memory reader carries a
/// copy so range checks need no disk access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub sstable_id: u64,
    pub dirname: String,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub num_entries: u64,
    pub size_bytes: u64,
    /// Highest timestamp stored in the table; used to reseed the store's
    /// monotonic timestamp counter at open.
    pub max_timestamp: u64,
}

/// Directory name for a table id, e.g. `sstable_000042`.
pub fn dirname_for(sstable_id: u64) -> String {
    format!("sstable_{sstable_id:06}")
}

/// Writes a new SSTable from `entries`, which must be sorted by strictly
/// increasing key. All three files are fsynced before the metadata is
/// returned; the caller commits the metadata to a manifest to make the
/// table live.
pub fn write_sstable(sstables_dir: &Path, sstable_id: u64, entries: &[Entry]) -> Result<TableMeta> {
    if entries.is_empty() {
        return Err(Error::Validation(
            "cannot write an sstable with no entries".to_string(),
        ));
    }

    let dirname = dirname_for(sstable_id);
    let dir = sstables_dir.join(&dirname);
    std::fs::create_dir_all(&dir)?;

    let mut bloom = BloomFilter::new(entries.len(), BLOOM_FALSE_POSITIVE_RATE);
    let mut index = SparseIndex::new();
    let mut max_timestamp = 0u64;

    let data_path = dir.join(DATA_FILE);
    let mut offset = 0u64;
    {
        let file = File::create(&data_path)?;
        let mut writer = BufWriter::new(file);
        let mut payload = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            debug_assert!(i == 0 || entries[i - 1].key < entry.key);

            bloom.insert(&entry.key);
            if i % INDEX_INTERVAL == 0 {
                index.push(entry.key.clone(), offset);
            }
            max_timestamp = max_timestamp.max(entry.timestamp);

            payload.clear();
            entry.encode_into(&mut payload);
            writer.write_u32::<BigEndian>(payload.len() as u32)?;
            writer.write_all(&payload)?;
            writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
            offset += 8 + payload.len() as u64;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    let bloom_path = dir.join(BLOOM_FILE);
    {
        let mut file = File::create(&bloom_path)?;
        bloom.write_to(&mut file)?;
        file.sync_all()?;
    }

    let index_path = dir.join(INDEX_FILE);
    {
        let mut file = File::create(&index_path)?;
        index.write_to(&mut file)?;
        file.sync_all()?;
    }

    let size_bytes = std::fs::metadata(&data_path)?.len()
        + std::fs::metadata(&bloom_path)?.len()
        + std::fs::metadata(&index_path)?.len();

    Ok(TableMeta {
        sstable_id,
        dirname,
        min_key: entries.first().unwrap().key.clone(),
        max_key: entries.last().unwrap().key.clone(),
        num_entries: entries.len() as u64,
        size_bytes,
        max_timestamp,
    })
}

/// An open SSTable: metadata, bloom filter, sparse index, and a read-only
/// mmap of the data file. Safe to share between concurrent readers.
pub struct SSTable {
    pub meta: TableMeta,
    dir: PathBuf,
    bloom: BloomFilter,
    index: SparseIndex,
    mmap: Mmap,
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("id", &self.meta.sstable_id)
            .field("dir", &self.dir)
            .field("num_entries", &self.meta.num_entries)
            .field("size_bytes", &self.meta.size_bytes)
            .finish()
    }
}

impl SSTable {
    /// Opens the table described by `meta` under `sstables_dir`.
    pub fn open(sstables_dir: &Path, meta: TableMeta) -> Result<Self> {
        let dir = sstables_dir.join(&meta.dirname);

        let data_file = File::open(dir.join(DATA_FILE))?;
        // The data file is immutable once the manifest references it.
        let mmap = unsafe { Mmap::map(&data_file)? };

        let bloom = {
            let mut reader = BufReader::new(File::open(dir.join(BLOOM_FILE))?);
            BloomFilter::read_from(&mut reader)?
        };

        let index = {
            let mut reader = BufReader::new(File::open(dir.join(INDEX_FILE))?);
            SparseIndex::read_from(&mut reader)?
        };

        Ok(Self {
            meta,
            dir,
            bloom,
            index,
            mmap,
        })
    }

    pub fn id(&self) -> u64 {
        self.meta.sstable_id
    }

    /// Probes the directory for a complete table.
    pub fn exists(sstables_dir: &Path, sstable_id: u64) -> bool {
        let dir = sstables_dir.join(dirname_for(sstable_id));
        dir.join(DATA_FILE).exists()
            && dir.join(BLOOM_FILE).exists()
            && dir.join(INDEX_FILE).exists()
    }

    /// Point lookup. Returns tombstones so the caller can distinguish
    /// "deleted here" from "not present here".
    ///
    /// The read path is: key-range check on the metadata, bloom probe, then
    /// a sparse-index-bounded forward scan over the mmap. A bloom miss never
    /// touches the data file.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if key < self.meta.min_key.as_slice() || key > self.meta.max_key.as_slice() {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }

        let (start, end) = self.index.scan_range(key);
        let end = end.unwrap_or(self.mmap.len() as u64) as usize;
        let mut pos = start as usize;

        while pos < end {
            let (entry, next) = self.parse_frame(pos)?;
            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => pos = next,
            }
        }

        Ok(None)
    }

    /// Streams every entry in key order.
    pub fn read_all(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(self.meta.num_entries as usize);
        let mut pos = 0usize;

        while pos < self.mmap.len() {
            let (entry, next) = self.parse_frame(pos)?;
            entries.push(entry);
            pos = next;
        }

        Ok(entries)
    }

    /// Decodes the frame starting at `pos`, returning the entry and the
    /// offset of the following frame.
    fn parse_frame(&self, pos: usize) -> Result<(Entry, usize)> {
        let data = &self.mmap[..];

        if pos + 4 > data.len() {
            return Err(Error::Corruption(format!(
                "sstable {} frame header out of bounds at {pos}",
                self.meta.dirname
            )));
        }
        let payload_len =
            u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;

        let payload_start = pos + 4;
        let crc_start = payload_start + payload_len;
        let next = crc_start + 4;
        if next > data.len() {
            return Err(Error::Corruption(format!(
                "sstable {} frame out of bounds at {pos}",
                self.meta.dirname
            )));
        }

        let payload = &data[payload_start..crc_start];
        let stored_crc = u32::from_be_bytes(data[crc_start..next].try_into().unwrap());
        if CRC32.checksum(payload) != stored_crc {
            return Err(Error::Corruption(format!(
                "crc mismatch in sstable {} at {pos}",
                self.meta.dirname
            )));
        }

        let mut cursor = Cursor::new(payload);
        Ok((Entry::decode_from(&mut cursor)?, next))
    }
}

/// Removes a table's directory and all three files. Open mmaps keep the
/// unlinked data readable until the last reference drops.
pub fn delete_sstable(sstables_dir: &Path, dirname: &str) -> Result<()> {
    let dir = sstables_dir.join(dirname);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn sorted_entries(count: usize) -> Vec<Entry> {
        (0..count)
            .map(|i| {
                Entry::put(
                    format!("key_{i:04}").into_bytes(),
                    format!("value_{i:04}").into_bytes(),
                    i as u64 + 1,
                )
            })
            .collect()
    }

    fn write_and_open(dir: &TempDir, id: u64, entries: &[Entry]) -> SSTable {
        let meta = write_sstable(dir.path(), id, entries).expect("Failed to write sstable");
        SSTable::open(dir.path(), meta).expect("Failed to open sstable")
    }

    #[test]
    fn test_write_and_get() {
        let dir = TempDir::new().unwrap();
        let entries = sorted_entries(100);
        let table = write_and_open(&dir, 1, &entries);

        for entry in &entries {
            let found = table.get(&entry.key).unwrap().expect("Key not found");
            assert_eq!(found, *entry);
        }
    }

    #[test]
    fn test_get_missing_key() {
        let dir = TempDir::new().unwrap();
        let table = write_and_open(&dir, 1, &sorted_entries(20));

        // Inside the key range but absent.
        assert_eq!(table.get(b"key_0010x").unwrap(), None);
        // Outside the key range entirely.
        assert_eq!(table.get(b"aaa").unwrap(), None);
        assert_eq!(table.get(b"zzz").unwrap(), None);
    }

    #[test]
    fn test_metadata() {
        let dir = TempDir::new().unwrap();
        let entries = sorted_entries(10);
        let meta = write_sstable(dir.path(), 7, &entries).unwrap();

        assert_eq!(meta.sstable_id, 7);
        assert_eq!(meta.dirname, "sstable_000007");
        assert_eq!(meta.min_key, b"key_0000".to_vec());
        assert_eq!(meta.max_key, b"key_0009".to_vec());
        assert_eq!(meta.num_entries, 10);
        assert_eq!(meta.max_timestamp, 10);
        assert!(meta.size_bytes > 0);
    }

    #[test]
    fn test_read_all_preserves_order() {
        let dir = TempDir::new().unwrap();
        let entries = sorted_entries(50);
        let table = write_and_open(&dir, 1, &entries);

        assert_eq!(table.read_all().unwrap(), entries);
    }

    #[test]
    fn test_tombstones_returned() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            Entry::put(b"a".to_vec(), b"1".to_vec(), 1),
            Entry::tombstone(b"b".to_vec(), 2),
            Entry::put(b"c".to_vec(), b"3".to_vec(), 3),
        ];
        let table = write_and_open(&dir, 1, &entries);

        let found = table.get(b"b").unwrap().expect("Tombstone not found");
        assert!(found.is_tombstone());
        assert_eq!(found.timestamp, 2);
    }

    #[test]
    fn test_binary_keys_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut entries = vec![
            Entry::put(vec![0x00], b"nul".to_vec(), 1),
            Entry::put(b"a|b".to_vec(), b"pipe|value\n".to_vec(), 2),
            Entry::put(b"x\ty".to_vec(), vec![0xde, 0xad, 0xbe, 0xef], 3),
        ];
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let table = write_and_open(&dir, 1, &entries);

        for entry in &entries {
            assert_eq!(table.get(&entry.key).unwrap().as_ref(), Some(entry));
        }
    }

    #[test]
    fn test_empty_entries_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(write_sstable(dir.path(), 1, &[]).is_err());
    }

    #[test]
    fn test_exists_and_delete() {
        let dir = TempDir::new().unwrap();
        let meta = write_sstable(dir.path(), 3, &sorted_entries(5)).unwrap();

        assert!(SSTable::exists(dir.path(), 3));
        delete_sstable(dir.path(), &meta.dirname).unwrap();
        assert!(!SSTable::exists(dir.path(), 3));
    }

    #[test]
    fn test_single_entry_table() {
        let dir = TempDir::new().unwrap();
        let entries = vec![Entry::put(b"only".to_vec(), b"one".to_vec(), 9)];
        let table = write_and_open(&dir, 1, &entries);

        assert_eq!(table.get(b"only").unwrap(), Some(entries[0].clone()));
        assert_eq!(table.get(b"other").unwrap(), None);
    }

    #[test]
    fn test_corrupt_data_file_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_sstable(dir.path(), 1, &sorted_entries(8)).unwrap();

        // Flip a byte in the middle of the data file.
        let data_path = dir.path().join(&meta.dirname).join(DATA_FILE);
        let mut bytes = std::fs::read(&data_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&data_path, &bytes).unwrap();

        let table = SSTable::open(dir.path(), meta).unwrap();
        assert!(matches!(table.read_all(), Err(Error::Corruption(_))));
    }
}
