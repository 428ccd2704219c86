//! Write-Ahead Log: the durability floor for every mutation.
//!
//! Each `put` and `delete` is appended and fsynced here before it touches the
//! memtable, so an acknowledged write survives any crash. After a memtable is
//! flushed to an SSTable the covered records are trimmed out with an atomic
//! rewrite (temp file + rename), never an in-place truncation.
//!
//! # Record Format
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | entry payload    |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! All integers are big-endian; the CRC32 covers the payload. The framing is
//! length-prefixed so keys and values may contain any byte. A truncated tail
//! (crash mid-append) stops replay at the last good record; a CRC mismatch
//! with more data following is corruption and fails recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::Entry;
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Safety cap on a single record; anything larger is corruption.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

pub struct Wal {
    path: PathBuf,
    // Serializes appends, reads, and rewrites. Held across fsync.
    file: Mutex<File>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_record<W: Write>(writer: &mut W, entry: &Entry) -> Result<()> {
    let mut payload = Vec::with_capacity(
        16 + entry.key.len() + entry.value.as_ref().map_or(0, |v| v.len()),
    );
    entry.encode_into(&mut payload);

    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
    Ok(())
}

impl Wal {
    /// Opens (or creates) the WAL file in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the WAL file in bytes.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map_or(0, |meta| meta.len())
    }

    /// Appends a single record and fsyncs before returning.
    pub fn append(&self, entry: &Entry) -> Result<()> {
        let mut file = self.file.lock()?;
        write_record(&mut *file, entry)?;
        file.sync_all()?;
        Ok(())
    }

    /// Appends a batch of records with a single fsync at the end.
    pub fn append_batch(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock()?;
        for entry in entries {
            write_record(&mut *file, entry)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Reads every valid record in order.
    ///
    /// A truncated trailing record is logged and ignored; everything before
    /// it is returned. A CRC mismatch that is not at the tail is fatal.
    pub fn read_all(&self) -> Result<Vec<Entry>> {
        let _guard = self.file.lock()?;
        self.read_records()
    }

    fn read_records(&self) -> Result<Vec<Entry>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();

        loop {
            let payload_len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            if payload_len == 0 || payload_len > MAX_RECORD_SIZE {
                return Err(Error::Corruption(format!(
                    "wal record length out of range: {payload_len}"
                )));
            }

            let mut payload = vec![0u8; payload_len as usize];
            if let Err(e) = reader.read_exact(&mut payload) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    tracing::warn!("Truncated WAL tail, stopping replay");
                    break;
                }
                return Err(e.into());
            }

            let stored_crc = match reader.read_u32::<BigEndian>() {
                Ok(crc) => crc,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("Truncated WAL tail, stopping replay");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            if CRC32.checksum(&payload) != stored_crc {
                // A bad checksum on the very last record is a torn write; a
                // bad checksum with more data behind it is real corruption.
                if reader.fill_buf()?.is_empty() {
                    tracing::warn!("CRC mismatch in WAL tail record, stopping replay");
                    break;
                }
                return Err(Error::Corruption(
                    "crc mismatch in non-trailing wal record".to_string(),
                ));
            }

            let mut cursor = Cursor::new(payload.as_slice());
            entries.push(Entry::decode_from(&mut cursor)?);
        }

        Ok(entries)
    }

    /// Atomically rewrites the WAL to contain only records satisfying
    /// `keep`. Survivors go to a sibling temp file which is fsynced and then
    /// renamed over the log; the append handle is reopened afterwards.
    pub fn replace_with_filtered<F>(&self, keep: F) -> Result<()>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut file = self.file.lock()?;

        let survivors: Vec<Entry> = self
            .read_records()?
            .into_iter()
            .filter(|entry| keep(entry))
            .collect();

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &survivors {
                write_record(&mut tmp, entry)?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        // The old handle points at the unlinked inode; swap in a fresh one.
        *file = open_append(&self.path)?;
        Ok(())
    }

    /// Empties the WAL with the same temp-file-plus-rename discipline.
    pub fn clear(&self) -> Result<()> {
        self.replace_with_filtered(|_| false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::io::Seek;

    fn wal_in(dir: &TempDir) -> Wal {
        Wal::open(dir.path().join("wal.log")).expect("Failed to open WAL")
    }

    #[test]
    fn test_append_and_read_all() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"k1".to_vec(), b"v1".to_vec(), 1))
            .unwrap();
        wal.append(&Entry::tombstone(b"k2".to_vec(), 2)).unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, Some(b"v1".to_vec()));
        assert!(entries[1].is_tombstone());
    }

    #[test]
    fn test_append_batch() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        let batch: Vec<Entry> = (0..10)
            .map(|i| Entry::put(format!("k{i}").into_bytes(), vec![i as u8], i))
            .collect();
        wal.append_batch(&batch).unwrap();

        assert_eq!(wal.read_all().unwrap(), batch);
    }

    #[test]
    fn test_empty_wal() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_binary_safe_records() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        let entry = Entry::put(b"user|123".to_vec(), b"a|b\nc\0d".to_vec(), 5);
        wal.append(&entry).unwrap();

        assert_eq!(wal.read_all().unwrap(), vec![entry]);
    }

    #[test]
    fn test_truncated_tail_stops_replay() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        wal.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2))
            .unwrap();

        // Chop bytes off the final record to simulate a crash mid-append.
        let path = dir.path().join("wal.log");
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 5).unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"a");
    }

    #[test]
    fn test_mid_file_corruption_is_fatal() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        wal.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2))
            .unwrap();

        // Flip a payload byte inside the first record.
        let path = dir.path().join("wal.log");
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(6)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(wal.read_all(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_replace_with_filtered() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"keep".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        wal.append(&Entry::put(b"drop".to_vec(), b"2".to_vec(), 2))
            .unwrap();
        wal.append(&Entry::put(b"keep2".to_vec(), b"3".to_vec(), 3))
            .unwrap();

        wal.replace_with_filtered(|entry| entry.key != b"drop")
            .unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, b"keep");
        assert_eq!(entries[1].key, b"keep2");
    }

    #[test]
    fn test_appends_work_after_rewrite() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        wal.replace_with_filtered(|_| false).unwrap();
        wal.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2))
            .unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"b");
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);

        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        wal.clear().unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        assert_eq!(wal.size(), 0);
    }
}
