//! The typed record stored everywhere in the tree: WAL, memtables, SSTables.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const FLAG_LIVE: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;

/// A single mutation: a key, an optional value, and the store-assigned
/// timestamp. `value == None` marks a tombstone (deletion); an empty value
/// (`Some(vec![])`) is a live entry.
///
/// Timestamps are strictly monotonic across the life of a store, so the
/// entry with the highest timestamp for a key is always the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: u64,
}

impl Entry {
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
        }
    }

    pub fn tombstone(key: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Serialized payload layout (big-endian):
    ///
    /// ```text
    /// +------------+------+-----------+-----+-----------+-------+
    /// |timestamp:u64|flag:u8|key_len:u32| key |val_len:u32| value |
    /// +------------+------+-----------+-----+-----------+-------+
    /// ```
    ///
    /// The value fields are absent for tombstones. Length prefixes make the
    /// payload safe for arbitrary bytes in keys and values.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.timestamp).unwrap();
        match &self.value {
            Some(value) => {
                buf.write_u8(FLAG_LIVE).unwrap();
                buf.write_u32::<BigEndian>(self.key.len() as u32).unwrap();
                buf.extend_from_slice(&self.key);
                buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
                buf.extend_from_slice(value);
            }
            None => {
                buf.write_u8(FLAG_TOMBSTONE).unwrap();
                buf.write_u32::<BigEndian>(self.key.len() as u32).unwrap();
                buf.extend_from_slice(&self.key);
            }
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let flag = cursor.read_u8()?;

        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;

        let value = match flag {
            FLAG_LIVE => {
                let val_len = cursor.read_u32::<BigEndian>()? as usize;
                let mut value = vec![0u8; val_len];
                cursor.read_exact(&mut value)?;
                Some(value)
            }
            FLAG_TOMBSTONE => None,
            other => {
                return Err(Error::Corruption(format!(
                    "unknown entry flag: {other}"
                )))
            }
        };

        Ok(Self {
            key,
            value,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(entry: &Entry) -> Entry {
        let mut buf = Vec::new();
        entry.encode_into(&mut buf);
        let mut cursor = Cursor::new(buf.as_slice());
        Entry::decode_from(&mut cursor).expect("Failed to decode")
    }

    #[test]
    fn test_put_roundtrip() {
        let entry = Entry::put(b"key".to_vec(), b"value".to_vec(), 42);
        assert_eq!(roundtrip(&entry), entry);
        assert!(!entry.is_tombstone());
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let entry = Entry::tombstone(b"key".to_vec(), 43);
        assert_eq!(roundtrip(&entry), entry);
        assert!(entry.is_tombstone());
    }

    #[test]
    fn test_empty_value_is_live() {
        let entry = Entry::put(b"key".to_vec(), Vec::new(), 1);
        let decoded = roundtrip(&entry);
        assert_eq!(decoded.value, Some(Vec::new()));
        assert!(!decoded.is_tombstone());
    }

    #[test]
    fn test_binary_keys_and_values() {
        let key = vec![0x00, 0x7c, 0x0a, 0x09, 0xff, 0xfe];
        let value = b"a|b\nc\td\0e".to_vec();
        let entry = Entry::put(key, value, 7);
        assert_eq!(roundtrip(&entry), entry);
    }

    #[test]
    fn test_unknown_flag_is_corruption() {
        let entry = Entry::put(b"k".to_vec(), b"v".to_vec(), 1);
        let mut buf = Vec::new();
        entry.encode_into(&mut buf);
        buf[8] = 9; // clobber the flag byte

        let mut cursor = Cursor::new(buf.as_slice());
        assert!(matches!(
            Entry::decode_from(&mut cursor),
            Err(Error::Corruption(_))
        ));
    }
}
