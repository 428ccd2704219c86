//! # cinderkv
//!
//! A persistent, crash-safe, ordered key-value store built as a
//! Log-Structured Merge tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐
//! │ Active Memtable │───►│ Immutable Queue  │
//! │   (SkipMap)     │    │ (frozen, FIFO)   │
//! └─────────────────┘    └──────────────────┘
//!           │                      │ flush workers
//!           ▼                      ▼
//!      ┌─────────┐          ┌─────────────┐
//!      │ wal.log │          │  Level 0    │ overlapping, newest first
//!      └─────────┘          └─────────────┘
//!                                  │ compaction
//!                                  ▼
//!                           ┌─────────────┐
//!                           │  Level 1    │ single non-overlapping table
//!                           └─────────────┘
//!                                  │
//!                                  ▼
//!                                 ...
//! ```
//!
//! # Data Flow
//!
//! **Writes**: every mutation is appended and fsynced to the WAL, then
//! applied to the active memtable. A full memtable rotates into the
//! immutable queue, where background workers flush it to a Level-0 SSTable
//! and trim the WAL. A full queue applies backpressure by making the writer
//! flush synchronously.
//!
//! **Reads**: active memtable, immutable memtables newest to oldest, L0
//! tables newest to oldest, then one table per deeper level. The first hit
//! wins; tombstones read as "not found".
//!
//! **Compaction**: when a level exceeds its soft limit, its tables are
//! merged into the next level under snapshot isolation, keeping the highest
//! timestamp per key. Tombstones survive until they reach the bottommost
//! populated level.
//!
//! # Durability
//!
//! SSTables and their bloom/index sidecars are fsynced before the per-level
//! JSON manifest (temp-file + rename) commits them; the manifest rewrite is
//! the linearization point for every structural change. Recovery loads the
//! manifests, sweeps orphan table directories, and replays the WAL, which
//! tolerates a torn tail.
//!
//! # Example
//!
//! ```rust,no_run
//! use cinderkv::Store;
//!
//! # async fn demo() -> cinderkv::Result<()> {
//! let store = Store::open("./data")?;
//! store.put(b"hello", b"world")?;
//! assert_eq!(store.get(b"hello")?, Some(b"world".to_vec()));
//! store.delete(b"hello")?;
//! store.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! `Store::open` must run inside a tokio runtime; flush workers, the
//! compaction backstop, and metrics logging are spawned on it.

pub mod config;
pub mod entry;
pub mod error;
pub mod flock;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod tmpfs;
pub mod wal;

pub use config::{CompactionConfig, Config, WorkerConfig};
pub use entry::Entry;
pub use error::{Error, Result};
pub use sstable::TableMeta;
pub use store::{LevelStats, Store, StoreStats};
