//! The store facade: wires the WAL, memtable manager, and SSTable levels
//! together and serializes mutations.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::flock::StoreLock;
use crate::sstable::TableMeta;
use crate::store::metrics::StoreStats;
use crate::store::state::LsmState;
use crate::store::tasks::Workers;
use crate::store::{compaction, flush, metrics, recovery};

/// A persistent, crash-safe, ordered key-value store.
///
/// # Write Path
///
/// 1. Validate the key and value.
/// 2. Under the write mutex: assign a monotonic timestamp, append + fsync
///    the WAL record, apply to the active memtable (rotating it when full).
/// 3. If the rotation left the immutable queue at capacity, flush the
///    oldest immutable synchronously, outside every lock.
///
/// # Read Path
///
/// Active memtable, then immutable memtables newest to oldest, then L0
/// SSTables newest to oldest, then L1, L2, ... The first entry found wins;
/// a tombstone reads as "not found".
///
/// # Background Work
///
/// `open` spawns flush workers, a compaction backstop, and a metrics loop
/// on the ambient tokio runtime; `close` drains and joins them. Compaction
/// also runs inline after each SSTable install when its triggers fire.
pub struct Store {
    config: Config,
    _lock: StoreLock,
    state: Arc<LsmState>,
    workers: Mutex<Option<Workers>>,
    /// Serializes put/delete so WAL order always matches memtable order.
    write_lock: Mutex<()>,
}

impl Store {
    /// Opens a store with default configuration. Must be called within a
    /// tokio runtime; background tasks are spawned on it.
    pub fn open(dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Opens a store, recovering any previous state from `config.dir`.
    pub fn open_with_config(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let lock = StoreLock::acquire(&config.dir)?;
        let state = Arc::new(recovery::recover_state(&config)?);
        let workers = Workers::start(state.clone(), &config);

        tracing::info!(dir = %config.dir.display(), "Store opened");

        Ok(Self {
            config,
            _lock: lock,
            state,
            workers: Mutex::new(Some(workers)),
            write_lock: Mutex::new(()),
        })
    }

    /// Inserts or updates a key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;
        self.apply_mutation(key, Some(value))
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.apply_mutation(key, None)
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.validate_key(key)?;
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(entry) = self.state.memtables.get(key)? {
            return Ok(if entry.is_tombstone() {
                None
            } else {
                entry.value
            });
        }

        // Probe a snapshot of the level map; a concurrent compaction commit
        // cannot tear the view.
        let levels = self.state.snapshot_levels()?;
        for tables in levels.values() {
            for table in tables {
                if let Some(entry) = table.get(key)? {
                    return Ok(if entry.is_tombstone() {
                        None
                    } else {
                        entry.value
                    });
                }
            }
        }

        Ok(None)
    }

    /// Synchronously flushes the active memtable to an L0 SSTable.
    ///
    /// Errors with [`Error::EmptyMemtable`] when there is nothing to flush.
    pub fn flush(&self) -> Result<TableMeta> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        // Drain older immutables first so this flush cannot install its
        // table ahead of older data, then rotate and flush the active.
        let _flush = self.state.flush_lock.lock()?;
        while let Some(immutable) = self.state.memtables.claim_oldest()? {
            flush::flush_claimed(&self.state, &self.config, &immutable)?;
        }

        let immutable = self
            .state
            .memtables
            .flush_active_sync()?
            .ok_or(Error::EmptyMemtable)?;

        flush::flush_claimed(&self.state, &self.config, &immutable)?
            .ok_or(Error::EmptyMemtable)
    }

    /// Merges every level into the bottommost, dropping tombstones. Waits
    /// for any in-flight background compaction first.
    pub async fn compact(&self) -> Result<TableMeta> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let _guard = loop {
            match self.state.start_compaction() {
                Some(guard) => break guard,
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        compaction::full_compact(&self.state, &self.config)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> Result<StoreStats> {
        metrics::collect(&self.state, &self.config)
    }

    /// Graceful shutdown: fails subsequent operations, flushes everything
    /// in memory, joins background work, then clears the WAL. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Closing store");

        // Flush the queued immutables, then the active memtable.
        {
            let _flush = self.state.flush_lock.lock()?;
            while let Some(immutable) = self.state.memtables.claim_oldest()? {
                flush::flush_claimed(&self.state, &self.config, &immutable)?;
            }
            if let Some(immutable) = self.state.memtables.flush_active_sync()? {
                flush::flush_claimed(&self.state, &self.config, &immutable)?;
            }
        }

        // Join the flush workers and the compaction backstop; a loop
        // mid-round finishes before it exits.
        if let Some(workers) = self.workers.lock()?.take() {
            workers.shutdown().await?;
        }

        // A caller-context compaction may still hold the slot.
        while self.state.compaction_in_flight() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Everything in memory is durable in SSTables now.
        self.state.wal.clear()?;

        tracing::info!("Store closed");
        Ok(())
    }

    fn apply_mutation(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let over_capacity = {
            let _write = self.write_lock.lock()?;
            let timestamp = self.state.next_timestamp();
            let entry = match value {
                Some(value) => Entry::put(key.to_vec(), value.to_vec(), timestamp),
                None => Entry::tombstone(key.to_vec(), timestamp),
            };
            self.state.wal.append(&entry)?;
            self.state.memtables.apply(entry)?
        };

        // Backpressure: the queue is at capacity, so this caller flushes
        // the oldest immutable before returning. The mutation itself is
        // already durable; a failed flush is retried by the workers.
        if over_capacity {
            if let Err(e) = flush::flush_oldest(&self.state, &self.config) {
                tracing::warn!(error = %e, "Backpressure flush failed, will retry");
            }
        }

        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("key cannot be empty".to_string()));
        }
        if key.len() > self.config.max_key_size {
            return Err(Error::Validation(format!(
                "key exceeds max size ({} > {} bytes)",
                key.len(),
                self.config.max_key_size
            )));
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_value_size {
            return Err(Error::Validation(format!(
                "value exceeds max size ({} > {} bytes)",
                value.len(),
                self.config.max_value_size
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.config.dir)
            .field("closed", &self.state.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // A store dropped without close() must not leave background loops
        // running against its directory. The directory lock itself releases
        // when the field drops.
        if let Ok(mut workers) = self.workers.lock() {
            if let Some(workers) = workers.take() {
                workers.shutdown_now();
            }
        }
    }
}
