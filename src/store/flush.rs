//! Flushing immutable memtables to L0 SSTables.
//!
//! All flushes serialize on the state's flush mutex, and claims on the
//! immutable queue are taken under it, so L0 tables are installed in
//! rotation order: an older memtable's table always lands before a newer
//! one's, keeping L0's newest-first probe order truthful.
//!
//! A flushing memtable stays in the manager's queue (and the read path) for
//! the whole flush; it is removed only after the new table is committed to
//! the L0 manifest and the WAL has been trimmed. A crash at any point
//! either leaves the records in the WAL (table not yet committed) or in the
//! committed table, never neither.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::Result;
use crate::memtable::manager::ImmutableMemtable;
use crate::sstable::{self, SSTable, TableMeta};
use crate::store::compaction;
use crate::store::state::LsmState;

/// Claims and flushes the oldest pending immutable memtable, if any.
/// Returns the new table's metadata, or None when the queue is drained.
pub(crate) fn flush_oldest(state: &LsmState, config: &Config) -> Result<Option<TableMeta>> {
    let _flush = state.flush_lock.lock()?;
    match state.memtables.claim_oldest()? {
        Some(immutable) => flush_claimed(state, config, &immutable),
        None => Ok(None),
    }
}

/// Flushes one claimed immutable memtable. The caller must hold the flush
/// mutex.
///
/// On failure the claim is returned so the memtable is retried by the next
/// flusher; its records are still in the WAL.
pub(crate) fn flush_claimed(
    state: &LsmState,
    config: &Config,
    immutable: &ImmutableMemtable,
) -> Result<Option<TableMeta>> {
    let entries = immutable.entries_sorted();
    if entries.is_empty() {
        state.memtables.remove(immutable.sequence())?;
        return Ok(None);
    }

    let meta = match install_sstable(state, &entries) {
        Ok(meta) => meta,
        Err(e) => {
            immutable.unclaim();
            return Err(e);
        }
    };

    // The entries are durable; a failed trim only leaves redundant WAL
    // records, which replay idempotently.
    if let Err(e) = clear_wal_for_flushed(state, &entries) {
        tracing::warn!(error = %e, "Failed to trim WAL after flush");
    }

    state.memtables.remove(immutable.sequence())?;

    tracing::info!(
        sstable_id = meta.sstable_id,
        entries = meta.num_entries,
        sequence = immutable.sequence(),
        "Flushed memtable to L0"
    );

    if let Err(e) = compaction::auto_compact(state, config) {
        tracing::error!(error = %e, "Auto-compaction after flush failed");
    }

    Ok(Some(meta))
}

/// Creates an SSTable from sorted entries and commits it to L0.
///
/// The id is reserved durably first, the three files are written and
/// fsynced outside every lock, and only then is the metadata appended to
/// the L0 manifest and the reader made visible. A crash before the manifest
/// write leaves an orphan directory for the next open to reap.
pub(crate) fn install_sstable(state: &LsmState, entries: &[Entry]) -> Result<TableMeta> {
    let sstable_id = state.manifest.next_id()?;
    let meta = sstable::write_sstable(&state.sstables_dir, sstable_id, entries)?;

    let table = match SSTable::open(&state.sstables_dir, meta.clone()) {
        Ok(table) => Arc::new(table),
        Err(e) => {
            let _ = sstable::delete_sstable(&state.sstables_dir, &meta.dirname);
            return Err(e);
        }
    };

    let mut levels = state.levels.write()?;
    if let Err(e) = state.manifest.add(0, meta.clone()) {
        drop(levels);
        let _ = sstable::delete_sstable(&state.sstables_dir, &meta.dirname);
        return Err(e);
    }
    levels.entry(0).or_default().insert(0, table);

    Ok(meta)
}

/// Atomically rewrites the WAL to drop records covered by the flush: a
/// record survives only if its key was not flushed or it is strictly newer
/// than the flushed version of that key.
pub(crate) fn clear_wal_for_flushed(state: &LsmState, flushed: &[Entry]) -> Result<()> {
    let mut flushed_ts: HashMap<&[u8], u64> = HashMap::with_capacity(flushed.len());
    for entry in flushed {
        let ts = flushed_ts.entry(entry.key.as_slice()).or_insert(0);
        *ts = (*ts).max(entry.timestamp);
    }

    state.wal.replace_with_filtered(|record| {
        flushed_ts
            .get(record.key.as_slice())
            .map_or(true, |&ts| record.timestamp > ts)
    })
}
