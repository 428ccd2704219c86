//! Startup recovery: manifests -> levels, orphan sweep, WAL replay.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::ManifestSet;
use crate::memtable::manager::MemtableManager;
use crate::memtable::Memtable;
use crate::sstable::SSTable;
use crate::store::state::LsmState;
use crate::wal::Wal;

pub const SSTABLES_DIR: &str = "sstables";
pub const WAL_FILE: &str = "wal.log";

/// Rebuilds the store's state from disk:
///
/// 1. Load each level manifest and open every referenced SSTable eagerly.
///    A referenced table missing from disk is corruption.
/// 2. Sweep the sstables directory and delete any directory no manifest
///    references (leftovers from a crash mid-flush or mid-compaction).
/// 3. Replay the WAL into a single fresh active memtable, no rotation and
///    no re-logging; a torn tail stops replay at the last good record.
/// 4. Seed the timestamp counter above everything persisted.
pub(crate) fn recover_state(config: &Config) -> Result<LsmState> {
    let sstables_dir = config.dir.join(SSTABLES_DIR);
    std::fs::create_dir_all(&sstables_dir)?;

    let manifest = ManifestSet::open(&config.dir)?;

    let mut levels: BTreeMap<u32, Vec<Arc<SSTable>>> = BTreeMap::new();
    let mut max_timestamp = 0u64;

    for (level, metas) in manifest.all_levels()? {
        let mut tables = Vec::with_capacity(metas.len());
        for meta in metas {
            if !SSTable::exists(&sstables_dir, meta.sstable_id) {
                return Err(Error::Corruption(format!(
                    "manifest references missing sstable {}",
                    meta.dirname
                )));
            }
            max_timestamp = max_timestamp.max(meta.max_timestamp);
            tables.push(Arc::new(SSTable::open(&sstables_dir, meta)?));
        }

        // Manifests append in install order; the read path wants L0 newest
        // first.
        if level == 0 {
            tables.sort_by(|a, b| b.id().cmp(&a.id()));
        }
        levels.insert(level, tables);
    }

    sweep_orphans(&sstables_dir, &manifest)?;

    let wal = Wal::open(config.dir.join(WAL_FILE))?;
    let active = Memtable::new();
    let mut replayed = 0usize;
    for record in wal.read_all()? {
        max_timestamp = max_timestamp.max(record.timestamp);
        active.apply(record);
        replayed += 1;
    }
    if replayed > 0 {
        tracing::info!(records = replayed, "Replayed WAL into active memtable");
    }

    let memtables = MemtableManager::new(
        config.memtable_size,
        config.max_immutable_memtables,
        active,
    );

    let state = LsmState::new(
        memtables,
        levels,
        manifest,
        wal,
        sstables_dir,
        max_timestamp,
    );

    state.validate_consistency()?;
    tracing::info!(
        sstables = state.num_sstables()?,
        "Recovery completed"
    );

    Ok(state)
}

/// Deletes SSTable directories no manifest references. Idempotent; safe to
/// run on every open.
fn sweep_orphans(sstables_dir: &Path, manifest: &ManifestSet) -> Result<()> {
    let live = manifest.live_dirnames()?;

    for dir_entry in std::fs::read_dir(sstables_dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_dir() {
            continue;
        }

        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("sstable_") || live.contains(name) {
            continue;
        }

        tracing::warn!(dirname = name, "Removing orphan sstable directory");
        if let Err(e) = std::fs::remove_dir_all(dir_entry.path()) {
            tracing::warn!(dirname = name, error = %e, "Failed to remove orphan");
        }
    }

    Ok(())
}
